//! Tool descriptor and result types exposed through the MCP bridge.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A tool exposed read-only to remote peers.
///
/// The authoritative copy lives in the external tool runtime; the bridge only
/// hands out snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique tool name.
    pub name: String,
    /// MCP server that hosts the tool.
    pub server: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub input_schema: serde_json::Value,
    /// Whether the tool can currently be invoked.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Separator between server and tool in a qualified tool name.
pub const QUALIFIED_SEPARATOR: char = '/';

impl ToolDescriptor {
    /// `server/name`, unique across servers.
    pub fn qualified_name(&self) -> String {
        format!("{}{QUALIFIED_SEPARATOR}{}", self.server, self.name)
    }
}

/// Split `server/name` into its parts. A bare name has no server.
pub fn split_qualified(name: &str) -> (Option<&str>, &str) {
    match name.split_once(QUALIFIED_SEPARATOR) {
        Some((server, tool)) if !server.is_empty() && !tool.is_empty() => (Some(server), tool),
        _ => (None, name),
    }
}

/// Successful output of a bridged tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    /// The tool that produced this result.
    pub tool: String,
    /// Structured output from the runtime.
    pub output: serde_json::Value,
    /// Wall-clock execution time in milliseconds.
    pub duration_ms: u64,
}

/// Classification of bridge failures seen by remote peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolErrorKind {
    /// Arguments did not match the tool's declared schema.
    ValidationError,
    /// The runtime reported a failure.
    ExecutionError,
    /// The per-call timeout elapsed.
    Timeout,
    /// The session is not granted a capability covering the tool's server.
    Unauthorized,
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolErrorKind::ValidationError => write!(f, "validation error"),
            ToolErrorKind::ExecutionError => write!(f, "execution error"),
            ToolErrorKind::Timeout => write!(f, "timeout"),
            ToolErrorKind::Unauthorized => write!(f, "unauthorized"),
        }
    }
}

/// A structured tool failure.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("Tool '{tool}' {kind}: {message}")]
pub struct ToolError {
    /// Failure classification.
    pub kind: ToolErrorKind,
    /// The tool that was invoked.
    pub tool: String,
    /// Description of the failure.
    pub message: String,
}

impl ToolError {
    pub fn validation(tool: &str, message: impl Into<String>) -> Self {
        Self {
            kind: ToolErrorKind::ValidationError,
            tool: tool.to_string(),
            message: message.into(),
        }
    }

    pub fn execution(tool: &str, message: impl Into<String>) -> Self {
        Self {
            kind: ToolErrorKind::ExecutionError,
            tool: tool.to_string(),
            message: message.into(),
        }
    }

    pub fn timeout(tool: &str, timeout_ms: u64) -> Self {
        Self {
            kind: ToolErrorKind::Timeout,
            tool: tool.to_string(),
            message: format!("no result within {timeout_ms}ms"),
        }
    }

    pub fn unauthorized(tool: &str, message: impl Into<String>) -> Self {
        Self {
            kind: ToolErrorKind::Unauthorized,
            tool: tool.to_string(),
            message: message.into(),
        }
    }
}

/// Body of `POST /tools/execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteToolRequest {
    /// Tool to invoke: a bare name, or `server/name` when several granted
    /// servers expose the same name.
    pub tool: String,
    /// Arguments, validated against the tool's schema before dispatch.
    #[serde(default)]
    pub args: serde_json::Value,
}
