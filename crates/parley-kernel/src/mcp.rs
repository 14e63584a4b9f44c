//! MCP tool runtime over HTTP JSON-RPC 2.0.
//!
//! Each `[[tools.servers]]` entry is an MCP server reachable by POSTing
//! JSON-RPC requests to its URL. Tools are discovered with `tools/list` and
//! invoked with `tools/call`.

use crate::bridge::ToolRuntime;
use async_trait::async_trait;
use dashmap::DashSet;
use parley_types::config::McpServerEntry;
use parley_types::tool::ToolDescriptor;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// MCP protocol revision sent in `initialize`.
const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC 2.0 request.
#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<serde_json::Value>,
}

/// JSON-RPC 2.0 response.
#[derive(Deserialize)]
struct JsonRpcResponse {
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[allow(dead_code)]
    pub data: Option<serde_json::Value>,
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

struct ToolCache {
    fetched_at: Instant,
    tools: Vec<ToolDescriptor>,
}

/// Tool runtime backed by one or more MCP servers.
pub struct McpHttpRuntime {
    client: reqwest::Client,
    servers: Vec<McpServerEntry>,
    cache_ttl: Duration,
    cache: Mutex<Option<ToolCache>>,
    initialized: DashSet<String>,
    next_id: AtomicU64,
}

impl McpHttpRuntime {
    pub fn new(servers: Vec<McpServerEntry>, cache_ttl: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            servers,
            cache_ttl,
            cache: Mutex::new(None),
            initialized: DashSet::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn server(&self, name: &str) -> Option<&McpServerEntry> {
        self.servers.iter().find(|s| s.name == name)
    }

    async fn rpc(
        &self,
        server: &McpServerEntry,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<Option<serde_json::Value>, String> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        debug!(server = %server.name, method, id, "MCP request");

        let response = self
            .client
            .post(server.url.as_str())
            .json(&request)
            .timeout(Duration::from_secs(server.timeout_secs))
            .send()
            .await
            .map_err(|e| format!("MCP request to '{}' failed: {e}", server.name))?;

        if !response.status().is_success() {
            return Err(format!(
                "MCP server '{}' returned {}",
                server.name,
                response.status()
            ));
        }

        let body = response
            .text()
            .await
            .map_err(|e| format!("Failed to read MCP response: {e}"))?;
        let rpc: JsonRpcResponse = serde_json::from_str(&body)
            .map_err(|e| format!("Invalid MCP JSON-RPC response: {e}"))?;

        if let Some(err) = rpc.error {
            return Err(err.to_string());
        }
        Ok(rpc.result)
    }

    /// Run the `initialize` handshake once per server.
    async fn ensure_initialized(&self, server: &McpServerEntry) -> Result<(), String> {
        if self.initialized.contains(&server.name) {
            return Ok(());
        }
        let params = serde_json::json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "parley",
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        if let Some(result) = self.rpc(server, "initialize", Some(params)).await? {
            debug!(server = %server.name, server_info = %result, "MCP initialize response");
        }
        self.initialized.insert(server.name.clone());
        Ok(())
    }

    async fn fetch_tools(&self, server: &McpServerEntry) -> Result<Vec<ToolDescriptor>, String> {
        self.ensure_initialized(server).await?;
        let result = self.rpc(server, "tools/list", None).await?;
        Ok(result
            .as_ref()
            .map(|r| parse_tool_list(&server.name, r))
            .unwrap_or_default())
    }
}

/// Convert a `tools/list` result into descriptors for `server`.
fn parse_tool_list(server: &str, result: &serde_json::Value) -> Vec<ToolDescriptor> {
    let Some(tools) = result.get("tools").and_then(|t| t.as_array()) else {
        return Vec::new();
    };
    tools
        .iter()
        .filter_map(|tool| {
            let name = tool["name"].as_str()?;
            Some(ToolDescriptor {
                name: name.to_string(),
                server: server.to_string(),
                description: tool["description"].as_str().unwrap_or("").to_string(),
                input_schema: tool
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or(serde_json::json!({"type": "object"})),
                enabled: true,
            })
        })
        .collect()
}

/// Extract the output of a `tools/call` result.
///
/// Structured content wins; otherwise text items are joined. A result
/// flagged `isError` becomes an error carrying its text.
fn parse_call_result(result: serde_json::Value) -> Result<serde_json::Value, String> {
    let text = result
        .get("content")
        .and_then(|c| c.as_array())
        .map(|items| {
            items
                .iter()
                .filter(|item| item["type"].as_str() == Some("text"))
                .filter_map(|item| item["text"].as_str())
                .collect::<Vec<_>>()
                .join("\n")
        });

    if result["isError"].as_bool() == Some(true) {
        return Err(text.unwrap_or_else(|| "tool reported an error".to_string()));
    }
    if let Some(structured) = result.get("structuredContent") {
        return Ok(structured.clone());
    }
    match text {
        Some(text) => Ok(serde_json::Value::String(text)),
        None => Ok(result),
    }
}

#[async_trait]
impl ToolRuntime for McpHttpRuntime {
    async fn list_registered(&self) -> Vec<ToolDescriptor> {
        let mut cache = self.cache.lock().await;
        if let Some(c) = cache.as_ref() {
            if c.fetched_at.elapsed() < self.cache_ttl {
                return c.tools.clone();
            }
        }

        let mut tools = Vec::new();
        for server in &self.servers {
            match self.fetch_tools(server).await {
                Ok(found) => {
                    info!(server = %server.name, tools = found.len(), "MCP tools listed");
                    tools.extend(found);
                }
                Err(e) => {
                    // A server that is down just contributes no tools.
                    warn!(server = %server.name, error = %e, "MCP tools/list failed");
                    self.initialized.remove(&server.name);
                }
            }
        }
        *cache = Some(ToolCache {
            fetched_at: Instant::now(),
            tools: tools.clone(),
        });
        tools
    }

    async fn execute(
        &self,
        tool: &ToolDescriptor,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, String> {
        let server = self
            .server(&tool.server)
            .ok_or_else(|| format!("MCP server '{}' is not configured", tool.server))?;
        self.ensure_initialized(server).await?;
        let params = serde_json::json!({
            "name": tool.name,
            "arguments": args,
        });
        match self.rpc(server, "tools/call", Some(params)).await? {
            Some(result) => parse_call_result(result),
            None => Err("No result from MCP tools/call".to_string()),
        }
    }
}
