//! Coordinator configuration.
//!
//! Every field has a default so an empty (or missing) `config.toml` yields a
//! working coordinator on `127.0.0.1:4100`.

use crate::agent::{AgentIdentity, ProtocolSpec};
use crate::capability::Capability;
use crate::notification::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Top-level coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Address the HTTP/WebSocket server binds to.
    pub listen_addr: SocketAddr,
    pub agent: AgentConfig,
    /// Protocols this agent can negotiate, most preferred first.
    pub protocols: Vec<ProtocolSpec>,
    /// Capabilities registered at boot.
    pub capabilities: Vec<Capability>,
    pub session: SessionConfig,
    pub router: RouterConfig,
    pub tools: ToolsConfig,
    pub stream: StreamConfig,
    pub notifications: NotificationConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 4100)),
            agent: AgentConfig::default(),
            protocols: vec![
                ProtocolSpec::new("a2a", "1.0", &["streaming", "push"]),
                ProtocolSpec::new("a2a", "0.9", &[]),
            ],
            capabilities: Vec::new(),
            session: SessionConfig::default(),
            router: RouterConfig::default(),
            tools: ToolsConfig::default(),
            stream: StreamConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

/// `[agent]`: identity advertised in the agent card.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    /// Public base URL. Empty means "derive from listen_addr".
    pub base_url: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: "parley-agent".to_string(),
            name: "parley".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: "Agent-to-agent protocol coordinator".to_string(),
            base_url: String::new(),
        }
    }
}

impl AgentConfig {
    pub fn identity(&self) -> AgentIdentity {
        AgentIdentity {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
        }
    }
}

/// `[session]`: token lifetime and idle handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Absolute token lifetime.
    pub token_ttl_secs: u64,
    /// Inactivity before `Active → Idle`.
    pub idle_timeout_secs: u64,
    /// Additional inactivity before `Idle → Closed`.
    pub idle_grace_secs: u64,
    /// How often the sweeper applies idle/expiry transitions.
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_ttl_secs: 3600,
            idle_timeout_secs: 300,
            idle_grace_secs: 300,
            sweep_interval_secs: 15,
        }
    }
}

/// `[router]`: request/response timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub default_request_timeout_ms: u64,
    /// Upper bound a caller may request.
    pub max_request_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_request_timeout_ms: 30_000,
            max_request_timeout_ms: 300_000,
        }
    }
}

/// `[tools]`: MCP bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Per-call timeout, distinct from transport timeouts.
    pub call_timeout_ms: u64,
    /// Capability name → tool servers it authorizes. A capability without an
    /// entry authorizes the server of the same name.
    pub capability_servers: HashMap<String, Vec<String>>,
    /// MCP servers reachable over HTTP JSON-RPC.
    pub servers: Vec<McpServerEntry>,
    /// How long a fetched tool list is reused before `tools/list` is
    /// called again.
    pub list_cache_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 60_000,
            capability_servers: HashMap::new(),
            servers: Vec::new(),
            list_cache_secs: 60,
        }
    }
}

/// One `[[tools.servers]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerEntry {
    /// Server name; tool descriptors carry it and capabilities map to it.
    pub name: String,
    /// JSON-RPC endpoint URL.
    pub url: String,
    /// Transport timeout for a single JSON-RPC call.
    #[serde(default = "default_server_timeout")]
    pub timeout_secs: u64,
}

fn default_server_timeout() -> u64 {
    30
}

/// `[stream]`: streaming transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub heartbeat_interval_secs: u64,
    /// No ping/pong exchange for this long marks the connection stale.
    pub heartbeat_timeout_secs: u64,
    /// Unacknowledged outbound messages kept per connection.
    pub buffer_capacity: usize,
    /// How long a detached connection stays resumable.
    pub resume_window_secs: u64,
    /// HMAC key for resumption tokens. Empty means random per process.
    pub resume_secret: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15,
            heartbeat_timeout_secs: 45,
            buffer_capacity: 256,
            resume_window_secs: 300,
            resume_secret: String::new(),
        }
    }
}

/// `[notifications]`: push delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Policy used when a subscriber does not supply one.
    pub default_retry: RetryPolicy,
    /// Number of delivery failures remembered.
    pub failure_history: usize,
    /// Timeout for a single webhook POST.
    pub delivery_timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            default_retry: RetryPolicy::default(),
            failure_history: 256,
            delivery_timeout_secs: 10,
        }
    }
}
