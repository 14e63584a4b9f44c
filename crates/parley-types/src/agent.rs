//! Agent card: the self-description document served at
//! `/.well-known/agent-card`.

use crate::capability::{Capability, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of this agent process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Stable agent identifier.
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// Agent software version.
    pub version: String,
    /// What this agent does.
    #[serde(default)]
    pub description: String,
}

/// A protocol this agent speaks, with optional feature flags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolSpec {
    /// Protocol family name (e.g. `a2a`).
    pub name: String,
    /// Protocol version.
    pub version: String,
    /// Optional protocol features (e.g. `streaming`, `push`).
    #[serde(default)]
    pub features: Vec<String>,
}

impl ProtocolSpec {
    pub fn new(name: &str, version: &str, features: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            features: features.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Parsed version, if valid.
    pub fn parsed_version(&self) -> Option<Version> {
        Version::parse(&self.version).ok()
    }
}

impl fmt::Display for ProtocolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// One entry in the card's endpoint map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSpec {
    /// HTTP path relative to the base URL.
    pub path: String,
    /// HTTP method (`GET`, `POST`, or `WS` for the stream upgrade).
    pub method: String,
}

impl EndpointSpec {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            path: path.to_string(),
            method: method.to_string(),
        }
    }
}

/// Immutable snapshot of this agent's self-description.
///
/// Regenerated whenever the capability set changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCard {
    /// Agent identity.
    #[serde(flatten)]
    pub identity: AgentIdentity,
    /// Ordered capability list (unique by name).
    pub capabilities: Vec<Capability>,
    /// Logical endpoint name → path/method.
    pub endpoints: BTreeMap<String, EndpointSpec>,
    /// Protocols this agent can negotiate.
    pub protocols: Vec<ProtocolSpec>,
    /// Base URL the endpoint paths are relative to.
    pub base_url: String,
    /// Monotonic revision, bumped on every capability change.
    pub revision: u64,
}

impl AgentCard {
    /// Look up a capability by name.
    pub fn capability(&self, name: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.name == name)
    }
}

/// Body of `POST /discover`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverRequest {
    /// Identity of the asking agent.
    pub requester_id: String,
    /// Restrict results to these capability names.
    #[serde(default)]
    pub filter: Option<Vec<String>>,
}

/// The standard endpoint map advertised by every parley agent.
pub fn default_endpoints() -> BTreeMap<String, EndpointSpec> {
    [
        ("agent_card", EndpointSpec::new("GET", "/.well-known/agent-card")),
        ("discover", EndpointSpec::new("POST", "/discover")),
        ("negotiate", EndpointSpec::new("POST", "/negotiate")),
        ("message", EndpointSpec::new("POST", "/message")),
        ("notify", EndpointSpec::new("POST", "/notify")),
        ("tools", EndpointSpec::new("GET", "/tools")),
        ("tools_execute", EndpointSpec::new("POST", "/tools/execute")),
        ("stream", EndpointSpec::new("WS", "/stream")),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}
