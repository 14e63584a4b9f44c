//! Negotiation request/response bodies for `POST /negotiate`.

use crate::agent::ProtocolSpec;
use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A peer's request to open a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationRequest {
    /// Identity of the requesting agent (pre-validated upstream).
    pub requester_id: String,
    /// Client-chosen session id, if the peer wants to pick one.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Protocols in descending order of preference.
    pub preferences: Vec<ProtocolSpec>,
    /// Capabilities the session cannot work without.
    #[serde(default)]
    pub required: Vec<String>,
    /// Capabilities the peer would like if available.
    #[serde(default)]
    pub optional: Vec<String>,
}

/// Successful negotiation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationResponse {
    pub session_id: SessionId,
    /// The protocol both sides agreed on.
    pub protocol: ProtocolSpec,
    /// Capabilities granted to the session.
    pub granted: Vec<String>,
    /// Optional capabilities that were requested but are not available.
    #[serde(default)]
    pub dropped_optional: Vec<String>,
    /// Opaque bearer token for all authenticated calls.
    pub token: String,
    pub expires_at: DateTime<Utc>,
}
