//! Session types: the authorized, time-bounded context a peer operates in.

use crate::agent::ProtocolSpec;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from the string form used on the wire.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session lifecycle state.
///
/// ```text
/// Uninitiated → Negotiating → Active ⇄ Idle → Closed
///                     └──────→ Rejected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitiated,
    Negotiating,
    Active,
    Idle,
    Closed,
    Rejected,
}

impl SessionState {
    /// Whether the session token is currently accepted.
    pub fn accepts_token(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Idle)
    }

    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Rejected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Uninitiated => "uninitiated",
            SessionState::Negotiating => "negotiating",
            SessionState::Active => "active",
            SessionState::Idle => "idle",
            SessionState::Closed => "closed",
            SessionState::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Explicit revoke (peer logout or detected misuse).
    Revoked,
    /// Unused past the idle window plus grace.
    IdleTimeout,
    /// Token reached its expiry.
    Expired,
    /// The coordinator is shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Revoked => "revoked",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::Expired => "expired",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// A negotiated session.
///
/// Owned by the negotiation engine; every other component refers to it by
/// [`SessionId`] and asks the engine for the current state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// Identity of the remote peer.
    pub peer_id: String,
    /// Capabilities granted during negotiation.
    pub granted: BTreeSet<String>,
    /// Agreed protocol and version.
    pub protocol: ProtocolSpec,
    /// Opaque bearer token. Never serialized back out.
    #[serde(skip_serializing, default)]
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_reason: Option<CloseReason>,
}

impl Session {
    /// Whether a capability was granted to this session.
    pub fn has_capability(&self, name: &str) -> bool {
        self.granted.contains(name)
    }
}
