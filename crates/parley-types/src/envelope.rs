//! Envelope: the routed unit of communication between agents.
//!
//! Envelopes are created once per message and never mutated after send.
//! The router only reads header fields; the payload is opaque to it.

use crate::error::ErrorBody;
use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// What an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// Expects a correlated response.
    Request,
    /// Answers a request; `correlation_id` names the request.
    Response,
    /// Fire-and-forget.
    Event,
    /// Failed answer to a request; payload is an [`ErrorBody`].
    Error,
}

impl EnvelopeKind {
    /// Responses and errors both resolve a pending request.
    pub fn is_reply(self) -> bool {
        matches!(self, EnvelopeKind::Response | EnvelopeKind::Error)
    }

    /// Only events may be dropped under backpressure.
    pub fn is_critical(self) -> bool {
        !matches!(self, EnvelopeKind::Event)
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvelopeKind::Request => "request",
            EnvelopeKind::Response => "response",
            EnvelopeKind::Event => "event",
            EnvelopeKind::Error => "error",
        };
        f.write_str(s)
    }
}

/// A routed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub session_id: SessionId,
    pub sender: String,
    pub recipient: String,
    pub kind: EnvelopeKind,
    /// For requests: the id replies must echo. For replies: the request's id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    fn build(
        session_id: SessionId,
        sender: &str,
        recipient: &str,
        kind: EnvelopeKind,
        correlation_id: Option<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session_id,
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            kind,
            correlation_id,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// A request with a fresh correlation id.
    pub fn request(
        session_id: SessionId,
        sender: &str,
        recipient: &str,
        payload: serde_json::Value,
    ) -> Self {
        let correlation = Uuid::new_v4().to_string();
        Self::build(
            session_id,
            sender,
            recipient,
            EnvelopeKind::Request,
            Some(correlation),
            payload,
        )
    }

    /// A fire-and-forget event.
    pub fn event(
        session_id: SessionId,
        sender: &str,
        recipient: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self::build(
            session_id,
            sender,
            recipient,
            EnvelopeKind::Event,
            None,
            payload,
        )
    }

    /// A response addressed back to the sender of `request`.
    pub fn response_to(request: &Envelope, payload: serde_json::Value) -> Self {
        Self::build(
            request.session_id,
            &request.recipient,
            &request.sender,
            EnvelopeKind::Response,
            request.correlation_id.clone(),
            payload,
        )
    }

    /// An error reply addressed back to the sender of `request`.
    pub fn error_to(request: &Envelope, body: &ErrorBody) -> Self {
        let payload = serde_json::to_value(body).unwrap_or(serde_json::Value::Null);
        Self::build(
            request.session_id,
            &request.recipient,
            &request.sender,
            EnvelopeKind::Error,
            request.correlation_id.clone(),
            payload,
        )
    }
}

/// Body of `POST /message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRequest {
    pub envelope: Envelope,
    /// Block until the correlated response arrives (request envelopes only).
    #[serde(default)]
    pub await_response: bool,
    /// Overrides the router's default request timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}
