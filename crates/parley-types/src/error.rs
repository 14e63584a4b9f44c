//! Shared error types for the parley coordinator.
//!
//! Every error that crosses an agent boundary is reduced to an [`ErrorKind`]
//! plus a human-readable message, so remote peers see the same taxonomy no
//! matter which component failed.

use crate::tool::{ToolError, ToolErrorKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for the parley coordinator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParleyError {
    /// No protocol in the requester's preference list is supported locally.
    #[error("No common protocol: requested [{requested}], supported [{supported}]")]
    ProtocolMismatch {
        /// Requested protocols, comma separated.
        requested: String,
        /// Locally supported protocols, comma separated.
        supported: String,
    },

    /// A capability the requester marked as required is not available.
    #[error("Required capabilities unavailable: {}", .0.join(", "))]
    MissingRequiredCapability(Vec<String>),

    /// The session is unknown or not in a usable state.
    #[error("Session invalid: {0}")]
    SessionInvalid(String),

    /// The session was closed while the operation was in flight.
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// Missing or invalid session token.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A structured tool failure from the MCP bridge.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// A notification could not be delivered after all retries.
    #[error("Delivery failed for subscription {subscription_id}: {reason}")]
    DeliveryFailed {
        /// The subscription whose endpoint failed.
        subscription_id: String,
        /// Last delivery error.
        reason: String,
    },

    /// A capability failed validation on registration.
    #[error("Invalid capability: {0}")]
    InvalidCapability(String),

    /// A request body or envelope was malformed.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// No handler is registered for the envelope's protocol and kind.
    #[error("No route for protocol '{protocol}' and kind '{kind}'")]
    NoRoute {
        /// Negotiated protocol of the session.
        protocol: String,
        /// Envelope kind.
        kind: String,
    },

    /// A correlated request did not receive its response in time.
    #[error("Request {correlation_id} timed out after {timeout_ms}ms")]
    RequestTimeout {
        /// Correlation id of the request.
        correlation_id: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ParleyError {
    /// The stable, wire-visible kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ParleyError::ProtocolMismatch { .. } => ErrorKind::ProtocolMismatch,
            ParleyError::MissingRequiredCapability(_) => ErrorKind::MissingRequiredCapability,
            ParleyError::SessionInvalid(_) => ErrorKind::SessionInvalid,
            ParleyError::SessionClosed(_) => ErrorKind::SessionClosed,
            ParleyError::Unauthorized(_) => ErrorKind::Unauthorized,
            ParleyError::Tool(e) => match e.kind {
                ToolErrorKind::ValidationError => ErrorKind::ToolValidationError,
                ToolErrorKind::ExecutionError => ErrorKind::ToolExecutionError,
                ToolErrorKind::Timeout => ErrorKind::ToolTimeout,
                ToolErrorKind::Unauthorized => ErrorKind::ToolUnauthorized,
            },
            ParleyError::DeliveryFailed { .. } => ErrorKind::DeliveryFailed,
            ParleyError::InvalidCapability(_) => ErrorKind::InvalidCapability,
            ParleyError::InvalidInput(_) => ErrorKind::InvalidInput,
            ParleyError::NoRoute { .. } => ErrorKind::NoRoute,
            ParleyError::RequestTimeout { .. } => ErrorKind::RequestTimeout,
            ParleyError::Config(_) => ErrorKind::Config,
            ParleyError::Serialization(_) => ErrorKind::Serialization,
            ParleyError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether this error terminates the session it occurred in.
    ///
    /// `Unauthorized` and `SessionClosed` are fatal; everything else can be
    /// recovered by retrying or renegotiating.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            ParleyError::Unauthorized(_) | ParleyError::SessionClosed(_)
        )
    }

    /// Build the structured body returned to remote peers.
    pub fn to_body(&self) -> ErrorBody {
        let details = match self {
            ParleyError::MissingRequiredCapability(missing) => {
                Some(serde_json::json!({ "missing": missing }))
            }
            ParleyError::RequestTimeout {
                correlation_id,
                timeout_ms,
            } => Some(serde_json::json!({
                "correlation_id": correlation_id,
                "timeout_ms": timeout_ms,
            })),
            ParleyError::DeliveryFailed {
                subscription_id, ..
            } => Some(serde_json::json!({ "subscription_id": subscription_id })),
            _ => None,
        };
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
            details,
        }
    }
}

impl From<serde_json::Error> for ParleyError {
    fn from(e: serde_json::Error) -> Self {
        ParleyError::Serialization(e.to_string())
    }
}

/// Wire-visible error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ProtocolMismatch,
    MissingRequiredCapability,
    SessionInvalid,
    SessionClosed,
    Unauthorized,
    ToolValidationError,
    ToolExecutionError,
    ToolTimeout,
    ToolUnauthorized,
    DeliveryFailed,
    InvalidCapability,
    InvalidInput,
    NoRoute,
    RequestTimeout,
    Config,
    Serialization,
    Internal,
}

/// Structured error body carried in HTTP responses and error envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Optional machine-readable context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Alias for Result with ParleyError.
pub type ParleyResult<T> = Result<T, ParleyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(ParleyError::Unauthorized("bad token".into()).is_fatal_to_session());
        assert!(ParleyError::SessionClosed("s-1".into()).is_fatal_to_session());
        assert!(!ParleyError::SessionInvalid("s-1".into()).is_fatal_to_session());
        assert!(!ParleyError::MissingRequiredCapability(vec!["x".into()]).is_fatal_to_session());
    }

    #[test]
    fn test_tool_error_kind_mapping() {
        let err: ParleyError = ToolError::timeout("shell", 500).into();
        assert_eq!(err.kind(), ErrorKind::ToolTimeout);
    }

    #[test]
    fn test_body_carries_missing_capabilities() {
        let err = ParleyError::MissingRequiredCapability(vec!["quantum_teleport".into()]);
        let body = err.to_body();
        assert_eq!(body.kind, ErrorKind::MissingRequiredCapability);
        assert_eq!(body.details.unwrap()["missing"][0], "quantum_teleport");
        assert!(body.message.contains("quantum_teleport"));
    }

    #[test]
    fn test_error_body_serialization() {
        let body = ParleyError::Unauthorized("missing token".into()).to_body();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["kind"], "Unauthorized");
        assert!(json.get("details").is_none());
    }
}
