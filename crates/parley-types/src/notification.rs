//! Push-notification subscription types for `POST /notify`.

use crate::session::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bounded exponential backoff for webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum delivery attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

/// Maximum attempts a subscriber may ask for.
const MAX_ATTEMPTS_CAP: u32 = 10;
/// Maximum endpoint URL length.
const MAX_ENDPOINT_LEN: usize = 2048;
/// Maximum number of event filters per subscription.
const MAX_FILTERS: usize = 32;
/// Maximum event type name length.
const MAX_EVENT_TYPE_LEN: usize = 128;

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 || self.max_attempts > MAX_ATTEMPTS_CAP {
            return Err(format!(
                "max_attempts must be between 1 and {} (got {})",
                MAX_ATTEMPTS_CAP, self.max_attempts
            ));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(format!(
                "initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            ));
        }
        Ok(())
    }
}

/// An active subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSubscription {
    pub id: String,
    /// Session that created the subscription; closing it removes the subscription.
    pub session_id: SessionId,
    /// Agent that receives deliveries.
    pub subscriber_id: String,
    /// Event types to deliver: exact names, `*`, or `prefix.*`.
    pub event_types: Vec<String>,
    /// Webhook URL deliveries are POSTed to.
    pub endpoint: String,
    pub retry: RetryPolicy,
    pub created_at: DateTime<Utc>,
}

impl NotificationSubscription {
    /// Whether `event_type` passes this subscription's filter.
    pub fn matches(&self, event_type: &str) -> bool {
        self.event_types
            .iter()
            .any(|pattern| event_type_matches(pattern, event_type))
    }
}

/// Match an event type against a filter pattern.
pub fn event_type_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => event_type.starts_with(prefix),
        None => pattern == event_type,
    }
}

/// Body of `POST /notify`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NotifyRequest {
    Subscribe {
        event_types: Vec<String>,
        endpoint: String,
        #[serde(default)]
        retry: Option<RetryPolicy>,
    },
    Unsubscribe {
        subscription_id: String,
    },
    Publish {
        event_type: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl NotifyRequest {
    /// Validate the request before it reaches the dispatcher.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            NotifyRequest::Subscribe {
                event_types,
                endpoint,
                retry,
            } => {
                if event_types.is_empty() {
                    return Err("event_types must not be empty".to_string());
                }
                if event_types.len() > MAX_FILTERS {
                    return Err(format!(
                        "at most {MAX_FILTERS} event filters allowed (got {})",
                        event_types.len()
                    ));
                }
                for t in event_types {
                    validate_event_type(t)?;
                }
                if endpoint.len() > MAX_ENDPOINT_LEN {
                    return Err(format!(
                        "endpoint exceeds maximum length of {MAX_ENDPOINT_LEN} chars"
                    ));
                }
                if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                    return Err("endpoint must be an http(s) URL".to_string());
                }
                if let Some(policy) = retry {
                    policy.validate()?;
                }
                Ok(())
            }
            NotifyRequest::Unsubscribe { subscription_id } => {
                if subscription_id.is_empty() {
                    return Err("subscription_id must not be empty".to_string());
                }
                Ok(())
            }
            NotifyRequest::Publish { event_type, .. } => validate_event_type(event_type),
        }
    }
}

fn validate_event_type(t: &str) -> Result<(), String> {
    if t.is_empty() {
        return Err("event type must not be empty".to_string());
    }
    if t.len() > MAX_EVENT_TYPE_LEN {
        return Err(format!(
            "event type exceeds maximum length of {MAX_EVENT_TYPE_LEN} chars"
        ));
    }
    if t.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(format!("event type '{t}' contains whitespace or control characters"));
    }
    Ok(())
}

/// Payload POSTed to a subscriber's endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationDelivery {
    pub subscription_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    /// 1-based attempt number.
    pub attempt: u32,
    pub published_at: DateTime<Utc>,
}

/// A delivery that exhausted its retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub subscription_id: String,
    pub event_type: String,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}
