//! NotificationDispatcher: webhook push for subscribed event types.
//!
//! `publish` never waits on delivery: each matching subscription gets its
//! own task that retries with bounded exponential backoff and records a
//! [`DeliveryFailure`] once the policy is exhausted.

use crate::negotiation::{NegotiationEngine, SessionObserver};
use crate::retry::{retry_async, RetryConfig, RetryOutcome};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parley_types::error::{ParleyError, ParleyResult};
use parley_types::notification::{
    DeliveryFailure, NotificationDelivery, NotificationSubscription, RetryPolicy,
};
use parley_types::session::{CloseReason, Session, SessionId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where deliveries go.
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn deliver(&self, endpoint: &str, delivery: &NotificationDelivery) -> Result<(), String>;
}

/// POSTs each delivery as JSON; any non-2xx status is a failure.
pub struct WebhookSink {
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookSink {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn deliver(&self, endpoint: &str, delivery: &NotificationDelivery) -> Result<(), String> {
        let response = self
            .client
            .post(endpoint)
            .json(delivery)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| format!("webhook request failed: {e}"))?;
        if !response.status().is_success() {
            return Err(format!("webhook returned {}", response.status()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("subscription removed")]
    Unsubscribed,
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct DispatcherStats {
    pub subscriptions: usize,
    pub delivered: u64,
    pub failed: u64,
}

pub struct NotificationDispatcher {
    engine: Arc<NegotiationEngine>,
    sink: Arc<dyn NotificationSink>,
    subscriptions: DashMap<String, NotificationSubscription>,
    default_retry: RetryPolicy,
    failures: Mutex<VecDeque<DeliveryFailure>>,
    failure_history: usize,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl NotificationDispatcher {
    pub fn new(
        engine: Arc<NegotiationEngine>,
        sink: Arc<dyn NotificationSink>,
        default_retry: RetryPolicy,
        failure_history: usize,
    ) -> Self {
        Self {
            engine,
            sink,
            subscriptions: DashMap::new(),
            default_retry,
            failures: Mutex::new(VecDeque::new()),
            failure_history: failure_history.max(1),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Register a subscription owned by `session`.
    pub fn subscribe(
        &self,
        session: &Session,
        event_types: Vec<String>,
        endpoint: String,
        retry: Option<RetryPolicy>,
    ) -> ParleyResult<NotificationSubscription> {
        if event_types.is_empty() {
            return Err(ParleyError::InvalidInput(
                "event_types must not be empty".to_string(),
            ));
        }
        let retry = retry.unwrap_or(self.default_retry);
        retry.validate().map_err(ParleyError::InvalidInput)?;

        let subscription = NotificationSubscription {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session.id,
            subscriber_id: session.peer_id.clone(),
            event_types,
            endpoint,
            retry,
            created_at: Utc::now(),
        };
        self.subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        // The session may have closed since the caller authenticated; its
        // observer sweep would then have missed this entry.
        if !self.engine.is_usable(session.id) {
            self.subscriptions.remove(&subscription.id);
            return Err(ParleyError::SessionClosed(session.id.to_string()));
        }
        info!(
            subscription = %subscription.id,
            session = %session.id,
            filters = ?subscription.event_types,
            "Subscription created"
        );
        Ok(subscription)
    }

    /// Remove a subscription. Only the owning session may remove it.
    pub fn unsubscribe(&self, session_id: SessionId, subscription_id: &str) -> bool {
        let removed = self
            .subscriptions
            .remove_if(subscription_id, |_, s| s.session_id == session_id)
            .is_some();
        if removed {
            info!(subscription = %subscription_id, "Subscription removed");
        }
        removed
    }

    /// Fan `event_type` out to every matching subscription of a live
    /// session. Returns the number of deliveries started.
    pub fn publish(self: &Arc<Self>, event_type: &str, payload: serde_json::Value) -> usize {
        let published_at = Utc::now();
        let targets: Vec<NotificationSubscription> = self
            .subscriptions
            .iter()
            .filter(|s| s.matches(event_type) && self.engine.is_usable(s.session_id))
            .map(|s| s.value().clone())
            .collect();

        for sub in &targets {
            let delivery = NotificationDelivery {
                subscription_id: sub.id.clone(),
                event_type: event_type.to_string(),
                payload: payload.clone(),
                attempt: 0,
                published_at,
            };
            let this = Arc::clone(self);
            let sub = sub.clone();
            tokio::spawn(async move { this.deliver(sub, delivery).await });
        }
        debug!(event_type, matched = targets.len(), "Event published");
        targets.len()
    }

    async fn deliver(&self, sub: NotificationSubscription, template: NotificationDelivery) {
        let endpoint = &sub.endpoint;
        let template = &template;
        let outcome = retry_async(
            &RetryConfig::from(&sub.retry),
            |attempt| async move {
                if !self.subscriptions.contains_key(&template.subscription_id) {
                    return Err(AttemptError::Unsubscribed);
                }
                let delivery = NotificationDelivery {
                    attempt,
                    ..template.clone()
                };
                self.sink
                    .deliver(endpoint, &delivery)
                    .await
                    .map_err(AttemptError::Failed)
            },
            |e| matches!(e, AttemptError::Failed(_)),
        )
        .await;

        match outcome {
            RetryOutcome::Success { attempts, .. } => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                debug!(subscription = %sub.id, attempts, "Notification delivered");
            }
            RetryOutcome::Aborted { .. } => {
                debug!(subscription = %sub.id, "Delivery abandoned, subscription removed");
            }
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subscription = %sub.id,
                    endpoint = %sub.endpoint,
                    event_type = %template.event_type,
                    attempts,
                    error = %last_error,
                    "Notification dropped after retries"
                );
                self.record_failure(DeliveryFailure {
                    subscription_id: sub.id.clone(),
                    event_type: template.event_type.clone(),
                    attempts,
                    last_error: last_error.to_string(),
                    failed_at: Utc::now(),
                });
            }
        }
    }

    fn record_failure(&self, failure: DeliveryFailure) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        if failures.len() >= self.failure_history {
            failures.pop_front();
        }
        failures.push_back(failure);
    }

    /// Recorded delivery failures, oldest first.
    pub fn failures(&self) -> Vec<DeliveryFailure> {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn subscriptions_for(&self, session_id: SessionId) -> Vec<NotificationSubscription> {
        self.subscriptions
            .iter()
            .filter(|s| s.session_id == session_id)
            .map(|s| s.value().clone())
            .collect()
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            subscriptions: self.subscriptions.len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

impl SessionObserver for NotificationDispatcher {
    fn session_closed(&self, session_id: SessionId, _reason: CloseReason) {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|_, s| s.session_id != session_id);
        let removed = before.saturating_sub(self.subscriptions.len());
        if removed > 0 {
            debug!(session = %session_id, removed, "Subscriptions dropped with session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentCardRegistry;
    use parley_types::agent::{AgentIdentity, ProtocolSpec};
    use parley_types::config::SessionConfig;
    use parley_types::negotiation::NegotiationRequest;

    /// Fails the first `fail_first` attempts per subscription, records the rest.
    struct FlakySink {
        fail_first: u32,
        seen: Mutex<Vec<NotificationDelivery>>,
    }

    impl FlakySink {
        fn new(fail_first: u32) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn successes(&self) -> Vec<NotificationDelivery> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .filter(|d| d.attempt > self.fail_first)
                .cloned()
                .collect()
        }

        fn attempts(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl NotificationSink for FlakySink {
        async fn deliver(&self, _endpoint: &str, delivery: &NotificationDelivery) -> Result<(), String> {
            self.seen.lock().unwrap().push(delivery.clone());
            if delivery.attempt <= self.fail_first {
                Err("503 Service Unavailable".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn setup(sink: Arc<FlakySink>) -> (Arc<NegotiationEngine>, Arc<NotificationDispatcher>, Session) {
        let registry = Arc::new(AgentCardRegistry::new(
            AgentIdentity {
                id: "me".to_string(),
                name: "me".to_string(),
                version: "0.1.0".to_string(),
                description: String::new(),
            },
            Vec::new(),
            "http://localhost",
        ));
        let engine = Arc::new(NegotiationEngine::new(
            registry,
            vec![ProtocolSpec::new("a2a", "1.0", &[])],
            &SessionConfig::default(),
        ));
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        };
        let dispatcher = Arc::new(NotificationDispatcher::new(engine.clone(), sink, policy, 2));
        engine.observe(dispatcher.clone());
        let resp = engine
            .negotiate(NegotiationRequest {
                requester_id: "watcher".to_string(),
                session_id: None,
                preferences: vec![ProtocolSpec::new("a2a", "1.0", &[])],
                required: Vec::new(),
                optional: Vec::new(),
            })
            .unwrap();
        let session = engine.get(resp.session_id).unwrap();
        (engine, dispatcher, session)
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_matches_filters() {
        let sink = FlakySink::new(0);
        let (_, dispatcher, session) = setup(sink.clone());
        dispatcher
            .subscribe(&session, vec!["task.*".to_string()], "http://hook/a".to_string(), None)
            .unwrap();
        dispatcher
            .subscribe(&session, vec!["agent.joined".to_string()], "http://hook/b".to_string(), None)
            .unwrap();

        assert_eq!(dispatcher.publish("task.completed", serde_json::json!({"id": 1})), 1);
        assert_eq!(dispatcher.publish("other", serde_json::Value::Null), 0);
        settle().await;

        let got = sink.successes();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].event_type, "task.completed");
        assert_eq!(got[0].attempt, 1);
        assert_eq!(dispatcher.stats().delivered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds() {
        let sink = FlakySink::new(2);
        let (_, dispatcher, session) = setup(sink.clone());
        dispatcher
            .subscribe(&session, vec!["*".to_string()], "http://hook".to_string(), None)
            .unwrap();
        dispatcher.publish("ping", serde_json::Value::Null);
        settle().await;
        assert_eq!(sink.attempts(), 3);
        assert_eq!(sink.successes().len(), 1);
        assert!(dispatcher.failures().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_delivery_recorded() {
        let sink = FlakySink::new(u32::MAX);
        let (_, dispatcher, session) = setup(sink.clone());
        let sub = dispatcher
            .subscribe(&session, vec!["*".to_string()], "http://hook".to_string(), None)
            .unwrap();
        for n in 0..3 {
            dispatcher.publish(&format!("evt.{n}"), serde_json::Value::Null);
        }
        settle().await;

        assert_eq!(sink.attempts(), 9);
        let failures = dispatcher.failures();
        // History is bounded to the two most recent failures.
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|f| f.subscription_id == sub.id && f.attempts == 3));
        assert_eq!(dispatcher.stats().failed, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_does_not_block() {
        let sink = FlakySink::new(u32::MAX);
        let (_, dispatcher, session) = setup(sink);
        dispatcher
            .subscribe(&session, vec!["*".to_string()], "http://hook".to_string(), None)
            .unwrap();
        let started = tokio::time::Instant::now();
        dispatcher.publish("slow", serde_json::Value::Null);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_subscribe_on_closed_session_is_rejected() {
        let (engine, dispatcher, session) = setup(FlakySink::new(0));
        engine.revoke(session.id).unwrap();
        let err = dispatcher
            .subscribe(&session, vec!["*".to_string()], "http://hook".to_string(), None)
            .unwrap_err();
        assert!(matches!(err, ParleyError::SessionClosed(_)));
        assert!(dispatcher.subscriptions_for(session.id).is_empty());
        assert_eq!(dispatcher.publish("anything", serde_json::Value::Null), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_owner_only() {
        let (engine, dispatcher, session) = setup(FlakySink::new(0));
        let sub = dispatcher
            .subscribe(&session, vec!["*".to_string()], "http://hook".to_string(), None)
            .unwrap();
        let stranger = engine
            .negotiate(NegotiationRequest {
                requester_id: "stranger".to_string(),
                session_id: None,
                preferences: vec![ProtocolSpec::new("a2a", "1.0", &[])],
                required: Vec::new(),
                optional: Vec::new(),
            })
            .unwrap();
        assert!(!dispatcher.unsubscribe(stranger.session_id, &sub.id));
        assert!(dispatcher.unsubscribe(session.id, &sub.id));
        assert!(!dispatcher.unsubscribe(session.id, &sub.id));
    }

    #[tokio::test]
    async fn test_session_close_drops_subscriptions() {
        let (engine, dispatcher, session) = setup(FlakySink::new(0));
        dispatcher
            .subscribe(&session, vec!["*".to_string()], "http://hook".to_string(), None)
            .unwrap();
        engine.revoke(session.id).unwrap();
        assert_eq!(dispatcher.stats().subscriptions, 0);
        assert_eq!(dispatcher.publish("anything", serde_json::Value::Null), 0);
    }

    #[test]
    fn test_invalid_retry_policy_rejected() {
        let (_, dispatcher, session) = setup(FlakySink::new(0));
        let bad = RetryPolicy {
            max_attempts: 0,
            initial_backoff_ms: 100,
            max_backoff_ms: 10,
        };
        assert!(matches!(
            dispatcher.subscribe(&session, vec!["*".to_string()], "http://hook".to_string(), Some(bad)),
            Err(ParleyError::InvalidInput(_))
        ));
    }
}
