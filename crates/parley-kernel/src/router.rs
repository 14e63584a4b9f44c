//! MessageRouter: envelope delivery and request/response correlation.
//!
//! Routing key is `(session, recipient)`. Requests and events are queued on
//! a per-`(session, sender)` lane whose worker delivers them one at a time,
//! which preserves send order per sender without a global lock. Delivery
//! goes to the recipient's streaming connection when it has one, otherwise
//! to the handler registered for the session's protocol and the envelope
//! kind.
//!
//! Responses and errors never queue: they resolve the matching waiter in
//! the per-session waiter table directly. A reply whose correlation id has
//! no waiter (late or duplicate) is logged and discarded.

use crate::negotiation::{NegotiationEngine, SessionObserver};
use async_trait::async_trait;
use dashmap::DashMap;
use parley_types::config::RouterConfig;
use parley_types::envelope::{Envelope, EnvelopeKind};
use parley_types::error::{ParleyError, ParleyResult};
use parley_types::session::{CloseReason, Session, SessionId, SessionState};
use parley_wire::{Delivery, StreamingTransport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Protocol key matching every negotiated protocol.
pub const ANY_PROTOCOL: &str = "*";

/// Local recipient of routed envelopes.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync + 'static {
    /// Handle one envelope.
    ///
    /// For a request, returning `Ok(Some(payload))` answers it immediately;
    /// `Ok(None)` means the reply will be sent later through the router;
    /// `Err` is turned into an error envelope for the requester.
    async fn handle(
        &self,
        envelope: &Envelope,
        session: &Session,
    ) -> ParleyResult<Option<serde_json::Value>>;
}

type Waiter = oneshot::Sender<ParleyResult<Envelope>>;
type LaneKey = (SessionId, String);

/// Counters exposed for observability.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct RouterStats {
    pub pending_requests: usize,
    pub routed: u64,
    pub late_replies: u64,
    pub timeouts: u64,
    pub dropped_events: u64,
}

pub struct MessageRouter {
    engine: Arc<NegotiationEngine>,
    config: RouterConfig,
    handlers: DashMap<(String, EnvelopeKind), Arc<dyn EnvelopeHandler>>,
    /// session → correlation id → waiter
    waiters: DashMap<SessionId, HashMap<String, Waiter>>,
    lanes: DashMap<LaneKey, mpsc::UnboundedSender<Envelope>>,
    streams: OnceLock<Arc<StreamingTransport>>,
    this: Weak<MessageRouter>,
    routed: AtomicU64,
    late_replies: AtomicU64,
    timeouts: AtomicU64,
    dropped_events: AtomicU64,
}

impl MessageRouter {
    pub fn new(engine: Arc<NegotiationEngine>, config: RouterConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            engine,
            config,
            handlers: DashMap::new(),
            waiters: DashMap::new(),
            lanes: DashMap::new(),
            streams: OnceLock::new(),
            this: this.clone(),
            routed: AtomicU64::new(0),
            late_replies: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            dropped_events: AtomicU64::new(0),
        })
    }

    /// Route to live streams through `transport`. Only the first call wins.
    pub fn attach_transport(&self, transport: Arc<StreamingTransport>) {
        if self.streams.set(transport).is_err() {
            warn!("Streaming transport already attached to router");
        }
    }

    /// Register the handler for `(protocol, kind)`. Use [`ANY_PROTOCOL`] to
    /// match every protocol. Replaces any previous handler.
    pub fn register_handler(
        &self,
        protocol: &str,
        kind: EnvelopeKind,
        handler: Arc<dyn EnvelopeHandler>,
    ) {
        debug!(protocol, kind = %kind, "Envelope handler registered");
        self.handlers.insert((protocol.to_string(), kind), handler);
    }

    fn handler_for(&self, protocol: &str, kind: EnvelopeKind) -> Option<Arc<dyn EnvelopeHandler>> {
        self.handlers
            .get(&(protocol.to_string(), kind))
            .or_else(|| self.handlers.get(&(ANY_PROTOCOL.to_string(), kind)))
            .map(|h| h.value().clone())
    }

    fn stream_for(&self, envelope: &Envelope) -> Option<&Arc<StreamingTransport>> {
        self.streams
            .get()
            .filter(|t| t.has_connection(envelope.session_id, &envelope.recipient))
    }

    /// The session must exist and be usable; using it revives it from idle.
    fn routable_session(&self, session_id: SessionId) -> ParleyResult<Session> {
        match self.engine.touch(session_id) {
            Ok(session) if session.state == SessionState::Active => Ok(session),
            Ok(session) => Err(ParleyError::SessionInvalid(format!(
                "session {session_id} is {}",
                session.state
            ))),
            Err(ParleyError::SessionClosed(_)) => Err(ParleyError::SessionInvalid(format!(
                "session {session_id} is closed"
            ))),
            Err(e) => Err(e),
        }
    }

    /// Fire-and-forget delivery.
    ///
    /// Fails fast with `SessionInvalid` for an unknown or closed session and
    /// with `NoRoute` when nothing can receive the envelope.
    pub fn send(&self, envelope: Envelope) -> ParleyResult<()> {
        let session = self.routable_session(envelope.session_id)?;

        if envelope.kind.is_reply() {
            self.resolve(envelope);
            return Ok(());
        }

        if self.stream_for(&envelope).is_none()
            && self.handler_for(&session.protocol.name, envelope.kind).is_none()
        {
            return Err(ParleyError::NoRoute {
                protocol: session.protocol.name.clone(),
                kind: envelope.kind.to_string(),
            });
        }

        self.enqueue(envelope)
    }

    /// Send a request and wait for its correlated reply.
    ///
    /// Returns the response (or error) envelope, `RequestTimeout` when no
    /// reply arrives within `timeout`, or `SessionClosed` if the session
    /// closes first. Exactly one of these happens.
    pub async fn send_request(
        &self,
        envelope: Envelope,
        timeout: Option<Duration>,
    ) -> ParleyResult<Envelope> {
        if envelope.kind != EnvelopeKind::Request {
            return Err(ParleyError::InvalidInput(format!(
                "send_request needs a request envelope, got {}",
                envelope.kind
            )));
        }
        let correlation_id = envelope
            .correlation_id
            .clone()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| {
                ParleyError::InvalidInput("request envelope has no correlation_id".to_string())
            })?;
        let session_id = envelope.session_id;
        let timeout = self.clamp_timeout(timeout);

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.waiters.entry(session_id).or_default();
            if pending.contains_key(&correlation_id) {
                return Err(ParleyError::InvalidInput(format!(
                    "correlation id '{correlation_id}' is already pending"
                )));
            }
            pending.insert(correlation_id.clone(), tx);
        }

        if let Err(e) = self.send(envelope) {
            self.take_waiter(session_id, &correlation_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ParleyError::SessionClosed(session_id.to_string())),
            Err(_) => {
                // Timeout wins: a reply arriving from now on finds no waiter.
                self.take_waiter(session_id, &correlation_id);
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                debug!(
                    session = %session_id,
                    correlation = %correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Request timed out"
                );
                Err(ParleyError::RequestTimeout {
                    correlation_id,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Clamp a caller-supplied timeout to the configured maximum.
    pub fn clamp_timeout(&self, requested: Option<Duration>) -> Duration {
        let max = Duration::from_millis(self.config.max_request_timeout_ms);
        requested
            .unwrap_or(Duration::from_millis(self.config.default_request_timeout_ms))
            .min(max)
    }

    /// Entry point for envelopes arriving over a stream.
    pub fn accept_inbound(&self, envelope: Envelope) -> ParleyResult<()> {
        self.send(envelope)
    }

    fn take_waiter(&self, session_id: SessionId, correlation_id: &str) -> Option<Waiter> {
        let mut pending = self.waiters.get_mut(&session_id)?;
        let waiter = pending.remove(correlation_id);
        let empty = pending.is_empty();
        drop(pending);
        if empty {
            self.waiters.remove_if(&session_id, |_, m| m.is_empty());
        }
        waiter
    }

    /// Hand a reply to its waiter, or discard it.
    fn resolve(&self, reply: Envelope) {
        let Some(correlation_id) = reply.correlation_id.clone() else {
            warn!(envelope = %reply.id, "Reply without correlation id discarded");
            self.late_replies.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match self.take_waiter(reply.session_id, &correlation_id) {
            Some(waiter) => {
                if waiter.send(Ok(reply)).is_ok() {
                    self.routed.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.late_replies.fetch_add(1, Ordering::Relaxed);
                    debug!(correlation = %correlation_id, "Waiter gone before reply");
                }
            }
            None => {
                self.late_replies.fetch_add(1, Ordering::Relaxed);
                debug!(
                    session = %reply.session_id,
                    correlation = %correlation_id,
                    "Late or duplicate reply discarded"
                );
            }
        }
    }

    fn enqueue(&self, envelope: Envelope) -> ParleyResult<()> {
        let key = (envelope.session_id, envelope.sender.clone());
        let lane = self
            .lanes
            .entry(key.clone())
            .or_insert_with(|| self.spawn_lane(key))
            .clone();
        lane.send(envelope)
            .map_err(|e| ParleyError::SessionClosed(e.0.session_id.to_string()))
    }

    fn spawn_lane(&self, key: LaneKey) -> mpsc::UnboundedSender<Envelope> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let router = self.this.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let Some(router) = router.upgrade() else {
                    break;
                };
                router.deliver(envelope).await;
            }
            debug!(session = %key.0, sender = %key.1, "Lane closed");
        });
        tx
    }

    /// Deliver one queued request/event. Runs on the sender's lane.
    async fn deliver(&self, envelope: Envelope) {
        let Some(session) = self.engine.get(envelope.session_id) else {
            self.fail_request(&envelope, ParleyError::SessionInvalid(envelope.session_id.to_string()));
            return;
        };
        if !session.state.accepts_token() {
            self.fail_request(&envelope, ParleyError::SessionClosed(session.id.to_string()));
            return;
        }

        if let Some(transport) = self.stream_for(&envelope) {
            match transport.send(envelope.clone()).await {
                Ok(Delivery::Dropped) => {
                    self.dropped_events.fetch_add(1, Ordering::Relaxed);
                }
                Ok(_) => {
                    self.routed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => self.fail_request(&envelope, e),
            }
            return;
        }

        let Some(handler) = self.handler_for(&session.protocol.name, envelope.kind) else {
            self.fail_request(
                &envelope,
                ParleyError::NoRoute {
                    protocol: session.protocol.name.clone(),
                    kind: envelope.kind.to_string(),
                },
            );
            return;
        };

        self.routed.fetch_add(1, Ordering::Relaxed);
        match handler.handle(&envelope, &session).await {
            Ok(Some(payload)) if envelope.kind == EnvelopeKind::Request => {
                self.resolve(Envelope::response_to(&envelope, payload));
            }
            Ok(_) => {}
            Err(e) => self.fail_request(&envelope, e),
        }
    }

    /// Answer a failed request with an error envelope; events just log.
    fn fail_request(&self, envelope: &Envelope, error: ParleyError) {
        if envelope.kind == EnvelopeKind::Request {
            debug!(envelope = %envelope.id, error = %error, "Request failed in delivery");
            self.resolve(Envelope::error_to(envelope, &error.to_body()));
        } else {
            warn!(envelope = %envelope.id, kind = %envelope.kind, error = %error, "Delivery failed");
        }
    }

    /// Cancel every waiter of a session with `SessionClosed` and drop its
    /// lanes. Returns the number of waiters cancelled.
    pub fn cancel_session(&self, session_id: SessionId) -> usize {
        let cancelled = match self.waiters.remove(&session_id) {
            Some((_, pending)) => {
                let n = pending.len();
                for (_, waiter) in pending {
                    let _ = waiter.send(Err(ParleyError::SessionClosed(session_id.to_string())));
                }
                n
            }
            None => 0,
        };
        self.lanes.retain(|(sid, _), _| *sid != session_id);
        if cancelled > 0 {
            info!(session = %session_id, cancelled, "Pending requests cancelled");
        }
        cancelled
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            pending_requests: self.waiters.iter().map(|e| e.value().len()).sum(),
            routed: self.routed.load(Ordering::Relaxed),
            late_replies: self.late_replies.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
        }
    }
}

impl SessionObserver for MessageRouter {
    fn session_closed(&self, session_id: SessionId, _reason: CloseReason) {
        self.cancel_session(session_id);
    }
}

/// Answers every request by echoing its payload back.
pub struct EchoHandler;

#[async_trait]
impl EnvelopeHandler for EchoHandler {
    async fn handle(
        &self,
        envelope: &Envelope,
        _session: &Session,
    ) -> ParleyResult<Option<serde_json::Value>> {
        Ok(Some(serde_json::json!({ "echo": envelope.payload })))
    }
}

/// Accepts events and logs them.
pub struct EventLogHandler;

#[async_trait]
impl EnvelopeHandler for EventLogHandler {
    async fn handle(
        &self,
        envelope: &Envelope,
        session: &Session,
    ) -> ParleyResult<Option<serde_json::Value>> {
        info!(
            session = %session.id,
            sender = %envelope.sender,
            recipient = %envelope.recipient,
            "Event received"
        );
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AgentCardRegistry;
    use parley_types::agent::{AgentIdentity, ProtocolSpec};
    use parley_types::config::SessionConfig;
    use parley_types::error::ErrorKind;
    use parley_types::negotiation::NegotiationRequest;
    use std::sync::Mutex;

    fn setup() -> (Arc<NegotiationEngine>, Arc<MessageRouter>, SessionId) {
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
        let router = MessageRouter::new(engine.clone(), RouterConfig::default());
        engine.observe(router.clone());
        let resp = engine
            .negotiate(NegotiationRequest {
                requester_id: "alice".to_string(),
                session_id: None,
                preferences: vec![ProtocolSpec::new("a2a", "1.0", &[])],
                required: Vec::new(),
                optional: Vec::new(),
            })
            .unwrap();
        (engine, router, resp.session_id)
    }

    /// Records envelopes; never answers.
    #[derive(Default)]
    struct Recorder(Mutex<Vec<Envelope>>);

    #[async_trait]
    impl EnvelopeHandler for Recorder {
        async fn handle(
            &self,
            envelope: &Envelope,
            _session: &Session,
        ) -> ParleyResult<Option<serde_json::Value>> {
            tokio::task::yield_now().await;
            self.0.lock().unwrap().push(envelope.clone());
            Ok(None)
        }
    }

    struct Failing;

    #[async_trait]
    impl EnvelopeHandler for Failing {
        async fn handle(
            &self,
            _envelope: &Envelope,
            _session: &Session,
        ) -> ParleyResult<Option<serde_json::Value>> {
            Err(ParleyError::Internal("handler exploded".to_string()))
        }
    }

    #[tokio::test]
    async fn test_unknown_session_fails_fast() {
        let (_, router, _) = setup();
        let env = Envelope::event(SessionId::new(), "alice", "me", serde_json::json!({}));
        assert!(matches!(
            router.send(env),
            Err(ParleyError::SessionInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_no_handler_is_no_route() {
        let (_, router, sid) = setup();
        let env = Envelope::event(sid, "alice", "me", serde_json::json!({}));
        assert!(matches!(router.send(env), Err(ParleyError::NoRoute { .. })));
    }

    #[tokio::test]
    async fn test_echo_request_response() {
        let (_, router, sid) = setup();
        router.register_handler(ANY_PROTOCOL, EnvelopeKind::Request, Arc::new(EchoHandler));
        let req = Envelope::request(sid, "alice", "me", serde_json::json!({"q": 1}));
        let resp = router
            .send_request(req.clone(), Some(Duration::from_millis(500)))
            .await
            .unwrap();
        assert_eq!(resp.kind, EnvelopeKind::Response);
        assert_eq!(resp.correlation_id, req.correlation_id);
        assert_eq!(resp.payload["echo"]["q"], 1);
        assert_eq!(router.stats().pending_requests, 0);
    }

    #[tokio::test]
    async fn test_late_response_resolves_once() {
        let (_, router, sid) = setup();
        router.register_handler("a2a", EnvelopeKind::Request, Arc::new(Recorder::default()));
        let req = Envelope::request(sid, "alice", "bob", serde_json::json!({}));

        let responder = {
            let router = router.clone();
            let req = req.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let resp = Envelope::response_to(&req, serde_json::json!({"n": 1}));
                router.send(resp.clone()).unwrap();
                // Duplicate is discarded, not an error
                router.send(resp).unwrap();
            })
        };
        let resp = router
            .send_request(req, Some(Duration::from_millis(500)))
            .await
            .unwrap();
        responder.await.unwrap();
        assert_eq!(resp.payload["n"], 1);
        assert_eq!(router.stats().late_replies, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_wins_and_late_reply_discarded() {
        let (_, router, sid) = setup();
        router.register_handler("a2a", EnvelopeKind::Request, Arc::new(Recorder::default()));
        let req = Envelope::request(sid, "alice", "bob", serde_json::json!({}));
        let err = router
            .send_request(req.clone(), Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, ParleyError::RequestTimeout { timeout_ms: 100, .. }));

        router
            .send(Envelope::response_to(&req, serde_json::json!({})))
            .unwrap();
        let stats = router.stats();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.late_replies, 1);
        assert_eq!(stats.pending_requests, 0);
    }

    #[tokio::test]
    async fn test_reply_to_abandoned_request_is_late() {
        let (_, router, sid) = setup();
        router.register_handler("a2a", EnvelopeKind::Request, Arc::new(Recorder::default()));
        let req = Envelope::request(sid, "alice", "bob", serde_json::json!({}));
        let pending = {
            let router = router.clone();
            let req = req.clone();
            tokio::spawn(async move { router.send_request(req, Some(Duration::from_secs(10))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(router.stats().pending_requests, 1);
        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());

        let routed = router.stats().routed;
        router
            .send(Envelope::response_to(&req, serde_json::json!({})))
            .unwrap();
        let stats = router.stats();
        assert_eq!(stats.routed, routed);
        assert_eq!(stats.late_replies, 1);
        assert_eq!(stats.pending_requests, 0);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_envelope() {
        let (_, router, sid) = setup();
        router.register_handler("a2a", EnvelopeKind::Request, Arc::new(Failing));
        let req = Envelope::request(sid, "alice", "me", serde_json::json!({}));
        let reply = router
            .send_request(req, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(reply.kind, EnvelopeKind::Error);
        assert_eq!(reply.payload["kind"], serde_json::json!(ErrorKind::Internal));
    }

    #[tokio::test]
    async fn test_revoke_cancels_waiters() {
        let (engine, router, sid) = setup();
        router.register_handler("a2a", EnvelopeKind::Request, Arc::new(Recorder::default()));
        let req = Envelope::request(sid, "alice", "bob", serde_json::json!({}));
        let pending = {
            let router = router.clone();
            tokio::spawn(async move { router.send_request(req, Some(Duration::from_secs(10))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        engine.revoke(sid).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ParleyError::SessionClosed(_))));

        let env = Envelope::event(sid, "alice", "bob", serde_json::json!({}));
        assert!(matches!(router.send(env), Err(ParleyError::SessionInvalid(_))));
    }

    #[tokio::test]
    async fn test_per_sender_order_preserved() {
        let (_, router, sid) = setup();
        let recorder = Arc::new(Recorder::default());
        router.register_handler(ANY_PROTOCOL, EnvelopeKind::Event, recorder.clone());
        for n in 0..50 {
            router
                .send(Envelope::event(sid, "alice", "me", serde_json::json!({ "n": n })))
                .unwrap();
        }
        for _ in 0..100 {
            if recorder.0.lock().unwrap().len() == 50 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let seen: Vec<i64> = recorder
            .0
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.payload["n"].as_i64().unwrap())
            .collect();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_duplicate_correlation_rejected() {
        let (_, router, sid) = setup();
        router.register_handler("a2a", EnvelopeKind::Request, Arc::new(Recorder::default()));
        let req = Envelope::request(sid, "alice", "bob", serde_json::json!({}));
        let first = {
            let router = router.clone();
            let req = req.clone();
            tokio::spawn(async move { router.send_request(req, Some(Duration::from_millis(200))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            router.send_request(req, None).await,
            Err(ParleyError::InvalidInput(_))
        ));
        let _ = first.await;
    }

    #[test]
    fn test_timeout_clamped() {
        let (_, router, _) = setup();
        assert_eq!(router.clamp_timeout(None), Duration::from_millis(30_000));
        assert_eq!(
            router.clamp_timeout(Some(Duration::from_secs(3600))),
            Duration::from_millis(300_000)
        );
    }
}
