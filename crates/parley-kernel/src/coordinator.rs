//! Coordinator: assembles every component and owns their lifecycle.
//!
//! Session closure fans out through [`SessionObserver`]s registered on the
//! negotiation engine: the router cancels waiters, the dispatcher drops
//! subscriptions and the streaming transport terminates connections.

use crate::bridge::{McpBridge, ToolRuntime};
use crate::config::validate_config;
use crate::discovery::DiscoveryService;
use crate::error::{KernelError, KernelResult};
use crate::mcp::McpHttpRuntime;
use crate::negotiation::{NegotiationEngine, SessionObserver};
use crate::notify::{DispatcherStats, NotificationDispatcher, NotificationSink, WebhookSink};
use crate::registry::AgentCardRegistry;
use crate::router::{EchoHandler, EventLogHandler, MessageRouter, RouterStats, ANY_PROTOCOL};
use crate::supervisor::{Supervisor, SupervisorHealth};
use async_trait::async_trait;
use parley_types::config::CoordinatorConfig;
use parley_types::envelope::{Envelope, EnvelopeKind, MessageRequest};
use parley_types::error::{ParleyError, ParleyResult};
use parley_types::notification::NotifyRequest;
use parley_types::session::{CloseReason, Session, SessionId};
use parley_wire::{SessionGate, StreamingTransport, TransportConfig};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub struct Coordinator {
    pub config: CoordinatorConfig,
    pub registry: Arc<AgentCardRegistry>,
    pub discovery: DiscoveryService,
    pub engine: Arc<NegotiationEngine>,
    pub router: Arc<MessageRouter>,
    pub bridge: McpBridge,
    pub notifications: Arc<NotificationDispatcher>,
    pub transport: Arc<StreamingTransport>,
    pub supervisor: Supervisor,
    started_at: Instant,
}

/// Snapshot served by `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorHealth {
    pub status: &'static str,
    pub sessions: usize,
    pub uptime_secs: u64,
    pub streams: usize,
    pub router: RouterStats,
    pub notifications: DispatcherStats,
    pub supervisor: SupervisorHealth,
}

/// Bridges the streaming transport back into the engine and router.
struct CoordinatorGate {
    engine: Arc<NegotiationEngine>,
    router: Arc<MessageRouter>,
}

#[async_trait]
impl SessionGate for CoordinatorGate {
    fn authenticate(&self, token: &str) -> ParleyResult<Session> {
        self.engine.authenticate(token)
    }

    fn touch(&self, session_id: SessionId) -> ParleyResult<Session> {
        self.engine.touch(session_id)
    }

    fn is_usable(&self, session_id: SessionId) -> bool {
        self.engine.is_usable(session_id)
    }

    async fn deliver_inbound(&self, envelope: Envelope) -> ParleyResult<()> {
        self.router.accept_inbound(envelope)
    }

    fn revoke(&self, session_id: SessionId) -> bool {
        matches!(self.engine.revoke(session_id), Ok(true))
    }
}

impl SessionObserver for StreamingTransport {
    fn session_closed(&self, session_id: SessionId, reason: CloseReason) {
        let closed = self.close_session(session_id, &reason.to_string());
        if closed > 0 {
            debug!(session = %session_id, closed, "Streams closed with session");
        }
    }
}

impl Coordinator {
    /// Boot with the configured MCP servers and webhook delivery.
    pub fn boot(config: CoordinatorConfig) -> KernelResult<Arc<Self>> {
        let runtime = Arc::new(McpHttpRuntime::new(
            config.tools.servers.clone(),
            Duration::from_secs(config.tools.list_cache_secs),
        ));
        let sink = Arc::new(WebhookSink::new(Duration::from_secs(
            config.notifications.delivery_timeout_secs,
        )));
        Self::boot_with(config, runtime, sink)
    }

    /// Boot with explicit collaborators.
    pub fn boot_with(
        config: CoordinatorConfig,
        runtime: Arc<dyn ToolRuntime>,
        sink: Arc<dyn NotificationSink>,
    ) -> KernelResult<Arc<Self>> {
        validate_config(&config)?;

        let base_url = if config.agent.base_url.is_empty() {
            format!("http://{}", config.listen_addr)
        } else {
            config.agent.base_url.clone()
        };
        let registry = Arc::new(AgentCardRegistry::new(
            config.agent.identity(),
            config.protocols.clone(),
            &base_url,
        ));
        for capability in &config.capabilities {
            registry.register_capability(capability.clone()).map_err(|e| {
                KernelError::BootFailed(format!("capability '{}': {e}", capability.name))
            })?;
        }

        let engine = Arc::new(NegotiationEngine::new(
            registry.clone(),
            config.protocols.clone(),
            &config.session,
        ));
        let router = MessageRouter::new(engine.clone(), config.router.clone());
        router.register_handler(ANY_PROTOCOL, EnvelopeKind::Request, Arc::new(EchoHandler));
        router.register_handler(ANY_PROTOCOL, EnvelopeKind::Event, Arc::new(EventLogHandler));

        let gate = Arc::new(CoordinatorGate {
            engine: engine.clone(),
            router: router.clone(),
        });
        let transport = Arc::new(StreamingTransport::new(
            TransportConfig::from(&config.stream),
            gate,
        ));
        router.attach_transport(transport.clone());

        let notifications = Arc::new(NotificationDispatcher::new(
            engine.clone(),
            sink,
            config.notifications.default_retry,
            config.notifications.failure_history,
        ));
        let bridge = McpBridge::new(runtime, engine.clone(), &config.tools);

        engine.observe(router.clone());
        engine.observe(notifications.clone());
        engine.observe(transport.clone());

        info!(
            agent = %config.agent.id,
            protocols = config.protocols.len(),
            capabilities = config.capabilities.len(),
            tool_servers = config.tools.servers.len(),
            "Coordinator booted"
        );

        Ok(Arc::new(Self {
            discovery: DiscoveryService::new(registry.clone()),
            config,
            registry,
            engine,
            router,
            bridge,
            notifications,
            transport,
            supervisor: Supervisor::new(),
            started_at: Instant::now(),
        }))
    }

    /// Spawn the session sweeper and the stream heartbeat. Both stop on
    /// [`Coordinator::shutdown`].
    pub fn start_background(self: &Arc<Self>) {
        let interval = Duration::from_secs(self.config.session.sweep_interval_secs.max(1));
        let this = Arc::clone(self);
        let mut shutdown = self.supervisor.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let closed = this.engine.sweep();
                        if !closed.is_empty() {
                            info!(closed = closed.len(), "Session sweep closed sessions");
                        }
                        this.supervisor.record_sweep(closed.len());
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Session sweeper stopped");
        });

        tokio::spawn(self.transport.clone().run_heartbeat(self.supervisor.subscribe()));
        info!(sweep_interval_secs = interval.as_secs(), "Background tasks started");
    }

    /// Resolve a bearer token to its session.
    pub fn authenticate(&self, token: &str) -> ParleyResult<Session> {
        self.engine.authenticate(token)
    }

    /// Close the session when `result` failed with an error that is fatal
    /// to it (`Unauthorized`, `SessionClosed`).
    pub fn enforce<T>(&self, session_id: SessionId, result: ParleyResult<T>) -> ParleyResult<T> {
        if let Err(e) = &result {
            if e.is_fatal_to_session() && matches!(self.engine.revoke(session_id), Ok(true)) {
                warn!(session = %session_id, error = %e, "Session closed after fatal error");
            }
        }
        result
    }

    /// `POST /message`: the envelope must belong to the caller's session
    /// and name the caller as sender.
    pub async fn handle_message(
        &self,
        session: &Session,
        request: MessageRequest,
    ) -> ParleyResult<Option<Envelope>> {
        let result = self.route_message(session, request).await;
        self.enforce(session.id, result)
    }

    async fn route_message(
        &self,
        session: &Session,
        request: MessageRequest,
    ) -> ParleyResult<Option<Envelope>> {
        let envelope = request.envelope;
        if envelope.session_id != session.id {
            return Err(ParleyError::Unauthorized(
                "envelope session does not match token".to_string(),
            ));
        }
        if envelope.sender != session.peer_id {
            return Err(ParleyError::Unauthorized(format!(
                "sender '{}' is not the session peer",
                envelope.sender
            )));
        }

        if request.await_response {
            let timeout = request.timeout_ms.map(Duration::from_millis);
            self.router.send_request(envelope, timeout).await.map(Some)
        } else {
            self.router.send(envelope).map(|_| None)
        }
    }

    /// `POST /notify`.
    pub fn handle_notify(
        &self,
        session: &Session,
        request: NotifyRequest,
    ) -> ParleyResult<serde_json::Value> {
        request.validate().map_err(ParleyError::InvalidInput)?;
        match request {
            NotifyRequest::Subscribe {
                event_types,
                endpoint,
                retry,
            } => {
                let sub = self
                    .notifications
                    .subscribe(session, event_types, endpoint, retry)?;
                Ok(serde_json::json!({ "subscription_id": sub.id }))
            }
            NotifyRequest::Unsubscribe { subscription_id } => {
                let removed = self.notifications.unsubscribe(session.id, &subscription_id);
                Ok(serde_json::json!({ "removed": removed }))
            }
            NotifyRequest::Publish {
                event_type,
                payload,
            } => {
                let matched = self.notifications.publish(&event_type, payload);
                Ok(serde_json::json!({ "matched": matched }))
            }
        }
    }

    /// Close a session explicitly.
    pub fn revoke(&self, session_id: SessionId) -> ParleyResult<bool> {
        let revoked = self.engine.revoke(session_id)?;
        if revoked {
            info!(session = %session_id, "Session revoked");
        }
        Ok(revoked)
    }

    pub fn health(&self) -> CoordinatorHealth {
        let supervisor = self.supervisor.health();
        CoordinatorHealth {
            status: if supervisor.is_shutting_down {
                "shutting_down"
            } else {
                "ok"
            },
            sessions: self.engine.open_count(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            streams: self.transport.registry().connected_count(),
            router: self.router.stats(),
            notifications: self.notifications.stats(),
            supervisor,
        }
    }

    /// Close every session and stream and stop background tasks.
    pub fn shutdown(&self) {
        if self.supervisor.is_shutting_down() {
            warn!("Shutdown already in progress");
            return;
        }
        let closed = self.engine.close_all(CloseReason::Shutdown);
        self.transport.shutdown();
        self.supervisor.shutdown();
        info!(closed_sessions = closed, "Coordinator shut down");
    }
}
