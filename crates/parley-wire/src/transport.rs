//! StreamingTransport: long-lived, resumable agent connections.
//!
//! The transport is socket-agnostic: the HTTP layer performs the WebSocket
//! upgrade, hands the first client frame to [`StreamingTransport::open`] and
//! then pumps frames between the socket and the returned [`Attachment`].
//!
//! The [`SessionGate`] trait abstracts the kernel's session table and
//! message router so this crate never depends on them directly.

use crate::frame::StreamFrame;
use crate::registry::{Connection, ConnectionKey, ConnectionRegistry, LinkState, StreamStats};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parley_types::config::StreamConfig;
use parley_types::envelope::Envelope;
use parley_types::error::{ErrorBody, ParleyError, ParleyResult};
use parley_types::session::{Session, SessionId};
use rand::RngCore;
use sha2::Sha256;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Sign resumption-token data with HMAC-SHA256.
fn hmac_sign(secret: &str, data: &[u8]) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify an HMAC-SHA256 signature using constant-time comparison.
fn hmac_verify(secret: &str, data: &[u8], signature: &str) -> bool {
    let expected = hmac_sign(secret, data);
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
}

/// Errors from the streaming layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Invalid resumption token")]
    InvalidResumeToken,
    #[error("Resumption window expired")]
    ResumeExpired,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Session(#[from] ParleyError),
}

impl From<WireError> for ParleyError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Session(inner) => inner,
            WireError::InvalidResumeToken => ParleyError::Unauthorized(e.to_string()),
            WireError::ResumeExpired | WireError::ConnectionClosed => {
                ParleyError::SessionInvalid(e.to_string())
            }
            WireError::Json(_) | WireError::FrameTooLarge { .. } | WireError::HandshakeFailed(_) => {
                ParleyError::InvalidInput(e.to_string())
            }
        }
    }
}

impl WireError {
    pub fn to_body(self) -> ErrorBody {
        ParleyError::from(self).to_body()
    }
}

/// Runtime settings, resolved from `[stream]`.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub buffer_capacity: usize,
    pub resume_window: Duration,
    pub resume_secret: String,
}

impl From<&StreamConfig> for TransportConfig {
    fn from(c: &StreamConfig) -> Self {
        let resume_secret = if c.resume_secret.is_empty() {
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            hex::encode(bytes)
        } else {
            c.resume_secret.clone()
        };
        Self {
            heartbeat_interval: Duration::from_secs(c.heartbeat_interval_secs.max(1)),
            heartbeat_timeout: Duration::from_secs(c.heartbeat_timeout_secs.max(1)),
            buffer_capacity: c.buffer_capacity.max(1),
            resume_window: Duration::from_secs(c.resume_window_secs),
            resume_secret,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

/// Trait for the kernel to validate sessions and accept inbound traffic.
#[async_trait]
pub trait SessionGate: Send + Sync + 'static {
    /// Resolve a bearer token to its session, touching it.
    fn authenticate(&self, token: &str) -> ParleyResult<Session>;

    /// Touch a session by id. Fails if it no longer accepts traffic.
    fn touch(&self, session_id: SessionId) -> ParleyResult<Session>;

    /// Whether the session still exists and accepts traffic.
    fn is_usable(&self, session_id: SessionId) -> bool;

    /// Hand an envelope received over a stream to the router.
    async fn deliver_inbound(&self, envelope: Envelope) -> ParleyResult<()>;

    /// Close a session after a fatal error on one of its streams. Returns
    /// whether this call closed it.
    fn revoke(&self, session_id: SessionId) -> bool;
}

/// Result of a successful `hello`/`resume`.
pub struct Attachment {
    pub connection: Arc<Connection>,
    /// Identifies this socket's tenure on the connection.
    pub epoch: u64,
    /// Frames to write to the socket, starting with `welcome`.
    pub outbound: mpsc::UnboundedReceiver<StreamFrame>,
}

/// What happened to an outbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the live socket under this sequence number.
    Sent(u64),
    /// Held for replay; no socket attached.
    Buffered(u64),
    /// Event refused because the buffer was full.
    Dropped,
}

pub struct StreamingTransport {
    config: TransportConfig,
    registry: ConnectionRegistry,
    gate: Arc<dyn SessionGate>,
}

impl StreamingTransport {
    pub fn new(config: TransportConfig, gate: Arc<dyn SessionGate>) -> Self {
        Self {
            config,
            registry: ConnectionRegistry::new(),
            gate,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Process the first frame of a new socket.
    ///
    /// `hello` needs the bearer token presented on the upgrade request;
    /// `resume` is authorized by its signed resumption token alone.
    pub fn open(&self, token: Option<&str>, first: StreamFrame) -> Result<Attachment, WireError> {
        match first {
            StreamFrame::Hello { agent_id } => {
                let token = token.ok_or_else(|| {
                    ParleyError::Unauthorized("missing session token".to_string())
                })?;
                let session = self.gate.authenticate(token)?;
                if agent_id != session.peer_id {
                    return Err(ParleyError::Unauthorized(format!(
                        "agent '{agent_id}' does not own session {}",
                        session.id
                    ))
                    .into());
                }
                let key = ConnectionKey::new(&agent_id, session.id);
                let conn = self
                    .registry
                    .get_or_create(key, self.config.buffer_capacity);
                let after = conn
                    .buffer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .acked();
                Ok(self.attach(conn, after))
            }
            StreamFrame::Resume {
                resume_token,
                last_seq,
            } => {
                let (key, connection_id) = self.verify_resume_token(&resume_token)?;
                let conn = self
                    .registry
                    .get(&key)
                    .filter(|c| c.connection_id == connection_id && !c.is_closed())
                    .ok_or(WireError::ResumeExpired)?;
                {
                    let link = conn.link.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(since) = link.detached_at {
                        if since.elapsed() > self.config.resume_window {
                            return Err(WireError::ResumeExpired);
                        }
                    }
                }
                self.gate.touch(key.session_id)?;
                conn.buffer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .ack(last_seq);
                conn.space.notify_waiters();
                conn.replays.fetch_add(1, Ordering::Relaxed);
                Ok(self.attach(conn, last_seq))
            }
            other => Err(WireError::HandshakeFailed(format!(
                "expected hello or resume, got {}",
                other.name()
            ))),
        }
    }

    /// Bind a fresh socket channel to `conn` and queue welcome + replay.
    fn attach(&self, conn: Arc<Connection>, after_seq: u64) -> Attachment {
        let (tx, rx) = mpsc::unbounded_channel();
        // Buffer lock first so no concurrent send slips between replay and
        // the new channel becoming live.
        let buffer = conn.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let replay = buffer.replay(after_seq);
        let epoch = {
            let mut link = conn.link.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(old) = link.tx.take() {
                let _ = old.send(StreamFrame::Close {
                    reason: "superseded by a newer connection".to_string(),
                });
            }
            link.epoch += 1;
            link.state = LinkState::Connected;
            link.last_seen = Instant::now();
            link.detached_at = None;
            link.tx = Some(tx.clone());
            link.epoch
        };

        let resumed = !replay.is_empty();
        let _ = tx.send(StreamFrame::Welcome {
            connection_id: conn.connection_id.clone(),
            resume_token: self.issue_resume_token(&conn),
            resumed,
            next_seq: buffer.next_seq(),
        });
        for frame in replay {
            if matches!(frame, StreamFrame::Gap { .. }) {
                conn.gaps.fetch_add(1, Ordering::Relaxed);
            }
            let _ = tx.send(frame);
        }
        drop(buffer);

        info!(
            agent = %conn.key.agent_id,
            session = %conn.key.session_id,
            connection = %conn.connection_id,
            epoch,
            resumed,
            "Stream attached"
        );
        Attachment {
            connection: conn,
            epoch,
            outbound: rx,
        }
    }

    /// Mark a socket as gone. The connection stays resumable.
    pub fn detach(&self, conn: &Arc<Connection>, epoch: u64) {
        let mut link = conn.link.lock().unwrap_or_else(|e| e.into_inner());
        if link.epoch != epoch || link.state != LinkState::Connected {
            return;
        }
        link.state = LinkState::Disconnected;
        link.tx = None;
        link.detached_at = Some(Instant::now());
        drop(link);
        conn.space.notify_waiters();
        info!(
            agent = %conn.key.agent_id,
            session = %conn.key.session_id,
            "Stream detached; buffer kept for resumption"
        );
    }

    /// Whether `agent_id` holds a (possibly detached) stream for the session.
    pub fn has_connection(&self, session_id: SessionId, agent_id: &str) -> bool {
        self.registry
            .get(&ConnectionKey::new(agent_id, session_id))
            .is_some_and(|c| !c.is_closed())
    }

    /// Queue an envelope for its recipient's stream.
    ///
    /// Events are dropped (and counted) when the buffer is full and a
    /// socket is attached. Requests, responses and errors wait for space
    /// instead. With no socket attached the oldest entry is evicted and
    /// the client will see a gap marker on resume.
    pub async fn send(&self, envelope: Envelope) -> ParleyResult<Delivery> {
        let key = ConnectionKey::new(&envelope.recipient, envelope.session_id);
        let conn = self
            .registry
            .get(&key)
            .ok_or_else(|| ParleyError::SessionInvalid(format!(
                "no stream for agent '{}' in session {}",
                key.agent_id, key.session_id
            )))?;
        let critical = envelope.kind.is_critical();

        loop {
            let notified = conn.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if conn.is_closed() {
                return Err(ParleyError::SessionClosed(key.session_id.to_string()));
            }
            {
                let mut buffer = conn.buffer.lock().unwrap_or_else(|e| e.into_inner());
                let attached = conn.state() == LinkState::Connected;
                if !(buffer.is_full() && attached) {
                    let outcome = buffer.push(envelope.clone());
                    if let crate::buffer::PushOutcome::StoredWithEviction { evicted, .. } = outcome
                    {
                        debug!(agent = %key.agent_id, evicted, "Stream buffer overflow; oldest evicted");
                    }
                    let seq = outcome.seq();
                    let sent = conn.push_frame(StreamFrame::Data { seq, envelope });
                    return Ok(if sent {
                        Delivery::Sent(seq)
                    } else {
                        Delivery::Buffered(seq)
                    });
                }
                if !critical {
                    buffer.record_dropped_event();
                    warn!(
                        agent = %key.agent_id,
                        session = %key.session_id,
                        "Stream buffer full; event dropped"
                    );
                    return Ok(Delivery::Dropped);
                }
            }
            debug!(agent = %key.agent_id, kind = %envelope.kind, "Stream buffer full; waiting for ack");
            notified.await;
        }
    }

    /// Handle a frame read from an attached socket.
    pub async fn handle_frame(&self, conn: &Arc<Connection>, frame: StreamFrame) {
        {
            let mut link = conn.link.lock().unwrap_or_else(|e| e.into_inner());
            link.last_seen = Instant::now();
        }
        match frame {
            StreamFrame::Ack { seq } => {
                let released = conn
                    .buffer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .ack(seq);
                if released > 0 {
                    conn.space.notify_waiters();
                }
            }
            StreamFrame::Ping { ts } => {
                conn.push_frame(StreamFrame::Pong { ts });
            }
            StreamFrame::Pong { .. } => {}
            StreamFrame::Send { envelope } => {
                if let Err(e) = self.accept_inbound(conn, envelope).await {
                    let fatal = e.is_fatal_to_session();
                    debug!(agent = %conn.key.agent_id, error = %e, fatal, "Inbound envelope rejected");
                    conn.push_frame(StreamFrame::Error { error: e.to_body() });
                    if fatal && self.gate.revoke(conn.key.session_id) {
                        warn!(
                            agent = %conn.key.agent_id,
                            session = %conn.key.session_id,
                            "Session closed after fatal stream error"
                        );
                    }
                }
            }
            other => {
                let err = ParleyError::InvalidInput(format!(
                    "unexpected '{}' frame on an open stream",
                    other.name()
                ));
                conn.push_frame(StreamFrame::Error {
                    error: err.to_body(),
                });
            }
        }
    }

    async fn accept_inbound(&self, conn: &Arc<Connection>, envelope: Envelope) -> ParleyResult<()> {
        if envelope.session_id != conn.key.session_id {
            return Err(ParleyError::Unauthorized(format!(
                "envelope session {} does not match stream session {}",
                envelope.session_id, conn.key.session_id
            )));
        }
        if envelope.sender != conn.key.agent_id {
            return Err(ParleyError::Unauthorized(format!(
                "sender '{}' does not match stream agent '{}'",
                envelope.sender, conn.key.agent_id
            )));
        }
        self.gate.touch(envelope.session_id)?;
        self.gate.deliver_inbound(envelope).await
    }

    /// One heartbeat pass: ping live sockets, detach stale ones, expire
    /// detached connections past the resumption window, and close
    /// connections whose session is gone.
    pub fn heartbeat_tick(&self) {
        let now = Instant::now();
        for conn in self.registry.all() {
            if conn.is_closed() {
                continue;
            }
            if !self.gate.is_usable(conn.key.session_id) {
                self.close_connection(&conn, "session closed");
                continue;
            }
            let (state, last_seen, detached_at, epoch) = {
                let link = conn.link.lock().unwrap_or_else(|e| e.into_inner());
                (link.state, link.last_seen, link.detached_at, link.epoch)
            };
            match state {
                LinkState::Connected => {
                    if now.duration_since(last_seen) > self.config.heartbeat_timeout {
                        warn!(
                            agent = %conn.key.agent_id,
                            session = %conn.key.session_id,
                            "Stream stale; no heartbeat within timeout"
                        );
                        conn.push_frame(StreamFrame::Close {
                            reason: "heartbeat timeout".to_string(),
                        });
                        self.detach(&conn, epoch);
                    } else {
                        conn.push_frame(StreamFrame::Ping {
                            ts: chrono::Utc::now().timestamp_millis(),
                        });
                    }
                }
                LinkState::Disconnected => {
                    let expired = detached_at
                        .is_some_and(|since| now.duration_since(since) > self.config.resume_window);
                    if expired {
                        debug!(agent = %conn.key.agent_id, "Resumption window elapsed");
                        self.close_connection(&conn, "resumption window elapsed");
                    }
                }
            }
        }
    }

    /// Run heartbeats until `shutdown` flips to true.
    pub async fn run_heartbeat(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.heartbeat_tick(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Stream heartbeat stopped");
    }

    /// Terminate every connection of a session. Returns how many closed.
    pub fn close_session(&self, session_id: SessionId, reason: &str) -> usize {
        let conns = self.registry.for_session(session_id);
        for conn in &conns {
            self.close_connection(conn, reason);
        }
        conns.len()
    }

    /// Terminate every connection.
    pub fn shutdown(&self) {
        for conn in self.registry.all() {
            self.close_connection(&conn, "shutdown");
        }
    }

    fn close_connection(&self, conn: &Arc<Connection>, reason: &str) {
        if conn.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut link = conn.link.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(tx) = link.tx.take() {
                let _ = tx.send(StreamFrame::Close {
                    reason: reason.to_string(),
                });
            }
            link.state = LinkState::Disconnected;
        }
        self.registry.remove(conn);
        conn.space.notify_waiters();
        info!(
            agent = %conn.key.agent_id,
            session = %conn.key.session_id,
            reason,
            "Stream closed"
        );
    }

    pub fn stats(&self) -> Vec<StreamStats> {
        self.registry.all().iter().map(|c| c.stats()).collect()
    }

    pub fn stats_for(&self, session_id: SessionId, agent_id: &str) -> Option<StreamStats> {
        self.registry
            .get(&ConnectionKey::new(agent_id, session_id))
            .map(|c| c.stats())
    }

    /// `hex(session|connection|agent).hmac`
    fn issue_resume_token(&self, conn: &Connection) -> String {
        let payload = format!(
            "{}|{}|{}",
            conn.key.session_id, conn.connection_id, conn.key.agent_id
        );
        let sig = hmac_sign(&self.config.resume_secret, payload.as_bytes());
        format!("{}.{}", hex::encode(payload.as_bytes()), sig)
    }

    fn verify_resume_token(&self, token: &str) -> Result<(ConnectionKey, String), WireError> {
        let (payload_hex, sig) = token.split_once('.').ok_or(WireError::InvalidResumeToken)?;
        let payload = hex::decode(payload_hex).map_err(|_| WireError::InvalidResumeToken)?;
        if !hmac_verify(&self.config.resume_secret, &payload, sig) {
            return Err(WireError::InvalidResumeToken);
        }
        let payload = String::from_utf8(payload).map_err(|_| WireError::InvalidResumeToken)?;
        let mut parts = payload.splitn(3, '|');
        let (Some(session), Some(connection_id), Some(agent_id)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(WireError::InvalidResumeToken);
        };
        let session_id = SessionId::parse(session).ok_or(WireError::InvalidResumeToken)?;
        Ok((
            ConnectionKey::new(agent_id, session_id),
            connection_id.to_string(),
        ))
    }
}
