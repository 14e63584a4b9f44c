//! NegotiationEngine: protocol/capability agreement and the session table.
//!
//! Sessions live in a [`DashMap`] keyed by [`SessionId`]. Every state
//! transition happens while holding that entry's shard lock, so concurrent
//! `touch`/`revoke`/sweep calls on one session are serialized while
//! different sessions proceed independently.
//!
//! Closing a session (revoke, idle timeout, expiry, shutdown) notifies every
//! registered [`SessionObserver`] after the entry lock is released.

use crate::registry::AgentCardRegistry;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parley_types::agent::ProtocolSpec;
use parley_types::config::SessionConfig;
use parley_types::error::{ParleyError, ParleyResult};
use parley_types::negotiation::{NegotiationRequest, NegotiationResponse};
use parley_types::session::{CloseReason, Session, SessionId, SessionState};
use rand::RngCore;
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

/// Session token length in bytes (hex-encoded on the wire).
const TOKEN_BYTES: usize = 32;

/// Receives session closure notifications.
pub trait SessionObserver: Send + Sync + 'static {
    fn session_closed(&self, session_id: SessionId, reason: CloseReason);
}

pub struct NegotiationEngine {
    registry: Arc<AgentCardRegistry>,
    supported: Vec<ProtocolSpec>,
    token_ttl: Duration,
    idle_timeout: Duration,
    idle_grace: Duration,
    sessions: DashMap<SessionId, Session>,
    /// token → session id
    tokens: DashMap<String, SessionId>,
    observers: RwLock<Vec<Arc<dyn SessionObserver>>>,
}

impl NegotiationEngine {
    pub fn new(
        registry: Arc<AgentCardRegistry>,
        supported: Vec<ProtocolSpec>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            registry,
            supported,
            token_ttl: secs(config.token_ttl_secs),
            idle_timeout: secs(config.idle_timeout_secs),
            idle_grace: secs(config.idle_grace_secs),
            sessions: DashMap::new(),
            tokens: DashMap::new(),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register a closure observer.
    pub fn observe(&self, observer: Arc<dyn SessionObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    /// Agree on a protocol and capability set and open a session.
    ///
    /// A failed negotiation ends in `Rejected` and leaves nothing behind in
    /// the session table.
    pub fn negotiate(&self, request: NegotiationRequest) -> ParleyResult<NegotiationResponse> {
        let mut state = SessionState::Uninitiated;
        let result = self.try_negotiate(&request, &mut state);
        if let Err(ref e) = result {
            state = SessionState::Rejected;
            info!(
                requester = %request.requester_id,
                state = %state,
                error = %e,
                "Negotiation rejected"
            );
        }
        result
    }

    fn try_negotiate(
        &self,
        request: &NegotiationRequest,
        state: &mut SessionState,
    ) -> ParleyResult<NegotiationResponse> {
        if request.requester_id.trim().is_empty() {
            return Err(ParleyError::InvalidInput(
                "requester_id must not be empty".to_string(),
            ));
        }
        if request.preferences.is_empty() {
            return Err(ParleyError::InvalidInput(
                "at least one protocol preference is required".to_string(),
            ));
        }
        *state = SessionState::Negotiating;

        let protocol = self.select_protocol(&request.preferences)?;

        let missing: Vec<String> = request
            .required
            .iter()
            .filter(|name| !self.registry.is_available(name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ParleyError::MissingRequiredCapability(missing));
        }

        let mut granted: BTreeSet<String> = request.required.iter().cloned().collect();
        let mut dropped_optional = Vec::new();
        for name in &request.optional {
            if self.registry.is_available(name) {
                granted.insert(name.clone());
            } else if !dropped_optional.contains(name) {
                dropped_optional.push(name.clone());
            }
        }

        let id = request.session_id.unwrap_or_default();
        let now = Utc::now();
        let token = generate_token();
        let session = Session {
            id,
            peer_id: request.requester_id.clone(),
            granted: granted.clone(),
            protocol: protocol.clone(),
            token: token.clone(),
            created_at: now,
            last_active: now,
            expires_at: now + self.token_ttl,
            state: SessionState::Active,
            close_reason: None,
        };

        match self.sessions.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(ParleyError::SessionInvalid(format!(
                    "session id {id} is already in use"
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session);
            }
        }
        self.tokens.insert(token.clone(), id);
        *state = SessionState::Active;

        info!(
            session = %id,
            peer = %request.requester_id,
            protocol = %protocol,
            granted = granted.len(),
            dropped = dropped_optional.len(),
            "Session negotiated"
        );

        Ok(NegotiationResponse {
            session_id: id,
            protocol,
            granted: granted.into_iter().collect(),
            dropped_optional,
            token,
            expires_at: now + self.token_ttl,
        })
    }

    /// First preference (in the requester's order) that a supported
    /// protocol can serve.
    fn select_protocol(&self, preferences: &[ProtocolSpec]) -> ParleyResult<ProtocolSpec> {
        for pref in preferences {
            let Some(wanted) = pref.parsed_version() else {
                debug!(protocol = %pref, "Skipping unparseable protocol preference");
                continue;
            };
            let best = self
                .supported
                .iter()
                .filter(|s| s.name == pref.name)
                .filter_map(|s| s.parsed_version().map(|v| (v, s)))
                .filter(|(v, _)| v.satisfies(&wanted))
                .max_by(|(a, _), (b, _)| a.cmp(b));
            if let Some((_, supported)) = best {
                let features = pref
                    .features
                    .iter()
                    .filter(|f| supported.features.contains(f))
                    .cloned()
                    .collect();
                return Ok(ProtocolSpec {
                    name: pref.name.clone(),
                    version: pref.version.clone(),
                    features,
                });
            }
        }
        Err(ParleyError::ProtocolMismatch {
            requested: join_protocols(preferences),
            supported: join_protocols(&self.supported),
        })
    }

    /// Resolve a bearer token and touch its session.
    pub fn authenticate(&self, token: &str) -> ParleyResult<Session> {
        let id = self
            .tokens
            .get(token)
            .map(|e| *e.value())
            .ok_or_else(|| ParleyError::Unauthorized("unknown session token".to_string()))?;
        {
            let session = self
                .sessions
                .get(&id)
                .ok_or_else(|| ParleyError::Unauthorized("unknown session token".to_string()))?;
            let matches: bool = session.token.as_bytes().ct_eq(token.as_bytes()).into();
            if !matches {
                return Err(ParleyError::Unauthorized("session token mismatch".to_string()));
            }
        }
        self.touch(id).map_err(|e| match e {
            ParleyError::SessionClosed(msg) => ParleyError::Unauthorized(msg),
            other => other,
        })
    }

    /// Record activity on a session, reviving it from `Idle`.
    ///
    /// Fails with `SessionClosed` once the session is closed or its token
    /// has expired.
    pub fn touch(&self, id: SessionId) -> ParleyResult<Session> {
        let now = Utc::now();
        let mut expired = false;
        let result = match self.sessions.get_mut(&id) {
            None => Err(ParleyError::SessionInvalid(format!("unknown session {id}"))),
            Some(mut session) => {
                if session.state.accepts_token() && now >= session.expires_at {
                    close_in_place(&mut session, CloseReason::Expired);
                    expired = true;
                }
                match session.state {
                    SessionState::Active | SessionState::Idle => {
                        if session.state == SessionState::Idle {
                            debug!(session = %id, "Session revived from idle");
                        }
                        session.state = SessionState::Active;
                        session.last_active = now;
                        Ok(session.clone())
                    }
                    _ => Err(ParleyError::SessionClosed(id.to_string())),
                }
            }
        };
        if expired {
            self.after_close(id, CloseReason::Expired);
        }
        result
    }

    /// Force a session closed. Closing an already-closed session is a
    /// no-op and returns `Ok(false)`.
    pub fn revoke(&self, id: SessionId) -> ParleyResult<bool> {
        self.close(id, CloseReason::Revoked)
    }

    /// Close a session for `reason`.
    pub fn close(&self, id: SessionId, reason: CloseReason) -> ParleyResult<bool> {
        let closed = match self.sessions.get_mut(&id) {
            None => return Err(ParleyError::SessionInvalid(format!("unknown session {id}"))),
            Some(mut session) => {
                if session.state.is_terminal() {
                    false
                } else {
                    close_in_place(&mut session, reason);
                    true
                }
            }
        };
        if closed {
            self.after_close(id, reason);
        }
        Ok(closed)
    }

    /// Apply idle and expiry transitions as of now.
    pub fn sweep(&self) -> Vec<(SessionId, CloseReason)> {
        self.sweep_at(Utc::now())
    }

    /// Apply idle and expiry transitions as of `now`. Returns the sessions
    /// closed by this pass. Closed sessions past their token expiry are
    /// purged from the table.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<(SessionId, CloseReason)> {
        let mut closed = Vec::new();
        let mut purge = Vec::new();

        for mut entry in self.sessions.iter_mut() {
            let session = entry.value_mut();
            if session.state.is_terminal() {
                if now >= session.expires_at {
                    purge.push(session.id);
                }
                continue;
            }
            if now >= session.expires_at {
                close_in_place(session, CloseReason::Expired);
                closed.push((session.id, CloseReason::Expired));
                continue;
            }
            let inactive = now - session.last_active;
            if session.state == SessionState::Active && inactive >= self.idle_timeout {
                session.state = SessionState::Idle;
                debug!(session = %session.id, "Session idle");
            }
            if session.state == SessionState::Idle && inactive >= self.idle_timeout + self.idle_grace
            {
                close_in_place(session, CloseReason::IdleTimeout);
                closed.push((session.id, CloseReason::IdleTimeout));
            }
        }

        for id in purge {
            self.sessions
                .remove_if(&id, |_, s| s.state.is_terminal());
        }
        for (id, reason) in &closed {
            self.after_close(*id, *reason);
        }
        closed
    }

    /// Close every open session (coordinator shutdown).
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| !e.state.is_terminal())
            .map(|e| *e.key())
            .collect();
        ids.into_iter()
            .filter(|id| matches!(self.close(*id, reason), Ok(true)))
            .count()
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    /// Whether the session exists and still accepts its token.
    pub fn is_usable(&self, id: SessionId) -> bool {
        self.sessions
            .get(&id)
            .is_some_and(|s| s.state.accepts_token())
    }

    pub fn list(&self) -> Vec<Session> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Number of sessions in `Active` or `Idle`.
    pub fn open_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|e| e.state.accepts_token())
            .count()
    }

    pub fn supported_protocols(&self) -> &[ProtocolSpec] {
        &self.supported
    }

    fn after_close(&self, id: SessionId, reason: CloseReason) {
        if let Some(token) = self.sessions.get(&id).map(|s| s.token.clone()) {
            self.tokens.remove(&token);
        }
        info!(session = %id, reason = %reason, "Session closed");
        let observers = self
            .observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in observers {
            observer.session_closed(id, reason);
        }
    }
}

fn close_in_place(session: &mut Session, reason: CloseReason) {
    if session.state.is_terminal() {
        warn!(session = %session.id, "close on terminal session ignored");
        return;
    }
    session.state = SessionState::Closed;
    session.close_reason = Some(reason);
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Ten years; longer durations are clamped.
const MAX_DURATION_SECS: u64 = 315_360_000;

fn secs(n: u64) -> Duration {
    Duration::seconds(n.min(MAX_DURATION_SECS) as i64)
}

fn join_protocols(list: &[ProtocolSpec]) -> String {
    list.iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
