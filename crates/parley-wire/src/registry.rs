//! Connection registry: tracks streaming connections and their buffers.
//!
//! There is at most one [`Connection`] per `(agent_id, session_id)`. A
//! connection survives its socket: when the socket drops it moves to
//! [`LinkState::Disconnected`] and keeps its outbound buffer so a later
//! `resume` can replay it.

use crate::buffer::{BufferCounters, OutboundBuffer};
use crate::frame::StreamFrame;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_types::session::SessionId;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

/// Identifies a connection slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub agent_id: String,
    pub session_id: SessionId,
}

impl ConnectionKey {
    pub fn new(agent_id: &str, session_id: SessionId) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            session_id,
        }
    }
}

/// Whether a socket is currently attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// A socket is attached and reading.
    Connected,
    /// Socket lost; buffer kept for resumption.
    Disconnected,
}

pub(crate) struct Link {
    pub state: LinkState,
    /// Bumped on every attach so a stale socket cannot detach its successor.
    pub epoch: u64,
    pub tx: Option<mpsc::UnboundedSender<StreamFrame>>,
    pub last_seen: Instant,
    pub detached_at: Option<Instant>,
}

/// One logical streaming connection.
pub struct Connection {
    pub key: ConnectionKey,
    pub connection_id: String,
    pub created_at: DateTime<Utc>,
    pub(crate) buffer: Mutex<OutboundBuffer>,
    pub(crate) link: Mutex<Link>,
    /// Signalled when buffer space frees up or the connection closes.
    pub(crate) space: Notify,
    pub(crate) closed: AtomicBool,
    pub(crate) replays: AtomicU64,
    pub(crate) gaps: AtomicU64,
}

impl Connection {
    pub(crate) fn new(key: ConnectionKey, capacity: usize) -> Self {
        Self {
            key,
            connection_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            buffer: Mutex::new(OutboundBuffer::new(capacity)),
            link: Mutex::new(Link {
                state: LinkState::Disconnected,
                epoch: 0,
                tx: None,
                last_seen: Instant::now(),
                detached_at: Some(Instant::now()),
            }),
            space: Notify::new(),
            closed: AtomicBool::new(false),
            replays: AtomicU64::new(0),
            gaps: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> LinkState {
        self.link.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Push a frame to the attached socket, if any. Returns false when
    /// detached or the socket's writer is gone.
    pub fn push_frame(&self, frame: StreamFrame) -> bool {
        let link = self.link.lock().unwrap_or_else(|e| e.into_inner());
        match (&link.state, &link.tx) {
            (LinkState::Connected, Some(tx)) => tx.send(frame).is_ok(),
            _ => false,
        }
    }

    pub fn stats(&self) -> StreamStats {
        let counters: BufferCounters = self
            .buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .counters();
        StreamStats {
            connection_id: self.connection_id.clone(),
            agent_id: self.key.agent_id.clone(),
            session_id: self.key.session_id,
            state: self.state(),
            connected: self.state() == LinkState::Connected,
            buffered: counters.buffered,
            dropped_events: counters.dropped_events,
            gaps: self.gaps.load(Ordering::Relaxed),
            evicted: counters.evicted,
            replays: self.replays.load(Ordering::Relaxed),
        }
    }
}

/// Observability snapshot for one connection.
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub connection_id: String,
    pub agent_id: String,
    pub session_id: SessionId,
    pub state: LinkState,
    pub connected: bool,
    /// Unacknowledged messages held for replay.
    pub buffered: usize,
    /// Events dropped because the buffer was full while attached.
    pub dropped_events: u64,
    /// Gap markers sent to the client.
    pub gaps: u64,
    /// Messages evicted while detached.
    pub evicted: u64,
    /// Successful resumptions.
    pub replays: u64,
}

/// Thread-safe registry of all streaming connections.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    conns: Arc<DashMap<ConnectionKey, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the existing connection for `key`, or create one.
    pub fn get_or_create(&self, key: ConnectionKey, capacity: usize) -> Arc<Connection> {
        self.conns
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Connection::new(key, capacity)))
            .clone()
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<Connection>> {
        self.conns.get(key).map(|c| c.clone())
    }

    /// Remove a connection. Only removes the exact instance given, so a
    /// replacement created in the meantime survives.
    pub fn remove(&self, conn: &Arc<Connection>) -> bool {
        self.conns
            .remove_if(&conn.key, |_, existing| Arc::ptr_eq(existing, conn))
            .is_some()
    }

    /// All connections belonging to a session.
    pub fn for_session(&self, session_id: SessionId) -> Vec<Arc<Connection>> {
        self.conns
            .iter()
            .filter(|e| e.key().session_id == session_id)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.conns.iter().map(|e| e.value().clone()).collect()
    }

    pub fn connected_count(&self) -> usize {
        self.conns
            .iter()
            .filter(|e| e.value().state() == LinkState::Connected)
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.conns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let key = ConnectionKey::new("alice", SessionId::new());
        let a = registry.get_or_create(key.clone(), 8);
        let b = registry.get_or_create(key.clone(), 8);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.total_count(), 1);
        assert_eq!(a.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_remove_only_matching_instance() {
        let registry = ConnectionRegistry::new();
        let key = ConnectionKey::new("alice", SessionId::new());
        let old = registry.get_or_create(key.clone(), 8);
        assert!(registry.remove(&old));
        let new = registry.get_or_create(key.clone(), 8);
        // Removing the stale instance must not touch the replacement
        assert!(!registry.remove(&old));
        assert!(registry.get(&key).is_some());
        assert!(registry.remove(&new));
        assert_eq!(registry.total_count(), 0);
    }

    #[test]
    fn test_for_session_filters() {
        let registry = ConnectionRegistry::new();
        let s1 = SessionId::new();
        let s2 = SessionId::new();
        registry.get_or_create(ConnectionKey::new("a", s1), 4);
        registry.get_or_create(ConnectionKey::new("b", s1), 4);
        registry.get_or_create(ConnectionKey::new("a", s2), 4);
        assert_eq!(registry.for_session(s1).len(), 2);
        assert_eq!(registry.for_session(s2).len(), 1);
        assert_eq!(registry.connected_count(), 0);
    }
}
