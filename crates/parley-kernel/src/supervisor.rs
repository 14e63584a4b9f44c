//! Background-task supervision: shutdown signalling and sweep bookkeeping.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tracing::info;

/// Shutdown signal shared by every background task.
pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    /// Completed session sweeps.
    sweeps: AtomicU64,
    /// Sessions closed by the sweeper (idle or expired).
    swept_sessions: AtomicU64,
}

impl Supervisor {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            shutdown_tx: tx,
            shutdown_rx: rx,
            sweeps: AtomicU64::new(0),
            swept_sessions: AtomicU64::new(0),
        }
    }

    /// Get a receiver that flips to `true` on shutdown.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Trigger a graceful shutdown.
    pub fn shutdown(&self) {
        info!("Supervisor: initiating graceful shutdown");
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn record_sweep(&self, closed: usize) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.swept_sessions
            .fetch_add(closed as u64, Ordering::Relaxed);
    }

    pub fn health(&self) -> SupervisorHealth {
        SupervisorHealth {
            is_shutting_down: self.is_shutting_down(),
            sweeps: self.sweeps.load(Ordering::Relaxed),
            swept_sessions: self.swept_sessions.load(Ordering::Relaxed),
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// Health summary for `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorHealth {
    pub is_shutting_down: bool,
    pub sweeps: u64,
    pub swept_sessions: u64,
}
