//! AgentCardRegistry: this process's self-description.
//!
//! Readers get a cheap `Arc` snapshot of the current card; writers replace
//! the whole snapshot under a single write lock, so a reader never observes
//! a half-applied capability change.

use parley_types::agent::{default_endpoints, AgentCard, AgentIdentity, ProtocolSpec};
use parley_types::capability::Capability;
use parley_types::error::ParleyResult;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

pub struct AgentCardRegistry {
    card: RwLock<Arc<AgentCard>>,
}

impl AgentCardRegistry {
    /// Create a registry with an empty capability list (revision 0).
    pub fn new(identity: AgentIdentity, protocols: Vec<ProtocolSpec>, base_url: &str) -> Self {
        let card = AgentCard {
            identity,
            capabilities: Vec::new(),
            endpoints: default_endpoints(),
            protocols,
            base_url: base_url.trim_end_matches('/').to_string(),
            revision: 0,
        };
        Self {
            card: RwLock::new(Arc::new(card)),
        }
    }

    /// Current card snapshot.
    pub fn describe(&self) -> Arc<AgentCard> {
        self.card.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Add or replace a capability by name.
    pub fn register_capability(&self, capability: Capability) -> ParleyResult<Arc<AgentCard>> {
        capability.validate()?;
        let name = capability.name.clone();
        let card = self.update(|caps| {
            match caps.iter_mut().find(|c| c.name == capability.name) {
                Some(existing) => *existing = capability,
                None => caps.push(capability),
            }
            true
        });
        info!(capability = %name, revision = card.revision, "Capability registered");
        Ok(card)
    }

    /// Remove a capability. Returns false if it was not registered.
    pub fn deregister_capability(&self, name: &str) -> bool {
        let mut removed = false;
        self.update(|caps| {
            let before = caps.len();
            caps.retain(|c| c.name != name);
            removed = caps.len() != before;
            removed
        });
        if removed {
            info!(capability = %name, "Capability deregistered");
        } else {
            debug!(capability = %name, "Deregister of unknown capability ignored");
        }
        removed
    }

    /// Enabled capabilities, in card order.
    pub fn available(&self) -> Vec<Capability> {
        self.describe()
            .capabilities
            .iter()
            .filter(|c| c.enabled)
            .cloned()
            .collect()
    }

    pub fn is_available(&self, name: &str) -> bool {
        self.describe()
            .capability(name)
            .is_some_and(|c| c.enabled)
    }

    /// Apply `f` to a copy of the capability list and publish a new
    /// snapshot if it reports a change.
    fn update<F>(&self, f: F) -> Arc<AgentCard>
    where
        F: FnOnce(&mut Vec<Capability>) -> bool,
    {
        let mut guard = self.card.write().unwrap_or_else(|e| e.into_inner());
        let mut caps = guard.capabilities.clone();
        if f(&mut caps) {
            let mut next = AgentCard::clone(&guard);
            next.capabilities = caps;
            next.revision += 1;
            *guard = Arc::new(next);
        }
        guard.clone()
    }
}
