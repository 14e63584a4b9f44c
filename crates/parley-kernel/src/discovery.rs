//! DiscoveryService: answers "what can you do" queries.

use crate::registry::AgentCardRegistry;
use parley_types::capability::Capability;
use std::sync::Arc;
use tracing::debug;

pub struct DiscoveryService {
    registry: Arc<AgentCardRegistry>,
}

impl DiscoveryService {
    pub fn new(registry: Arc<AgentCardRegistry>) -> Self {
        Self { registry }
    }

    /// Enabled capabilities, optionally narrowed to the names in `filter`.
    ///
    /// An empty filter matches nothing; `None` means no filter.
    pub fn discover(&self, requester_id: &str, filter: Option<&[String]>) -> Vec<Capability> {
        let available = self.registry.available();
        let result: Vec<Capability> = match filter {
            Some(names) => available
                .into_iter()
                .filter(|c| names.iter().any(|n| n == &c.name))
                .collect(),
            None => available,
        };
        debug!(
            requester = %requester_id,
            filtered = filter.is_some(),
            matched = result.len(),
            "Discovery query"
        );
        result
    }
}
