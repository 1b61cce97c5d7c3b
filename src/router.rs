//! Capability-to-agent routing

use std::sync::Arc;

use tracing::debug;

use crate::error::RegistryError;
use crate::registry::{AgentRecord, Registry};

/// Resolves a capability name to an agent that can serve it
///
/// Picks the first online match. Load- or cost-based selection would go here.
#[derive(Clone)]
pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// First online agent advertising `capability`, or `None`
    pub fn route(&self, capability: &str) -> Result<Option<AgentRecord>, RegistryError> {
        let candidate = self.registry.discover(capability)?.into_iter().next();
        debug!(
            capability,
            agent_id = candidate.as_ref().map(|r| r.id.as_str()),
            "Routed capability"
        );
        Ok(candidate)
    }
}
