use crate::agent::{Agent, AgentDescriptor};
use crate::handle::AgentHandle;
use conductor_core::{AgentError, ConductorError, ConductorResult};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Registered agents, keyed by id.
///
/// Executors resolve agents here at dispatch time, so an agent removed
/// after a task was accepted surfaces as a dispatch failure on that task.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<AgentHandle>>>,
}

impl AgentRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Register an agent under its descriptor id.
    pub fn register(
        &self,
        descriptor: AgentDescriptor,
        agent: Arc<dyn Agent>,
    ) -> ConductorResult<Arc<AgentHandle>> {
        self.register_with_options(descriptor, agent, Value::Null)
    }

    /// Register an agent whose `initialize` receives `options`.
    pub fn register_with_options(
        &self,
        descriptor: AgentDescriptor,
        agent: Arc<dyn Agent>,
        options: Value,
    ) -> ConductorResult<Arc<AgentHandle>> {
        let mut agents = self.agents.write();
        if agents.contains_key(&descriptor.id) {
            return Err(ConductorError::DuplicateAgent(descriptor.id));
        }
        let id = descriptor.id.clone();
        info!(
            agent = %id,
            name = %descriptor.name,
            version = %descriptor.version,
            capabilities = ?descriptor.capabilities,
            "Registered agent"
        );
        let handle = Arc::new(AgentHandle::with_options(descriptor, agent, options));
        agents.insert(id, handle.clone());
        Ok(handle)
    }

    /// Remove an agent. The caller decides whether to stop the returned handle.
    pub fn unregister(&self, id: &str) -> Option<Arc<AgentHandle>> {
        let removed = self.agents.write().remove(id);
        if removed.is_some() {
            info!(agent = %id, "Unregistered agent");
        }
        removed
    }

    /// Look up an agent by id.
    pub fn get(&self, id: &str) -> Option<Arc<AgentHandle>> {
        self.agents.read().get(id).cloned()
    }

    /// Whether an agent with this id is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.agents.read().contains_key(id)
    }

    /// Descriptors of every registered agent, ordered by id.
    pub fn list_descriptors(&self) -> Vec<AgentDescriptor> {
        let mut out: Vec<_> = self
            .agents
            .read()
            .values()
            .map(|h| h.descriptor().clone())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Agents advertising `capability`, ordered by id.
    pub fn discover(&self, capability: &str) -> Vec<AgentDescriptor> {
        self.list_descriptors()
            .into_iter()
            .filter(|d| d.has_capability(capability))
            .collect()
    }

    /// Number of registered agents.
    pub fn agent_count(&self) -> usize {
        self.agents.read().len()
    }

    /// Stop every registered agent, collecting failures instead of aborting.
    pub async fn stop_all(&self) -> Vec<(String, AgentError)> {
        let handles: Vec<_> = self.agents.read().values().cloned().collect();
        let mut failures = Vec::new();
        for handle in handles {
            if let Err(e) = handle.stop().await {
                warn!(agent = %handle.id(), error = %e, "Failed to stop agent");
                failures.push((handle.id().to_string(), e));
            }
        }
        failures
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
