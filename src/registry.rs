//! Capability registry with heartbeat liveness
//!
//! Agents are either online or offline. An agent is online from `register` or
//! `heartbeat` until `cleanup` finds its last heartbeat older than the
//! liveness window.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::AgentHandle;
use crate::config::RegistryConfig;
use crate::error::RegistryError;
use crate::protocol::{AgentId, Capability};

/// Liveness of a registered agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    #[default]
    Offline,
}

/// What the registry knows about an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    /// Runtime id of the agent
    pub id: AgentId,
    /// Display name
    pub name: String,
    /// What the agent can be routed for
    pub capabilities: Vec<Capability>,
    /// Address for out-of-process agents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Liveness as of the last heartbeat or cleanup
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(id: AgentId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            capabilities: Vec::new(),
            endpoint: None,
            status: AgentStatus::Offline,
            last_heartbeat: DateTime::<Utc>::default(),
        }
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == name)
    }

    pub fn is_online(&self) -> bool {
        self.status == AgentStatus::Online
    }
}

/// Durable store of agent records
pub trait AgentDirectory: Send + Sync {
    fn get(&self, id: &AgentId) -> Result<Option<AgentRecord>, RegistryError>;
    fn upsert(&self, record: AgentRecord) -> Result<(), RegistryError>;
    fn list(&self) -> Result<Vec<AgentRecord>, RegistryError>;
}

/// Directory kept in process memory
#[derive(Default)]
pub struct InMemoryAgentDirectory {
    records: RwLock<HashMap<AgentId, AgentRecord>>,
}

impl InMemoryAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AgentDirectory for InMemoryAgentDirectory {
    fn get(&self, id: &AgentId) -> Result<Option<AgentRecord>, RegistryError> {
        Ok(self.records.read().get(id).cloned())
    }

    fn upsert(&self, record: AgentRecord) -> Result<(), RegistryError> {
        self.records.write().insert(record.id.clone(), record);
        Ok(())
    }

    fn list(&self) -> Result<Vec<AgentRecord>, RegistryError> {
        let mut records: Vec<AgentRecord> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}

/// Source of "now" for heartbeat ages
pub type RegistryClock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Directory of live agents and their capabilities
pub struct Registry {
    config: RegistryConfig,
    directory: Arc<dyn AgentDirectory>,
    /// Online agents; read by discovery, written by heartbeats and cleanup
    online: RwLock<HashMap<AgentId, AgentRecord>>,
    clock: RegistryClock,
}

impl Registry {
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_directory(config, Arc::new(InMemoryAgentDirectory::new()))
    }

    pub fn with_directory(config: RegistryConfig, directory: Arc<dyn AgentDirectory>) -> Self {
        Self {
            config,
            directory,
            online: RwLock::new(HashMap::new()),
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the clock used for heartbeats and expiry
    pub fn with_clock(mut self, clock: RegistryClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Record capabilities and mark the agent online
    pub fn register(
        &self,
        id: &AgentId,
        capabilities: Vec<Capability>,
        endpoint: Option<String>,
    ) -> Result<AgentRecord, RegistryError> {
        let mut record = self
            .directory
            .get(id)?
            .unwrap_or_else(|| AgentRecord::new(id.clone(), id.as_str()));
        record.capabilities = capabilities;
        record.status = AgentStatus::Online;
        record.last_heartbeat = (self.clock)();
        if endpoint.is_some() {
            record.endpoint = endpoint;
        }

        self.directory.upsert(record.clone())?;
        self.online.write().insert(id.clone(), record.clone());

        info!(
            agent_id = %id,
            capabilities = record.capabilities.len(),
            "Registered agent capabilities"
        );
        Ok(record)
    }

    /// Register a runtime agent with the capabilities declared in its config
    pub fn register_handle(
        &self,
        handle: &AgentHandle,
        endpoint: Option<String>,
    ) -> Result<AgentRecord, RegistryError> {
        let config = handle.config();
        let mut record = self.register(handle.id(), config.capabilities.clone(), endpoint)?;
        if !config.name.is_empty() && record.name != config.name {
            record.name = config.name.clone();
            self.directory.upsert(record.clone())?;
            self.online.write().insert(record.id.clone(), record.clone());
        }
        Ok(record)
    }

    /// Refresh an agent's liveness, loading it from the directory if needed
    pub fn heartbeat(&self, id: &AgentId) -> Result<(), RegistryError> {
        let mut online = self.online.write();
        let mut record = match online.get(id) {
            Some(record) => record.clone(),
            None => self
                .directory
                .get(id)?
                .ok_or_else(|| RegistryError::AgentNotFound(id.clone()))?,
        };

        record.last_heartbeat = (self.clock)();
        record.status = AgentStatus::Online;
        self.directory.upsert(record.clone())?;
        online.insert(id.clone(), record);

        debug!(agent_id = %id, "Heartbeat");
        Ok(())
    }

    /// Online agents advertising a capability
    pub fn discover(&self, capability: &str) -> Result<Vec<AgentRecord>, RegistryError> {
        let mut matched: Vec<AgentRecord> = self
            .online
            .read()
            .values()
            .filter(|record| record.is_online() && record.has_capability(capability))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matched)
    }

    /// Every agent the directory knows, online or not
    pub fn records(&self) -> Result<Vec<AgentRecord>, RegistryError> {
        self.directory.list()
    }

    /// Ids of agents currently in the online cache
    pub fn online_agents(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.online.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_online(&self, id: &AgentId) -> bool {
        self.online.read().contains_key(id)
    }

    /// Mark agents with stale heartbeats offline; returns the evicted ids
    pub fn cleanup(&self) -> Vec<AgentId> {
        let now = (self.clock)();
        let window = self.config.liveness_window;
        let mut online = self.online.write();

        let expired: Vec<AgentId> = online
            .values()
            .filter(|record| {
                (now - record.last_heartbeat)
                    .to_std()
                    .map(|age| age > window)
                    .unwrap_or(false)
            })
            .map(|record| record.id.clone())
            .collect();

        for id in &expired {
            if let Some(mut record) = online.remove(id) {
                record.status = AgentStatus::Offline;
                if let Err(e) = self.directory.upsert(record) {
                    warn!(agent_id = %id, error = %e, "Failed to persist offline status");
                }
                info!(agent_id = %id, "Agent heartbeat expired");
            }
        }
        expired
    }

    /// Run `cleanup` every `cleanup_interval` until `token` is cancelled
    pub fn spawn_cleanup(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.cleanup_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = self.cleanup();
                        if !evicted.is_empty() {
                            debug!(count = evicted.len(), "Registry cleanup evicted agents");
                        }
                    }
                }
            }
        })
    }
}
