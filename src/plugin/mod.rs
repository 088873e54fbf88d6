pub mod standard;

pub use standard::StandardAgentFamily;

use crate::protocol::types::{
    AgentData, BuildProfile, ConsoleMessageData, ListenerData, TaskData,
};
use crate::{NocturneError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// One running listener transport. Socket handling lives behind this seam;
/// the core only drives the lifecycle and hands bytes across.
#[async_trait]
pub trait ListenerTransport: Send + Sync {
    async fn start(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    async fn edit(&self, config: &str) -> Result<ListenerData>;

    /// Deliver an outbound envelope to a connected agent. Only meaningful
    /// for persistent-connection transports; polling agents collect their
    /// batches at check-in instead.
    async fn send(&self, agent_id: &str, data: &[u8]) -> Result<()>;

    fn profile(&self) -> Result<Vec<u8>>;
}

/// Factory for a listener protocol variant ("http", "smb", ...), registered
/// under its protocol name.
#[async_trait]
pub trait ListenerFactory: Send + Sync {
    async fn create(
        &self,
        name: &str,
        config: &str,
    ) -> Result<(ListenerData, Arc<dyn ListenerTransport>)>;
}

/// One implant payload family: how its payloads are built and how its
/// first-beacon and console commands are interpreted.
pub trait AgentFamily: Send + Sync {
    /// Per-listener transport profiles embedded into a build.
    fn generate_profiles(&self, profile: &BuildProfile) -> Result<Vec<Vec<u8>>>;

    /// Produce the payload binary and a suggested file name.
    fn build_payload(
        &self,
        profile: &BuildProfile,
        agent_profiles: &[Vec<u8>],
    ) -> Result<(Vec<u8>, String)>;

    /// Interpret a first beacon into a registered agent identity.
    fn create_agent(&self, beat: &[u8]) -> Result<AgentData>;

    /// Turn console arguments into a task, with optional immediate
    /// validation feedback for the issuing operator.
    fn create_command(
        &self,
        agent: &AgentData,
        args: &HashMap<String, serde_json::Value>,
    ) -> Result<(TaskData, Option<ConsoleMessageData>)>;
}

/// Name-keyed tables of the pluggable pieces, populated at startup and
/// owned by the teamserver.
pub struct PluginRegistry {
    listener_factories: DashMap<String, Arc<dyn ListenerFactory>>,
    agent_families: DashMap<String, Arc<dyn AgentFamily>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            listener_factories: DashMap::new(),
            agent_families: DashMap::new(),
        }
    }

    pub fn register_listener_factory(&self, reg_name: &str, factory: Arc<dyn ListenerFactory>) {
        tracing::info!(plugin = %reg_name, "Listener factory registered");
        self.listener_factories.insert(reg_name.to_string(), factory);
    }

    pub fn register_agent_family(&self, reg_name: &str, family: Arc<dyn AgentFamily>) {
        tracing::info!(plugin = %reg_name, "Agent family registered");
        self.agent_families.insert(reg_name.to_string(), family);
    }

    pub fn listener_factory(&self, reg_name: &str) -> Result<Arc<dyn ListenerFactory>> {
        self.listener_factories
            .get(reg_name)
            .map(|f| f.clone())
            .ok_or_else(|| NocturneError::UnknownPlugin(reg_name.to_string()))
    }

    pub fn agent_family(&self, reg_name: &str) -> Result<Arc<dyn AgentFamily>> {
        self.agent_families
            .get(reg_name)
            .map(|f| f.clone())
            .ok_or_else(|| NocturneError::UnknownPlugin(reg_name.to_string()))
    }
}
