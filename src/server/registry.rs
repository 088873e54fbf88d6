use crate::plugin::ListenerTransport;
use crate::protocol::types::{AgentData, ListenerData};
use crate::{crypto, NocturneError, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;

/// Process-wide table of registered agents. The session key is minted here,
/// exactly once, at registration; every later lookup hands out the same
/// key. Lifetime is the process; teardown is explicit.
pub struct AgentRegistry {
    agents: DashMap<String, AgentData>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: DashMap::new(),
        }
    }

    /// Register a first-beacon agent. Fills in the id and session key when
    /// the creating plugin left them empty.
    pub fn register(&self, mut data: AgentData) -> Result<AgentData> {
        if data.session_key.is_empty() {
            data.session_key = crypto::generate_session_key();
        }
        if data.id.is_empty() {
            data.id = crypto::derive_agent_id(&data.session_key);
        }
        if data.create_time == 0 {
            data.create_time = Utc::now().timestamp();
        }
        data.last_tick = Utc::now().timestamp();

        if self.agents.contains_key(&data.id) {
            return Err(NocturneError::AgentExists(data.id));
        }

        tracing::info!(
            agent_id = %data.id,
            listener = %data.listener,
            computer = %data.computer,
            username = %data.username,
            "Agent registered"
        );
        self.agents.insert(data.id.clone(), data.clone());
        Ok(data)
    }

    pub fn get(&self, agent_id: &str) -> Result<AgentData> {
        self.agents
            .get(agent_id)
            .map(|a| a.clone())
            .ok_or_else(|| NocturneError::UnknownAgent(agent_id.to_string()))
    }

    /// Resolve the one candidate key for an envelope. The caller must never
    /// try a second key on the same ciphertext.
    pub fn session_key(&self, agent_id: &str) -> Result<Vec<u8>> {
        self.agents
            .get(agent_id)
            .map(|a| a.session_key.clone())
            .ok_or_else(|| NocturneError::UnknownAgent(agent_id.to_string()))
    }

    /// Check-in bookkeeping. The session key is deliberately not touchable
    /// here.
    pub fn checkin(&self, agent_id: &str, external_ip: Option<&str>) -> Result<()> {
        let mut agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| NocturneError::UnknownAgent(agent_id.to_string()))?;
        agent.last_tick = Utc::now().timestamp();
        if let Some(ip) = external_ip {
            agent.external_ip = ip.to_string();
        }
        Ok(())
    }

    pub fn update_sleep(&self, agent_id: &str, sleep: u32, jitter: u32) -> Result<()> {
        let mut agent = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| NocturneError::UnknownAgent(agent_id.to_string()))?;
        agent.sleep = sleep;
        agent.jitter = jitter;
        Ok(())
    }

    pub fn remove(&self, agent_id: &str) -> Result<AgentData> {
        self.agents
            .remove(agent_id)
            .map(|(_, data)| {
                tracing::info!(agent_id = %agent_id, "Agent removed");
                data
            })
            .ok_or_else(|| NocturneError::UnknownAgent(agent_id.to_string()))
    }

    pub fn list(&self) -> Vec<AgentData> {
        self.agents.iter().map(|a| a.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.agents.len()
    }
}

struct ListenerEntry {
    data: ListenerData,
    transport: Arc<dyn ListenerTransport>,
}

/// Process-wide table of running listener transports, keyed by listener
/// name. Start/stop lifecycle is owned here; the socket handling itself
/// lives in the transport plugin.
pub struct ListenerRegistry {
    listeners: DashMap<String, ListenerEntry>,
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            listeners: DashMap::new(),
        }
    }

    pub async fn register(
        &self,
        mut data: ListenerData,
        transport: Arc<dyn ListenerTransport>,
    ) -> Result<ListenerData> {
        if self.listeners.contains_key(&data.name) {
            return Err(NocturneError::ListenerExists(data.name));
        }

        transport.start().await?;
        data.status = "Listening".to_string();
        if data.create_time == 0 {
            data.create_time = Utc::now().timestamp();
        }

        tracing::info!(listener = %data.name, protocol = %data.protocol, watermark = %data.watermark, "Listener started");
        self.listeners.insert(
            data.name.clone(),
            ListenerEntry {
                data: data.clone(),
                transport,
            },
        );
        Ok(data)
    }

    pub async fn stop(&self, name: &str) -> Result<ListenerData> {
        let (_, entry) = self
            .listeners
            .remove(name)
            .ok_or_else(|| NocturneError::UnknownListener(name.to_string()))?;

        entry.transport.stop().await?;
        let mut data = entry.data;
        data.status = "Stopped".to_string();
        tracing::info!(listener = %name, "Listener stopped");
        Ok(data)
    }

    pub async fn edit(&self, name: &str, config: &str) -> Result<ListenerData> {
        let transport = {
            let entry = self
                .listeners
                .get(name)
                .ok_or_else(|| NocturneError::UnknownListener(name.to_string()))?;
            entry.transport.clone()
        };

        // Transport call happens outside the map guard
        let updated = transport.edit(config).await?;
        if let Some(mut entry) = self.listeners.get_mut(name) {
            entry.data = updated.clone();
        }
        tracing::info!(listener = %name, "Listener reconfigured");
        Ok(updated)
    }

    pub fn get(&self, name: &str) -> Result<ListenerData> {
        self.listeners
            .get(name)
            .map(|e| e.data.clone())
            .ok_or_else(|| NocturneError::UnknownListener(name.to_string()))
    }

    pub fn transport(&self, name: &str) -> Result<Arc<dyn ListenerTransport>> {
        self.listeners
            .get(name)
            .map(|e| e.transport.clone())
            .ok_or_else(|| NocturneError::UnknownListener(name.to_string()))
    }

    /// Route pivoted or ambiguous traffic back to the profile that produced
    /// it.
    pub fn by_watermark(&self, watermark: &str) -> Option<ListenerData> {
        self.listeners
            .iter()
            .find(|e| e.data.watermark == watermark)
            .map(|e| e.data.clone())
    }

    pub fn list(&self) -> Vec<ListenerData> {
        self.listeners.iter().map(|e| e.data.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::ListenerTransport;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingTransport {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ListenerTransport for RecordingTransport {
        async fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn edit(&self, config: &str) -> Result<ListenerData> {
            Ok(ListenerData {
                name: "http-main".to_string(),
                data: config.to_string(),
                ..Default::default()
            })
        }

        async fn send(&self, _agent_id: &str, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        fn profile(&self) -> Result<Vec<u8>> {
            Ok(b"profile".to_vec())
        }
    }

    #[test]
    fn session_key_is_minted_once_and_immutable() {
        let registry = AgentRegistry::new();
        let agent = registry
            .register(AgentData {
                listener: "http-main".to_string(),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(agent.session_key.len(), crypto::SESSION_KEY_LEN);
        assert!(!agent.id.is_empty());

        // Check-ins update bookkeeping but never the key
        registry.checkin(&agent.id, Some("198.51.100.7")).unwrap();
        registry.update_sleep(&agent.id, 30, 10).unwrap();
        let after = registry.get(&agent.id).unwrap();
        assert_eq!(after.session_key, agent.session_key);
        assert_eq!(after.external_ip, "198.51.100.7");
        assert_eq!(registry.session_key(&agent.id).unwrap(), agent.session_key);
    }

    #[test]
    fn duplicate_agent_id_is_rejected() {
        let registry = AgentRegistry::new();
        let agent = registry.register(AgentData::default()).unwrap();

        let outcome = registry.register(AgentData {
            id: agent.id.clone(),
            ..Default::default()
        });
        assert!(matches!(outcome, Err(NocturneError::AgentExists(_))));
    }

    #[test]
    fn unknown_agent_lookups_fail_cleanly() {
        let registry = AgentRegistry::new();
        assert!(matches!(
            registry.session_key("ghost"),
            Err(NocturneError::UnknownAgent(_))
        ));
        assert!(matches!(
            registry.remove("ghost"),
            Err(NocturneError::UnknownAgent(_))
        ));
    }

    #[tokio::test]
    async fn listener_lifecycle_drives_the_transport() {
        let registry = ListenerRegistry::new();
        let transport = RecordingTransport::new();

        let data = registry
            .register(
                ListenerData {
                    name: "http-main".to_string(),
                    protocol: "http".to_string(),
                    watermark: "wm-1122".to_string(),
                    ..Default::default()
                },
                transport.clone(),
            )
            .await
            .unwrap();
        assert_eq!(data.status, "Listening");
        assert_eq!(transport.starts.load(Ordering::SeqCst), 1);

        assert!(registry.by_watermark("wm-1122").is_some());
        assert!(registry.by_watermark("wm-other").is_none());

        let stopped = registry.stop("http-main").await.unwrap();
        assert_eq!(stopped.status, "Stopped");
        assert_eq!(transport.stops.load(Ordering::SeqCst), 1);
        assert!(registry.get("http-main").is_err());
    }

    #[tokio::test]
    async fn duplicate_listener_name_is_rejected() {
        let registry = ListenerRegistry::new();
        let data = ListenerData {
            name: "http-main".to_string(),
            ..Default::default()
        };
        registry
            .register(data.clone(), RecordingTransport::new())
            .await
            .unwrap();

        assert!(matches!(
            registry.register(data, RecordingTransport::new()).await,
            Err(NocturneError::ListenerExists(_))
        ));
    }
}
