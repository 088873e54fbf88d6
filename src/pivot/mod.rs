use crate::protocol::types::{PivotData, TaskData, TaskType};
use crate::server::registry::AgentRegistry;
use crate::{crypto, NocturneError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

/// The agent relay graph: edges let a parent agent forward encrypted blobs
/// for a child reached through it. The set forms a forest; every mutation
/// is atomic with respect to relay lookups, so an in-flight relay sees a
/// consistent edge or a clean not-found.
pub struct PivotRelay {
    edges: RwLock<HashMap<String, PivotData>>,
}

impl Default for PivotRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl PivotRelay {
    pub fn new() -> Self {
        Self {
            edges: RwLock::new(HashMap::new()),
        }
    }

    /// Add an edge. A child keeps exactly one active parent edge, and a
    /// chain may never loop back on itself.
    pub fn add_edge(&self, edge: PivotData) -> Result<()> {
        let mut edges = self.edges.write();

        if edges.contains_key(&edge.pivot_id) {
            return Err(NocturneError::PivotConflict(format!(
                "pivot id {} already present",
                edge.pivot_id
            )));
        }
        if edges
            .values()
            .any(|e| e.child_agent_id == edge.child_agent_id)
        {
            return Err(NocturneError::PivotConflict(format!(
                "agent {} already has a parent edge",
                edge.child_agent_id
            )));
        }

        // Walk up from the would-be parent; reaching the child again would
        // close a cycle
        let mut cursor = edge.parent_agent_id.clone();
        loop {
            if cursor == edge.child_agent_id {
                return Err(NocturneError::PivotConflict(format!(
                    "edge {} -> {} would close a cycle",
                    edge.parent_agent_id, edge.child_agent_id
                )));
            }
            match edges.values().find(|e| e.child_agent_id == cursor) {
                Some(parent_edge) => cursor = parent_edge.parent_agent_id.clone(),
                None => break,
            }
        }

        tracing::info!(
            pivot_id = %edge.pivot_id,
            parent = %edge.parent_agent_id,
            child = %edge.child_agent_id,
            "Pivot edge added"
        );
        edges.insert(edge.pivot_id.clone(), edge);
        Ok(())
    }

    pub fn remove_edge(&self, pivot_id: &str) -> Result<PivotData> {
        let removed = self.edges.write().remove(pivot_id);
        match removed {
            Some(edge) => {
                tracing::info!(pivot_id = %pivot_id, "Pivot edge removed");
                Ok(edge)
            }
            None => Err(NocturneError::UnknownPivot(pivot_id.to_string())),
        }
    }

    /// Drop every edge touching a torn-down agent.
    pub fn remove_agent_edges(&self, agent_id: &str) -> usize {
        let mut edges = self.edges.write();
        let before = edges.len();
        edges.retain(|_, e| e.parent_agent_id != agent_id && e.child_agent_id != agent_id);
        before - edges.len()
    }

    pub fn edge(&self, pivot_id: &str) -> Option<PivotData> {
        self.edges.read().get(pivot_id).cloned()
    }

    pub fn children_of(&self, agent_id: &str) -> Vec<PivotData> {
        self.edges
            .read()
            .values()
            .filter(|e| e.parent_agent_id == agent_id)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.edges.read().len()
    }

    /// Re-pack data for the next hop: the blob arrived decrypted once at
    /// the parent's boundary and is sealed again under the child's own
    /// session key. The parent's key is never used for the child's hop.
    pub fn pack_data(
        &self,
        pivot_id: &str,
        data: &[u8],
        agents: &AgentRegistry,
    ) -> Result<TaskData> {
        // Snapshot the edge before any crypto work; a concurrent removal
        // either happened before (clean not-found) or after (relay on the
        // edge as it was)
        let edge = self
            .edge(pivot_id)
            .ok_or_else(|| NocturneError::UnknownPivot(pivot_id.to_string()))?;

        let child_key = agents.session_key(&edge.child_agent_id)?;
        let sealed = crypto::seal(data, &child_key)?;

        let mut task = TaskData::new(TaskType::ProxyData, &edge.parent_agent_id);
        task.hook_id = pivot_id.to_string();
        task.data = sealed;
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::AgentData;
    use std::sync::Arc;

    fn edge(pivot_id: &str, parent: &str, child: &str) -> PivotData {
        PivotData {
            pivot_id: pivot_id.to_string(),
            pivot_name: format!("{}-{}", parent, child),
            parent_agent_id: parent.to_string(),
            child_agent_id: child.to_string(),
        }
    }

    fn registry_with(ids: &[&str]) -> AgentRegistry {
        let registry = AgentRegistry::new();
        for id in ids {
            registry
                .register(AgentData {
                    id: id.to_string(),
                    ..Default::default()
                })
                .unwrap();
        }
        registry
    }

    #[test]
    fn relay_seals_for_the_child_key_only() {
        let agents = registry_with(&["parent", "child"]);
        let relay = PivotRelay::new();
        relay.add_edge(edge("pv-1", "parent", "child")).unwrap();

        let payload = b"inner hop bytes";
        let task = relay.pack_data("pv-1", payload, &agents).unwrap();

        assert_eq!(task.agent_id, "parent");
        assert_eq!(task.hook_id, "pv-1");
        assert_eq!(task.task_type, TaskType::ProxyData as i32);

        let child_key = agents.session_key("child").unwrap();
        assert_eq!(crypto::open(&task.data, &child_key).unwrap(), payload);

        // The parent's key must not open the child's hop
        let parent_key = agents.session_key("parent").unwrap();
        assert!(matches!(
            crypto::open(&task.data, &parent_key),
            Err(NocturneError::AuthenticationFailure)
        ));
    }

    #[test]
    fn unknown_pivot_is_recoverable_not_fatal() {
        let agents = registry_with(&["parent"]);
        let relay = PivotRelay::new();
        assert!(matches!(
            relay.pack_data("gone", b"x", &agents),
            Err(NocturneError::UnknownPivot(_))
        ));
    }

    #[test]
    fn child_has_one_parent_edge_at_a_time() {
        let relay = PivotRelay::new();
        relay.add_edge(edge("pv-1", "a", "b")).unwrap();
        assert!(relay.add_edge(edge("pv-2", "c", "b")).is_err());

        // After removal the child may be re-parented
        relay.remove_edge("pv-1").unwrap();
        relay.add_edge(edge("pv-2", "c", "b")).unwrap();
    }

    #[test]
    fn cycles_are_rejected() {
        let relay = PivotRelay::new();
        relay.add_edge(edge("pv-1", "a", "b")).unwrap();
        relay.add_edge(edge("pv-2", "b", "c")).unwrap();
        // c -> a would loop the chain back on itself
        assert!(relay.add_edge(edge("pv-3", "c", "a")).is_err());
        // and self-edges are cycles of length one
        assert!(relay.add_edge(edge("pv-4", "d", "d")).is_err());
    }

    #[test]
    fn removal_races_resolve_to_relay_or_clean_not_found() {
        let agents = Arc::new(registry_with(&["parent", "child"]));
        let relay = Arc::new(PivotRelay::new());
        relay.add_edge(edge("pv-1", "parent", "child")).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let relay = relay.clone();
            let agents = agents.clone();
            handles.push(std::thread::spawn(move || {
                relay.pack_data("pv-1", b"racing", &agents)
            }));
        }
        let remover = {
            let relay = relay.clone();
            std::thread::spawn(move || {
                let _ = relay.remove_edge("pv-1");
            })
        };

        for handle in handles {
            match handle.join().unwrap() {
                Ok(task) => {
                    // A winning relay used the edge exactly as it existed
                    assert_eq!(task.agent_id, "parent");
                    assert_eq!(task.hook_id, "pv-1");
                }
                Err(NocturneError::UnknownPivot(_)) => {}
                Err(other) => panic!("unexpected error {:?}", other),
            }
        }
        remover.join().unwrap();
        assert_eq!(relay.count(), 0);
    }

    #[test]
    fn agent_teardown_drops_its_edges() {
        let relay = PivotRelay::new();
        relay.add_edge(edge("pv-1", "a", "b")).unwrap();
        relay.add_edge(edge("pv-2", "b", "c")).unwrap();
        relay.add_edge(edge("pv-3", "a", "d")).unwrap();

        assert_eq!(relay.remove_agent_edges("b"), 2);
        assert_eq!(relay.count(), 1);
        assert!(relay.edge("pv-3").is_some());
    }
}
