//! The workflow registry: per-user graph resolution, just-in-time
//! compilation, and bounded caches for configs and compiled graphs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use cortex_core::error::{CortexError, Result};
use cortex_core::model::GraphConfig;
use cortex_core::traits::ConfigStore;
use cortex_core::types::{UserSettings, LOWEST_TIER, SYSTEM_OWNER};
use cortex_engine::{compile, CompiledGraph};

use crate::cache::TtlCache;

const CONFIG_CACHE_CAPACITY: usize = 100;
const COMPILED_CACHE_CAPACITY: usize = 50;
const CACHE_TTL: Duration = Duration::from_secs(300);

type Key = (String, String);

pub struct GraphRegistry {
    store: Arc<dyn ConfigStore>,
    configs: std::sync::Mutex<TtlCache<Key, GraphConfig>>,
    compiled: std::sync::Mutex<TtlCache<Key, Arc<CompiledGraph>>>,
}

impl GraphRegistry {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        Self {
            store,
            configs: std::sync::Mutex::new(TtlCache::new(CONFIG_CACHE_CAPACITY, CACHE_TTL)),
            compiled: std::sync::Mutex::new(TtlCache::new(COMPILED_CACHE_CAPACITY, CACHE_TTL)),
        }
    }

    /// Resolve and compile a graph for a user. Usage counters bump in the
    /// background and never block the request.
    pub async fn get_graph(&self, graph_id: &str, user_id: &str) -> Result<Arc<CompiledGraph>> {
        let key = (user_id.to_string(), graph_id.to_string());
        if let Some(graph) = self.compiled.lock().unwrap().get(&key) {
            return Ok(graph);
        }

        let config = self.get_config(graph_id, user_id).await?;
        let graph = Arc::new(compile(&config)?);
        self.compiled.lock().unwrap().insert(key, graph.clone());

        let store = self.store.clone();
        let graph_id = graph_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.record_graph_use(&graph_id).await {
                warn!(graph_id = %graph_id, error = %e, "Usage counter update failed");
            }
        });

        Ok(graph)
    }

    /// Resolve a graph config for a user, enforcing ownership and tier.
    pub async fn get_config(&self, graph_id: &str, user_id: &str) -> Result<GraphConfig> {
        let key = (user_id.to_string(), graph_id.to_string());
        if let Some(config) = self.configs.lock().unwrap().get(&key) {
            return Ok(config);
        }

        let config = self
            .store
            .find_graph(graph_id)
            .await?
            .filter(|g| g.owner_id == user_id || g.owner_id == SYSTEM_OWNER)
            .ok_or_else(|| CortexError::GraphNotFound(graph_id.to_string()))?;

        if config.owner_id == SYSTEM_OWNER {
            let user_tier = self.user_tier(user_id).await;
            if user_tier > config.tier {
                return Err(CortexError::AccessDenied {
                    resource: format!("graph '{}'", graph_id),
                    user_id: user_id.to_string(),
                });
            }
        }

        self.configs.lock().unwrap().insert(key, config.clone());
        debug!(graph_id, user_id, "Graph config resolved");
        Ok(config)
    }

    /// Graphs a user may select: system graphs within tier, plus their own.
    pub async fn get_user_graphs(&self, user_id: &str) -> Result<Vec<GraphConfig>> {
        let user_tier = self.user_tier(user_id).await;
        let graphs = self.store.graphs_for_user(user_id).await?;
        Ok(graphs
            .into_iter()
            .filter(|g| g.owner_id == user_id || user_tier <= g.tier)
            .collect())
    }

    pub fn clear_cache(&self, user_id: Option<&str>) {
        match user_id {
            Some(user) => {
                self.configs
                    .lock()
                    .unwrap()
                    .retain(|(cached_user, _)| cached_user != user);
                self.compiled
                    .lock()
                    .unwrap()
                    .retain(|(cached_user, _)| cached_user != user);
            }
            None => {
                self.configs.lock().unwrap().clear();
                self.compiled.lock().unwrap().clear();
            }
        }
    }

    async fn user_tier(&self, user_id: &str) -> u8 {
        match self.store.user_settings(user_id).await {
            Ok(Some(UserSettings { account_tier, .. })) => account_tier,
            Ok(None) => LOWEST_TIER,
            Err(e) => {
                warn!(user_id, error = %e, "User settings lookup failed, assuming lowest tier");
                LOWEST_TIER
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemStore;
    use serde_json::json;

    fn graph(id: &str, owner: &str, tier: u8) -> GraphConfig {
        serde_json::from_value(json!({
            "graphId": id,
            "ownerId": owner,
            "tier": tier,
            "name": id,
            "nodes": [
                {"id": "respond", "type": "responder", "config": {"type": "transform", "config": {"operation": "set", "outputField": "x", "value": "1"}}}
            ],
            "edges": [
                {"from": "__start__", "to": "respond"},
                {"from": "respond", "to": "__end__"}
            ]
        }))
        .unwrap()
    }

    fn registry_with(graphs: Vec<GraphConfig>, users: Vec<(&str, u8)>) -> GraphRegistry {
        let store = MemStore::default();
        for g in graphs {
            store.put_graph(g);
        }
        for (user, tier) in users {
            store.put_user(
                user,
                UserSettings {
                    account_tier: tier,
                    ..Default::default()
                },
            );
        }
        GraphRegistry::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_compiles_and_caches() {
        let registry = registry_with(vec![graph("g", SYSTEM_OWNER, 4)], vec![]);
        let first = registry.get_graph("g", "u1").await.unwrap();
        let second = registry.get_graph("g", "u1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_missing_graph_not_found() {
        let registry = registry_with(vec![], vec![]);
        let err = registry.get_graph("ghost", "u1").await.unwrap_err();
        assert!(matches!(err, CortexError::GraphNotFound(_)));
    }

    #[tokio::test]
    async fn test_tier_gate_denies_low_privilege_user() {
        let registry = registry_with(vec![graph("research", SYSTEM_OWNER, 3)], vec![("u1", 4)]);
        let err = registry.get_graph("research", "u1").await.unwrap_err();
        assert!(matches!(err, CortexError::AccessDenied { .. }));
    }

    #[tokio::test]
    async fn test_compile_failure_carries_graph_id() {
        let mut broken = graph("broken", SYSTEM_OWNER, 4);
        broken.edges.clear();
        let registry = registry_with(vec![broken], vec![]);
        let err = registry.get_graph("broken", "u1").await.unwrap_err();
        match err {
            CortexError::CompilationFailed { graph_id, .. } => assert_eq!(graph_id, "broken"),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_usage_counter_increments_in_background() {
        let store = MemStore::default();
        store.put_graph(graph("g", SYSTEM_OWNER, 4));
        let registry = GraphRegistry::new(Arc::new(store.clone()));
        registry.get_graph("g", "u1").await.unwrap();

        // The counter bumps in a spawned task; wait for it briefly.
        for _ in 0..50 {
            if store.usage_of("g") == 1 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("usage counter never incremented");
    }

    #[tokio::test]
    async fn test_user_graphs_tier_filtered() {
        let registry = registry_with(
            vec![
                graph("open", SYSTEM_OWNER, 4),
                graph("gated", SYSTEM_OWNER, 0),
                graph("mine", "u1", 4),
            ],
            vec![("u1", 4)],
        );
        let graphs = registry.get_user_graphs("u1").await.unwrap();
        let ids: Vec<&str> = graphs.iter().map(|g| g.graph_id.as_str()).collect();
        assert!(ids.contains(&"open"));
        assert!(ids.contains(&"mine"));
        assert!(!ids.contains(&"gated"));
    }
}
