//! SQLite-backed `ConfigStore`: graph, neuron, and universal-node documents
//! plus user settings and usage counters. Documents are stored as JSON
//! columns and validated on read.

use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use cortex_core::error::{CortexError, Result};
use cortex_core::model::{GraphConfig, NeuronConfig};
use cortex_core::traits::ConfigStore;
use cortex_core::types::{UserSettings, SYSTEM_OWNER};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CortexError::Store(format!("failed to create store directory: {}", e))
                })?;
            }
        }

        let conn = Connection::open(path).map_err(store_err)?;
        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory().map_err(store_err)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(store_err)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS graphs (
                graph_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                tier INTEGER NOT NULL DEFAULT 4,
                is_default INTEGER NOT NULL DEFAULT 0,
                config TEXT NOT NULL,
                usage_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_graphs_owner_default
                ON graphs(owner_id, is_default);
            CREATE INDEX IF NOT EXISTS idx_graphs_tier ON graphs(tier);

            CREATE TABLE IF NOT EXISTS neurons (
                neuron_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                role TEXT NOT NULL,
                config TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_neurons_owner_role
                ON neurons(owner_id, role);

            CREATE TABLE IF NOT EXISTS universal_nodes (
                node_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                category TEXT,
                version INTEGER NOT NULL DEFAULT 1,
                config TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                settings TEXT NOT NULL
            );",
        )
        .map_err(store_err)?;

        debug!("Config store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace a graph document.
    pub fn upsert_graph(&self, config: &GraphConfig) -> Result<()> {
        let json = serde_json::to_string(config)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO graphs (graph_id, owner_id, tier, is_default, config)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(graph_id) DO UPDATE SET
                owner_id = excluded.owner_id,
                tier = excluded.tier,
                is_default = excluded.is_default,
                config = excluded.config",
            params![
                config.graph_id,
                config.owner_id,
                config.tier,
                config.is_default as i64,
                json
            ],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Insert or replace a neuron document.
    pub fn upsert_neuron(&self, config: &NeuronConfig) -> Result<()> {
        let json = serde_json::to_string(config)?;
        let role = serde_json::to_value(config.role)?
            .as_str()
            .unwrap_or("chat")
            .to_string();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO neurons (neuron_id, owner_id, role, config)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(neuron_id) DO UPDATE SET
                owner_id = excluded.owner_id,
                role = excluded.role,
                config = excluded.config",
            params![config.neuron_id, config.owner_id, role, json],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Insert or replace a reusable universal-node config.
    pub fn upsert_universal_node(
        &self,
        node_id: &str,
        owner_id: &str,
        category: Option<&str>,
        config: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO universal_nodes (node_id, owner_id, category, config)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(node_id) DO UPDATE SET
                owner_id = excluded.owner_id,
                category = excluded.category,
                version = universal_nodes.version + 1,
                config = excluded.config",
            params![node_id, owner_id, category, config.to_string()],
        )
        .map_err(store_err)?;
        Ok(())
    }

    /// Insert or replace a user's settings.
    pub fn upsert_user(&self, user_id: &str, settings: &UserSettings) -> Result<()> {
        let json = serde_json::to_string(settings)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO users (user_id, settings) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET settings = excluded.settings",
            params![user_id, json],
        )
        .map_err(store_err)?;
        Ok(())
    }

    pub fn graph_usage(&self, graph_id: &str) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: Option<i64> = conn
            .query_row(
                "SELECT usage_count FROM graphs WHERE graph_id = ?1",
                params![graph_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_err)?;
        Ok(count.unwrap_or(0) as u64)
    }
}

fn store_err(e: rusqlite::Error) -> CortexError {
    CortexError::Store(e.to_string())
}

fn decode<T: serde::de::DeserializeOwned>(what: &str, id: &str, json: String) -> Result<T> {
    serde_json::from_str(&json)
        .map_err(|e| CortexError::Store(format!("corrupt {} document '{}': {}", what, id, e)))
}

impl ConfigStore for SqliteStore {
    fn find_graph(&self, graph_id: &str) -> BoxFuture<'_, Result<Option<GraphConfig>>> {
        let graph_id = graph_id.to_string();
        Box::pin(async move {
            let json: Option<String> = {
                let conn = self.conn.lock().unwrap();
                conn.query_row(
                    "SELECT config FROM graphs WHERE graph_id = ?1",
                    params![graph_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(store_err)?
            };
            json.map(|j| decode("graph", &graph_id, j)).transpose()
        })
    }

    fn find_neuron(&self, neuron_id: &str) -> BoxFuture<'_, Result<Option<NeuronConfig>>> {
        let neuron_id = neuron_id.to_string();
        Box::pin(async move {
            let json: Option<String> = {
                let conn = self.conn.lock().unwrap();
                conn.query_row(
                    "SELECT config FROM neurons WHERE neuron_id = ?1",
                    params![neuron_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(store_err)?
            };
            json.map(|j| decode("neuron", &neuron_id, j)).transpose()
        })
    }

    fn find_universal_node(
        &self,
        node_id: &str,
    ) -> BoxFuture<'_, Result<Option<serde_json::Value>>> {
        let node_id = node_id.to_string();
        Box::pin(async move {
            let json: Option<String> = {
                let conn = self.conn.lock().unwrap();
                conn.query_row(
                    "SELECT config FROM universal_nodes WHERE node_id = ?1",
                    params![node_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(store_err)?
            };
            json.map(|j| decode("universal node", &node_id, j)).transpose()
        })
    }

    fn user_settings(&self, user_id: &str) -> BoxFuture<'_, Result<Option<UserSettings>>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            let json: Option<String> = {
                let conn = self.conn.lock().unwrap();
                conn.query_row(
                    "SELECT settings FROM users WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(store_err)?
            };
            json.map(|j| decode("user settings", &user_id, j)).transpose()
        })
    }

    fn graphs_for_user(&self, user_id: &str) -> BoxFuture<'_, Result<Vec<GraphConfig>>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            let rows: Vec<(String, String)> = {
                let conn = self.conn.lock().unwrap();
                let mut stmt = conn
                    .prepare(
                        "SELECT graph_id, config FROM graphs
                         WHERE owner_id = ?1 OR owner_id = ?2
                         ORDER BY graph_id",
                    )
                    .map_err(store_err)?;
                let mapped = stmt
                    .query_map(params![user_id, SYSTEM_OWNER], |row| {
                        Ok((row.get(0)?, row.get(1)?))
                    })
                    .map_err(store_err)?;
                mapped
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(store_err)?
            };
            rows.into_iter()
                .map(|(id, json)| decode("graph", &id, json))
                .collect()
        })
    }

    fn record_graph_use(&self, graph_id: &str) -> BoxFuture<'_, Result<()>> {
        let graph_id = graph_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE graphs SET usage_count = usage_count + 1 WHERE graph_id = ?1",
                params![graph_id],
            )
            .map_err(store_err)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn graph(id: &str, owner: &str, tier: u8, is_default: bool) -> GraphConfig {
        serde_json::from_value(json!({
            "graphId": id,
            "ownerId": owner,
            "tier": tier,
            "isDefault": is_default,
            "name": id,
            "nodes": [{"id": "n", "type": "responder"}],
            "edges": [{"from": "__start__", "to": "n"}, {"from": "n", "to": "__end__"}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_graph_roundtrip_and_usage() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert_graph(&graph("g1", SYSTEM_OWNER, 2, true)).unwrap();

        let loaded = store.find_graph("g1").await.unwrap().unwrap();
        assert_eq!(loaded.graph_id, "g1");
        assert_eq!(loaded.tier, 2);
        assert!(loaded.is_default);
        assert!(store.find_graph("ghost").await.unwrap().is_none());

        store.record_graph_use("g1").await.unwrap();
        store.record_graph_use("g1").await.unwrap();
        assert_eq!(store.graph_usage("g1").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_neuron_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let neuron: NeuronConfig = serde_json::from_value(json!({
            "neuronId": "n1",
            "ownerId": "u1",
            "tier": 3,
            "name": "chat",
            "role": "chat",
            "provider": "anthropic-compatible",
            "endpoint": "https://api.example.com",
            "model": "m",
            "apiKey": "CORTEX_KEY",
            "apiKeyEncrypted": true
        }))
        .unwrap();
        store.upsert_neuron(&neuron).unwrap();

        let loaded = store.find_neuron("n1").await.unwrap().unwrap();
        assert_eq!(loaded.owner_id, "u1");
        assert!(loaded.api_key_encrypted);
        assert_eq!(loaded.api_key.as_deref(), Some("CORTEX_KEY"));
    }

    #[tokio::test]
    async fn test_universal_node_versioning() {
        let store = SqliteStore::in_memory().unwrap();
        let config = json!({"steps": [{"type": "transform", "config": {"operation": "set", "outputField": "x", "value": "1"}}]});
        store
            .upsert_universal_node("shared", SYSTEM_OWNER, Some("planning"), &config)
            .unwrap();

        let loaded = store.find_universal_node("shared").await.unwrap().unwrap();
        assert_eq!(loaded["steps"][0]["type"], "transform");
    }

    #[tokio::test]
    async fn test_user_settings_roundtrip() {
        let store = SqliteStore::in_memory().unwrap();
        let settings: UserSettings = serde_json::from_value(json!({
            "accountTier": 1,
            "defaultGraphId": "research"
        }))
        .unwrap();
        store.upsert_user("u1", &settings).unwrap();

        let loaded = store.user_settings("u1").await.unwrap().unwrap();
        assert_eq!(loaded.account_tier, 1);
        assert_eq!(loaded.default_graph_id.as_deref(), Some("research"));
        assert!(store.user_settings("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reopen_preserves_documents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cortex.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert_graph(&graph("g1", SYSTEM_OWNER, 4, false)).unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert!(store.find_graph("g1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_graphs_for_user_scopes_by_owner() {
        let store = SqliteStore::in_memory().unwrap();
        store.upsert_graph(&graph("sys", SYSTEM_OWNER, 4, false)).unwrap();
        store.upsert_graph(&graph("mine", "u1", 4, false)).unwrap();
        store.upsert_graph(&graph("theirs", "u2", 4, false)).unwrap();

        let graphs = store.graphs_for_user("u1").await.unwrap();
        let ids: Vec<&str> = graphs.iter().map(|g| g.graph_id.as_str()).collect();
        assert_eq!(ids, vec!["mine", "sys"]);
    }
}
