//! In-memory `ConfigStore` for registry tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;

use cortex_core::error::Result;
use cortex_core::model::{GraphConfig, NeuronConfig};
use cortex_core::traits::ConfigStore;
use cortex_core::types::{UserSettings, SYSTEM_OWNER};

#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    graphs: Vec<GraphConfig>,
    neurons: Vec<NeuronConfig>,
    universal_nodes: HashMap<String, Value>,
    users: HashMap<String, UserSettings>,
    usage: HashMap<String, u64>,
}

impl MemStore {
    pub fn put_graph(&self, graph: GraphConfig) {
        self.inner.lock().unwrap().graphs.push(graph);
    }

    pub fn put_neuron(&self, neuron: NeuronConfig) {
        self.inner.lock().unwrap().neurons.push(neuron);
    }

    pub fn put_user(&self, user_id: &str, settings: UserSettings) {
        self.inner
            .lock()
            .unwrap()
            .users
            .insert(user_id.to_string(), settings);
    }

    pub fn usage_of(&self, graph_id: &str) -> u64 {
        *self
            .inner
            .lock()
            .unwrap()
            .usage
            .get(graph_id)
            .unwrap_or(&0)
    }
}

impl ConfigStore for MemStore {
    fn find_graph(&self, graph_id: &str) -> BoxFuture<'_, Result<Option<GraphConfig>>> {
        let graph_id = graph_id.to_string();
        let inner = self.inner.clone();
        Box::pin(async move {
            Ok(inner
                .lock()
                .unwrap()
                .graphs
                .iter()
                .find(|g| g.graph_id == graph_id)
                .cloned())
        })
    }

    fn find_neuron(&self, neuron_id: &str) -> BoxFuture<'_, Result<Option<NeuronConfig>>> {
        let neuron_id = neuron_id.to_string();
        let inner = self.inner.clone();
        Box::pin(async move {
            Ok(inner
                .lock()
                .unwrap()
                .neurons
                .iter()
                .find(|n| n.neuron_id == neuron_id)
                .cloned())
        })
    }

    fn find_universal_node(&self, node_id: &str) -> BoxFuture<'_, Result<Option<Value>>> {
        let node_id = node_id.to_string();
        let inner = self.inner.clone();
        Box::pin(async move { Ok(inner.lock().unwrap().universal_nodes.get(&node_id).cloned()) })
    }

    fn user_settings(&self, user_id: &str) -> BoxFuture<'_, Result<Option<UserSettings>>> {
        let user_id = user_id.to_string();
        let inner = self.inner.clone();
        Box::pin(async move { Ok(inner.lock().unwrap().users.get(&user_id).cloned()) })
    }

    fn graphs_for_user(&self, user_id: &str) -> BoxFuture<'_, Result<Vec<GraphConfig>>> {
        let user_id = user_id.to_string();
        let inner = self.inner.clone();
        Box::pin(async move {
            Ok(inner
                .lock()
                .unwrap()
                .graphs
                .iter()
                .filter(|g| g.owner_id == user_id || g.owner_id == SYSTEM_OWNER)
                .cloned()
                .collect())
        })
    }

    fn record_graph_use(&self, graph_id: &str) -> BoxFuture<'_, Result<()>> {
        let graph_id = graph_id.to_string();
        let inner = self.inner.clone();
        Box::pin(async move {
            *inner.lock().unwrap().usage.entry(graph_id).or_insert(0) += 1;
            Ok(())
        })
    }
}
