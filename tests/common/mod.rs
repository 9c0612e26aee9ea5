//! Scripted collaborators for end-to-end orchestrator tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;

use cortex_core::error::{CortexError, Result};
use cortex_core::model::{GraphConfig, NeuronConfig};
use cortex_core::traits::{ConfigStore, LmHandle, NeuronSource, ToolRouter};
use cortex_core::types::{LmDelta, LmRequest, ToolCallMeta, UserSettings, SYSTEM_OWNER};

/// An LM that replays scripted chunks, optionally with a delay per chunk.
#[derive(Clone)]
pub struct ScriptedLm {
    chunks: Vec<String>,
    chunk_delay: Duration,
}

impl ScriptedLm {
    pub fn streaming(chunks: &[&str]) -> Self {
        Self {
            chunks: chunks.iter().map(|s| s.to_string()).collect(),
            chunk_delay: Duration::ZERO,
        }
    }

    pub fn slow(chunks: &[&str], chunk_delay: Duration) -> Self {
        Self {
            chunks: chunks.iter().map(|s| s.to_string()).collect(),
            chunk_delay,
        }
    }
}

impl LmHandle for ScriptedLm {
    fn chat_stream(
        &self,
        _request: LmRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<LmDelta>>>> {
        let chunks = self.chunks.clone();
        let delay = self.chunk_delay;
        Box::pin(async move {
            let stream = futures::stream::iter(chunks)
                .then(move |chunk| async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    Ok(LmDelta::Text(chunk))
                })
                .chain(futures::stream::iter(vec![Ok(LmDelta::Stop)]));
            Ok(stream.boxed())
        })
    }

    fn complete(&self, _request: LmRequest) -> BoxFuture<'_, Result<String>> {
        let text = self.chunks.concat();
        Box::pin(async move { Ok(text) })
    }
}

pub struct FakeNeurons {
    lm: ScriptedLm,
}

impl FakeNeurons {
    pub fn new(lm: ScriptedLm) -> Arc<Self> {
        Arc::new(Self { lm })
    }
}

impl NeuronSource for FakeNeurons {
    fn model(&self, _neuron_id: &str, _user_id: &str) -> BoxFuture<'_, Result<Box<dyn LmHandle>>> {
        let lm = self.lm.clone();
        Box::pin(async move { Ok(Box::new(lm) as Box<dyn LmHandle>) })
    }

    fn neuron_config(
        &self,
        neuron_id: &str,
        _user_id: &str,
    ) -> BoxFuture<'_, Result<NeuronConfig>> {
        let neuron_id = neuron_id.to_string();
        Box::pin(async move {
            Ok(serde_json::from_value(serde_json::json!({
                "neuronId": neuron_id,
                "ownerId": SYSTEM_OWNER,
                "name": "scripted",
                "role": "chat",
                "provider": "local",
                "endpoint": "http://localhost",
                "model": "scripted"
            }))
            .expect("static neuron config"))
        })
    }
}

/// A tool router that records calls and answers everything with `{}`.
#[derive(Clone, Default)]
pub struct RecordingTools {
    calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl RecordingTools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_named(&self, name: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|(n, _)| n == name)
            .map(|(_, args)| args)
            .collect()
    }
}

impl ToolRouter for RecordingTools {
    fn call_tool(
        &self,
        name: &str,
        args: Value,
        _meta: ToolCallMeta,
    ) -> BoxFuture<'_, Result<Value>> {
        let name = name.to_string();
        let calls = self.calls.clone();
        Box::pin(async move {
            calls.lock().unwrap().push((name, args));
            Ok(serde_json::json!({}))
        })
    }

    fn tool_names(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async { vec!["history_append".into(), "history_context".into()] })
    }
}

/// An in-memory config store seeded per test.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<MemStoreInner>>,
}

#[derive(Default)]
struct MemStoreInner {
    graphs: Vec<GraphConfig>,
    users: HashMap<String, UserSettings>,
}

impl MemStore {
    pub fn put_graph(&self, graph: Value) {
        let graph: GraphConfig = serde_json::from_value(graph).expect("valid graph json");
        self.inner.lock().unwrap().graphs.push(graph);
    }

    pub fn put_user(&self, user_id: &str, tier: u8) {
        self.inner.lock().unwrap().users.insert(
            user_id.to_string(),
            UserSettings {
                account_tier: tier,
                ..Default::default()
            },
        );
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

    fn find_neuron(&self, _neuron_id: &str) -> BoxFuture<'_, Result<Option<NeuronConfig>>> {
        Box::pin(async { Ok(None) })
    }

    fn find_universal_node(&self, _node_id: &str) -> BoxFuture<'_, Result<Option<Value>>> {
        Box::pin(async { Ok(None) })
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

    fn record_graph_use(&self, _graph_id: &str) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// A graph definition: one streamed neuron responder.
pub fn responder_graph(graph_id: &str, tier: u8) -> Value {
    serde_json::json!({
        "graphId": graph_id,
        "ownerId": SYSTEM_OWNER,
        "tier": tier,
        "name": graph_id,
        "nodes": [
            {"id": "respond", "type": "responder", "config": {"type": "neuron", "config": {
                "userPrompt": "{{state.query.message}}",
                "outputField": "response",
                "stream": true
            }}}
        ],
        "edges": [
            {"from": "__start__", "to": "respond"},
            {"from": "respond", "to": "__end__"}
        ]
    })
}

/// A graph whose precheck short-circuits greetings and otherwise routes to a
/// web-search step before responding.
pub fn fastpath_graph(graph_id: &str) -> Value {
    serde_json::json!({
        "graphId": graph_id,
        "ownerId": SYSTEM_OWNER,
        "tier": 4,
        "name": graph_id,
        "nodes": [
            {"id": "precheck", "type": "precheck", "config": {"steps": [
                {"type": "conditional", "config": {
                    "condition": "state.query.message === 'hello'",
                    "setField": "nextRoute",
                    "trueValue": "fastpath",
                    "falseValue": "search"
                }},
                {"type": "transform", "config": {
                    "operation": "set",
                    "outputField": "finalResponse",
                    "value": "Hi!"
                }, "condition": "data.nextRoute === 'fastpath'"}
            ]}},
            {"id": "search", "type": "search", "config": {"type": "tool", "config": {
                "toolName": "web_search",
                "parameters": {"query": "{{state.query.message}}"},
                "outputField": "results"
            }}},
            {"id": "respond", "type": "responder", "config": {"type": "neuron", "config": {
                "userPrompt": "{{state.query.message}}",
                "outputField": "response",
                "stream": true
            }}}
        ],
        "edges": [
            {"from": "__start__", "to": "precheck"},
            {"from": "precheck", "condition": "state.data.nextRoute",
             "targets": {"fastpath": "__end__", "search": "search"}, "fallback": "search"},
            {"from": "search", "to": "respond"},
            {"from": "respond", "to": "__end__"}
        ]
    })
}
