//! Scripted fakes for the trait seams, used by this crate's unit tests.

use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use cortex_core::error::{CortexError, Result};
use cortex_core::model::{GraphConfig, NeuronConfig, NeuronRole, ProviderKind};
use cortex_core::traits::*;
use cortex_core::types::*;

use crate::context::RunContext;

/// An LM handle that replays a script.
#[derive(Clone)]
pub enum ScriptedLm {
    Streaming(Vec<String>),
    Completing(String),
    Failing(String),
}

impl ScriptedLm {
    pub fn streaming(chunks: &[&str]) -> Self {
        Self::Streaming(chunks.iter().map(|s| s.to_string()).collect())
    }

    pub fn completing(text: &str) -> Self {
        Self::Completing(text.to_string())
    }

    pub fn failing(message: &str) -> Self {
        Self::Failing(message.to_string())
    }
}

impl LmHandle for ScriptedLm {
    fn chat_stream(
        &self,
        _request: LmRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<LmDelta>>>> {
        let script = self.clone();
        Box::pin(async move {
            match script {
                ScriptedLm::Streaming(chunks) => {
                    let deltas: Vec<Result<LmDelta>> = chunks
                        .into_iter()
                        .map(|c| Ok(LmDelta::Text(c)))
                        .chain(std::iter::once(Ok(LmDelta::Stop)))
                        .collect();
                    Ok(futures::stream::iter(deltas).boxed())
                }
                ScriptedLm::Completing(text) => {
                    let deltas = vec![Ok(LmDelta::Text(text)), Ok(LmDelta::Stop)];
                    Ok(futures::stream::iter(deltas).boxed())
                }
                ScriptedLm::Failing(message) => Err(CortexError::Provider(message)),
            }
        })
    }

    fn complete(&self, _request: LmRequest) -> BoxFuture<'_, Result<String>> {
        let script = self.clone();
        Box::pin(async move {
            match script {
                ScriptedLm::Streaming(chunks) => Ok(chunks.concat()),
                ScriptedLm::Completing(text) => Ok(text),
                ScriptedLm::Failing(message) => Err(CortexError::Provider(message)),
            }
        })
    }
}

/// A neuron source that hands out clones of one scripted LM.
pub struct FakeNeurons {
    lm: ScriptedLm,
}

impl FakeNeurons {
    pub fn new(lm: ScriptedLm) -> Self {
        Self { lm }
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
            Ok(NeuronConfig {
                neuron_id,
                owner_id: SYSTEM_OWNER.into(),
                tier: LOWEST_TIER,
                name: "scripted".into(),
                role: NeuronRole::Chat,
                provider: ProviderKind::Local,
                endpoint: "http://localhost".into(),
                model: "scripted".into(),
                api_key: None,
                api_key_encrypted: false,
                temperature: None,
                max_output_tokens: None,
                top_p: None,
            })
        })
    }
}

/// A tool router that fails a configured number of times, then succeeds,
/// recording every call.
#[derive(Clone, Default)]
pub struct FakeTools {
    inner: Arc<Mutex<FakeToolsInner>>,
}

#[derive(Default)]
struct FakeToolsInner {
    failures_left: u32,
    result: Value,
    calls: Vec<(String, Value)>,
}

impl FakeTools {
    pub fn succeeding(result: Value) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeToolsInner {
                failures_left: 0,
                result,
                calls: Vec::new(),
            })),
        }
    }

    pub fn failing_n(failures: u32, then: Value) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeToolsInner {
                failures_left: failures,
                result: then,
                calls: Vec::new(),
            })),
        }
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.inner.lock().unwrap().calls.clone()
    }
}

impl ToolRouter for FakeTools {
    fn call_tool(
        &self,
        name: &str,
        args: Value,
        _meta: ToolCallMeta,
    ) -> BoxFuture<'_, Result<Value>> {
        let name = name.to_string();
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.lock().unwrap();
            guard.calls.push((name.clone(), args));
            if guard.failures_left > 0 {
                guard.failures_left -= 1;
                return Err(CortexError::ToolExecution {
                    tool: name,
                    message: "scripted failure".into(),
                });
            }
            Ok(guard.result.clone())
        })
    }

    fn tool_names(&self) -> BoxFuture<'_, Vec<String>> {
        Box::pin(async { vec!["web_search".into(), "history_append".into()] })
    }
}

/// A shared cache that records published tool events and drops the rest.
#[derive(Clone, Default)]
pub struct RecordingCache {
    tool_events: Arc<Mutex<Vec<ToolEvent>>>,
}

impl RecordingCache {
    pub fn tool_events(&self) -> Vec<ToolEvent> {
        self.tool_events.lock().unwrap().clone()
    }
}

impl SharedCache for RecordingCache {
    fn start_generation(&self, _: &str, _: &str) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
    fn append_content(&self, _: &str, _: &str) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
    fn publish_chunk(&self, _: &str, _: &str) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
    fn publish_status(&self, _: &str, _: &str, _: Option<&str>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
    fn publish_tool_event(&self, _: &str, event: ToolEvent) -> BoxFuture<'_, Result<()>> {
        let events = self.tool_events.clone();
        Box::pin(async move {
            events.lock().unwrap().push(event);
            Ok(())
        })
    }
    fn publish_tool_status(&self, _: &str, _: &str, _: &str) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
    fn publish_thinking_chunk(&self, _: &str, _: &str) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
    fn complete_generation(&self, _: &str, _: Option<Value>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
    fn fail_generation(&self, _: &str, _: &str) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
    fn subscribe(&self, _: &str) -> BoxFuture<'_, Result<BoxStream<'static, StreamEvent>>> {
        Box::pin(async { Ok(futures::stream::empty().boxed()) })
    }
    fn generation_state(&self, _: &str) -> BoxFuture<'_, Option<GenerationState>> {
        Box::pin(async { None })
    }
}

/// A shared cache that drops everything.
pub struct NullCache;

impl SharedCache for NullCache {
    fn start_generation(&self, _: &str, _: &str) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
    fn append_content(&self, _: &str, _: &str) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
    fn publish_chunk(&self, _: &str, _: &str) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
    fn publish_status(&self, _: &str, _: &str, _: Option<&str>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
    fn publish_tool_event(&self, _: &str, _: ToolEvent) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
    fn publish_tool_status(&self, _: &str, _: &str, _: &str) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
    fn publish_thinking_chunk(&self, _: &str, _: &str) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
    fn complete_generation(&self, _: &str, _: Option<Value>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
    fn fail_generation(&self, _: &str, _: &str) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
    fn subscribe(&self, _: &str) -> BoxFuture<'_, Result<BoxStream<'static, StreamEvent>>> {
        Box::pin(async { Ok(futures::stream::empty().boxed()) })
    }
    fn generation_state(&self, _: &str) -> BoxFuture<'_, Option<GenerationState>> {
        Box::pin(async { None })
    }
}

/// An in-memory config store.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<MemStoreInner>>,
}

#[derive(Default)]
struct MemStoreInner {
    graphs: Vec<GraphConfig>,
    neurons: Vec<NeuronConfig>,
    universal_nodes: std::collections::HashMap<String, Value>,
    users: std::collections::HashMap<String, UserSettings>,
}

impl MemStore {
    pub fn put_universal_node(&self, node_id: &str, config: Value) {
        self.inner
            .lock()
            .unwrap()
            .universal_nodes
            .insert(node_id.to_string(), config);
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

    fn record_graph_use(&self, _graph_id: &str) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

pub fn ctx_from_parts(
    lm: ScriptedLm,
    tools: FakeTools,
    store: MemStore,
    sink: Option<Arc<dyn TokenSink>>,
) -> RunContext {
    RunContext {
        neurons: Arc::new(FakeNeurons::new(lm)),
        tools: Arc::new(tools),
        cache: Arc::new(NullCache),
        store: Arc::new(store),
        sink,
        cancel: CancellationToken::new(),
        default_neuron_id: SYSTEM_DEFAULT_NEURON_ID.to_string(),
    }
}

pub fn null_ctx() -> RunContext {
    ctx_from_parts(
        ScriptedLm::failing("no LM scripted"),
        FakeTools::default(),
        MemStore::default(),
        None,
    )
}

pub fn ctx_with(lm: ScriptedLm) -> RunContext {
    ctx_from_parts(lm, FakeTools::default(), MemStore::default(), None)
}

pub fn ctx_with_tools(tools: FakeTools) -> RunContext {
    ctx_from_parts(ScriptedLm::failing("no LM scripted"), tools, MemStore::default(), None)
}

pub fn ctx_with_tools_and_cache(tools: FakeTools, cache: RecordingCache) -> RunContext {
    let mut ctx = ctx_with_tools(tools);
    ctx.cache = Arc::new(cache);
    ctx
}

pub fn ctx_with_store(store: MemStore) -> RunContext {
    ctx_from_parts(
        ScriptedLm::failing("no LM scripted"),
        FakeTools::default(),
        store,
        None,
    )
}
