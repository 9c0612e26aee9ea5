//! The orchestrator front door: resolves user settings and the workflow
//! graph, assembles the initial state, dispatches the run, and guarantees
//! every started generation ends completed or failed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use uuid::Uuid;

use cortex_core::config::RuntimeConfig;
use cortex_core::error::{CortexError, Result};
use cortex_core::state::{QueryInput, RuntimeState};
use cortex_core::traits::{ConfigStore, NeuronSource, SharedCache, TokenSink, ToolRouter};
use cortex_core::types::*;
use cortex_engine::{CompiledGraph, RunContext};
use cortex_registry::GraphRegistry;
use cortex_stream::{CancelRegistry, StreamEmitter};

use crate::background::BackgroundTasks;
use crate::history;

/// Caller-supplied request options. Only `user_id` is required.
#[derive(Debug, Clone, Default)]
pub struct RespondOptions {
    pub user_id: String,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
    pub user_message_id: Option<String>,
    pub graph_id: Option<String>,
    pub stream: bool,
    pub source: Option<String>,
}

impl RespondOptions {
    pub fn for_user(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            ..Default::default()
        }
    }
}

/// Items yielded on the streaming transport: request metadata first, then
/// the event stream, then the complete assistant message.
#[derive(Debug, Clone)]
pub enum TransportItem {
    Metadata {
        conversation_id: String,
        generation_id: String,
    },
    Event(StreamEvent),
    Final(ChatMessage),
}

/// A response: the final message directly, or a transport stream.
#[derive(Debug)]
pub enum Reply {
    Message(ChatMessage),
    Stream(ReceiverStream<TransportItem>),
}

pub struct Orchestrator {
    config: RuntimeConfig,
    store: Arc<dyn ConfigStore>,
    graphs: Arc<GraphRegistry>,
    neurons: Arc<dyn NeuronSource>,
    tools: Arc<dyn ToolRouter>,
    cache: Arc<dyn SharedCache>,
    cancels: Arc<CancelRegistry>,
}

impl Orchestrator {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<dyn ConfigStore>,
        graphs: Arc<GraphRegistry>,
        neurons: Arc<dyn NeuronSource>,
        tools: Arc<dyn ToolRouter>,
        cache: Arc<dyn SharedCache>,
    ) -> Self {
        Self {
            config,
            store,
            graphs,
            neurons,
            tools,
            cache,
            cancels: Arc::new(CancelRegistry::new()),
        }
    }

    /// Cancel an in-flight generation by its generation id.
    pub fn abort_stream(&self, generation_id: &str) -> bool {
        self.cancels.abort(generation_id)
    }

    /// Answer one user query over the selected workflow graph.
    pub async fn respond(&self, query: QueryInput, options: RespondOptions) -> Result<Reply> {
        if options.user_id.trim().is_empty() {
            return Err(CortexError::Config("userId is required".into()));
        }

        let settings = match self.store.user_settings(&options.user_id).await {
            Ok(Some(settings)) => settings,
            Ok(None) => UserSettings::default(),
            Err(e) => {
                warn!(user_id = %options.user_id, error = %e, "Settings lookup failed, using defaults");
                UserSettings::default()
            }
        };

        let graph = self
            .resolve_graph(&options, &settings)
            .await?;

        let conversation_id = options
            .conversation_id
            .clone()
            .unwrap_or_else(|| derive_conversation_id(&options.user_id, &query.message));
        let generation_id = new_id();
        let user_message_id = options.user_message_id.clone().unwrap_or_else(new_id);
        let assistant_message_id = options.message_id.clone().unwrap_or_else(new_id);

        // From here the generation exists; every path below must end it.
        self.cache
            .start_generation(&conversation_id, &assistant_message_id)
            .await?;

        info!(
            user_id = %options.user_id,
            graph_id = %graph.graph_id(),
            conversation_id = %conversation_id,
            generation_id = %generation_id,
            stream = options.stream,
            "Generation started"
        );

        let job = Job {
            config: self.config.clone(),
            neurons: self.neurons.clone(),
            tools: self.tools.clone(),
            cache: self.cache.clone(),
            store: self.store.clone(),
            cancels: self.cancels.clone(),
            graph,
            settings,
            query,
            user_id: options.user_id.clone(),
            conversation_id: conversation_id.clone(),
            generation_id: generation_id.clone(),
            user_message_id,
            assistant_message_id: assistant_message_id.clone(),
            stream: options.stream,
        };

        if !options.stream {
            return job.execute().await.map(Reply::Message);
        }

        // Streaming: the transport reads the same subscription a
        // reconnecting client would, so ordering and durability match.
        let subscription = self.cache.subscribe(&assistant_message_id).await?;
        let (tx, rx) = mpsc::channel::<TransportItem>(64);
        let (final_tx, final_rx) = oneshot::channel::<Option<ChatMessage>>();

        tokio::spawn(async move {
            let _ = final_tx.send(job.execute().await.ok());
        });

        tokio::spawn(async move {
            let _ = tx
                .send(TransportItem::Metadata {
                    conversation_id,
                    generation_id,
                })
                .await;

            let mut subscription = subscription;
            while let Some(event) = subscription.next().await {
                if tx.send(TransportItem::Event(event)).await.is_err() {
                    return; // caller went away; the job keeps running
                }
            }

            if let Ok(Some(message)) = final_rx.await {
                let _ = tx.send(TransportItem::Final(message)).await;
            }
        });

        Ok(Reply::Stream(ReceiverStream::new(rx)))
    }

    /// Resolve the requested graph, falling back to the system default when
    /// the user's choice is missing or tier-gated.
    async fn resolve_graph(
        &self,
        options: &RespondOptions,
        settings: &UserSettings,
    ) -> Result<Arc<CompiledGraph>> {
        let graph_id = options
            .graph_id
            .clone()
            .or_else(|| settings.default_graph_id.clone())
            .unwrap_or_else(|| SYSTEM_DEFAULT_GRAPH_ID.to_string());

        match self.graphs.get_graph(&graph_id, &options.user_id).await {
            Ok(graph) => Ok(graph),
            Err(e @ (CortexError::GraphNotFound(_) | CortexError::AccessDenied { .. }))
                if graph_id != SYSTEM_DEFAULT_GRAPH_ID =>
            {
                warn!(
                    graph_id = %graph_id,
                    user_id = %options.user_id,
                    error = %e,
                    "Graph unavailable, falling back to system default"
                );
                self.graphs
                    .get_graph(SYSTEM_DEFAULT_GRAPH_ID, &options.user_id)
                    .await
            }
            Err(e) => Err(e),
        }
    }
}

/// One generation's worth of owned handles and identifiers.
struct Job {
    config: RuntimeConfig,
    neurons: Arc<dyn NeuronSource>,
    tools: Arc<dyn ToolRouter>,
    cache: Arc<dyn SharedCache>,
    store: Arc<dyn ConfigStore>,
    cancels: Arc<CancelRegistry>,
    graph: Arc<CompiledGraph>,
    settings: UserSettings,
    query: QueryInput,
    user_id: String,
    conversation_id: String,
    generation_id: String,
    user_message_id: String,
    assistant_message_id: String,
    stream: bool,
}

impl Job {
    async fn execute(self) -> Result<ChatMessage> {
        let meta = ToolCallMeta {
            conversation_id: self.conversation_id.clone(),
            generation_id: self.generation_id.clone(),
            message_id: self.assistant_message_id.clone(),
        };

        history::persist_message(
            &self.tools,
            &meta,
            &self.user_message_id,
            "user",
            &self.query.message,
            None,
            Vec::new(),
        )
        .await;

        let (context_messages, context_summary) =
            history::load_context(&self.tools, &meta, self.config.max_context_tokens).await;

        let mut state = RuntimeState::new(
            self.query.clone(),
            &self.user_id,
            self.settings.account_tier,
        );
        state.conversation_id = self.conversation_id.clone();
        state.generation_id = self.generation_id.clone();
        state.message_id = self.assistant_message_id.clone();
        state.context_messages = context_messages;
        state.context_summary = context_summary;
        state.stream_enabled = self.stream;
        state.data.insert(
            "currentDate".to_string(),
            json!(Utc::now().format("%Y-%m-%d").to_string()),
        );
        state
            .data
            .insert("systemPrompt".to_string(), json!(self.config.system_prompt));

        let cancel = self.cancels.register(&self.generation_id);
        let sink: Option<Arc<dyn TokenSink>> = if self.stream {
            Some(Arc::new(StreamEmitter::new(
                self.cache.clone(),
                &self.assistant_message_id,
            )))
        } else {
            None
        };

        let ctx = RunContext {
            neurons: self.neurons.clone(),
            tools: self.tools.clone(),
            cache: self.cache.clone(),
            store: self.store.clone(),
            sink,
            cancel: cancel.clone(),
            default_neuron_id: self
                .settings
                .default_neuron_id
                .clone()
                .unwrap_or_else(|| SYSTEM_DEFAULT_NEURON_ID.to_string()),
        };

        let budget = Duration::from_secs(
            self.config
                .stream_timeout_secs
                .min(self.graph.global_config().timeout),
        );

        let run = async {
            tokio::select! {
                result = self.graph.run(&ctx, state) => result,
                _ = cancel.cancelled() => Err(CortexError::Cancelled),
            }
        };
        let outcome = match tokio::time::timeout(budget, run).await {
            Ok(result) => result,
            Err(_) => Err(CortexError::StreamTimeout(budget.as_secs())),
        };

        // Bookkeeping runs on every path out of the race above.
        self.cancels.release(&self.generation_id);

        let final_state = match outcome {
            Ok(final_state) => final_state,
            Err(e) => {
                error!(generation_id = %self.generation_id, error = %e, "Generation failed");
                if let Err(fail_err) = self
                    .cache
                    .fail_generation(&self.assistant_message_id, &e.to_string())
                    .await
                {
                    warn!(error = %fail_err, "Could not mark generation failed");
                }
                return Err(e);
            }
        };

        match self.finalize(final_state, &meta).await {
            Ok(message) => Ok(message),
            Err(e) => {
                let _ = self
                    .cache
                    .fail_generation(&self.assistant_message_id, &e.to_string())
                    .await;
                Err(e)
            }
        }
    }

    async fn finalize(&self, state: RuntimeState, meta: &ToolCallMeta) -> Result<ChatMessage> {
        let cached = self.cache.generation_state(&self.assistant_message_id).await;
        let streamed_content = cached
            .as_ref()
            .map(|s| s.content.clone())
            .unwrap_or_default();
        let thinking = cached
            .as_ref()
            .map(|s| s.thinking.clone())
            .filter(|t| !t.is_empty());
        let tool_events = cached.map(|s| s.tool_events).unwrap_or_default();

        // Streaming requests persist the accumulated cache content: reasoning
        // extracted and leading whitespace dropped, exactly what a
        // reconnecting subscriber would snapshot. Non-streaming requests keep
        // the responder's raw output.
        let final_text = state
            .final_response
            .clone()
            .or_else(|| {
                (self.stream && !streamed_content.is_empty()).then(|| streamed_content.clone())
            })
            .or_else(|| state.response.as_ref().map(|m| m.content.clone()))
            .unwrap_or(streamed_content);

        let executions = history::reconstruct_tool_executions(&tool_events);
        history::persist_message(
            &self.tools,
            meta,
            &self.assistant_message_id,
            "assistant",
            &final_text,
            thinking.as_deref(),
            executions,
        )
        .await;

        self.cache
            .complete_generation(
                &self.assistant_message_id,
                Some(json!({
                    "conversationId": self.conversation_id,
                    "generationId": self.generation_id,
                })),
            )
            .await?;

        let worker_neuron_id = self
            .settings
            .default_worker_neuron_id
            .clone()
            .unwrap_or_else(|| SYSTEM_WORKER_NEURON_ID.to_string());
        Arc::new(BackgroundTasks {
            neurons: self.neurons.clone(),
            tools: self.tools.clone(),
            worker_neuron_id,
            user_id: self.user_id.clone(),
            meta: meta.clone(),
        })
        .spawn_all(self.query.message.clone(), final_text.clone());

        info!(generation_id = %self.generation_id, "Generation completed");
        Ok(ChatMessage::assistant(final_text))
    }
}

/// A conversation id derived deterministically from the first message, so a
/// client retrying its opening request lands on the same conversation.
fn derive_conversation_id(user_id: &str, message: &str) -> String {
    let seed = format!("{}:{}", user_id, message);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).to_string()
}
