use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::model::{GraphConfig, NeuronConfig};
use crate::types::*;

/// A single-use LM endpoint handle. Handles are created fresh per call and
/// never shared across users.
pub trait LmHandle: Send + Sync + 'static {
    /// Send a chat request and receive a stream of deltas.
    fn chat_stream(
        &self,
        request: LmRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<LmDelta>>>>;

    /// Send a chat request and receive the full completion. Used for
    /// structured output, where token streaming is meaningless.
    fn complete(&self, request: LmRequest) -> BoxFuture<'_, Result<String>>;
}

/// Resolves neurons to fresh LM handles, applying ownership and tier checks.
/// Implemented by the neuron registry; tests use scripted fakes.
pub trait NeuronSource: Send + Sync + 'static {
    fn model(
        &self,
        neuron_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, Result<Box<dyn LmHandle>>>;

    fn neuron_config(
        &self,
        neuron_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, Result<NeuronConfig>>;
}

/// Routes tool invocations by tool name. Implemented by the process pool.
pub trait ToolRouter: Send + Sync + 'static {
    /// Invoke `name` with `args`, attaching `meta` as `_meta`. Returns the
    /// tool's structured result.
    fn call_tool(
        &self,
        name: &str,
        args: serde_json::Value,
        meta: ToolCallMeta,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// All tool names currently routable.
    fn tool_names(&self) -> BoxFuture<'_, Vec<String>>;
}

/// The shared cache holding per-generation state and its pub/sub channel.
/// All mutations are single-key atomic; entries live for one hour.
pub trait SharedCache: Send + Sync + 'static {
    /// Begin a generation. Fails with `AlreadyInProgress` when the
    /// conversation already has one generating.
    fn start_generation(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> BoxFuture<'_, Result<()>>;

    /// Append to accumulated content and publish a `chunk` event.
    fn append_content(&self, message_id: &str, chunk: &str) -> BoxFuture<'_, Result<()>>;

    /// Publish a `chunk` event without touching accumulated content. Used
    /// for transport-only signals like the synthetic space after a thinking
    /// block; reconnecting subscribers must not see them in the snapshot.
    fn publish_chunk(&self, message_id: &str, chunk: &str) -> BoxFuture<'_, Result<()>>;

    /// Publish a `status` event and record it as the current status.
    fn publish_status(
        &self,
        message_id: &str,
        action: &str,
        description: Option<&str>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Record a tool event and publish it.
    fn publish_tool_event(&self, message_id: &str, event: ToolEvent) -> BoxFuture<'_, Result<()>>;

    /// Publish a transient tool status.
    fn publish_tool_status(
        &self,
        message_id: &str,
        status: &str,
        action: &str,
    ) -> BoxFuture<'_, Result<()>>;

    /// Append to accumulated thinking and publish a `thinking_chunk` event.
    fn publish_thinking_chunk(&self, message_id: &str, chunk: &str)
        -> BoxFuture<'_, Result<()>>;

    /// Mark the generation completed and publish a `complete` event.
    fn complete_generation(
        &self,
        message_id: &str,
        metadata: Option<serde_json::Value>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Mark the generation failed and publish an `error` event.
    fn fail_generation(&self, message_id: &str, error: &str) -> BoxFuture<'_, Result<()>>;

    /// Subscribe to a generation: yields `init` with any accumulated content,
    /// then the live event stream until `complete` or `error`.
    fn subscribe(
        &self,
        message_id: &str,
    ) -> BoxFuture<'_, Result<BoxStream<'static, StreamEvent>>>;

    /// Read the current generation state, if the entry is still live.
    fn generation_state(&self, message_id: &str) -> BoxFuture<'_, Option<GenerationState>>;
}

/// Persistent-store surface the core consumes: graph, neuron, and
/// universal-node documents plus per-user settings.
pub trait ConfigStore: Send + Sync + 'static {
    fn find_graph(&self, graph_id: &str) -> BoxFuture<'_, Result<Option<GraphConfig>>>;

    fn find_neuron(&self, neuron_id: &str) -> BoxFuture<'_, Result<Option<NeuronConfig>>>;

    /// Look up a reusable universal-node config by node id.
    fn find_universal_node(
        &self,
        node_id: &str,
    ) -> BoxFuture<'_, Result<Option<serde_json::Value>>>;

    fn user_settings(&self, user_id: &str) -> BoxFuture<'_, Result<Option<UserSettings>>>;

    /// Graphs visible to a user before tier filtering: system graphs plus
    /// the user's own.
    fn graphs_for_user(&self, user_id: &str) -> BoxFuture<'_, Result<Vec<GraphConfig>>>;

    /// Bump a graph's usage counter. Callers spawn this; it must never block
    /// a request.
    fn record_graph_use(&self, graph_id: &str) -> BoxFuture<'_, Result<()>>;
}

/// Sink for raw LM token chunks of a user-visible step. The streaming
/// pipeline implements this with think-tag extraction and batching behind it.
pub trait TokenSink: Send + Sync + 'static {
    fn push(&self, chunk: &str) -> BoxFuture<'_, Result<()>>;

    /// Flush any buffered output at end of stream.
    fn flush(&self) -> BoxFuture<'_, Result<()>>;
}
