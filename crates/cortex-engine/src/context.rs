use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use cortex_core::traits::{ConfigStore, NeuronSource, SharedCache, TokenSink, ToolRouter};

/// Component handles a graph run executes against. Constructed once per
/// request by the orchestrator; the state tree itself stays pure data.
#[derive(Clone)]
pub struct RunContext {
    pub neurons: Arc<dyn NeuronSource>,
    pub tools: Arc<dyn ToolRouter>,
    pub cache: Arc<dyn SharedCache>,
    pub store: Arc<dyn ConfigStore>,
    /// Transport sink for user-visible LM tokens; absent in non-streaming
    /// requests.
    pub sink: Option<Arc<dyn TokenSink>>,
    pub cancel: CancellationToken,
    /// Neuron used when a step names none.
    pub default_neuron_id: String,
}

impl RunContext {
    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
