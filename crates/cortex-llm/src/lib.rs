//! Provider adapters behind the `LmHandle` trait.

pub mod providers;
pub mod streaming;

use cortex_core::model::{NeuronConfig, ProviderKind};
use cortex_core::traits::LmHandle;

pub use providers::{AnthropicCompatible, GoogleCompatible, OpenAiCompatible};

/// Build a fresh handle for a neuron. Every call returns a new instance;
/// handles are never pooled or shared across users.
///
/// `api_key` is the already-resolved key (the registry handles encrypted
/// indirections before calling in here).
pub fn build_handle(config: &NeuronConfig, api_key: Option<String>) -> Box<dyn LmHandle> {
    match config.provider {
        ProviderKind::AnthropicCompatible => {
            Box::new(AnthropicCompatible::from_neuron(config, api_key))
        }
        ProviderKind::GoogleCompatible => {
            Box::new(GoogleCompatible::from_neuron(config, api_key))
        }
        // Local and custom endpoints speak the OpenAI chat-completions shape.
        ProviderKind::Local | ProviderKind::OpenaiCompatible | ProviderKind::Custom => {
            Box::new(OpenAiCompatible::from_neuron(config, api_key))
        }
    }
}
