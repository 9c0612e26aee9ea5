//! The LM-call step.

use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;

use cortex_core::error::{CortexError, Result};
use cortex_core::state::{RuntimeState, StateDelta};
use cortex_core::types::{ChatMessage, LmDelta, LmRequest, Role};

use crate::context::RunContext;
use crate::steps::policy::{with_retries, ErrorPolicy, PolicyOutcome};
use crate::steps::write_output;
use crate::template::{render, single_placeholder};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NeuronStepConfig {
    #[serde(default)]
    pub neuron_id: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub user_prompt: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    pub output_field: String,
    /// Whether this step's tokens are user-visible on the transport.
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub structured_output: Option<StructuredOutput>,
    #[serde(default)]
    pub error_handling: ErrorPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StructuredOutput {
    pub schema: Value,
    #[serde(default)]
    pub method: Option<String>,
}

pub async fn execute(
    ctx: &RunContext,
    state: &RuntimeState,
    config: NeuronStepConfig,
) -> Result<StateDelta> {
    let messages = build_messages(state, &config)?;
    let neuron_id = config
        .neuron_id
        .clone()
        .unwrap_or_else(|| ctx.default_neuron_id.clone());

    let request = LmRequest {
        messages,
        temperature: config.temperature,
        max_tokens: config.max_tokens,
        top_p: None,
        json_schema: config.structured_output.as_ref().map(|s| s.schema.clone()),
    };

    let structured = config.structured_output.is_some();
    let visible = config.stream && ctx.sink.is_some();

    let outcome = with_retries(&config.error_handling, "neuron", || {
        let request = request.clone();
        let neuron_id = neuron_id.clone();
        async move {
            let handle = ctx.neurons.model(&neuron_id, &state.user_id).await?;

            if structured {
                let text = handle.complete(request).await?;
                return Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)));
            }

            let mut stream = handle.chat_stream(request).await?;
            let mut accumulated = String::new();
            while let Some(delta) = stream.next().await {
                if ctx.cancelled() {
                    return Err(CortexError::Cancelled);
                }
                match delta? {
                    LmDelta::Text(text) => {
                        if visible {
                            if let Some(sink) = &ctx.sink {
                                sink.push(&text).await?;
                            }
                        }
                        accumulated.push_str(&text);
                    }
                    LmDelta::Usage { .. } => {}
                    LmDelta::Stop => break,
                }
            }
            if visible {
                if let Some(sink) = &ctx.sink {
                    sink.flush().await?;
                }
            }
            Ok(Value::String(accumulated))
        }
    })
    .await?;

    let mut delta = StateDelta::new();
    match outcome {
        PolicyOutcome::Value(v) | PolicyOutcome::Fallback(v) => {
            write_output(&mut delta, &config.output_field, v);
        }
        PolicyOutcome::Skipped => {}
    }
    Ok(delta)
}

/// Expand prompts into the message list for the LM.
///
/// A `userPrompt` that is exactly one placeholder naming an array is taken
/// as a pre-built message list; `systemPrompt` then replaces its leading
/// system message or is prepended.
fn build_messages(state: &RuntimeState, config: &NeuronStepConfig) -> Result<Vec<ChatMessage>> {
    if let Some(path) = single_placeholder(&config.user_prompt) {
        if let Some(value @ Value::Array(_)) = state.lookup(path) {
            let mut messages: Vec<ChatMessage> =
                serde_json::from_value(value).map_err(|e| CortexError::Step {
                    step: "neuron".into(),
                    message: format!("field '{}' is not a message list: {}", path, e),
                })?;

            if let Some(system) = &config.system_prompt {
                let rendered = render(system, state)?;
                match messages.first_mut() {
                    Some(first) if first.role == Role::System => first.content = rendered,
                    _ => messages.insert(0, ChatMessage::system(rendered)),
                }
            }
            return Ok(messages);
        }
    }

    let mut messages = Vec::new();
    if let Some(system) = &config.system_prompt {
        messages.push(ChatMessage::system(render(system, state)?));
    }
    messages.push(ChatMessage::user(render(&config.user_prompt, state)?));
    Ok(messages)
}
