//! The five step primitives executed inside universal nodes.
//!
//! Every executor takes `(config, state)` and returns a partial state delta;
//! deltas flow back through the reducer in `cortex_core::state`.

pub mod conditional;
pub mod loop_step;
pub mod neuron;
pub mod policy;
pub mod tool;
pub mod transform;

pub use policy::{ErrorPolicy, OnError, PolicyOutcome};

use futures::future::BoxFuture;
use serde_json::Value;

use cortex_core::error::{CortexError, Result};
use cortex_core::model::{StepKind, StepSpec};
use cortex_core::state::{expand_dot_keys, merge_deltas, RuntimeState, StateDelta};
use cortex_core::types::ChatMessage;

use crate::context::RunContext;

/// Execute one step against the current working state. Boxed so the loop
/// step can recurse into its nested steps.
pub fn execute_step<'a>(
    ctx: &'a RunContext,
    state: &'a RuntimeState,
    spec: &'a StepSpec,
) -> BoxFuture<'a, Result<StateDelta>> {
    Box::pin(async move {
        if ctx.cancelled() {
            return Err(CortexError::Cancelled);
        }
        match spec.step_type {
            StepKind::Neuron => {
                let config = parse_config(&spec.config, "neuron")?;
                neuron::execute(ctx, state, config).await
            }
            StepKind::Tool => {
                let config = parse_config(&spec.config, "tool")?;
                tool::execute(ctx, state, config).await
            }
            StepKind::Transform => {
                let config = parse_config(&spec.config, "transform")?;
                transform::execute(state, config)
            }
            StepKind::Conditional => {
                let config = parse_config(&spec.config, "conditional")?;
                conditional::execute(state, config)
            }
            StepKind::Loop => {
                let config = parse_config(&spec.config, "loop")?;
                loop_step::execute(ctx, state, config).await
            }
        }
    })
}

fn parse_config<T: serde::de::DeserializeOwned>(config: &Value, step: &str) -> Result<T> {
    serde_json::from_value(config.clone()).map_err(|e| CortexError::Step {
        step: step.to_string(),
        message: format!("invalid config: {}", e),
    })
}

/// Write a step's output value into a delta. Output fields land in `data`
/// (dot paths expand to nested objects), with two exceptions: a string
/// written to `response` becomes the final assistant message, and a string
/// written to `finalResponse` sets the short-circuit answer.
pub(crate) fn write_output(delta: &mut StateDelta, field: &str, value: Value) {
    if field == "response" {
        if let Value::String(text) = &value {
            if let Ok(msg) = serde_json::to_value(ChatMessage::assistant(text.clone())) {
                delta.insert("response".to_string(), msg);
                return;
            }
        }
    }
    if field == "finalResponse" && value.is_string() {
        delta.insert("finalResponse".to_string(), value);
        return;
    }

    let mut flat = StateDelta::new();
    flat.insert(format!("data.{}", field), value);
    let nested = expand_dot_keys(flat);
    merge_deltas(delta, &nested);
}
