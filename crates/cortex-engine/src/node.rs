//! The universal node: every graph node sequences steps through this one
//! handler, accumulating per-step deltas and converting failures into an
//! `error_handler` route instead of re-raising.

use serde_json::Value;
use tracing::{debug, error, warn};

use cortex_core::model::{NodeConfig, StepSpec};
use cortex_core::state::{
    apply_delta, expand_dot_keys, merge_deltas, RuntimeState, StateDelta,
};

use crate::context::RunContext;
use crate::expr;
use crate::steps::execute_step;

/// Route taken when a step inside a node fails after its error policy.
pub const ERROR_ROUTE: &str = "error_handler";

/// Run one node. Never returns an error: step failures become a delta
/// carrying `data.error` and `data.nextRoute = "error_handler"`.
pub async fn run_node(
    ctx: &RunContext,
    state: &RuntimeState,
    node_id: &str,
    config: Option<&NodeConfig>,
) -> StateDelta {
    let steps = match resolve_steps(ctx, node_id, config).await {
        Ok(steps) => steps,
        Err(message) => return error_delta(&message),
    };

    let counter = state.node_counter + 1;
    let mut delta = StateDelta::new();
    delta.insert("nodeCounter".to_string(), Value::from(counter));
    delta.insert(
        "data".to_string(),
        serde_json::json!({
            "systemPrefix": format!("Workflow node '{}' (#{})", node_id, counter),
        }),
    );

    for (index, step) in steps.iter().enumerate() {
        // Steps see the original state plus everything accumulated so far.
        let mut working = state.clone();
        apply_delta(&mut working, &delta);

        if let Some(guard) = &step.condition {
            if !expr::evaluate_condition(guard, &working) {
                debug!(node_id, step = index, "Step condition falsy, skipping");
                continue;
            }
        }

        delta.insert("currentStepIndex".to_string(), Value::from(index as u64));

        match execute_step(ctx, &working, step).await {
            Ok(step_delta) => {
                let expanded = expand_dot_keys(step_delta);
                merge_deltas(&mut delta, &expanded);
            }
            Err(e) => {
                error!(node_id, step = index, error = %e, "Node step failed, routing to error handler");
                return error_delta(&e.to_string());
            }
        }
    }

    delta
}

/// Normalize the injected config to a step list, resolving `{ nodeId }`
/// references through the universal-node library.
async fn resolve_steps(
    ctx: &RunContext,
    node_id: &str,
    config: Option<&NodeConfig>,
) -> Result<Vec<StepSpec>, String> {
    let Some(config) = config else {
        warn!(node_id, "Node has no config, passing through");
        return Ok(Vec::new());
    };

    match config {
        NodeConfig::Reference { node_id: reference } => {
            let stored = ctx
                .store
                .find_universal_node(reference)
                .await
                .map_err(|e| format!("node reference '{}' lookup failed: {}", reference, e))?
                .ok_or_else(|| format!("node reference '{}' not found", reference))?;
            let resolved: NodeConfig = serde_json::from_value(stored)
                .map_err(|e| format!("node reference '{}' is invalid: {}", reference, e))?;
            if matches!(resolved, NodeConfig::Reference { .. }) {
                return Err(format!("node reference '{}' is itself a reference", reference));
            }
            Ok(resolved.steps())
        }
        other => Ok(other.steps()),
    }
}

fn error_delta(message: &str) -> StateDelta {
    let mut delta = StateDelta::new();
    delta.insert(
        "data".to_string(),
        serde_json::json!({
            "error": message,
            "nextRoute": ERROR_ROUTE,
        }),
    );
    delta
}
