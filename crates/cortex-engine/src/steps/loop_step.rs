//! The loop step: run nested steps until an exit condition or iteration cap.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use cortex_core::error::{CortexError, Result};
use cortex_core::model::StepSpec;
use cortex_core::state::{apply_delta, expand_dot_keys, RuntimeState, StateDelta};

use crate::context::RunContext;
use crate::expr;
use crate::steps::execute_step;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnMaxIterations {
    #[default]
    Continue,
    Throw,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopStepConfig {
    pub max_iterations: u32,
    pub exit_condition: String,
    pub steps: Vec<StepSpec>,
    #[serde(default)]
    pub accumulator_field: Option<String>,
    #[serde(default)]
    pub on_max_iterations: OnMaxIterations,
}

pub async fn execute(
    ctx: &RunContext,
    state: &RuntimeState,
    config: LoopStepConfig,
) -> Result<StateDelta> {
    let mut working = state.clone();
    let mut accumulator: Vec<Value> = Vec::new();
    let mut iterations = 0u32;
    let mut exit_met = false;

    for iteration in 1..=config.max_iterations {
        // Cancellation is checked at iteration boundaries.
        if ctx.cancelled() {
            return Err(CortexError::Cancelled);
        }

        working
            .data
            .insert("loopIteration".to_string(), Value::from(iteration));
        working.data.insert(
            "loopAccumulator".to_string(),
            Value::Array(accumulator.clone()),
        );

        for step in &config.steps {
            if let Some(guard) = &step.condition {
                if !expr::evaluate_condition(guard, &working) {
                    continue;
                }
            }
            let delta = execute_step(ctx, &working, step).await?;
            apply_delta(&mut working, &expand_dot_keys(delta));
        }

        iterations = iteration;

        if let Some(field) = &config.accumulator_field {
            if let Some(value) = working.lookup(field) {
                accumulator.push(value);
            }
        }

        if expr::evaluate_condition(&config.exit_condition, &working) {
            exit_met = true;
            break;
        }
    }

    if !exit_met {
        match config.on_max_iterations {
            OnMaxIterations::Throw => {
                return Err(CortexError::Step {
                    step: "loop".into(),
                    message: format!(
                        "exit condition not met within {} iterations",
                        config.max_iterations
                    ),
                });
            }
            OnMaxIterations::Continue => {
                warn!(
                    max_iterations = config.max_iterations,
                    "Loop hit iteration cap without meeting exit condition"
                );
            }
        }
    }

    debug!(iterations, exit_met, "Loop step finished");
    Ok(loop_delta(state, working, &config, accumulator, iterations, exit_met))
}

/// Project the working state's user-visible updates into one delta.
fn loop_delta(
    original: &RuntimeState,
    working: RuntimeState,
    config: &LoopStepConfig,
    accumulator: Vec<Value>,
    iterations: u32,
    exit_met: bool,
) -> StateDelta {
    let mut data = working.data;
    data.remove("loopIteration");
    data.remove("loopAccumulator");
    data.insert("loopIterations".to_string(), Value::from(iterations));
    data.insert("loopExitConditionMet".to_string(), Value::Bool(exit_met));
    if let Some(field) = &config.accumulator_field {
        data.insert(
            format!("{}Count", field),
            Value::from(accumulator.len()),
        );
        data.insert(format!("{}Array", field), Value::Array(accumulator));
    }

    let mut delta = StateDelta::new();
    delta.insert("data".to_string(), Value::Object(data));

    if working.messages.len() > original.messages.len() {
        if let Ok(new_msgs) =
            serde_json::to_value(&working.messages[original.messages.len()..])
        {
            delta.insert("messages".to_string(), new_msgs);
        }
    }
    if let Some(response) = working.response {
        if let Ok(v) = serde_json::to_value(response) {
            delta.insert("response".to_string(), v);
        }
    }
    if let Some(route) = working.next_route {
        delta.insert("nextRoute".to_string(), Value::String(route));
    }
    if let Some(final_response) = working.final_response {
        delta.insert("finalResponse".to_string(), Value::String(final_response));
    }
    if working.search_iterations != original.search_iterations {
        delta.insert(
            "searchIterations".to_string(),
            Value::from(working.search_iterations),
        );
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::null_ctx;
    use cortex_core::state::QueryInput;
    use serde_json::json;

    fn state() -> RuntimeState {
        let mut s = RuntimeState::new(QueryInput { message: "q".into() }, "u1", 4);
        s.data.insert("total".into(), json!(0));
        s
    }

    fn counting_loop(max: u32, exit: &str) -> LoopStepConfig {
        serde_json::from_value(json!({
            "maxIterations": max,
            "exitCondition": exit,
            "accumulatorField": "total",
            "steps": [
                {"type": "transform", "config": {
                    "operation": "set",
                    "outputField": "total",
                    "value": "{{ data.loopIteration }}"
                }}
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_runs_until_exit_condition() {
        let ctx = null_ctx();
        let delta = execute(&ctx, &state(), counting_loop(10, "data.total >= 3"))
            .await
            .unwrap();
        assert_eq!(delta["data"]["loopIterations"], json!(3));
        assert_eq!(delta["data"]["loopExitConditionMet"], json!(true));
        assert_eq!(delta["data"]["total"], json!(3));
        assert_eq!(delta["data"]["totalArray"], json!([1, 2, 3]));
        assert_eq!(delta["data"]["totalCount"], json!(3));
    }

    #[tokio::test]
    async fn test_iteration_cap_continues_by_default() {
        let ctx = null_ctx();
        let delta = execute(&ctx, &state(), counting_loop(2, "data.total >= 99"))
            .await
            .unwrap();
        assert_eq!(delta["data"]["loopIterations"], json!(2));
        assert_eq!(delta["data"]["loopExitConditionMet"], json!(false));
    }

    #[tokio::test]
    async fn test_iteration_cap_throws_when_configured() {
        let ctx = null_ctx();
        let mut config = counting_loop(2, "data.total >= 99");
        config.on_max_iterations = OnMaxIterations::Throw;
        let err = execute(&ctx, &state(), config).await.unwrap_err();
        assert!(matches!(err, CortexError::Step { .. }));
    }

    #[tokio::test]
    async fn test_scratch_bindings_do_not_leak() {
        let ctx = null_ctx();
        let delta = execute(&ctx, &state(), counting_loop(3, "data.total >= 1"))
            .await
            .unwrap();
        assert!(delta["data"].get("loopIteration").is_none());
        assert!(delta["data"].get("loopAccumulator").is_none());
    }

    #[tokio::test]
    async fn test_cancellation_checked_at_boundary() {
        let ctx = null_ctx();
        ctx.cancel.cancel();
        let err = execute(&ctx, &state(), counting_loop(3, "data.total >= 1"))
            .await
            .unwrap_err();
        assert!(matches!(err, CortexError::Cancelled));
    }
}
