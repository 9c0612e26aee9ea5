//! The conditional-set step: pick one of two values by a guard expression.

use serde::Deserialize;
use serde_json::Value;

use cortex_core::error::Result;
use cortex_core::state::{RuntimeState, StateDelta};

use crate::expr;
use crate::steps::write_output;
use crate::template::render;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalStepConfig {
    pub condition: String,
    pub set_field: String,
    pub true_value: Value,
    pub false_value: Value,
}

pub fn execute(state: &RuntimeState, config: ConditionalStepConfig) -> Result<StateDelta> {
    let chosen = if eval_condition(&config.condition, state) {
        &config.true_value
    } else {
        &config.false_value
    };

    let value = eval_chosen(state, chosen)?;
    let mut delta = StateDelta::new();
    write_output(&mut delta, &config.set_field, value);
    Ok(delta)
}

/// The condition may be a bare expression or a `{{…}}`-wrapped one.
fn eval_condition(condition: &str, state: &RuntimeState) -> bool {
    let trimmed = condition.trim();
    let source = trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(trimmed);
    expr::evaluate_condition(source, state)
}

/// A `{{…}}`-wrapped string value is evaluated as an expression; other
/// strings render as templates; non-strings pass through.
fn eval_chosen(state: &RuntimeState, value: &Value) -> Result<Value> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if let Some(inner) = trimmed
                .strip_prefix("{{")
                .and_then(|rest| rest.strip_suffix("}}"))
            {
                return expr::evaluate(inner.trim(), state);
            }
            Ok(Value::String(render(s, state)?))
        }
        other => Ok(other.clone()),
    }
}
