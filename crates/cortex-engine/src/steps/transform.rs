//! Pure data-shaping operations over the state tree.

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::warn;

use cortex_core::error::{CortexError, Result};
use cortex_core::state::{value_at, RuntimeState, StateDelta};
use cortex_core::types::ChatMessage;

use crate::expr;
use crate::steps::write_output;
use crate::template::render;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransformOp {
    Map,
    Filter,
    Select,
    Set,
    ParseJson,
    Append,
    Concat,
    BuildMessages,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformStepConfig {
    pub operation: TransformOp,
    #[serde(default)]
    pub input_field: Option<String>,
    #[serde(default)]
    pub output_field: Option<String>,
    /// `map`: template rendered per element with `item` / `index` bound.
    #[serde(default)]
    pub transform: Option<String>,
    /// `filter`: expression evaluated per element with the same bindings.
    #[serde(default)]
    pub filter_condition: Option<String>,
    /// `select`: dot path extracted from the input value.
    #[serde(default)]
    pub path: Option<String>,
    /// `set` / `append`: the value to evaluate.
    #[serde(default)]
    pub value: Option<Value>,
    /// `append`: optional guard; a falsy guard makes the step a no-op.
    #[serde(default)]
    pub condition: Option<String>,
    /// `concat`: the right-hand array.
    #[serde(default)]
    pub second_field: Option<String>,
    #[serde(default)]
    pub first_default: Option<Value>,
    #[serde(default)]
    pub second_default: Option<Value>,
    /// `build-messages`: name of a pre-existing message array.
    #[serde(default)]
    pub use_existing_field: Option<String>,
    /// `build-messages`: role/content templates.
    #[serde(default)]
    pub messages: Option<Vec<MessageTemplate>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageTemplate {
    pub role: String,
    pub content: String,
}

pub fn execute(state: &RuntimeState, config: TransformStepConfig) -> Result<StateDelta> {
    let result = match config.operation {
        TransformOp::Map => op_map(state, &config)?,
        TransformOp::Filter => op_filter(state, &config)?,
        TransformOp::Select => op_select(state, &config)?,
        TransformOp::Set => op_set(state, &config)?,
        TransformOp::ParseJson => op_parse_json(state, &config)?,
        TransformOp::Append => match op_append(state, &config)? {
            Some(v) => v,
            None => return Ok(StateDelta::new()),
        },
        TransformOp::Concat => op_concat(state, &config)?,
        TransformOp::BuildMessages => op_build_messages(state, &config)?,
    };

    let mut delta = StateDelta::new();
    match (&config.output_field, result) {
        (Some(field), value) => write_output(&mut delta, field, value),
        (None, Value::Object(map)) => {
            delta.insert("data".to_string(), Value::Object(map));
        }
        (None, other) => {
            warn!(operation = ?config.operation, "Transform produced a non-object with no outputField, dropping {}", other);
        }
    }
    Ok(delta)
}

fn step_err(message: impl Into<String>) -> CortexError {
    CortexError::Step {
        step: "transform".into(),
        message: message.into(),
    }
}

fn input_array(state: &RuntimeState, config: &TransformStepConfig) -> Result<Vec<Value>> {
    let field = config
        .input_field
        .as_deref()
        .ok_or_else(|| step_err("inputField is required"))?;
    match state.lookup(field) {
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(step_err(format!("'{}' is not an array: {}", field, other))),
        None => Err(step_err(format!("'{}' is unset", field))),
    }
}

/// Clone the state with `item` / `index` bound into the workspace, so element
/// templates and conditions can reference them.
fn with_bindings(state: &RuntimeState, item: &Value, index: usize) -> RuntimeState {
    let mut bound = state.clone();
    bound.data.insert("item".to_string(), item.clone());
    bound.data.insert("index".to_string(), Value::from(index));
    bound
}

fn op_map(state: &RuntimeState, config: &TransformStepConfig) -> Result<Value> {
    let template = config
        .transform
        .as_deref()
        .ok_or_else(|| step_err("map requires 'transform'"))?;
    let items = input_array(state, config)?;
    let mut out = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let bound = with_bindings(state, item, index);
        out.push(Value::String(render(template, &bound)?));
    }
    Ok(Value::Array(out))
}

fn op_filter(state: &RuntimeState, config: &TransformStepConfig) -> Result<Value> {
    let condition = config
        .filter_condition
        .as_deref()
        .ok_or_else(|| step_err("filter requires 'filterCondition'"))?;
    let items = input_array(state, config)?;
    let mut out = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        let bound = with_bindings(state, &item, index);
        if expr::evaluate_condition(condition, &bound) {
            out.push(item);
        }
    }
    Ok(Value::Array(out))
}

fn op_select(state: &RuntimeState, config: &TransformStepConfig) -> Result<Value> {
    let path = config
        .path
        .as_deref()
        .ok_or_else(|| step_err("select requires 'path'"))?;
    let field = config
        .input_field
        .as_deref()
        .ok_or_else(|| step_err("inputField is required"))?;
    let input = state
        .lookup(field)
        .ok_or_else(|| step_err(format!("'{}' is unset", field)))?;

    let segments: Vec<&str> = path.split('.').collect();
    Ok(match input {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| value_at(item, &segments).unwrap_or(Value::Null))
                .collect(),
        ),
        other => value_at(&other, &segments).unwrap_or(Value::Null),
    })
}

/// Evaluate a configured value: a `{{…}}`-wrapped string is an expression,
/// any other string is a template, everything else is a literal.
fn eval_value(state: &RuntimeState, value: &Value) -> Result<Value> {
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

fn op_set(state: &RuntimeState, config: &TransformStepConfig) -> Result<Value> {
    let value = config
        .value
        .as_ref()
        .ok_or_else(|| step_err("set requires 'value'"))?;
    eval_value(state, value)
}

fn op_parse_json(state: &RuntimeState, config: &TransformStepConfig) -> Result<Value> {
    let field = config
        .input_field
        .as_deref()
        .ok_or_else(|| step_err("inputField is required"))?;
    let text = match state.lookup(field) {
        Some(Value::String(s)) => s,
        Some(other) => return Ok(other), // already structured
        None => return Err(step_err(format!("'{}' is unset", field))),
    };

    if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
        return Ok(parsed);
    }
    extract_json(&text)
        .ok_or_else(|| step_err(format!("no JSON value found in '{}'", field)))
}

/// Locate a balanced JSON object or array inside arbitrary text (LM output
/// often wraps JSON in prose or code fences).
pub fn extract_json(text: &str) -> Option<Value> {
    let mut depth = 0i32;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' if depth > 0 => in_string = true,
            '{' | '[' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' | ']' => {
                if depth == 0 {
                    continue;
                }
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        if let Ok(v) = serde_json::from_str::<Value>(&text[s..=i]) {
                            return Some(v);
                        }
                        start = None;
                    }
                }
            }
            _ => {}
        }
    }
    None
}

fn op_append(state: &RuntimeState, config: &TransformStepConfig) -> Result<Option<Value>> {
    if let Some(guard) = &config.condition {
        if !expr::evaluate_condition(guard, state) {
            return Ok(None);
        }
    }
    let field = config
        .output_field
        .as_deref()
        .ok_or_else(|| step_err("append requires 'outputField'"))?;
    let value = config
        .value
        .as_ref()
        .ok_or_else(|| step_err("append requires 'value'"))?;
    let value = eval_value(state, value)?;

    let mut items = match state.lookup(field) {
        Some(Value::Array(items)) => items,
        Some(other) => return Err(step_err(format!("'{}' is not an array: {}", field, other))),
        None => Vec::new(),
    };
    items.push(value);
    Ok(Some(Value::Array(items)))
}

fn op_concat(state: &RuntimeState, config: &TransformStepConfig) -> Result<Value> {
    let side = |field: Option<&str>, default: &Option<Value>| -> Result<Vec<Value>> {
        let looked_up = field.and_then(|f| state.lookup(f));
        match looked_up.or_else(|| default.clone()) {
            Some(Value::Array(items)) => Ok(items),
            Some(other) => Err(step_err(format!("concat operand is not an array: {}", other))),
            None => Ok(Vec::new()),
        }
    };

    let mut left = side(config.input_field.as_deref(), &config.first_default)?;
    let right = side(config.second_field.as_deref(), &config.second_default)?;
    left.extend(right);
    Ok(Value::Array(left))
}

fn op_build_messages(state: &RuntimeState, config: &TransformStepConfig) -> Result<Value> {
    if let Some(field) = &config.use_existing_field {
        return match state.lookup(field) {
            Some(value @ Value::Array(_)) => Ok(value),
            Some(other) => Err(step_err(format!("'{}' is not a message list: {}", field, other))),
            None => Err(step_err(format!("'{}' is unset", field))),
        };
    }

    let templates = config
        .messages
        .as_ref()
        .ok_or_else(|| step_err("build-messages requires 'messages' or 'useExistingField'"))?;

    let mut out = Vec::with_capacity(templates.len());
    for template in templates {
        let content = render(&template.content, state)?;
        let mut map = Map::new();
        map.insert("role".to_string(), Value::String(template.role.clone()));
        map.insert("content".to_string(), Value::String(content));
        out.push(Value::Object(map));
    }
    // Validate the shape early so neuron steps can consume it as-is.
    let _: Vec<ChatMessage> = serde_json::from_value(Value::Array(out.clone()))
        .map_err(|e| step_err(format!("invalid message template: {}", e)))?;
    Ok(Value::Array(out))
}
