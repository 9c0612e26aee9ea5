//! `{{state.path}}` template rendering against the runtime state tree.

use serde_json::Value;
use tracing::warn;

use cortex_core::error::{CortexError, Result};
use cortex_core::state::RuntimeState;

/// Substitute every `{{state.<path>}}` placeholder in `template`.
///
/// Object and array values are encoded as their JSON text. Paths that do not
/// resolve (after the `data.<path>` fallback applied by
/// [`RuntimeState::lookup`]) keep the literal placeholder and log a warning.
/// Only malformed placeholder syntax is an error.
pub fn render(template: &str, state: &RuntimeState) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let end = after_open.find("}}").ok_or_else(|| {
            CortexError::Template(format!(
                "unterminated placeholder near '{}'",
                &rest[start..rest.len().min(start + 24)]
            ))
        })?;

        let raw = after_open[..end].trim();
        if raw.is_empty() {
            return Err(CortexError::Template("empty placeholder".into()));
        }

        let path = raw.strip_prefix("state.").unwrap_or(raw);
        match state.lookup(path) {
            Some(value) => out.push_str(&value_to_text(&value)),
            None => {
                warn!(path, "Unresolved template placeholder");
                out.push_str(&rest[start..start + 2 + end + 2]);
            }
        }

        rest = &after_open[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Recursively render every string in a JSON value. Non-strings pass
/// through; arrays and objects recurse.
pub fn render_params(params: &Value, state: &RuntimeState) -> Result<Value> {
    Ok(match params {
        Value::String(s) => Value::String(render(s, state)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| render_params(v, state))
                .collect::<Result<Vec<_>>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), render_params(v, state)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

/// Whether `template` is exactly one placeholder and nothing else. Returns
/// the inner path with any `state.` prefix stripped.
pub fn single_placeholder(template: &str) -> Option<&str> {
    let trimmed = template.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?.trim();
    if inner.is_empty() || inner.contains("{{") {
        return None;
    }
    Some(inner.strip_prefix("state.").unwrap_or(inner))
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}
