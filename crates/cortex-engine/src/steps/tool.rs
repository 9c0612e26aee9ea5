//! The tool-call step: routes through the process pool and unwraps results.

use serde::Deserialize;
use serde_json::Value;

use cortex_core::error::Result;
use cortex_core::state::{RuntimeState, StateDelta};
use cortex_core::types::{new_id, ToolCallMeta, ToolEvent, ToolEventKind};

use crate::context::RunContext;
use crate::steps::policy::{with_retries, ErrorPolicy, OnError, PolicyOutcome};
use crate::steps::write_output;
use crate::template::render_params;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStepConfig {
    pub tool_name: String,
    #[serde(default)]
    pub parameters: Value,
    pub output_field: String,
    #[serde(default)]
    pub error_handling: Option<ErrorPolicy>,
    // Legacy retry knobs, honored when errorHandling is absent.
    #[serde(default)]
    pub retry_on_error: bool,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl ToolStepConfig {
    fn policy(&self) -> ErrorPolicy {
        if let Some(policy) = &self.error_handling {
            return policy.clone();
        }
        if self.retry_on_error {
            return ErrorPolicy {
                retry: self.max_retries.unwrap_or(2),
                on_error: OnError::Throw,
                ..Default::default()
            };
        }
        ErrorPolicy::default()
    }
}

pub async fn execute(
    ctx: &RunContext,
    state: &RuntimeState,
    config: ToolStepConfig,
) -> Result<StateDelta> {
    let args = render_params(&config.parameters, state)?;
    let meta = ToolCallMeta {
        conversation_id: state.conversation_id.clone(),
        generation_id: state.generation_id.clone(),
        message_id: state.message_id.clone(),
    };

    let tool_id = new_id();
    ctx.cache
        .publish_tool_status(&state.message_id, "running", &config.tool_name)
        .await?;
    ctx.cache
        .publish_tool_event(
            &state.message_id,
            ToolEvent::new(&tool_id, &config.tool_name, ToolEventKind::Start, args.clone()),
        )
        .await?;

    let policy = config.policy();
    let tool_name = config.tool_name.clone();
    let outcome = with_retries(&policy, &tool_name, || {
        let name = tool_name.clone();
        let args = args.clone();
        let meta = meta.clone();
        async move { ctx.tools.call_tool(&name, args, meta).await }
    })
    .await;

    let mut delta = StateDelta::new();
    match outcome {
        Ok(PolicyOutcome::Value(raw)) => {
            let value = unwrap_tool_result(&raw);
            ctx.cache
                .publish_tool_event(
                    &state.message_id,
                    ToolEvent::new(&tool_id, &config.tool_name, ToolEventKind::Complete, value.clone()),
                )
                .await?;
            write_output(&mut delta, &config.output_field, value);
        }
        Ok(PolicyOutcome::Fallback(value)) => {
            // The policy resolved a value, so this is not an error to the
            // client or the persisted execution record.
            ctx.cache
                .publish_tool_event(
                    &state.message_id,
                    ToolEvent::new(&tool_id, &config.tool_name, ToolEventKind::Fallback, value.clone()),
                )
                .await?;
            write_output(&mut delta, &config.output_field, value);
        }
        Ok(PolicyOutcome::Skipped) => {
            ctx.cache
                .publish_tool_event(
                    &state.message_id,
                    ToolEvent::new(&tool_id, &config.tool_name, ToolEventKind::Error, Value::Null),
                )
                .await?;
        }
        Err(e) => {
            ctx.cache
                .publish_tool_event(
                    &state.message_id,
                    ToolEvent::new(
                        &tool_id,
                        &config.tool_name,
                        ToolEventKind::Error,
                        Value::String(e.to_string()),
                    ),
                )
                .await?;
            return Err(e);
        }
    }
    Ok(delta)
}

/// Unwrap a tool's structured result: a single text content item becomes
/// its parsed JSON (or the text itself); anything else stays as-is.
fn unwrap_tool_result(raw: &Value) -> Value {
    if let Some(content) = raw.get("content").and_then(Value::as_array) {
        if content.len() == 1 {
            if let Some(text) = content[0].get("text").and_then(Value::as_str) {
                if let Ok(parsed) = serde_json::from_str::<Value>(text) {
                    return parsed;
                }
                return Value::String(text.to_string());
            }
        }
    }
    raw.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ctx_with_tools, ctx_with_tools_and_cache, FakeTools, RecordingCache};
    use cortex_core::error::CortexError;
    use cortex_core::state::QueryInput;
    use serde_json::json;

    fn state() -> RuntimeState {
        RuntimeState::new(QueryInput { message: "find rust news".into() }, "u1", 4)
    }

    #[test]
    fn test_unwrap_single_text_json() {
        let raw = json!({"content": [{"type": "text", "text": "[{\"title\": \"a\"}]"}]});
        assert_eq!(unwrap_tool_result(&raw), json!([{"title": "a"}]));
    }

    #[test]
    fn test_unwrap_single_text_plain() {
        let raw = json!({"content": [{"type": "text", "text": "just text"}]});
        assert_eq!(unwrap_tool_result(&raw), json!("just text"));
    }

    #[test]
    fn test_unwrap_passthrough() {
        let raw = json!({"content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}]});
        assert_eq!(unwrap_tool_result(&raw), raw);
    }

    #[tokio::test]
    async fn test_parameters_are_templated() {
        let tools = FakeTools::succeeding(json!({"content": [{"type": "text", "text": "ok"}]}));
        let ctx = ctx_with_tools(tools.clone());
        let config: ToolStepConfig = serde_json::from_value(json!({
            "toolName": "web_search",
            "parameters": {"query": "{{state.query.message}}"},
            "outputField": "results"
        }))
        .unwrap();

        let delta = execute(&ctx, &state(), config).await.unwrap();
        assert_eq!(delta["data"]["results"], json!("ok"));
        assert_eq!(tools.calls()[0].1["query"], json!("find rust news"));
    }

    #[tokio::test]
    async fn test_retry_then_fallback() {
        // Fails twice; retry budget of one means both attempts fail, and the
        // fallback value lands in the output field without an error.
        let tools = FakeTools::failing_n(2, json!({"content": [{"type": "text", "text": "late"}]}));
        let cache = RecordingCache::default();
        let ctx = ctx_with_tools_and_cache(tools.clone(), cache.clone());
        let config: ToolStepConfig = serde_json::from_value(json!({
            "toolName": "web_search",
            "parameters": {"query": "{{state.query.message}}"},
            "outputField": "results",
            "errorHandling": {"retry": 1, "retryDelay": 10, "onError": "fallback", "fallbackValue": []}
        }))
        .unwrap();

        let delta = execute(&ctx, &state(), config).await.unwrap();
        assert_eq!(delta["data"]["results"], json!([]));
        assert_eq!(tools.calls().len(), 2);

        // A resolved fallback is its own terminal event kind, never an error.
        let events = cache.tool_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ToolEventKind::Start);
        assert_eq!(events[1].kind, ToolEventKind::Fallback);
        assert_eq!(events[1].payload, json!([]));
    }

    #[tokio::test]
    async fn test_exhausted_retries_throw_by_default() {
        let tools = FakeTools::failing_n(3, json!(null));
        let ctx = ctx_with_tools(tools);
        let config: ToolStepConfig = serde_json::from_value(json!({
            "toolName": "web_search",
            "parameters": {},
            "outputField": "results",
            "retryOnError": true,
            "maxRetries": 1
        }))
        .unwrap();

        let err = execute(&ctx, &state(), config).await.unwrap_err();
        assert!(matches!(err, CortexError::ToolExecution { .. }));
    }
}
