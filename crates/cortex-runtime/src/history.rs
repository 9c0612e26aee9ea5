//! Conversation persistence through the history tool, and reconstruction of
//! per-message tool-execution records from the generation's event log.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::warn;

use cortex_core::traits::ToolRouter;
use cortex_core::types::{ToolCallMeta, ToolEvent, ToolEventKind};

/// Append a message to the conversation history. Best effort: a down
/// history server degrades persistence, not the response.
pub async fn persist_message(
    tools: &Arc<dyn ToolRouter>,
    meta: &ToolCallMeta,
    message_id: &str,
    role: &str,
    content: &str,
    thinking: Option<&str>,
    tool_executions: Vec<Value>,
) {
    let args = json!({
        "conversationId": meta.conversation_id,
        "messageId": message_id,
        "role": role,
        "content": content,
        "thinking": thinking,
        "toolExecutions": tool_executions,
    });

    if let Err(e) = tools.call_tool("history_append", args, meta.clone()).await {
        warn!(message_id, role, error = %e, "Failed to persist message");
    }
}

/// Load prior context for a conversation: ordered messages plus a rolling
/// summary. Returns empty context when the history tool is unavailable.
pub async fn load_context(
    tools: &Arc<dyn ToolRouter>,
    meta: &ToolCallMeta,
    max_tokens: usize,
) -> (Vec<cortex_core::types::ChatMessage>, String) {
    let args = json!({
        "conversationId": meta.conversation_id,
        "maxTokens": max_tokens,
    });

    match tools.call_tool("history_context", args, meta.clone()).await {
        Ok(result) => {
            let messages = result
                .get("messages")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            let summary = result
                .get("summary")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            (messages, summary)
        }
        Err(e) => {
            warn!(conversation_id = %meta.conversation_id, error = %e, "Context load failed, starting empty");
            (Vec::new(), String::new())
        }
    }
}

/// Group a generation's ordered tool events into per-call execution records:
/// `start` → `progress`… → a terminal `complete`, `fallback`, or `error`,
/// keyed by tool id.
pub fn reconstruct_tool_executions(events: &[ToolEvent]) -> Vec<Value> {
    let mut order: Vec<String> = Vec::new();
    let mut by_id: std::collections::HashMap<&str, Value> = std::collections::HashMap::new();

    for event in events {
        if !by_id.contains_key(event.tool_id.as_str()) {
            order.push(event.tool_id.clone());
            by_id.insert(
                &event.tool_id,
                json!({
                    "toolId": event.tool_id,
                    "toolName": event.tool_name,
                    "status": "running",
                    "progress": [],
                }),
            );
        }
        let record = by_id.get_mut(event.tool_id.as_str()).unwrap();
        match event.kind {
            ToolEventKind::Start => {
                record["parameters"] = event.payload.clone();
                record["startedAt"] = json!(event.timestamp);
            }
            ToolEventKind::Progress => {
                if let Some(progress) = record["progress"].as_array_mut() {
                    progress.push(event.payload.clone());
                }
            }
            ToolEventKind::Complete => {
                record["status"] = json!("complete");
                record["result"] = event.payload.clone();
                record["completedAt"] = json!(event.timestamp);
            }
            ToolEventKind::Fallback => {
                record["status"] = json!("fallback");
                record["result"] = event.payload.clone();
                record["completedAt"] = json!(event.timestamp);
            }
            ToolEventKind::Error => {
                record["status"] = json!("error");
                record["error"] = event.payload.clone();
                record["completedAt"] = json!(event.timestamp);
            }
        }
    }

    order
        .iter()
        .filter_map(|id| by_id.remove(id.as_str()))
        .collect()
}
