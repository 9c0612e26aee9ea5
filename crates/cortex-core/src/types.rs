use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Graph id the orchestrator falls back to when the requested graph is
/// missing or tier-gated.
pub const SYSTEM_DEFAULT_GRAPH_ID: &str = "system-default";
/// Minimal single-responder graph, used as the default for new accounts.
pub const SYSTEM_SIMPLE_GRAPH_ID: &str = "system-simple";
/// Chat neuron used when a user has no default configured.
pub const SYSTEM_DEFAULT_NEURON_ID: &str = "system-chat";
/// Worker neuron used for background summarization and titling.
pub const SYSTEM_WORKER_NEURON_ID: &str = "system-worker";

/// Lowest-privilege account tier. Tiers run 0 (highest) to 4 (lowest).
pub const LOWEST_TIER: u8 = 4;

/// Owner id marking a system-owned resource.
pub const SYSTEM_OWNER: &str = "system";

/// Reserved graph endpoints.
pub const START_NODE: &str = "__start__";
pub const END_NODE: &str = "__end__";
/// Reserved branch key taken when a conditional edge resolves to no target.
pub const FALLBACK_KEY: &str = "__fallback__";

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A chat message flowing through graphs and to LM providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// A request to an LM handle.
#[derive(Debug, Clone, Default)]
pub struct LmRequest {
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    /// JSON schema for structured output; providers that cannot enforce it
    /// ignore it.
    pub json_schema: Option<serde_json::Value>,
}

/// A streaming delta from an LM handle.
#[derive(Debug, Clone)]
pub enum LmDelta {
    /// A chunk of text content.
    Text(String),
    /// Token accounting, when the provider reports it.
    Usage { input_tokens: u64, output_tokens: u64 },
    /// The response is complete.
    Stop,
}

/// Lifecycle status of a tool event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolEventKind {
    Start,
    Progress,
    Complete,
    Error,
    /// The call failed but its error policy resolved a fallback value; the
    /// step did not throw. Terminal, like `Complete`/`Error`.
    Fallback,
}

/// One entry in a generation's ordered tool-event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEvent {
    pub tool_id: String,
    pub tool_name: String,
    pub kind: ToolEventKind,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ToolEvent {
    pub fn new(tool_id: &str, tool_name: &str, kind: ToolEventKind, payload: serde_json::Value) -> Self {
        Self {
            tool_id: tool_id.to_string(),
            tool_name: tool_name.to_string(),
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Request identifiers attached as `_meta` to every tool call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallMeta {
    pub conversation_id: String,
    pub generation_id: String,
    pub message_id: String,
}

/// Status of a streaming generation in the shared cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Generating,
    Completed,
    Error,
}

/// Durable projection of a generation, kept in the shared cache for one hour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationState {
    pub message_id: String,
    pub conversation_id: String,
    pub status: GenerationStatus,
    pub content: String,
    pub thinking: String,
    pub tool_events: Vec<ToolEvent>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
}

impl GenerationState {
    pub fn started(conversation_id: &str, message_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            status: GenerationStatus::Generating,
            content: String::new(),
            thinking: String::new(),
            tool_events: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            current_status: None,
            tokens: None,
        }
    }
}

/// An event on a generation's pub/sub channel, delivered to the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Init {
        #[serde(skip_serializing_if = "Option::is_none")]
        existing_content: Option<String>,
    },
    Chunk {
        content: String,
    },
    Status {
        action: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    ToolEvent {
        event: ToolEvent,
    },
    ToolStatus {
        status: String,
        action: String,
    },
    ThinkingChunk {
        content: String,
    },
    Complete {
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    Error {
        error: String,
    },
}

impl StreamEvent {
    /// Whether this event terminates a subscription.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error { .. })
    }
}

/// Per-user defaults read from the `users` collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    #[serde(default = "default_lowest_tier")]
    pub account_tier: u8,
    #[serde(default)]
    pub default_neuron_id: Option<String>,
    #[serde(default)]
    pub default_worker_neuron_id: Option<String>,
    #[serde(default)]
    pub default_graph_id: Option<String>,
}

pub fn default_lowest_tier() -> u8 {
    LOWEST_TIER
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            account_tier: LOWEST_TIER,
            default_neuron_id: None,
            default_worker_neuron_id: None,
            default_graph_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_event_terminal() {
        assert!(StreamEvent::Complete { metadata: None }.is_terminal());
        assert!(StreamEvent::Error { error: "x".into() }.is_terminal());
        assert!(!StreamEvent::Chunk { content: "hi".into() }.is_terminal());
    }

    #[test]
    fn test_stream_event_serialization() {
        let e = StreamEvent::Chunk { content: "abc".into() };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "chunk");
        assert_eq!(json["content"], "abc");

        let e = StreamEvent::Status {
            action: "thinking".into(),
            description: None,
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "status");
        assert!(json.get("description").is_none());
    }

    #[test]
    fn test_user_settings_defaults() {
        let settings: UserSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.account_tier, LOWEST_TIER);
        assert!(settings.default_graph_id.is_none());
    }
}
