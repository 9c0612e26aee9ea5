//! The per-request state tree and its deep-merge reducer.
//!
//! `RuntimeState` is created once per generation, mutated only through
//! [`apply_delta`], and discarded when the generation completes. Step
//! executors and nodes never mutate state directly; they return a
//! [`StateDelta`] (a JSON map of updates) which the reducer folds in:
//! `data` is deep-merged, `messages` is concatenated, everything else is
//! last-write-wins.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::ChatMessage;

/// The user query a generation answers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryInput {
    pub message: String,
}

/// A partial state update produced by a step or node.
pub type StateDelta = Map<String, Value>;

/// The state tree that flows through a compiled graph.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    pub query: QueryInput,
    pub user_id: String,
    pub account_tier: u8,
    pub conversation_id: String,
    pub generation_id: String,
    pub message_id: String,

    /// Prior conversation turns, oldest first.
    pub context_messages: Vec<ChatMessage>,
    pub context_summary: String,

    /// Universal workspace for node outputs; deep-merged across steps.
    pub data: Map<String, Value>,
    /// Accumulated chat messages; always extended, never truncated.
    pub messages: Vec<ChatMessage>,
    /// Final LM message, once a responder produced one.
    pub response: Option<ChatMessage>,
    /// Routing key consumed by conditional edges.
    pub next_route: Option<String>,
    /// Short-circuit answer; set by fastpath-style nodes.
    pub final_response: Option<String>,

    pub node_counter: u64,
    pub current_step_index: u64,
    pub search_iterations: u64,

    /// Whether this request streams to a transport at all.
    pub stream_enabled: bool,
}

impl RuntimeState {
    pub fn new(query: QueryInput, user_id: &str, account_tier: u8) -> Self {
        Self {
            query,
            user_id: user_id.to_string(),
            account_tier,
            conversation_id: String::new(),
            generation_id: String::new(),
            message_id: String::new(),
            context_messages: Vec::new(),
            context_summary: String::new(),
            data: Map::new(),
            messages: Vec::new(),
            response: None,
            next_route: None,
            final_response: None,
            node_counter: 0,
            current_step_index: 0,
            search_iterations: 0,
            stream_enabled: false,
        }
    }

    /// Resolve a dot-separated path against the state tree.
    ///
    /// The leading `state.` prefix must already be stripped. Paths whose
    /// first segment is not a state field fall back to `data.<path>`, as do
    /// known-field paths that fail to resolve.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let segments: Vec<&str> = path.split('.').collect();
        if segments.is_empty() || segments[0].is_empty() {
            return None;
        }

        let (root, rest) = match segments[0] {
            "query" => (serde_json::to_value(&self.query).ok()?, &segments[1..]),
            "userId" => (Value::String(self.user_id.clone()), &segments[1..]),
            "accountTier" => (Value::from(self.account_tier), &segments[1..]),
            "conversationId" => (Value::String(self.conversation_id.clone()), &segments[1..]),
            "generationId" => (Value::String(self.generation_id.clone()), &segments[1..]),
            "messageId" => (Value::String(self.message_id.clone()), &segments[1..]),
            "contextMessages" => (serde_json::to_value(&self.context_messages).ok()?, &segments[1..]),
            "contextSummary" => (Value::String(self.context_summary.clone()), &segments[1..]),
            "data" => (Value::Object(self.data.clone()), &segments[1..]),
            "messages" => (serde_json::to_value(&self.messages).ok()?, &segments[1..]),
            "response" => (serde_json::to_value(&self.response).ok()?, &segments[1..]),
            "nextRoute" => (serde_json::to_value(&self.next_route).ok()?, &segments[1..]),
            "finalResponse" => (serde_json::to_value(&self.final_response).ok()?, &segments[1..]),
            "nodeCounter" => (Value::from(self.node_counter), &segments[1..]),
            "currentStepIndex" => (Value::from(self.current_step_index), &segments[1..]),
            "searchIterations" => (Value::from(self.search_iterations), &segments[1..]),
            // Unknown root: resolve the whole path inside `data`.
            _ => (Value::Object(self.data.clone()), &segments[..]),
        };

        match value_at(&root, rest) {
            Some(v) => Some(v),
            // Known field missed; retry inside `data`.
            None if segments[0] != "data" => value_at(&Value::Object(self.data.clone()), &segments),
            None => None,
        }
    }
}

/// Walk `segments` into a JSON value.
pub fn value_at(value: &Value, segments: &[&str]) -> Option<Value> {
    let mut current = value;
    for seg in segments {
        match current {
            Value::Object(map) => current = map.get(*seg)?,
            Value::Array(items) => {
                let idx: usize = seg.parse().ok()?;
                current = items.get(idx)?;
            }
            _ => return None,
        }
    }
    Some(current.clone())
}

/// Deep-merge `src` into `target`: objects merge recursively, everything
/// else (arrays included) is replaced by the newer value.
pub fn deep_merge(target: &mut Value, src: &Value) {
    match (target, src) {
        (Value::Object(t), Value::Object(s)) => {
            for (k, v) in s {
                merge_into_map(t, k, v);
            }
        }
        (t, s) => *t = s.clone(),
    }
}

fn merge_into_map(map: &mut Map<String, Value>, key: &str, value: &Value) {
    match map.entry(key.to_string()) {
        serde_json::map::Entry::Occupied(mut entry) => deep_merge(entry.get_mut(), value),
        serde_json::map::Entry::Vacant(entry) => {
            entry.insert(value.clone());
        }
    }
}

/// Fold one delta into the state. This is the only mutation path for
/// `RuntimeState` after construction.
pub fn apply_delta(state: &mut RuntimeState, delta: &StateDelta) {
    for (key, value) in delta {
        match key.as_str() {
            "data" => {
                if let Value::Object(updates) = value {
                    for (k, v) in updates {
                        merge_into_map(&mut state.data, k, v);
                    }
                }
            }
            "messages" => {
                if let Ok(msgs) = serde_json::from_value::<Vec<ChatMessage>>(value.clone()) {
                    state.messages.extend(msgs);
                }
            }
            "response" => {
                state.response = serde_json::from_value(value.clone()).ok();
            }
            "nextRoute" => {
                state.next_route = value.as_str().map(str::to_string);
            }
            "finalResponse" => {
                state.final_response = value.as_str().map(str::to_string);
            }
            "contextSummary" => {
                if let Some(s) = value.as_str() {
                    state.context_summary = s.to_string();
                }
            }
            "contextMessages" => {
                if let Ok(msgs) = serde_json::from_value::<Vec<ChatMessage>>(value.clone()) {
                    state.context_messages = msgs;
                }
            }
            "nodeCounter" => {
                if let Some(n) = value.as_u64() {
                    state.node_counter = n;
                }
            }
            "currentStepIndex" => {
                if let Some(n) = value.as_u64() {
                    state.current_step_index = n;
                }
            }
            "searchIterations" => {
                if let Some(n) = value.as_u64() {
                    state.search_iterations = n;
                }
            }
            // Anything else is workspace data.
            other => merge_into_map(&mut state.data, other, value),
        }
    }
}

/// Merge a later delta into an accumulated one, with the same semantics the
/// state reducer applies (`data` deep-merged, `messages` concatenated).
pub fn merge_deltas(acc: &mut StateDelta, next: &StateDelta) {
    for (key, value) in next {
        match key.as_str() {
            "messages" => match acc.entry(key.clone()) {
                serde_json::map::Entry::Occupied(mut entry) => {
                    match (entry.get_mut(), value) {
                        (Value::Array(existing), Value::Array(items)) => {
                            existing.extend(items.iter().cloned());
                        }
                        (slot, other) => *slot = other.clone(),
                    }
                }
                serde_json::map::Entry::Vacant(entry) => {
                    entry.insert(value.clone());
                }
            },
            "data" => merge_into_map(acc, key, value),
            _ => {
                acc.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Expand flat dot-path keys (`"data.plan"`) into nested objects before the
/// reducer sees them.
pub fn expand_dot_keys(delta: StateDelta) -> StateDelta {
    let mut out = StateDelta::new();
    for (key, value) in delta {
        if let Some((head, rest)) = key.split_once('.') {
            let nested = nest_path(rest, value);
            merge_into_map(&mut out, head, &nested);
        } else {
            merge_into_map(&mut out, &key, &value);
        }
    }
    out
}

fn nest_path(path: &str, value: Value) -> Value {
    match path.split_once('.') {
        Some((head, rest)) => {
            let mut map = Map::new();
            map.insert(head.to_string(), nest_path(rest, value));
            Value::Object(map)
        }
        None => {
            let mut map = Map::new();
            map.insert(path.to_string(), value);
            Value::Object(map)
        }
    }
}
