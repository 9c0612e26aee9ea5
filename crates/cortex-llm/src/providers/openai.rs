//! OpenAI-compatible chat completions adapter. Also serves `local` and
//! `custom` neurons, which speak the same wire shape.

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use cortex_core::error::{CortexError, Result};
use cortex_core::model::NeuronConfig;
use cortex_core::traits::LmHandle;
use cortex_core::types::{ChatMessage, LmDelta, LmRequest, Role};

use crate::streaming::{SseEvent, SseStream};

pub struct OpenAiCompatible {
    http: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    defaults: Defaults,
}

#[derive(Clone, Copy, Default)]
struct Defaults {
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    top_p: Option<f32>,
}

impl OpenAiCompatible {
    pub fn from_neuron(config: &NeuronConfig, api_key: Option<String>) -> Self {
        let base = config.endpoint.trim_end_matches('/');
        let endpoint = if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{}/chat/completions", base)
        };
        Self {
            http: Client::new(),
            endpoint,
            model: config.model.clone(),
            api_key,
            defaults: Defaults {
                temperature: config.temperature,
                max_tokens: config.max_output_tokens,
                top_p: config.top_p,
            },
        }
    }

    fn body(&self, request: &LmRequest, stream: bool) -> ApiRequest {
        ApiRequest {
            model: self.model.clone(),
            messages: request.messages.iter().map(ApiMessage::from).collect(),
            max_tokens: request.max_tokens.or(self.defaults.max_tokens),
            temperature: request.temperature.or(self.defaults.temperature),
            top_p: request.top_p.or(self.defaults.top_p),
            stream,
            response_format: request.json_schema.as_ref().map(|schema| {
                serde_json::json!({
                    "type": "json_schema",
                    "json_schema": {"name": "structured_output", "schema": schema},
                })
            }),
        }
    }

    async fn send(&self, request: &LmRequest, stream: bool) -> Result<reqwest::Response> {
        let mut req = self.http.post(&self.endpoint).json(&self.body(request, stream));
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let response = req
            .send()
            .await
            .map_err(|e| CortexError::Provider(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_else(|_| "unknown".into());
            return Err(CortexError::Provider(format!("HTTP {}: {}", status, body)));
        }
        Ok(response)
    }
}

#[derive(Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

impl From<&ChatMessage> for ApiMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: role_name(message.role),
            content: message.content.clone(),
        }
    }
}

pub(crate) fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: DeltaContent,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

pub(crate) fn parse_chunk(event: SseEvent) -> Vec<Result<LmDelta>> {
    if event.data.trim() == "[DONE]" {
        return vec![Ok(LmDelta::Stop)];
    }

    match serde_json::from_str::<StreamChunk>(&event.data) {
        Ok(chunk) => {
            let mut deltas = Vec::new();
            if let Some(usage) = chunk.usage {
                deltas.push(Ok(LmDelta::Usage {
                    input_tokens: usage.prompt_tokens,
                    output_tokens: usage.completion_tokens,
                }));
            }
            if let Some(choice) = chunk.choices.into_iter().next() {
                if let Some(text) = choice.delta.content {
                    if !text.is_empty() {
                        deltas.push(Ok(LmDelta::Text(text)));
                    }
                }
                if choice.finish_reason.is_some() {
                    deltas.push(Ok(LmDelta::Stop));
                }
            }
            deltas
        }
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse stream chunk");
            vec![]
        }
    }
}

impl LmHandle for OpenAiCompatible {
    fn chat_stream(
        &self,
        request: LmRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<LmDelta>>>> {
        Box::pin(async move {
            let response = self.send(&request, true).await?;
            let sse = SseStream::new(response.bytes_stream());
            let deltas = sse
                .map(|event| futures::stream::iter(parse_chunk(event)))
                .flatten();
            Ok(deltas.boxed())
        })
    }

    fn complete(&self, request: LmRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let response = self.send(&request, false).await?;
            let completion: Completion = response
                .json()
                .await
                .map_err(|e| CortexError::Provider(format!("invalid completion body: {}", e)))?;
            completion
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .ok_or_else(|| CortexError::Provider("completion had no content".into()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_chunk() {
        let event = SseEvent {
            event_type: None,
            data: r#"{"choices":[{"delta":{"content":"Hi"}}]}"#.into(),
        };
        let deltas = parse_chunk(event);
        assert_eq!(deltas.len(), 1);
        assert!(matches!(deltas[0], Ok(LmDelta::Text(ref t)) if t == "Hi"));
    }

    #[test]
    fn test_parse_finish_and_done() {
        let event = SseEvent {
            event_type: None,
            data: r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#.into(),
        };
        assert!(matches!(parse_chunk(event)[0], Ok(LmDelta::Stop)));

        let done = SseEvent {
            event_type: None,
            data: "[DONE]".into(),
        };
        assert!(matches!(parse_chunk(done)[0], Ok(LmDelta::Stop)));
    }

    #[test]
    fn test_parse_usage_chunk() {
        let event = SseEvent {
            event_type: None,
            data: r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":4}}"#.into(),
        };
        match &parse_chunk(event)[0] {
            Ok(LmDelta::Usage {
                input_tokens,
                output_tokens,
            }) => {
                assert_eq!(*input_tokens, 10);
                assert_eq!(*output_tokens, 4);
            }
            other => panic!("unexpected delta: {:?}", other),
        }
    }

    #[test]
    fn test_endpoint_normalization() {
        let config: NeuronConfig = serde_json::from_value(serde_json::json!({
            "neuronId": "n",
            "ownerId": "system",
            "name": "n",
            "role": "chat",
            "provider": "openai-compatible",
            "endpoint": "http://localhost:8000/v1/",
            "model": "m"
        }))
        .unwrap();
        let handle = OpenAiCompatible::from_neuron(&config, None);
        assert_eq!(handle.endpoint, "http://localhost:8000/v1/chat/completions");
    }
}
