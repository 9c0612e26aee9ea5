//! Anthropic-compatible messages adapter.

use futures::future::BoxFuture;
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use cortex_core::error::{CortexError, Result};
use cortex_core::model::NeuronConfig;
use cortex_core::traits::LmHandle;
use cortex_core::types::{LmDelta, LmRequest, Role};

use crate::streaming::{SseEvent, SseStream};

const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicCompatible {
    http: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    default_temperature: Option<f32>,
    default_max_tokens: Option<u32>,
}

impl AnthropicCompatible {
    pub fn from_neuron(config: &NeuronConfig, api_key: Option<String>) -> Self {
        let base = config.endpoint.trim_end_matches('/');
        let endpoint = if base.ends_with("/v1/messages") {
            base.to_string()
        } else {
            format!("{}/v1/messages", base)
        };
        Self {
            http: Client::new(),
            endpoint,
            model: config.model.clone(),
            api_key,
            default_temperature: config.temperature,
            default_max_tokens: config.max_output_tokens,
        }
    }

    async fn send(&self, request: &LmRequest, stream: bool) -> Result<reqwest::Response> {
        // Anthropic keeps the system prompt out of the message list.
        let system: Vec<String> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.clone())
            .collect();
        let messages: Vec<ApiMessage> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| ApiMessage {
                role: if m.role == Role::Assistant {
                    "assistant"
                } else {
                    "user"
                },
                content: m.content.clone(),
            })
            .collect();

        let body = ApiRequest {
            model: self.model.clone(),
            max_tokens: request
                .max_tokens
                .or(self.default_max_tokens)
                .unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: request.temperature.or(self.default_temperature),
            system: if system.is_empty() {
                None
            } else {
                Some(system.join("\n\n"))
            },
            messages,
            stream,
        };

        let mut req = self
            .http
            .post(&self.endpoint)
            .header("anthropic-version", API_VERSION)
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
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
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
    stream: bool,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum SseData {
    #[serde(rename = "message_start")]
    MessageStart {},
    #[serde(rename = "content_block_start")]
    ContentBlockStart {},
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: DeltaInfo },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop {},
    #[serde(rename = "message_delta")]
    MessageDelta {
        #[serde(default)]
        usage: Option<UsageInfo>,
    },
    #[serde(rename = "message_stop")]
    MessageStop {},
    #[serde(rename = "ping")]
    Ping {},
    #[serde(rename = "error")]
    Error { error: ApiError },
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum DeltaInfo {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Deserialize)]
struct Completion {
    #[serde(default)]
    content: Vec<CompletionBlock>,
}

#[derive(Deserialize)]
struct CompletionBlock {
    #[serde(default)]
    text: Option<String>,
}

fn parse_event(event: SseEvent) -> Vec<Result<LmDelta>> {
    match serde_json::from_str::<SseData>(&event.data) {
        Ok(SseData::ContentBlockDelta {
            delta: DeltaInfo::TextDelta { text },
        }) => vec![Ok(LmDelta::Text(text))],
        Ok(SseData::MessageDelta { usage: Some(usage) }) => vec![Ok(LmDelta::Usage {
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        })],
        Ok(SseData::MessageStop {}) => vec![Ok(LmDelta::Stop)],
        Ok(SseData::Error { error }) => {
            vec![Err(CortexError::ProviderStream(error.message))]
        }
        Ok(_) => vec![],
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse stream event");
            vec![]
        }
    }
}

impl LmHandle for AnthropicCompatible {
    fn chat_stream(
        &self,
        request: LmRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<LmDelta>>>> {
        Box::pin(async move {
            let response = self.send(&request, true).await?;
            let sse = SseStream::new(response.bytes_stream());
            let deltas = sse
                .map(|event| futures::stream::iter(parse_event(event)))
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
            let text: String = completion
                .content
                .iter()
                .filter_map(|b| b.text.as_deref())
                .collect();
            if text.is_empty() {
                return Err(CortexError::Provider("completion had no text".into()));
            }
            Ok(text)
        })
    }
}
