//! Google-compatible generateContent adapter.

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

pub struct GoogleCompatible {
    http: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    default_temperature: Option<f32>,
    default_max_tokens: Option<u32>,
}

impl GoogleCompatible {
    pub fn from_neuron(config: &NeuronConfig, api_key: Option<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            default_temperature: config.temperature,
            default_max_tokens: config.max_output_tokens,
        }
    }

    fn url(&self, stream: bool) -> String {
        let method = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        format!("{}/v1beta/models/{}:{}", self.endpoint, self.model, method)
    }

    fn body(&self, request: &LmRequest) -> ApiRequest {
        let system: Vec<String> = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.clone())
            .collect();

        ApiRequest {
            contents: request
                .messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(|m| Content {
                    role: if m.role == Role::Assistant { "model" } else { "user" },
                    parts: vec![Part {
                        text: m.content.clone(),
                    }],
                })
                .collect(),
            system_instruction: if system.is_empty() {
                None
            } else {
                Some(Content {
                    role: "user",
                    parts: vec![Part {
                        text: system.join("\n\n"),
                    }],
                })
            },
            generation_config: GenerationConfig {
                temperature: request.temperature.or(self.default_temperature),
                max_output_tokens: request.max_tokens.or(self.default_max_tokens),
                response_mime_type: request.json_schema.as_ref().map(|_| "application/json"),
            },
        }
    }

    async fn send(&self, request: &LmRequest, stream: bool) -> Result<reqwest::Response> {
        let mut req = self.http.post(self.url(stream)).json(&self.body(request));
        if let Some(key) = &self.api_key {
            req = req.header("x-goog-api-key", key);
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
#[serde(rename_all = "camelCase")]
struct ApiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

fn chunk_text(chunk: &ApiChunk) -> Option<String> {
    let candidate = chunk.candidates.first()?;
    let content = candidate.content.as_ref()?;
    let text: String = content
        .parts
        .iter()
        .filter_map(|p| p.text.as_deref())
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn parse_chunk(event: SseEvent) -> Vec<Result<LmDelta>> {
    match serde_json::from_str::<ApiChunk>(&event.data) {
        Ok(chunk) => {
            let mut deltas = Vec::new();
            if let Some(text) = chunk_text(&chunk) {
                deltas.push(Ok(LmDelta::Text(text)));
            }
            if let Some(usage) = &chunk.usage_metadata {
                deltas.push(Ok(LmDelta::Usage {
                    input_tokens: usage.prompt_token_count,
                    output_tokens: usage.candidates_token_count,
                }));
            }
            if chunk
                .candidates
                .first()
                .and_then(|c| c.finish_reason.as_deref())
                .is_some()
            {
                deltas.push(Ok(LmDelta::Stop));
            }
            deltas
        }
        Err(e) => {
            warn!(data = %event.data, error = %e, "Failed to parse stream chunk");
            vec![]
        }
    }
}

impl LmHandle for GoogleCompatible {
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
            let chunk: ApiChunk = response
                .json()
                .await
                .map_err(|e| CortexError::Provider(format!("invalid completion body: {}", e)))?;
            chunk_text(&chunk)
                .ok_or_else(|| CortexError::Provider("completion had no text".into()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_and_finish() {
        let event = SseEvent {
            event_type: None,
            data: r#"{"candidates":[{"content":{"parts":[{"text":"Hey"}]},"finishReason":"STOP"}]}"#
                .into(),
        };
        let deltas = parse_chunk(event);
        assert!(matches!(deltas[0], Ok(LmDelta::Text(ref t)) if t == "Hey"));
        assert!(matches!(deltas[1], Ok(LmDelta::Stop)));
    }

    #[test]
    fn test_stream_url() {
        let config: NeuronConfig = serde_json::from_value(serde_json::json!({
            "neuronId": "n",
            "ownerId": "system",
            "name": "n",
            "role": "worker",
            "provider": "google-compatible",
            "endpoint": "https://generativelanguage.googleapis.com",
            "model": "gemini-pro"
        }))
        .unwrap();
        let handle = GoogleCompatible::from_neuron(&config, None);
        assert!(handle.url(true).ends_with("models/gemini-pro:streamGenerateContent?alt=sse"));
        assert!(handle.url(false).ends_with("models/gemini-pro:generateContent"));
    }
}
