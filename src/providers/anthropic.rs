//! Anthropic messages adapter
//!
//! Anthropic's wire format diverges from the OpenAI shape in several ways
//! this adapter has to bridge: auth travels in `x-api-key` plus a pinned
//! `anthropic-version`, system prompts are a top-level field rather than a
//! message role, `max_tokens` is mandatory, and streaming events are typed
//! rather than bare deltas.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Map, Value};

use super::{
    open_sse_stream, post_json, ErrorKind, MessageContent, ProviderAdapter, ProviderError,
    ProviderRequest, ProviderResponse, ProviderStream, TokenUsage,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicAdapter {
    base_url: String,
    api_key: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timeout,
            client: super::build_client(timeout),
        }
    }

    fn headers(&self) -> std::result::Result<HeaderMap, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key).map_err(|e| {
                ProviderError::new(ErrorKind::Unknown, format!("invalid API key format: {e}"))
            })?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        Ok(headers)
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }
}

/// Extract the text delta from an Anthropic streaming event.
pub(crate) fn parse_chunk(chunk: &Value) -> Option<String> {
    if chunk.get("type").and_then(Value::as_str) != Some("content_block_delta") {
        return None;
    }
    chunk
        .get("delta")?
        .get("text")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn prepare_request(&self, request: &ProviderRequest, stream: bool) -> Value {
        // System messages become the top-level `system` field; everything
        // else keeps its role. Structured part lists pass through as-is.
        let mut system_parts: Vec<String> = Vec::new();
        let mut messages: Vec<Value> = Vec::new();
        for message in &request.messages {
            if message.role == "system" {
                let text = message.content.as_text();
                if !text.is_empty() {
                    system_parts.push(text.to_string());
                }
                continue;
            }
            let content = match &message.content {
                MessageContent::Text(text) => Value::String(text.clone()),
                MessageContent::Parts(parts) => Value::Array(parts.clone()),
            };
            messages.push(json!({"role": message.role, "content": content}));
        }

        let mut payload = Map::new();
        payload.insert("model".to_string(), Value::String(request.model.clone()));
        payload.insert("messages".to_string(), Value::Array(messages));
        payload.insert(
            "max_tokens".to_string(),
            request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS).into(),
        );
        payload.insert("stream".to_string(), Value::Bool(stream));

        if !system_parts.is_empty() {
            payload.insert(
                "system".to_string(),
                Value::String(system_parts.join("\n\n")),
            );
        }
        if let Some(temperature) = request.temperature {
            payload.insert("temperature".to_string(), temperature.into());
        }
        if let Some(top_p) = request.top_p {
            payload.insert("top_p".to_string(), top_p.into());
        }

        Value::Object(payload)
    }

    fn parse_response(
        &self,
        response: Value,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let content = response
            .get("content")
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .filter(|s| !s.is_empty());

        let usage = response.get("usage").map(|u| {
            let prompt = u.get("input_tokens").and_then(Value::as_u64);
            let completion = u.get("output_tokens").and_then(Value::as_u64);
            TokenUsage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: match (prompt, completion) {
                    (Some(p), Some(c)) => Some(p + c),
                    _ => None,
                },
            }
        });

        Ok(ProviderResponse {
            content,
            tool_calls: None,
            finish_reason: response
                .get("stop_reason")
                .and_then(Value::as_str)
                .map(str::to_string),
            usage,
            raw_response: Some(response),
        })
    }

    fn parse_stream_chunk(&self, chunk: &Value) -> Option<String> {
        parse_chunk(chunk)
    }

    async fn complete(
        &self,
        request: &ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let payload = self.prepare_request(request, false);
        let response = post_json(
            &self.client,
            &self.endpoint(),
            self.headers()?,
            &payload,
            self.timeout,
        )
        .await?;
        self.parse_response(response)
    }

    async fn stream_complete(
        &self,
        request: &ProviderRequest,
    ) -> std::result::Result<ProviderStream, ProviderError> {
        let payload = self.prepare_request(request, true);
        open_sse_stream(
            &self.client,
            &self.endpoint(),
            self.headers()?,
            &payload,
            parse_chunk,
        )
        .await
    }
}
