//! OpenAI chat-completions adapter
//!
//! Also serves as the permissive default for providers without a dedicated
//! adapter, since most inference gateways expose this wire format.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{Map, Value};

use super::{
    open_sse_stream, post_json, ErrorKind, ProviderAdapter, ProviderError, ProviderRequest,
    ProviderResponse, ProviderStream, TokenUsage,
};

pub struct OpenAiAdapter {
    provider: String,
    base_url: String,
    api_key: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Self {
        Self::for_provider("openai", base_url, api_key, timeout)
    }

    /// OpenAI-compatible adapter reporting a different provider name. Used
    /// as the fallback for providers with no dedicated adapter.
    pub fn for_provider(provider: &str, base_url: &str, api_key: &str, timeout: Duration) -> Self {
        Self {
            provider: provider.to_string(),
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
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.api_key)).map_err(|e| {
                ProviderError::new(ErrorKind::Unknown, format!("invalid API key format: {e}"))
            })?,
        );
        Ok(headers)
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

/// Extract the content delta from an OpenAI streaming chunk.
pub(crate) fn parse_chunk(chunk: &Value) -> Option<String> {
    chunk
        .get("choices")?
        .get(0)?
        .get("delta")?
        .get("content")?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub(crate) fn parse_usage(response: &Value) -> Option<TokenUsage> {
    response
        .get("usage")
        .and_then(|u| serde_json::from_value(u.clone()).ok())
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider_name(&self) -> &str {
        &self.provider
    }

    fn prepare_request(&self, request: &ProviderRequest, stream: bool) -> Value {
        let mut payload = Map::new();
        payload.insert("model".to_string(), Value::String(request.model.clone()));
        payload.insert(
            "messages".to_string(),
            serde_json::to_value(&request.messages).unwrap_or(Value::Array(vec![])),
        );
        payload.insert("stream".to_string(), Value::Bool(stream));

        if let Some(temperature) = request.temperature {
            payload.insert("temperature".to_string(), temperature.into());
        }
        if let Some(max_tokens) = request.max_tokens {
            payload.insert("max_tokens".to_string(), max_tokens.into());
        }
        if let Some(top_p) = request.top_p {
            payload.insert("top_p".to_string(), top_p.into());
        }
        if let Some(frequency_penalty) = request.frequency_penalty {
            payload.insert("frequency_penalty".to_string(), frequency_penalty.into());
        }
        if let Some(presence_penalty) = request.presence_penalty {
            payload.insert("presence_penalty".to_string(), presence_penalty.into());
        }
        if let Some(tools) = &request.tools {
            payload.insert("tools".to_string(), Value::Array(tools.clone()));
        }
        if let Some(tool_choice) = &request.tool_choice {
            payload.insert("tool_choice".to_string(), tool_choice.clone());
        }
        if let Some(response_format) = &request.response_format {
            payload.insert("response_format".to_string(), response_format.clone());
        }

        Value::Object(payload)
    }

    fn parse_response(
        &self,
        response: Value,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let choice = response
            .get("choices")
            .and_then(|c| c.get(0))
            .cloned()
            .unwrap_or(Value::Null);
        let message = choice.get("message").cloned().unwrap_or(Value::Null);

        Ok(ProviderResponse {
            content: message
                .get("content")
                .and_then(Value::as_str)
                .map(str::to_string),
            tool_calls: message.get("tool_calls").filter(|t| !t.is_null()).cloned(),
            finish_reason: choice
                .get("finish_reason")
                .and_then(Value::as_str)
                .map(str::to_string),
            usage: parse_usage(&response),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChatMessage;
    use serde_json::json;

    fn adapter() -> OpenAiAdapter {
        OpenAiAdapter::new(
            "https://api.openai.com/v1/",
            "sk-test",
            Duration::from_secs(30),
        )
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            model: "gpt-4".to_string(),
            messages: vec![ChatMessage::text("user", "hi")],
            temperature: Some(0.2),
            metadata: Some(std::collections::HashMap::from([(
                "request_id".to_string(),
                json!("abc"),
            )])),
            ..Default::default()
        }
    }

    #[test]
    fn prepare_request_emits_only_set_fields() {
        let payload = adapter().prepare_request(&request(), false);
        let object = payload.as_object().unwrap();

        assert_eq!(object["model"], "gpt-4");
        assert_eq!(object["stream"], json!(false));
        assert!(object.contains_key("temperature"));
        assert!(!object.contains_key("max_tokens"));
        assert!(!object.contains_key("tools"));
        // Internal metadata never reaches the wire.
        assert!(!object.contains_key("metadata"));
    }

    #[test]
    fn prepare_request_forces_stream_flag() {
        let mut req = request();
        req.stream = false;
        let payload = adapter().prepare_request(&req, true);
        assert_eq!(payload["stream"], json!(true));
    }

    #[test]
    fn prepare_request_includes_tools_and_format() {
        let mut req = request();
        req.tools = Some(vec![json!({"type": "function", "function": {"name": "f"}})]);
        req.response_format = Some(json!({"type": "json_object"}));
        let payload = adapter().prepare_request(&req, false);
        assert!(payload["tools"].is_array());
        assert_eq!(payload["response_format"]["type"], "json_object");
    }

    #[test]
    fn parse_response_normalizes_envelope() {
        let body = json!({
            "id": "cmpl-1",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hello", "tool_calls": null},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
        });

        let parsed = adapter().parse_response(body).unwrap();
        assert_eq!(parsed.content.as_deref(), Some("hello"));
        assert!(parsed.tool_calls.is_none());
        assert_eq!(parsed.finish_reason.as_deref(), Some("stop"));
        let usage = parsed.usage.unwrap();
        assert_eq!(usage.prompt_tokens, Some(12));
        assert_eq!(usage.completion_tokens, Some(4));
        assert!(parsed.raw_response.is_some());
    }

    #[test]
    fn parse_chunk_extracts_delta() {
        let chunk = json!({
            "choices": [{"index": 0, "delta": {"content": "Hel"}, "finish_reason": null}]
        });
        assert_eq!(parse_chunk(&chunk).as_deref(), Some("Hel"));

        let finish = json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]});
        assert_eq!(parse_chunk(&finish), None);

        let empty = json!({"choices": []});
        assert_eq!(parse_chunk(&empty), None);
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        assert_eq!(
            adapter().endpoint(),
            "https://api.openai.com/v1/chat/completions"
        );
    }
}
