//! DeepSeek chat-completions adapter
//!
//! DeepSeek exposes an OpenAI-compatible surface but gets its own adapter
//! so its field allow-list can diverge independently (it already differs in
//! which sampling knobs the upstream tolerates alongside tools).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{Map, Value};

use super::{
    open_sse_stream, openai, post_json, ErrorKind, ProviderAdapter, ProviderError,
    ProviderRequest, ProviderResponse, ProviderStream,
};

pub struct DeepSeekAdapter {
    base_url: String,
    api_key: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl DeepSeekAdapter {
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

#[async_trait]
impl ProviderAdapter for DeepSeekAdapter {
    fn provider_name(&self) -> &str {
        "deepseek"
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

        // Tool calling and structured output, model permitting.
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
            usage: openai::parse_usage(&response),
            raw_response: Some(response),
        })
    }

    fn parse_stream_chunk(&self, chunk: &Value) -> Option<String> {
        openai::parse_chunk(chunk)
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
            openai::parse_chunk,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChatMessage;
    use serde_json::json;

    fn adapter() -> DeepSeekAdapter {
        DeepSeekAdapter::new(
            "https://api.deepseek.com/v1",
            "sk-ds",
            Duration::from_secs(30),
        )
    }

    #[test]
    fn prepare_request_is_openai_shaped() {
        let request = ProviderRequest {
            model: "deepseek-coder".to_string(),
            messages: vec![ChatMessage::text("user", "write code")],
            max_tokens: Some(512),
            ..Default::default()
        };

        let payload = adapter().prepare_request(&request, true);
        assert_eq!(payload["model"], "deepseek-coder");
        assert_eq!(payload["stream"], json!(true));
        assert_eq!(payload["max_tokens"], json!(512));
        assert!(!payload.as_object().unwrap().contains_key("temperature"));
    }

    #[test]
    fn parse_response_extracts_usage() {
        let body = json!({
            "choices": [{"message": {"content": "done"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}
        });
        let parsed = adapter().parse_response(body).unwrap();
        assert_eq!(parsed.content.as_deref(), Some("done"));
        assert_eq!(parsed.usage.unwrap().total_tokens, Some(10));
    }
}
