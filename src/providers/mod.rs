//! Provider adapters for multi-provider support
//!
//! Normalizes requests and responses into a common internal format and maps
//! heterogeneous upstream failures onto a single error taxonomy. Each
//! adapter owns its HTTP client (released on drop) and knows which fields
//! its upstream accepts; internal metadata never leaves the process.

pub mod anthropic;
pub mod deepseek;
pub mod openai;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub use anthropic::AnthropicAdapter;
pub use deepseek::DeepSeekAdapter;
pub use openai::OpenAiAdapter;

/// Message content: plain text, or a structured part list (attachments,
/// image blocks, and similar provider-specific shapes).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<Value>),
}

impl MessageContent {
    /// The textual content, empty for structured part lists.
    pub fn as_text(&self) -> &str {
        match self {
            MessageContent::Text(text) => text,
            MessageContent::Parts(_) => "",
        }
    }

    pub fn is_structured(&self) -> bool {
        matches!(self, MessageContent::Parts(_))
    }
}

/// A single chat message as it travels through the gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: MessageContent::Text(content.into()),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

/// Normalized request format handed to adapters.
///
/// `metadata` is internal bookkeeping (correlation ids and the like) and is
/// never serialized into an upstream payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub tools: Option<Vec<Value>>,
    pub tool_choice: Option<Value>,
    pub response_format: Option<Value>,
    #[serde(default)]
    pub stream: bool,
    pub metadata: Option<HashMap<String, Value>>,
}

/// Normalized token usage reported by an upstream.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

/// Normalized response format.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderResponse {
    pub content: Option<String>,
    pub tool_calls: Option<Value>,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
    /// Raw upstream body kept for diagnostics only.
    pub raw_response: Option<Value>,
}

/// Error taxonomy shared by all adapters, the fallback executor, and the
/// log store. Tags, not types: the string form is what gets persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    Authentication,
    Permission,
    NotFound,
    Timeout,
    RateLimit,
    ServerError,
    Network,
    /// Synthesized by the executor when a breaker forbids an attempt.
    CircuitBreakerOpen,
    Unknown,
}

impl ErrorKind {
    /// Deterministic status-code classification.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => ErrorKind::InvalidRequest,
            401 => ErrorKind::Authentication,
            403 => ErrorKind::Permission,
            404 => ErrorKind::NotFound,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimit,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Permission => "permission",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Network => "network",
            ErrorKind::CircuitBreakerOpen => "circuit_breaker_open",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Whether a failure of this kind should count toward opening the
    /// provider's circuit breaker. Caller-side errors (4xx except 408) and
    /// rate limits must not poison the provider for everyone else.
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(
            self,
            ErrorKind::ServerError | ErrorKind::Timeout | ErrorKind::Network | ErrorKind::Unknown
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified upstream failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub status_code: Option<u16>,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code: None,
            message: message.into(),
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::from_status(status),
            status_code: Some(status),
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            status_code: Some(408),
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Network,
            status_code: None,
            message: message.into(),
        }
    }
}

/// A lazy, finite, non-restartable sequence of content deltas.
pub type ProviderStream =
    Pin<Box<dyn Stream<Item = std::result::Result<String, ProviderError>> + Send>>;

/// Core adapter interface.
///
/// `stream_complete` opens the upstream and validates the response status
/// before returning, so a header-level rejection surfaces as an `Err` the
/// executor can still fail over; only after the returned stream yields its
/// first delta is the attempt committed. Dropping an adapter releases its
/// HTTP client.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Name of the provider this adapter talks to.
    fn provider_name(&self) -> &str;

    /// Build the upstream payload. Only fields the upstream accepts may
    /// appear; the `stream` flag is forced to the call site's mode.
    fn prepare_request(&self, request: &ProviderRequest, stream: bool) -> Value;

    /// Convert an upstream response body into the normalized envelope.
    fn parse_response(&self, response: Value) -> std::result::Result<ProviderResponse, ProviderError>;

    /// Extract the content delta from one streaming chunk, if any.
    fn parse_stream_chunk(&self, chunk: &Value) -> Option<String>;

    /// Non-streaming completion.
    async fn complete(
        &self,
        request: &ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError>;

    /// Streaming completion. See the trait docs for the probe contract.
    async fn stream_complete(
        &self,
        request: &ProviderRequest,
    ) -> std::result::Result<ProviderStream, ProviderError>;
}

/// Factory for adapter construction, injectable for tests.
pub trait AdapterFactory: Send + Sync {
    fn create(
        &self,
        provider: &str,
        base_url: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Arc<dyn ProviderAdapter>;
}

/// Production factory: one adapter per known upstream, falling back to the
/// permissive OpenAI-compatible adapter for anything else.
pub struct DefaultAdapterFactory;

impl AdapterFactory for DefaultAdapterFactory {
    fn create(
        &self,
        provider: &str,
        base_url: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Arc<dyn ProviderAdapter> {
        match provider.to_lowercase().as_str() {
            "openai" => Arc::new(OpenAiAdapter::new(base_url, api_key, timeout)),
            "deepseek" => Arc::new(DeepSeekAdapter::new(base_url, api_key, timeout)),
            "anthropic" => Arc::new(AnthropicAdapter::new(base_url, api_key, timeout)),
            other => {
                warn!("no dedicated adapter for provider {other}, using OpenAI-compatible");
                Arc::new(OpenAiAdapter::for_provider(other, base_url, api_key, timeout))
            }
        }
    }
}

// ── Shared transport ────────────────────────────────────────────

/// Build an HTTP client with a connect timeout only. Unary calls set a
/// total deadline per request; streams must be allowed to outlive it.
pub(crate) fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

pub(crate) fn classify_transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::timeout(e.to_string())
    } else {
        ProviderError::network(e.to_string())
    }
}

/// Pull the human-readable message out of an upstream error body, falling
/// back to the raw body when it is not the common `{"error": {...}}` shape.
pub(crate) fn extract_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for path in [&["error", "message"][..], &["message"][..]] {
            let mut node = &value;
            let mut found = true;
            for key in path {
                match node.get(key) {
                    Some(next) => node = next,
                    None => {
                        found = false;
                        break;
                    }
                }
            }
            if found {
                if let Some(message) = node.as_str() {
                    return message.to_string();
                }
            }
        }
    }
    if body.is_empty() {
        "upstream returned an error with no body".to_string()
    } else {
        body.to_string()
    }
}

/// POST a JSON payload and decode the JSON response, mapping failures onto
/// the error taxonomy.
pub(crate) async fn post_json(
    client: &reqwest::Client,
    url: &str,
    headers: HeaderMap,
    payload: &Value,
    timeout: Duration,
) -> std::result::Result<Value, ProviderError> {
    let response = client
        .post(url)
        .headers(headers)
        .json(payload)
        .timeout(timeout)
        .send()
        .await
        .map_err(classify_transport_error)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::from_status(
            status.as_u16(),
            extract_error_message(&body),
        ));
    }

    response
        .json()
        .await
        .map_err(|e| ProviderError::new(ErrorKind::Unknown, format!("decode response: {e}")))
}

enum Frame {
    Delta(String),
    Done,
    Skip,
    Failed(ProviderError),
}

/// POST a streaming request and return the delta stream. The response
/// status is validated here, before any delta is forwarded. Malformed SSE
/// frames are skipped silently; the `[DONE]` sentinel ends the stream;
/// transport errors propagate.
pub(crate) async fn open_sse_stream(
    client: &reqwest::Client,
    url: &str,
    headers: HeaderMap,
    payload: &Value,
    parse_chunk: fn(&Value) -> Option<String>,
) -> std::result::Result<ProviderStream, ProviderError> {
    let response = client
        .post(url)
        .headers(headers)
        .json(payload)
        .send()
        .await
        .map_err(classify_transport_error)?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::from_status(
            status.as_u16(),
            extract_error_message(&body),
        ));
    }

    let stream = response
        .bytes_stream()
        .eventsource()
        .map(move |event| match event {
            Ok(event) => {
                let data = event.data.trim();
                if data == "[DONE]" {
                    return Frame::Done;
                }
                match serde_json::from_str::<Value>(data) {
                    Ok(chunk) => match parse_chunk(&chunk) {
                        Some(delta) => Frame::Delta(delta),
                        None => Frame::Skip,
                    },
                    Err(_) => Frame::Skip,
                }
            }
            Err(e) => Frame::Failed(ProviderError::network(e.to_string())),
        })
        .take_while(|frame| futures::future::ready(!matches!(frame, Frame::Done)))
        .filter_map(|frame| async move {
            match frame {
                Frame::Delta(delta) => Some(Ok(delta)),
                Frame::Failed(e) => Some(Err(e)),
                Frame::Done | Frame::Skip => None,
            }
        });

    Ok(Box::pin(stream))
}
