//! HTTP API types and error mapping
//!
//! The completion response keeps the familiar chat-completion envelope and
//! adds a `sources` list (when retrieval context was used) plus a `gateway`
//! block describing the routing decision, so callers can see which model
//! actually answered and why.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::observability::{FallbackAttempt, RequestLogRecord};
use crate::orchestrator::CompletionOutcome;
use crate::providers::TokenUsage;
use crate::rerank::SourceEntry;
use crate::GatewayError;

/// API-level error envelope.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error_type: String,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error_type: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            error_type: error_type.to_string(),
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "authentication", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "permission", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "unknown", message)
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        let status = match &e {
            // A 5xx reaches the caller only when the whole chain failed.
            GatewayError::AllFallbacksFailed { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Config(_) | GatewayError::ProviderNotConfigured(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::CredentialsUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.error_type(), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "type": self.error_type,
                "message": self.message,
            }
        });
        (self.status, Json(body)).into_response()
    }
}

/// Chat-completion response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    /// Present when retrieval context shaped this answer.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub sources: Vec<SourceEntry>,
    /// Gateway-specific routing detail.
    pub gateway: GatewayInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: String,
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayInfo {
    pub provider: String,
    pub route_name: String,
    pub route_reason: String,
    pub fallback_used: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub attempts: Vec<FallbackAttempt>,
}

impl CompletionResponse {
    pub fn from_outcome(outcome: CompletionOutcome) -> Self {
        Self {
            id: outcome.request_id,
            object: "chat.completion".to_string(),
            created: Utc::now().timestamp(),
            model: outcome.model_id,
            choices: vec![CompletionChoice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: outcome.response.content,
                    tool_calls: outcome.response.tool_calls,
                },
                finish_reason: outcome.response.finish_reason,
            }],
            usage: outcome.response.usage,
            sources: outcome.sources,
            gateway: GatewayInfo {
                provider: outcome.provider,
                route_name: outcome.routing.route_name,
                route_reason: outcome.routing.route_reason,
                fallback_used: !outcome.attempts.is_empty(),
                attempts: outcome.attempts,
            },
        }
    }
}

/// Compact log row returned by the listing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSummary {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub chat_id: Option<String>,
    pub provider: String,
    pub model_id: String,
    pub route_name: String,
    pub fallback_used: bool,
    pub total_latency_ms: f64,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub error_type: Option<String>,
    pub rag_used: bool,
}

impl From<&RequestLogRecord> for LogSummary {
    fn from(record: &RequestLogRecord) -> Self {
        Self {
            id: record.id.clone(),
            timestamp: record.timestamp,
            user_id: record.user_id.clone(),
            chat_id: record.chat_id.clone(),
            provider: record.provider.clone(),
            model_id: record.model_id.clone(),
            route_name: record.route_name.clone(),
            fallback_used: record.fallback_used,
            total_latency_ms: record.total_latency_ms,
            tokens_in: record.tokens_in,
            tokens_out: record.tokens_out,
            error_type: record.error_type.clone(),
            rag_used: record.rag_used,
        }
    }
}

/// Query parameters for `GET /v1/logs`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogsParams {
    pub provider: Option<String>,
    pub model_id: Option<String>,
    pub route_name: Option<String>,
    #[serde(default)]
    pub errors_only: bool,
    #[serde(default)]
    pub rag_used_only: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Query parameters for `GET /v1/metrics`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsParams {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub provider: Option<String>,
}
