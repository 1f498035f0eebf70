// Switchboard - multi-provider chat-completion gateway
// Routes each request to the best model, fails over through a fallback
// chain guarded by per-provider circuit breakers, and records a full
// observability trace for every completion.

//! # Switchboard Library
//!
//! This is the library root for the gateway. The crate is organized around
//! the request pipeline:
//!
//! ```text
//! HTTP request (api)
//!        ↓
//! Completion orchestrator (orchestrator)
//!        ↓ rerank + inject        ↓ route
//! RAG reranker (rerank)    Model router (router) ← Model registry (registry)
//!        ↓
//! Fallback executor (fallback) ← Circuit breakers (breaker)
//!        ↓
//! Provider adapters (providers)
//!        ↓
//! Upstream LLM APIs
//! ```
//!
//! Every request ends in the observability store (`observability`): a
//! request log with the routing decision and attempt audit trail, plus a
//! RAG log when retrieval context was injected.

pub mod api;
pub mod breaker;
pub mod fallback;
pub mod observability;
pub mod orchestrator;
pub mod providers;
pub mod registry;
pub mod rerank;
pub mod router;

// Re-export the types most callers need so they don't have to navigate the
// module hierarchy.
pub use breaker::{BreakerRegistry, BreakerSnapshot, BreakerState};
pub use fallback::FallbackExecutor;
pub use observability::{FallbackAttempt, ObservabilityMetrics, ObservabilityStore};
pub use orchestrator::{CompletionHandler, CompletionRequest};
pub use providers::{
    ChatMessage, ErrorKind, MessageContent, ProviderError, ProviderRequest, ProviderResponse,
};
pub use registry::{ModelRegistry, ModelSpec, RegistryConfig, RouteSpec};
pub use rerank::{LexicalReranker, RagChunk, RankedChunk, RerankerResult};
pub use router::{ModelRouter, RoutingContext, RoutingDecision};

use observability::FallbackAttempt as Attempt;
use thiserror::Error;

/// Gateway-level error type.
///
/// Provider-facing failures keep their taxonomy tag (see
/// [`providers::ErrorKind`]) so the tag survives unchanged from the adapter
/// through the attempt audit trail into the request log.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// A provider attempt failed with a classified upstream error.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Every candidate in the fallback chain failed. Carries the full
    /// attempt list for observability.
    #[error("all models in fallback chain failed after {} attempts", attempts.len())]
    AllFallbacksFailed { attempts: Vec<Attempt> },

    /// A model id was referenced that the registry does not know.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// A model resolved to a provider with no configuration entry.
    #[error("provider not configured: {0}")]
    ProviderNotConfigured(String),

    /// Credential handle present but unresolvable.
    #[error("credentials unavailable for provider: {0}")]
    CredentialsUnavailable(String),

    /// Registry document failed to load or validate.
    #[error("configuration error: {0}")]
    Config(String),

    /// Observability store failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// JSON serialization/deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The taxonomy tag recorded in logs for this error.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Provider(e) => e.kind.as_str(),
            GatewayError::AllFallbacksFailed { .. } => "all_fallbacks_failed",
            GatewayError::ModelNotFound(_) => "not_found",
            GatewayError::ProviderNotConfigured(_) => "invalid_request",
            GatewayError::CredentialsUnavailable(_) => "authentication",
            GatewayError::Config(_) => "invalid_request",
            GatewayError::Storage(_) | GatewayError::Serialization(_) => "unknown",
            GatewayError::Internal(_) => "unknown",
        }
    }
}

/// Type alias for Results that use the gateway error type.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Truncate an error message for log storage. Pathological upstream error
/// bodies must not bloat the log store.
pub(crate) fn truncate_error(message: &str) -> String {
    const MAX: usize = 200;
    if message.len() <= MAX {
        return message.to_string();
    }
    let mut end = MAX;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}
