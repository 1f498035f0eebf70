//! HTTP API for the gateway
//!
//! Exposes the completion endpoint plus the observability and admin
//! surface over axum. Authentication happens upstream in the embedding
//! application; see [`auth`] for the identity contract.

pub mod auth;
pub mod handlers;
pub mod types;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::breaker::BreakerRegistry;
use crate::observability::ObservabilityStore;
use crate::orchestrator::CompletionHandler;
use crate::registry::ModelRegistry;
use crate::{GatewayError, Result};

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            cors_enabled: true,
        }
    }
}

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ModelRegistry>,
    pub handler: Arc<CompletionHandler>,
    pub breakers: Arc<BreakerRegistry>,
    pub store: Arc<ObservabilityStore>,
    /// Path the reload endpoint re-reads; `None` disables reload.
    pub registry_path: Option<PathBuf>,
}

/// Build the gateway router.
pub fn router(state: AppState, cors_enabled: bool) -> Router {
    let mut router = Router::new()
        .route("/health", get(handlers::health))
        .route("/v1/completion", post(handlers::completion))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/logs", get(handlers::list_logs))
        .route("/v1/logs/:id", get(handlers::get_log))
        .route("/v1/metrics", get(handlers::metrics))
        .route("/v1/circuit-breakers", get(handlers::circuit_breakers))
        .route(
            "/v1/circuit-breakers/:provider/reset",
            post(handlers::reset_circuit_breaker),
        )
        .route("/v1/rag/logs/:request_id", get(handlers::get_rag_log))
        .route("/v1/registry/reload", post(handlers::reload_registry))
        .with_state(state);

    if cors_enabled {
        router = router.layer(CorsLayer::permissive());
    }
    router
}

/// Bind and serve until shutdown.
pub async fn serve(config: ApiConfig, state: AppState) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| GatewayError::Config(format!("invalid listen address: {e}")))?;

    let app = router(state, config.cors_enabled);
    info!("gateway listening on {addr}");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .map_err(|e| GatewayError::Internal(format!("server error: {e}")))
}
