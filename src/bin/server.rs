// Switchboard gateway server
// Run with: cargo run --bin server

//! Main server binary: loads the model registry, opens the observability
//! store, wires the completion pipeline, and serves the HTTP API. A
//! background task persists circuit-breaker snapshots for diagnostics.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use switchboard::api::{self, ApiConfig, AppState};
use switchboard::breaker::BreakerRegistry;
use switchboard::fallback::FallbackExecutor;
use switchboard::observability::ObservabilityStore;
use switchboard::orchestrator::CompletionHandler;
use switchboard::registry::ModelRegistry;
use switchboard::rerank::LexicalReranker;
use switchboard::router::ModelRouter;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional; deployment systems set real environment variables.
    if dotenv().is_err() {
        eprintln!("note: no .env file found, using process environment");
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("🚀 Starting Switchboard gateway...");

    let registry_path = env::var("MODEL_REGISTRY_CONFIG")
        .unwrap_or_else(|_| "config/model_registry.yaml".to_string());
    let host = env::var("GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = env::var("GATEWAY_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(3000);
    let db_path = env::var("GATEWAY_DB_PATH").unwrap_or_else(|_| "switchboard.db".to_string());
    let snapshot_interval = env::var("BREAKER_SNAPSHOT_INTERVAL_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(60);

    info!("Registry: {registry_path}");
    info!("Server: {host}:{port}");
    info!("Trace store: {db_path}");

    let registry = Arc::new(ModelRegistry::from_path(&registry_path));

    // Surface which provider credentials are actually resolvable, without
    // logging the keys themselves.
    {
        let snapshot = registry.snapshot();
        for provider in snapshot.provider_names() {
            if registry.api_key(provider).is_some() {
                info!("✅ {provider} credentials configured");
            } else {
                warn!("⚠️  no credentials found for {provider}; requests to it will fail");
            }
        }
    }

    let store = Arc::new(ObservabilityStore::open(&db_path).await?);
    let breakers = BreakerRegistry::global();
    let executor = Arc::new(FallbackExecutor::new(registry.clone(), breakers.clone()));
    let router = Arc::new(ModelRouter::new(registry.clone()));
    let handler = Arc::new(CompletionHandler::new(
        registry.clone(),
        router,
        executor,
        Arc::new(LexicalReranker::default()),
        store.clone(),
    ));

    // Periodic breaker snapshot persistence. Diagnostics only: the
    // in-process registry stays authoritative across restarts.
    {
        let store = store.clone();
        let breakers = breakers.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(snapshot_interval));
            loop {
                ticker.tick().await;
                let snapshots = breakers.snapshots();
                if snapshots.is_empty() {
                    continue;
                }
                if let Err(e) = store.upsert_breaker_snapshots(&snapshots).await {
                    error!("failed to persist breaker snapshots: {e}");
                }
            }
        });
    }

    let state = AppState {
        registry,
        handler,
        breakers,
        store,
        registry_path: Some(registry_path.into()),
    };

    api::serve(
        ApiConfig {
            host,
            port,
            cors_enabled: true,
        },
        state,
    )
    .await?;

    Ok(())
}
