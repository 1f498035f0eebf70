//! Switchboard admin CLI
//!
//! Thin client over the gateway's HTTP surface for operators: metrics,
//! log inspection, and circuit-breaker management.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "switchboard-admin")]
#[command(about = "Switchboard admin CLI - inspect traces, metrics, and circuit breakers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Gateway base URL
    #[arg(long, env = "GATEWAY_URL", default_value = "http://localhost:3000")]
    gateway_url: String,

    /// Caller id forwarded to the gateway
    #[arg(long, env = "GATEWAY_CALLER_ID", default_value = "admin")]
    caller_id: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Gateway health and per-provider breaker states
    Health,

    /// Aggregate metrics (defaults to the last 24 hours)
    Stats {
        /// Window start, RFC 3339
        #[arg(long)]
        start_time: Option<String>,

        /// Window end, RFC 3339
        #[arg(long)]
        end_time: Option<String>,

        /// Restrict to one provider
        #[arg(long)]
        provider: Option<String>,
    },

    /// List request logs
    Logs {
        /// Filter by provider
        #[arg(long)]
        provider: Option<String>,

        /// Filter by model id
        #[arg(long)]
        model_id: Option<String>,

        /// Only failed requests
        #[arg(long)]
        errors_only: bool,

        /// Only requests that used retrieval context
        #[arg(long)]
        rag_used_only: bool,

        /// Maximum rows
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Full detail for one request log
    Log {
        /// Correlation id
        id: String,
    },

    /// Retrieval trace for one request
    RagLog {
        /// Correlation id of the request
        request_id: String,
    },

    /// Circuit breaker states
    Breakers,

    /// Force a provider's circuit breaker closed
    ResetBreaker {
        /// Provider name
        provider: String,
    },

    /// Reload the model registry document
    ReloadRegistry,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let request = |method: reqwest::Method, path: String| {
        client
            .request(method, format!("{}{}", cli.gateway_url, path))
            .header("x-caller-id", &cli.caller_id)
            .header("x-caller-role", "admin")
    };

    let response = match &cli.command {
        Commands::Health => request(reqwest::Method::GET, "/health".to_string()).send().await?,
        Commands::Stats {
            start_time,
            end_time,
            provider,
        } => {
            let mut query: Vec<(&str, String)> = Vec::new();
            if let Some(start) = start_time {
                query.push(("start_time", start.clone()));
            }
            if let Some(end) = end_time {
                query.push(("end_time", end.clone()));
            }
            if let Some(provider) = provider {
                query.push(("provider", provider.clone()));
            }
            request(reqwest::Method::GET, "/v1/metrics".to_string())
                .query(&query)
                .send()
                .await?
        }
        Commands::Logs {
            provider,
            model_id,
            errors_only,
            rag_used_only,
            limit,
        } => {
            let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
            if let Some(provider) = provider {
                query.push(("provider", provider.clone()));
            }
            if let Some(model_id) = model_id {
                query.push(("model_id", model_id.clone()));
            }
            if *errors_only {
                query.push(("errors_only", "true".to_string()));
            }
            if *rag_used_only {
                query.push(("rag_used_only", "true".to_string()));
            }
            request(reqwest::Method::GET, "/v1/logs".to_string())
                .query(&query)
                .send()
                .await?
        }
        Commands::Log { id } => {
            request(reqwest::Method::GET, format!("/v1/logs/{id}")).send().await?
        }
        Commands::RagLog { request_id } => {
            request(reqwest::Method::GET, format!("/v1/rag/logs/{request_id}"))
                .send()
                .await?
        }
        Commands::Breakers => {
            request(reqwest::Method::GET, "/v1/circuit-breakers".to_string())
                .send()
                .await?
        }
        Commands::ResetBreaker { provider } => {
            request(
                reqwest::Method::POST,
                format!("/v1/circuit-breakers/{provider}/reset"),
            )
            .send()
            .await?
        }
        Commands::ReloadRegistry => {
            request(reqwest::Method::POST, "/v1/registry/reload".to_string())
                .send()
                .await?
        }
    };

    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    println!("{}", serde_json::to_string_pretty(&body)?);

    if !status.is_success() {
        bail!("gateway returned {status}");
    }
    Ok(())
}
