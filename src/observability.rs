//! Observability store and metrics
//!
//! Append-only persistence for request and RAG traces plus diagnostic
//! breaker snapshots, backed by SQLite. Every completion produces one
//! request log keyed by its correlation id; RAG-assisted completions add a
//! RAG log under the same id. Metrics are computed over a time window from
//! the persisted logs.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;

use crate::breaker::BreakerSnapshot;
use crate::Result;

pub const MAX_QUERY_LIMIT: i64 = 1000;

/// One attempt in the fallback chain audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallbackAttempt {
    /// 1-based position in the candidate chain.
    pub attempt_n: u32,
    pub model_id: String,
    pub provider: String,
    pub status_code: Option<u16>,
    pub error_type: Option<String>,
    pub error_short: Option<String>,
    pub latency_ms: f64,
}

/// A retrieval candidate as persisted in the RAG log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RagCandidate {
    pub doc_id: String,
    pub doc_title: Option<String>,
    pub doc_path: Option<String>,
    pub chunk_id: String,
    pub vector_score: f64,
    pub preview: String,
    pub rerank_score: Option<f64>,
    pub final_score: Option<f64>,
}

/// One request trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLogRecord {
    /// Correlation id linking this log to its RAG log.
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub chat_id: Option<String>,
    pub provider: String,
    pub model_id: String,
    pub route_name: String,
    pub route_reason: Option<String>,
    pub fallback_used: bool,
    pub fallback_chain: Vec<FallbackAttempt>,
    pub total_latency_ms: f64,
    pub provider_latency_ms: Option<f64>,
    pub tokens_in: Option<i64>,
    pub tokens_out: Option<i64>,
    pub error_type: Option<String>,
    pub error_short: Option<String>,
    pub rag_attempted: bool,
    pub rag_used: bool,
    pub rag_latency_ms: Option<f64>,
    pub rag_top_n: Option<i64>,
    pub rag_top_k: Option<i64>,
    pub reranker_type: Option<String>,
    pub rerank_latency_ms: Option<f64>,
    pub metadata: Option<Value>,
}

/// One RAG trace, linked to a request log by correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagLogRecord {
    pub id: String,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub knowledge_base_id: Option<String>,
    pub candidates: Vec<RagCandidate>,
    pub reranker_type: Option<String>,
    pub selected_chunks: Vec<RagCandidate>,
}

/// Filters for the log listing endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogQuery {
    pub user_id: Option<String>,
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

/// Aggregated metrics over a time window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservabilityMetrics {
    pub total_requests: i64,
    pub error_rate: f64,
    pub fallback_rate: f64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub rag_hit_rate: f64,
    pub provider_breakdown: HashMap<String, i64>,
    pub error_breakdown: HashMap<String, i64>,
}

impl ObservabilityMetrics {
    fn zeroed() -> Self {
        Self {
            total_requests: 0,
            error_rate: 0.0,
            fallback_rate: 0.0,
            avg_latency_ms: 0.0,
            p50_latency_ms: 0.0,
            p95_latency_ms: 0.0,
            rag_hit_rate: 0.0,
            provider_breakdown: HashMap::new(),
            error_breakdown: HashMap::new(),
        }
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS request_logs (
    id                  TEXT PRIMARY KEY,
    timestamp           TEXT NOT NULL,
    user_id             TEXT NOT NULL,
    chat_id             TEXT,
    provider            TEXT NOT NULL,
    model_id            TEXT NOT NULL,
    route_name          TEXT NOT NULL,
    route_reason        TEXT,
    fallback_used       INTEGER NOT NULL DEFAULT 0,
    fallback_chain_json TEXT,
    total_latency_ms    REAL,
    provider_latency_ms REAL,
    tokens_in           INTEGER,
    tokens_out          INTEGER,
    error_type          TEXT,
    error_short         TEXT,
    rag_attempted       INTEGER NOT NULL DEFAULT 0,
    rag_used            INTEGER NOT NULL DEFAULT 0,
    rag_latency_ms      REAL,
    rag_top_n           INTEGER,
    rag_top_k           INTEGER,
    reranker_type       TEXT,
    rerank_latency_ms   REAL,
    metadata_json       TEXT
);

CREATE INDEX IF NOT EXISTS idx_request_logs_timestamp ON request_logs(timestamp);
CREATE INDEX IF NOT EXISTS idx_request_logs_user ON request_logs(user_id);
CREATE INDEX IF NOT EXISTS idx_request_logs_provider ON request_logs(provider);
CREATE INDEX IF NOT EXISTS idx_request_logs_model ON request_logs(model_id);
CREATE INDEX IF NOT EXISTS idx_request_logs_route ON request_logs(route_name);
CREATE INDEX IF NOT EXISTS idx_request_logs_error ON request_logs(error_type);
CREATE INDEX IF NOT EXISTS idx_request_logs_timestamp_provider ON request_logs(timestamp, provider);
CREATE INDEX IF NOT EXISTS idx_request_logs_timestamp_error ON request_logs(timestamp, error_type);
CREATE INDEX IF NOT EXISTS idx_request_logs_user_timestamp ON request_logs(user_id, timestamp);

CREATE TABLE IF NOT EXISTS rag_logs (
    id                   TEXT PRIMARY KEY,
    request_id           TEXT NOT NULL,
    timestamp            TEXT NOT NULL,
    query                TEXT NOT NULL,
    knowledge_base_id    TEXT,
    candidates_json      TEXT,
    reranker_type        TEXT,
    selected_chunks_json TEXT
);

CREATE INDEX IF NOT EXISTS idx_rag_logs_request ON rag_logs(request_id);
CREATE INDEX IF NOT EXISTS idx_rag_logs_timestamp ON rag_logs(timestamp);
CREATE INDEX IF NOT EXISTS idx_rag_logs_kb ON rag_logs(knowledge_base_id);

CREATE TABLE IF NOT EXISTS breaker_snapshots (
    provider          TEXT PRIMARY KEY,
    state             TEXT NOT NULL,
    failure_count     INTEGER NOT NULL DEFAULT 0,
    last_failure_time TEXT,
    last_success_time TEXT,
    opened_at         TEXT,
    updated_at        TEXT NOT NULL
);
"#;

/// SQLite-backed trace store.
#[derive(Clone)]
pub struct ObservabilityStore {
    pool: SqlitePool,
}

impl ObservabilityStore {
    /// Open (creating if needed) the store at the given SQLite path.
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(sqlx::Error::from)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store, used by tests and ephemeral deployments.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Append one request log.
    pub async fn insert_request_log(&self, record: &RequestLogRecord) -> Result<()> {
        let fallback_chain = serde_json::to_string(&record.fallback_chain)?;
        let metadata = record
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO request_logs (
                id, timestamp, user_id, chat_id, provider, model_id,
                route_name, route_reason, fallback_used, fallback_chain_json,
                total_latency_ms, provider_latency_ms, tokens_in, tokens_out,
                error_type, error_short, rag_attempted, rag_used,
                rag_latency_ms, rag_top_n, rag_top_k, reranker_type,
                rerank_latency_ms, metadata_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(record.timestamp)
        .bind(&record.user_id)
        .bind(&record.chat_id)
        .bind(&record.provider)
        .bind(&record.model_id)
        .bind(&record.route_name)
        .bind(&record.route_reason)
        .bind(record.fallback_used)
        .bind(fallback_chain)
        .bind(record.total_latency_ms)
        .bind(record.provider_latency_ms)
        .bind(record.tokens_in)
        .bind(record.tokens_out)
        .bind(&record.error_type)
        .bind(&record.error_short)
        .bind(record.rag_attempted)
        .bind(record.rag_used)
        .bind(record.rag_latency_ms)
        .bind(record.rag_top_n)
        .bind(record.rag_top_k)
        .bind(&record.reranker_type)
        .bind(record.rerank_latency_ms)
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append one RAG log.
    pub async fn insert_rag_log(&self, record: &RagLogRecord) -> Result<()> {
        let candidates = serde_json::to_string(&record.candidates)?;
        let selected = serde_json::to_string(&record.selected_chunks)?;

        sqlx::query(
            r#"
            INSERT INTO rag_logs (
                id, request_id, timestamp, query, knowledge_base_id,
                candidates_json, reranker_type, selected_chunks_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.request_id)
        .bind(record.timestamp)
        .bind(&record.query)
        .bind(&record.knowledge_base_id)
        .bind(candidates)
        .bind(&record.reranker_type)
        .bind(selected)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch one request log by correlation id.
    pub async fn get_log(&self, id: &str) -> Result<Option<RequestLogRecord>> {
        let row = sqlx::query("SELECT * FROM request_logs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| request_log_from_row(&r)).transpose()
    }

    /// Query request logs, newest first.
    pub async fn query_logs(&self, query: &LogQuery) -> Result<Vec<RequestLogRecord>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT * FROM request_logs WHERE 1=1");

        if let Some(user_id) = &query.user_id {
            builder.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(provider) = &query.provider {
            builder.push(" AND provider = ").push_bind(provider);
        }
        if let Some(model_id) = &query.model_id {
            builder.push(" AND model_id = ").push_bind(model_id);
        }
        if let Some(route_name) = &query.route_name {
            builder.push(" AND route_name = ").push_bind(route_name);
        }
        if query.errors_only {
            builder.push(" AND error_type IS NOT NULL");
        }
        if query.rag_used_only {
            builder.push(" AND rag_used = 1");
        }
        if let Some(start) = query.start_time {
            builder.push(" AND timestamp >= ").push_bind(start);
        }
        if let Some(end) = query.end_time {
            builder.push(" AND timestamp <= ").push_bind(end);
        }

        let limit = query
            .limit
            .unwrap_or(100)
            .clamp(1, MAX_QUERY_LIMIT);
        let offset = query.offset.unwrap_or(0).max(0);
        builder.push(" ORDER BY timestamp DESC LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset);

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(request_log_from_row).collect()
    }

    /// Fetch a RAG log by the correlation id of its request.
    pub async fn get_rag_log(&self, request_id: &str) -> Result<Option<RagLogRecord>> {
        let row = sqlx::query("SELECT * FROM rag_logs WHERE request_id = ?")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| rag_log_from_row(&r)).transpose()
    }

    /// Persist breaker snapshots for diagnostics. Not authoritative: the
    /// in-process registry owns breaker state.
    pub async fn upsert_breaker_snapshots(&self, snapshots: &[BreakerSnapshot]) -> Result<()> {
        for snapshot in snapshots {
            sqlx::query(
                r#"
                INSERT INTO breaker_snapshots (
                    provider, state, failure_count, last_failure_time,
                    last_success_time, opened_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(provider) DO UPDATE SET
                    state = excluded.state,
                    failure_count = excluded.failure_count,
                    last_failure_time = excluded.last_failure_time,
                    last_success_time = excluded.last_success_time,
                    opened_at = excluded.opened_at,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&snapshot.provider)
            .bind(snapshot.state.as_str())
            .bind(snapshot.failure_count as i64)
            .bind(snapshot.last_failure_time)
            .bind(snapshot.last_success_time)
            .bind(snapshot.opened_at)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Aggregate metrics over a window. The window defaults to the last 24
    /// hours when no start is given; an empty window yields zeroed metrics.
    pub async fn metrics(
        &self,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        provider: Option<&str>,
    ) -> Result<ObservabilityMetrics> {
        let start = start_time.unwrap_or_else(|| Utc::now() - ChronoDuration::days(1));

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT provider, error_type, fallback_used, rag_attempted, rag_used, \
             total_latency_ms FROM request_logs WHERE timestamp >= ",
        );
        builder.push_bind(start);
        if let Some(end) = end_time {
            builder.push(" AND timestamp <= ").push_bind(end);
        }
        if let Some(provider) = provider {
            builder.push(" AND provider = ").push_bind(provider.to_string());
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        if rows.is_empty() {
            return Ok(ObservabilityMetrics::zeroed());
        }

        let total = rows.len() as i64;
        let mut errors = 0i64;
        let mut fallbacks = 0i64;
        let mut rag_attempted = 0i64;
        let mut rag_used = 0i64;
        let mut latencies: Vec<f64> = Vec::with_capacity(rows.len());
        let mut provider_breakdown: HashMap<String, i64> = HashMap::new();
        let mut error_breakdown: HashMap<String, i64> = HashMap::new();

        for row in &rows {
            let provider: String = row.try_get("provider")?;
            *provider_breakdown.entry(provider).or_default() += 1;

            if let Some(error_type) = row.try_get::<Option<String>, _>("error_type")? {
                errors += 1;
                *error_breakdown.entry(error_type).or_default() += 1;
            }
            if row.try_get::<bool, _>("fallback_used")? {
                fallbacks += 1;
            }
            if row.try_get::<bool, _>("rag_attempted")? {
                rag_attempted += 1;
            }
            if row.try_get::<bool, _>("rag_used")? {
                rag_used += 1;
            }
            if let Some(latency) = row.try_get::<Option<f64>, _>("total_latency_ms")? {
                latencies.push(latency);
            }
        }

        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let avg = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<f64>() / latencies.len() as f64
        };
        let p50 = percentile_by_index(&latencies, latencies.len() / 2);
        let p95 = percentile_by_index(&latencies, (latencies.len() as f64 * 0.95) as usize);

        Ok(ObservabilityMetrics {
            total_requests: total,
            error_rate: errors as f64 / total as f64,
            fallback_rate: fallbacks as f64 / total as f64,
            avg_latency_ms: avg,
            p50_latency_ms: p50,
            p95_latency_ms: p95,
            rag_hit_rate: if rag_attempted > 0 {
                rag_used as f64 / rag_attempted as f64
            } else {
                0.0
            },
            provider_breakdown,
            error_breakdown,
        })
    }
}

fn percentile_by_index(sorted: &[f64], index: usize) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    sorted[index.min(sorted.len() - 1)]
}

fn request_log_from_row(row: &SqliteRow) -> Result<RequestLogRecord> {
    let fallback_chain: Vec<FallbackAttempt> = row
        .try_get::<Option<String>, _>("fallback_chain_json")?
        .map(|json| serde_json::from_str(&json))
        .transpose()?
        .unwrap_or_default();
    let metadata: Option<Value> = row
        .try_get::<Option<String>, _>("metadata_json")?
        .map(|json| serde_json::from_str(&json))
        .transpose()?;

    Ok(RequestLogRecord {
        id: row.try_get("id")?,
        timestamp: row.try_get("timestamp")?,
        user_id: row.try_get("user_id")?,
        chat_id: row.try_get("chat_id")?,
        provider: row.try_get("provider")?,
        model_id: row.try_get("model_id")?,
        route_name: row.try_get("route_name")?,
        route_reason: row.try_get("route_reason")?,
        fallback_used: row.try_get("fallback_used")?,
        fallback_chain,
        total_latency_ms: row.try_get::<Option<f64>, _>("total_latency_ms")?.unwrap_or(0.0),
        provider_latency_ms: row.try_get("provider_latency_ms")?,
        tokens_in: row.try_get("tokens_in")?,
        tokens_out: row.try_get("tokens_out")?,
        error_type: row.try_get("error_type")?,
        error_short: row.try_get("error_short")?,
        rag_attempted: row.try_get("rag_attempted")?,
        rag_used: row.try_get("rag_used")?,
        rag_latency_ms: row.try_get("rag_latency_ms")?,
        rag_top_n: row.try_get("rag_top_n")?,
        rag_top_k: row.try_get("rag_top_k")?,
        reranker_type: row.try_get("reranker_type")?,
        rerank_latency_ms: row.try_get("rerank_latency_ms")?,
        metadata,
    })
}

fn rag_log_from_row(row: &SqliteRow) -> Result<RagLogRecord> {
    let candidates: Vec<RagCandidate> = row
        .try_get::<Option<String>, _>("candidates_json")?
        .map(|json| serde_json::from_str(&json))
        .transpose()?
        .unwrap_or_default();
    let selected_chunks: Vec<RagCandidate> = row
        .try_get::<Option<String>, _>("selected_chunks_json")?
        .map(|json| serde_json::from_str(&json))
        .transpose()?
        .unwrap_or_default();

    Ok(RagLogRecord {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        timestamp: row.try_get("timestamp")?,
        query: row.try_get("query")?,
        knowledge_base_id: row.try_get("knowledge_base_id")?,
        candidates,
        reranker_type: row.try_get("reranker_type")?,
        selected_chunks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(provider: &str, latency: f64) -> RequestLogRecord {
        RequestLogRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            user_id: "user-1".to_string(),
            chat_id: None,
            provider: provider.to_string(),
            model_id: format!("{provider}/model"),
            route_name: "default".to_string(),
            route_reason: Some("Default routing: fast and cost-effective".to_string()),
            fallback_used: false,
            fallback_chain: vec![],
            total_latency_ms: latency,
            provider_latency_ms: Some(latency * 0.9),
            tokens_in: Some(100),
            tokens_out: Some(20),
            error_type: None,
            error_short: None,
            rag_attempted: false,
            rag_used: false,
            rag_latency_ms: None,
            rag_top_n: None,
            rag_top_k: None,
            reranker_type: None,
            rerank_latency_ms: None,
            metadata: None,
        }
    }

    #[tokio::test]
    async fn round_trips_request_log() {
        let store = ObservabilityStore::in_memory().await.unwrap();
        let mut log = record("openai", 420.0);
        log.fallback_used = true;
        log.fallback_chain = vec![FallbackAttempt {
            attempt_n: 1,
            model_id: "gpt-4".to_string(),
            provider: "openai".to_string(),
            status_code: Some(500),
            error_type: Some("server_error".to_string()),
            error_short: Some("boom".to_string()),
            latency_ms: 120.0,
        }];
        log.metadata = Some(serde_json::json!({"trace": "abc"}));

        store.insert_request_log(&log).await.unwrap();
        let loaded = store.get_log(&log.id).await.unwrap().unwrap();

        assert_eq!(loaded.id, log.id);
        assert_eq!(loaded.fallback_chain, log.fallback_chain);
        assert_eq!(loaded.metadata, log.metadata);
        assert!(loaded.fallback_used);
    }

    #[tokio::test]
    async fn get_log_by_id_finds_old_records() {
        let store = ObservabilityStore::in_memory().await.unwrap();
        let old = record("openai", 100.0);
        store.insert_request_log(&old).await.unwrap();
        // Bury it under a full page of newer records; direct lookup must
        // still find it.
        for _ in 0..150 {
            store.insert_request_log(&record("openai", 10.0)).await.unwrap();
        }
        assert!(store.get_log(&old.id).await.unwrap().is_some());
        assert!(store.get_log("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_logs_applies_filters() {
        let store = ObservabilityStore::in_memory().await.unwrap();
        store.insert_request_log(&record("openai", 100.0)).await.unwrap();
        store.insert_request_log(&record("deepseek", 200.0)).await.unwrap();

        let mut failed = record("deepseek", 300.0);
        failed.error_type = Some("timeout".to_string());
        failed.user_id = "user-2".to_string();
        store.insert_request_log(&failed).await.unwrap();

        let by_provider = store
            .query_logs(&LogQuery {
                provider: Some("deepseek".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(by_provider.len(), 2);

        let errors = store
            .query_logs(&LogQuery {
                errors_only: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].user_id, "user-2");

        let scoped = store
            .query_logs(&LogQuery {
                user_id: Some("user-1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(scoped.len(), 2);
    }

    #[tokio::test]
    async fn metrics_over_empty_window_are_zeroed() {
        let store = ObservabilityStore::in_memory().await.unwrap();
        let metrics = store.metrics(None, None, None).await.unwrap();
        assert_eq!(metrics, ObservabilityMetrics::zeroed());
    }

    #[tokio::test]
    async fn metrics_aggregate_rates_and_percentiles() {
        let store = ObservabilityStore::in_memory().await.unwrap();
        for latency in [100.0, 200.0, 300.0, 400.0] {
            store.insert_request_log(&record("openai", latency)).await.unwrap();
        }

        let mut failed = record("deepseek", 500.0);
        failed.error_type = Some("server_error".to_string());
        failed.fallback_used = true;
        failed.rag_attempted = true;
        failed.rag_used = false;
        store.insert_request_log(&failed).await.unwrap();

        let mut rag_hit = record("deepseek", 600.0);
        rag_hit.rag_attempted = true;
        rag_hit.rag_used = true;
        store.insert_request_log(&rag_hit).await.unwrap();

        let metrics = store.metrics(None, None, None).await.unwrap();
        assert_eq!(metrics.total_requests, 6);
        assert!((metrics.error_rate - 1.0 / 6.0).abs() < 1e-9);
        assert!((metrics.fallback_rate - 1.0 / 6.0).abs() < 1e-9);
        assert!((metrics.rag_hit_rate - 0.5).abs() < 1e-9);
        assert!((metrics.avg_latency_ms - 350.0).abs() < 1e-9);
        // Sorted latencies: selection at floor(n/2) and floor(0.95 n).
        assert_eq!(metrics.p50_latency_ms, 400.0);
        assert_eq!(metrics.p95_latency_ms, 600.0);
        assert!(metrics.p50_latency_ms <= metrics.p95_latency_ms);
        assert_eq!(metrics.provider_breakdown["openai"], 4);
        assert_eq!(metrics.provider_breakdown["deepseek"], 2);
        assert_eq!(metrics.error_breakdown["server_error"], 1);

        let scoped = store.metrics(None, None, Some("openai")).await.unwrap();
        assert_eq!(scoped.total_requests, 4);
        assert_eq!(scoped.error_rate, 0.0);
    }

    #[tokio::test]
    async fn rag_log_round_trip() {
        let store = ObservabilityStore::in_memory().await.unwrap();
        let request_id = Uuid::new_v4().to_string();
        let candidate = RagCandidate {
            doc_id: "doc-1".to_string(),
            doc_title: Some("Guide".to_string()),
            doc_path: None,
            chunk_id: "c1".to_string(),
            vector_score: 0.8,
            preview: "preview".to_string(),
            rerank_score: Some(0.7),
            final_score: Some(0.73),
        };
        let log = RagLogRecord {
            id: Uuid::new_v4().to_string(),
            request_id: request_id.clone(),
            timestamp: Utc::now(),
            query: "what is bm25".to_string(),
            knowledge_base_id: Some("kb-1".to_string()),
            candidates: vec![candidate.clone()],
            reranker_type: Some("lexical_bm25".to_string()),
            selected_chunks: vec![candidate],
        };

        store.insert_rag_log(&log).await.unwrap();
        let loaded = store.get_rag_log(&request_id).await.unwrap().unwrap();
        assert_eq!(loaded.query, "what is bm25");
        assert_eq!(loaded.candidates, loaded.selected_chunks);
        assert!(store.get_rag_log("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn breaker_snapshots_upsert() {
        let store = ObservabilityStore::in_memory().await.unwrap();
        let snapshot = BreakerSnapshot {
            provider: "openai".to_string(),
            state: crate::breaker::BreakerState::Open,
            failure_count: 5,
            last_failure_time: Some(Utc::now()),
            last_success_time: None,
            opened_at: Some(Utc::now()),
        };
        store.upsert_breaker_snapshots(&[snapshot.clone()]).await.unwrap();
        store.upsert_breaker_snapshots(&[snapshot]).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM breaker_snapshots")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
