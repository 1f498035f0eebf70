//! HTTP handlers for the gateway API
//!
//! `POST /v1/completion` is the single completion surface; everything else
//! is observability and administration. Non-admin callers only ever see
//! their own traces.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::info;

use super::auth::Caller;
use super::types::{
    ApiError, CompletionResponse, LogSummary, LogsParams, MetricsParams,
};
use super::AppState;
use crate::observability::LogQuery;
use crate::orchestrator::{CompletionRequest, CompletionStreamOutcome};

/// `POST /v1/completion`: unary or SSE-streaming chat completion.
pub async fn completion(
    State(state): State<AppState>,
    caller: Caller,
    Json(mut request): Json<CompletionRequest>,
) -> Result<Response, ApiError> {
    // Identity comes from the auth layer, never from the body.
    request.user_id = caller.id;

    if request.stream {
        let outcome = state.handler.complete_stream(request).await?;
        Ok(stream_response(outcome))
    } else {
        let outcome = state.handler.complete(request).await?;
        Ok(Json(CompletionResponse::from_outcome(outcome)).into_response())
    }
}

/// SSE framing with a terminal `[DONE]` sentinel; the first frame carries
/// the assistant role plus sources and routing detail.
fn stream_response(outcome: CompletionStreamOutcome) -> Response {
    let created = Utc::now().timestamp();
    let chunk_id = outcome.request_id.clone();
    let chunk_model = outcome.model_id.clone();

    let mut head = json!({
        "id": outcome.request_id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": outcome.model_id,
        "choices": [{"index": 0, "delta": {"role": "assistant"}, "finish_reason": Value::Null}],
        "gateway": {
            "provider": outcome.provider,
            "route_name": outcome.routing.route_name,
            "route_reason": outcome.routing.route_reason,
        },
    });
    if !outcome.sources.is_empty() {
        head["sources"] = json!(outcome.sources);
    }

    let content = outcome.stream.map(move |item| match item {
        Ok(delta) => sse_frame(&json!({
            "id": chunk_id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": chunk_model,
            "choices": [{"index": 0, "delta": {"content": delta}, "finish_reason": Value::Null}],
        })),
        // Mid-stream errors are terminal.
        Err(e) => sse_frame(&json!({
            "error": {"type": e.kind.as_str(), "message": e.message}
        })),
    });

    let frames = futures::stream::once(async move { sse_frame(&head) })
        .chain(content)
        .chain(futures::stream::once(async {
            Bytes::from_static(b"data: [DONE]\n\n")
        }))
        .map(Ok::<Bytes, std::convert::Infallible>);

    match Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::wrap_stream(frames))
    {
        Ok(response) => response.into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

fn sse_frame(value: &Value) -> Bytes {
    Bytes::from(format!("data: {value}\n\n"))
}

/// `GET /v1/models`: the registry's model list.
pub async fn list_models(
    State(state): State<AppState>,
    _caller: Caller,
) -> Json<Value> {
    let snapshot = state.registry.snapshot();
    Json(json!({
        "object": "list",
        "data": snapshot.models(),
    }))
}

/// `GET /v1/logs`: filtered request log listing. Non-admin callers are
/// scoped to their own logs regardless of filters.
pub async fn list_logs(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<LogsParams>,
) -> Result<Json<Vec<LogSummary>>, ApiError> {
    let user_id = if caller.is_admin() {
        None
    } else {
        Some(caller.id.clone())
    };

    let logs = state
        .store
        .query_logs(&LogQuery {
            user_id,
            provider: params.provider,
            model_id: params.model_id,
            route_name: params.route_name,
            errors_only: params.errors_only,
            rag_used_only: params.rag_used_only,
            start_time: params.start_time,
            end_time: params.end_time,
            limit: params.limit,
            offset: params.offset,
        })
        .await?;

    Ok(Json(logs.iter().map(LogSummary::from).collect()))
}

/// `GET /v1/logs/:id`: full request trace, owner or admin only.
pub async fn get_log(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let log = state
        .store
        .get_log(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("Log not found"))?;
    caller.require_owner_or_admin(&log.user_id)?;

    let rag_log = if log.rag_used {
        state.store.get_rag_log(&id).await?
    } else {
        None
    };

    let mut body = serde_json::to_value(&log).map_err(|e| ApiError::internal(e.to_string()))?;
    body["rag_details"] = match rag_log {
        Some(rag) => json!({
            "query": rag.query,
            "knowledge_base_id": rag.knowledge_base_id,
            "candidates": rag.candidates,
            "reranker_type": rag.reranker_type,
            "selected_chunks": rag.selected_chunks,
        }),
        None => Value::Null,
    };
    Ok(Json(body))
}

/// `GET /v1/metrics`: aggregate metrics, admin only. Defaults to the last
/// 24 hours when no window start is given.
pub async fn metrics(
    State(state): State<AppState>,
    caller: Caller,
    Query(params): Query<MetricsParams>,
) -> Result<Json<crate::observability::ObservabilityMetrics>, ApiError> {
    caller.require_admin()?;
    let metrics = state
        .store
        .metrics(params.start_time, params.end_time, params.provider.as_deref())
        .await?;
    Ok(Json(metrics))
}

/// `GET /v1/circuit-breakers`: breaker states for every provider seen so
/// far, admin only.
pub async fn circuit_breakers(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<Value>, ApiError> {
    caller.require_admin()?;
    let mut states = serde_json::Map::new();
    for snapshot in state.breakers.snapshots() {
        states.insert(
            snapshot.provider.clone(),
            serde_json::to_value(&snapshot).unwrap_or(Value::Null),
        );
    }
    Ok(Json(Value::Object(states)))
}

/// `POST /v1/circuit-breakers/:provider/reset`: force a breaker closed,
/// admin only. Recorded as a synthetic success.
pub async fn reset_circuit_breaker(
    State(state): State<AppState>,
    caller: Caller,
    Path(provider): Path<String>,
) -> Result<Json<Value>, ApiError> {
    caller.require_admin()?;
    state.breakers.reset(&provider);
    info!(provider = %provider, "circuit breaker reset via admin API");
    Ok(Json(json!({
        "message": format!("Circuit breaker reset for {provider}")
    })))
}

/// `GET /v1/rag/logs/:request_id`: retrieval trace for one request.
pub async fn get_rag_log(
    State(state): State<AppState>,
    caller: Caller,
    Path(request_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let rag_log = state
        .store
        .get_rag_log(&request_id)
        .await?
        .ok_or_else(|| ApiError::not_found("RAG log not found"))?;

    // Ownership lives on the request log the trace belongs to.
    match state.store.get_log(&request_id).await? {
        Some(log) => caller.require_owner_or_admin(&log.user_id)?,
        None => caller.require_admin()?,
    }

    Ok(Json(json!({
        "request_id": rag_log.request_id,
        "timestamp": rag_log.timestamp,
        "query": rag_log.query,
        "knowledge_base_id": rag_log.knowledge_base_id,
        "candidates": rag_log.candidates,
        "reranker_type": rag_log.reranker_type,
        "selected_chunks": rag_log.selected_chunks,
    })))
}

/// `POST /v1/registry/reload`: rebuild the registry snapshot from the
/// configured document, admin only.
pub async fn reload_registry(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<Value>, ApiError> {
    caller.require_admin()?;
    let path = state
        .registry_path
        .as_ref()
        .ok_or_else(|| ApiError::bad_request("No registry document configured"))?;
    state.registry.reload_from_path(path)?;

    let snapshot = state.registry.snapshot();
    Ok(Json(json!({
        "message": "registry reloaded",
        "models_loaded": snapshot.model_count(),
        "providers_configured": snapshot.provider_count(),
    })))
}

/// `GET /health`: unauthenticated liveness with registry and breaker
/// summary.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.registry.snapshot();
    let mut breaker_states = serde_json::Map::new();
    for breaker in state.breakers.snapshots() {
        breaker_states.insert(
            breaker.provider.clone(),
            Value::String(breaker.state.as_str().to_string()),
        );
    }

    Json(json!({
        "status": "healthy",
        "models_loaded": snapshot.model_count(),
        "providers_configured": snapshot.provider_count(),
        "circuit_breaker_states": Value::Object(breaker_states),
    }))
}
