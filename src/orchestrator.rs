//! Unified completion orchestration
//!
//! Glues the pipeline together for one request: derive the routing context,
//! rerank and inject retrieval context when attached, route, execute with
//! fallback, and persist the trace. Trace persistence is best-effort; a
//! completion outcome (success or failure) is never shadowed by a logging
//! failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};
use uuid::Uuid;

use crate::fallback::FallbackExecutor;
use crate::observability::{
    FallbackAttempt, ObservabilityStore, RagCandidate, RagLogRecord, RequestLogRecord,
};
use crate::providers::{ChatMessage, ProviderRequest, ProviderResponse, ProviderStream};
use crate::registry::ModelRegistry;
use crate::rerank::{
    format_sources, inject_chunks, InjectionStrategy, LexicalReranker, RagChunk, RankedChunk,
    SourceEntry,
};
use crate::router::{ModelRouter, RoutingDecision};
use crate::{truncate_error, GatewayError, Result};

const RAG_TOP_K: usize = 5;

/// Unified completion request.
///
/// `user_id` is filled from the authenticated caller identity by the HTTP
/// layer, not trusted from the body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// Caller-selected model override.
    pub model: Option<String>,
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
    #[serde(default)]
    pub user_id: String,
    pub chat_id: Option<String>,

    // Retrieval context, pre-retrieved by the embedding application.
    #[serde(default)]
    pub rag_enabled: bool,
    pub rag_chunks: Option<Vec<RagChunk>>,
    pub knowledge_base_id: Option<String>,
    #[serde(default)]
    pub injection_strategy: InjectionStrategy,
}

/// Result of a unary completion, trace included.
#[derive(Debug)]
pub struct CompletionOutcome {
    pub request_id: String,
    pub response: ProviderResponse,
    pub model_id: String,
    pub provider: String,
    pub routing: RoutingDecision,
    pub attempts: Vec<FallbackAttempt>,
    pub sources: Vec<SourceEntry>,
    pub total_latency_ms: f64,
}

/// Result of opening a streaming completion.
pub struct CompletionStreamOutcome {
    pub request_id: String,
    pub stream: ProviderStream,
    pub model_id: String,
    pub provider: String,
    pub routing: RoutingDecision,
    pub sources: Vec<SourceEntry>,
}

struct RagState {
    candidates: Vec<RagChunk>,
    selected: Vec<RankedChunk>,
    sources: Vec<SourceEntry>,
    reranker_type: String,
    rag_latency_ms: f64,
    rerank_latency_ms: f64,
}

/// Writes a best-effort `cancelled` trace if the request future is dropped
/// before a real outcome was logged. Cancellation is not a provider fault:
/// nothing here touches breaker state.
struct CancelLogGuard {
    store: Arc<ObservabilityStore>,
    record: Option<RequestLogRecord>,
    started: Instant,
}

impl CancelLogGuard {
    fn new(store: Arc<ObservabilityStore>, record: RequestLogRecord) -> Self {
        Self {
            store,
            record: Some(record),
            started: Instant::now(),
        }
    }

    fn update(&mut self, f: impl FnOnce(&mut RequestLogRecord)) {
        if let Some(record) = self.record.as_mut() {
            f(record);
        }
    }

    fn disarm(&mut self) {
        self.record = None;
    }
}

impl Drop for CancelLogGuard {
    fn drop(&mut self) {
        let Some(mut record) = self.record.take() else {
            return;
        };
        record.total_latency_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        record.error_type = Some("cancelled".to_string());
        record.error_short = Some("request cancelled by caller".to_string());
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.store.clone();
            handle.spawn(async move {
                if let Err(e) = store.insert_request_log(&record).await {
                    error!("failed to log cancelled request: {e}");
                }
            });
        }
    }
}

/// Orchestrates completion requests across routing, RAG, fallback, and
/// observability. All collaborators are injected; the handler itself holds
/// no hidden state.
pub struct CompletionHandler {
    registry: Arc<ModelRegistry>,
    router: Arc<ModelRouter>,
    executor: Arc<FallbackExecutor>,
    reranker: Arc<LexicalReranker>,
    store: Arc<ObservabilityStore>,
}

impl CompletionHandler {
    pub fn new(
        registry: Arc<ModelRegistry>,
        router: Arc<ModelRouter>,
        executor: Arc<FallbackExecutor>,
        reranker: Arc<LexicalReranker>,
        store: Arc<ObservabilityStore>,
    ) -> Self {
        Self {
            registry,
            router,
            executor,
            reranker,
            store,
        }
    }

    /// Execute a unary completion end to end.
    pub async fn complete(&self, request: CompletionRequest) -> Result<CompletionOutcome> {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();

        let mut guard = CancelLogGuard::new(
            self.store.clone(),
            self.base_record(&request_id, &request),
        );

        let mut context =
            self.router
                .analyze(&request.messages, request.tools.as_deref(), request.response_format.as_ref());

        let (messages, rag) = self.apply_rag(&request, &context.last_user_message);
        if rag.is_some() {
            context.rag_enabled = true;
        }

        let routing = self.router.route(&context, request.model.as_deref());
        info!(
            route = %routing.route_name,
            primary = %routing.primary_model_id,
            fallbacks = ?routing.fallback_model_ids,
            "routing decision"
        );
        guard.update(|r| {
            r.model_id = routing.primary_model_id.clone();
            r.route_name = routing.route_name.clone();
            r.route_reason = Some(routing.route_reason.clone());
        });

        let provider_request = self.provider_request(&request, messages, &routing, &request_id);

        let result = self
            .executor
            .execute_with_fallback(
                &provider_request,
                &routing.primary_model_id,
                &routing.fallback_model_ids,
                routing.timeout_ms,
            )
            .await;
        let total_latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        guard.disarm();

        match result {
            Ok((response, attempts)) => {
                let model_id = attempts
                    .iter()
                    .rev()
                    .find(|a| a.error_type.is_none())
                    .map(|a| a.model_id.clone())
                    .unwrap_or_else(|| routing.primary_model_id.clone());
                let provider = self
                    .registry
                    .get_model(&model_id)
                    .map(|m| m.provider)
                    .unwrap_or_else(|| "unknown".to_string());
                let provider_latency_ms = attempts
                    .iter()
                    .rev()
                    .find(|a| a.error_type.is_none())
                    .map(|a| a.latency_ms);

                let usage = response.usage.clone().unwrap_or_default();
                let mut record = self.base_record(&request_id, &request);
                record.provider = provider.clone();
                record.model_id = model_id.clone();
                record.route_name = routing.route_name.clone();
                record.route_reason = Some(routing.route_reason.clone());
                record.fallback_used = !attempts.is_empty();
                record.fallback_chain = attempts.clone();
                record.total_latency_ms = total_latency_ms;
                record.provider_latency_ms = provider_latency_ms;
                record.tokens_in = usage.prompt_tokens.map(|t| t as i64);
                record.tokens_out = usage.completion_tokens.map(|t| t as i64);
                self.fill_rag_fields(&mut record, rag.as_ref(), true);

                self.write_trace(&record, rag.as_ref(), &request, &context.last_user_message)
                    .await;

                let sources = rag.map(|r| r.sources).unwrap_or_default();
                Ok(CompletionOutcome {
                    request_id,
                    response,
                    model_id,
                    provider,
                    routing,
                    attempts,
                    sources,
                    total_latency_ms,
                })
            }
            Err(e) => {
                let mut record = self.base_record(&request_id, &request);
                record.model_id = routing.primary_model_id.clone();
                record.route_name = routing.route_name.clone();
                record.route_reason = Some(routing.route_reason.clone());
                record.total_latency_ms = total_latency_ms;
                record.error_type = Some(e.error_type().to_string());
                record.error_short = Some(truncate_error(&e.to_string()));
                if let GatewayError::AllFallbacksFailed { attempts } = &e {
                    record.fallback_used = attempts.len() > 1;
                    record.fallback_chain = attempts.clone();
                }
                self.fill_rag_fields(&mut record, rag.as_ref(), false);

                if let Err(log_err) = self.store.insert_request_log(&record).await {
                    error!("failed to log failed request: {log_err}");
                }
                Err(e)
            }
        }
    }

    /// Open a streaming completion. The trace is written as soon as the
    /// upstream accepts the stream; token usage is unknown for streams.
    pub async fn complete_stream(
        &self,
        request: CompletionRequest,
    ) -> Result<CompletionStreamOutcome> {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();

        let mut guard = CancelLogGuard::new(
            self.store.clone(),
            self.base_record(&request_id, &request),
        );

        let mut context =
            self.router
                .analyze(&request.messages, request.tools.as_deref(), request.response_format.as_ref());

        let (messages, rag) = self.apply_rag(&request, &context.last_user_message);
        if rag.is_some() {
            context.rag_enabled = true;
        }

        let routing = self.router.route(&context, request.model.as_deref());
        guard.update(|r| {
            r.model_id = routing.primary_model_id.clone();
            r.route_name = routing.route_name.clone();
            r.route_reason = Some(routing.route_reason.clone());
        });

        let provider_request = self.provider_request(&request, messages, &routing, &request_id);

        let result = self
            .executor
            .stream_with_fallback(
                &provider_request,
                &routing.primary_model_id,
                &routing.fallback_model_ids,
                routing.timeout_ms,
            )
            .await;
        let total_latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        guard.disarm();

        match result {
            Ok(outcome) => {
                let mut record = self.base_record(&request_id, &request);
                record.provider = outcome.provider.clone();
                record.model_id = outcome.model_id.clone();
                record.route_name = routing.route_name.clone();
                record.route_reason = Some(routing.route_reason.clone());
                record.fallback_used = !outcome.attempts.is_empty();
                record.fallback_chain = outcome.attempts.clone();
                record.total_latency_ms = total_latency_ms;
                self.fill_rag_fields(&mut record, rag.as_ref(), true);

                self.write_trace(&record, rag.as_ref(), &request, &context.last_user_message)
                    .await;

                Ok(CompletionStreamOutcome {
                    request_id,
                    stream: outcome.stream,
                    model_id: outcome.model_id,
                    provider: outcome.provider,
                    routing,
                    sources: rag.map(|r| r.sources).unwrap_or_default(),
                })
            }
            Err(e) => {
                let mut record = self.base_record(&request_id, &request);
                record.model_id = routing.primary_model_id.clone();
                record.route_name = routing.route_name.clone();
                record.route_reason = Some(routing.route_reason.clone());
                record.total_latency_ms = total_latency_ms;
                record.error_type = Some(e.error_type().to_string());
                record.error_short = Some(truncate_error(&e.to_string()));
                if let GatewayError::AllFallbacksFailed { attempts } = &e {
                    record.fallback_used = attempts.len() > 1;
                    record.fallback_chain = attempts.clone();
                }
                self.fill_rag_fields(&mut record, rag.as_ref(), false);

                if let Err(log_err) = self.store.insert_request_log(&record).await {
                    error!("failed to log failed stream request: {log_err}");
                }
                Err(e)
            }
        }
    }

    /// Rerank and inject retrieval context when the request carries it.
    fn apply_rag(
        &self,
        request: &CompletionRequest,
        query: &str,
    ) -> (Vec<ChatMessage>, Option<RagState>) {
        let chunks = match (&request.rag_chunks, request.rag_enabled) {
            (Some(chunks), true) if !chunks.is_empty() => chunks,
            _ => return (request.messages.clone(), None),
        };

        let rag_started = Instant::now();
        let rerank = self.reranker.rerank(query, chunks, Some(RAG_TOP_K));
        let selected = rerank.ranked_chunks;
        let messages = inject_chunks(&request.messages, &selected, request.injection_strategy);
        let sources = format_sources(&selected);
        let rag_latency_ms = rag_started.elapsed().as_secs_f64() * 1000.0;

        info!(
            retrieved = chunks.len(),
            selected = selected.len(),
            rerank_latency_ms = rerank.rerank_latency_ms,
            "retrieval context reranked"
        );

        (
            messages,
            Some(RagState {
                candidates: chunks.clone(),
                selected,
                sources,
                reranker_type: rerank.reranker_type,
                rag_latency_ms,
                rerank_latency_ms: rerank.rerank_latency_ms,
            }),
        )
    }

    fn provider_request(
        &self,
        request: &CompletionRequest,
        messages: Vec<ChatMessage>,
        routing: &RoutingDecision,
        request_id: &str,
    ) -> ProviderRequest {
        ProviderRequest {
            model: routing.primary_model_id.clone(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            frequency_penalty: request.frequency_penalty,
            presence_penalty: request.presence_penalty,
            tools: request.tools.clone(),
            tool_choice: request.tool_choice.clone(),
            response_format: request.response_format.clone(),
            stream: request.stream,
            metadata: Some(HashMap::from([(
                "request_id".to_string(),
                Value::String(request_id.to_string()),
            )])),
        }
    }

    fn base_record(&self, request_id: &str, request: &CompletionRequest) -> RequestLogRecord {
        RequestLogRecord {
            id: request_id.to_string(),
            timestamp: chrono::Utc::now(),
            user_id: request.user_id.clone(),
            chat_id: request.chat_id.clone(),
            provider: "unknown".to_string(),
            model_id: String::new(),
            route_name: "unrouted".to_string(),
            route_reason: None,
            fallback_used: false,
            fallback_chain: vec![],
            total_latency_ms: 0.0,
            provider_latency_ms: None,
            tokens_in: None,
            tokens_out: None,
            error_type: None,
            error_short: None,
            rag_attempted: request.rag_enabled,
            rag_used: false,
            rag_latency_ms: None,
            rag_top_n: None,
            rag_top_k: None,
            reranker_type: None,
            rerank_latency_ms: None,
            metadata: None,
        }
    }

    fn fill_rag_fields(&self, record: &mut RequestLogRecord, rag: Option<&RagState>, completed: bool) {
        let Some(rag) = rag else {
            return;
        };
        record.rag_used = completed && !rag.selected.is_empty();
        record.rag_latency_ms = Some(rag.rag_latency_ms);
        record.rag_top_n = Some(rag.candidates.len() as i64);
        record.rag_top_k = Some(rag.selected.len() as i64);
        record.reranker_type = Some(rag.reranker_type.clone());
        record.rerank_latency_ms = Some(rag.rerank_latency_ms);
    }

    /// Persist the request log, then the RAG log (order matters within a
    /// correlation id). Failures are logged and swallowed.
    async fn write_trace(
        &self,
        record: &RequestLogRecord,
        rag: Option<&RagState>,
        request: &CompletionRequest,
        query: &str,
    ) {
        if let Err(e) = self.store.insert_request_log(record).await {
            error!("failed to log request: {e}");
            return;
        }

        let Some(rag) = rag else {
            return;
        };
        if rag.selected.is_empty() {
            return;
        }

        let rag_record = RagLogRecord {
            id: Uuid::new_v4().to_string(),
            request_id: record.id.clone(),
            timestamp: chrono::Utc::now(),
            query: query.to_string(),
            knowledge_base_id: request.knowledge_base_id.clone(),
            candidates: rag.candidates.iter().map(candidate_from_chunk).collect(),
            reranker_type: Some(rag.reranker_type.clone()),
            selected_chunks: rag.selected.iter().map(candidate_from_ranked).collect(),
        };
        if let Err(e) = self.store.insert_rag_log(&rag_record).await {
            error!("failed to log retrieval trace: {e}");
        }
    }
}

fn candidate_from_chunk(chunk: &RagChunk) -> RagCandidate {
    let mut preview: String = chunk.content.chars().take(400).collect();
    if chunk.content.chars().count() > 400 {
        preview.push_str("...");
    }
    RagCandidate {
        doc_id: chunk.doc_id.clone(),
        doc_title: chunk.doc_title.clone(),
        doc_path: chunk.doc_path.clone(),
        chunk_id: chunk.chunk_id.clone(),
        vector_score: chunk.vector_score,
        preview,
        rerank_score: None,
        final_score: None,
    }
}

fn candidate_from_ranked(ranked: &RankedChunk) -> RagCandidate {
    RagCandidate {
        doc_id: ranked.chunk.doc_id.clone(),
        doc_title: ranked.chunk.doc_title.clone(),
        doc_path: ranked.chunk.doc_path.clone(),
        chunk_id: ranked.chunk.chunk_id.clone(),
        vector_score: ranked.vector_score,
        preview: ranked.preview.clone(),
        rerank_score: Some(ranked.rerank_score),
        final_score: Some(ranked.final_score),
    }
}
