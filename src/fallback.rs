//! Fallback execution with circuit breaking
//!
//! Runs one request through an ordered candidate chain (primary, then
//! fallbacks), strictly sequentially. Every attempt honors the provider's
//! circuit breaker and a per-attempt deadline owned by the executor, and
//! leaves an audit record behind. Upstream cost and rate limits dominate
//! tail latency at this layer, so there is no speculative fan-out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::breaker::BreakerRegistry;
use crate::observability::FallbackAttempt;
use crate::providers::{
    AdapterFactory, DefaultAdapterFactory, ProviderAdapter, ProviderRequest, ProviderResponse,
    ProviderStream,
};
use crate::registry::{ModelRegistry, ModelSpec};
use crate::{truncate_error, GatewayError, Result};

/// A successfully opened stream plus the audit trail that led to it.
pub struct StreamOutcome {
    pub stream: ProviderStream,
    pub attempts: Vec<FallbackAttempt>,
    pub model_id: String,
    pub provider: String,
}

/// Executes requests against a candidate chain with breaker-aware
/// failover. Adapters are created lazily and cached per provider.
pub struct FallbackExecutor {
    registry: Arc<ModelRegistry>,
    breakers: Arc<BreakerRegistry>,
    factory: Arc<dyn AdapterFactory>,
    adapters: DashMap<String, Arc<dyn ProviderAdapter>>,
}

impl FallbackExecutor {
    pub fn new(registry: Arc<ModelRegistry>, breakers: Arc<BreakerRegistry>) -> Self {
        Self::with_factory(registry, breakers, Arc::new(DefaultAdapterFactory))
    }

    pub fn with_factory(
        registry: Arc<ModelRegistry>,
        breakers: Arc<BreakerRegistry>,
        factory: Arc<dyn AdapterFactory>,
    ) -> Self {
        Self {
            registry,
            breakers,
            factory,
            adapters: DashMap::new(),
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Adapter for a model's provider, created once per provider even
    /// under concurrent first use (the vacant entry holds the shard lock
    /// through construction).
    fn adapter(&self, model: &ModelSpec) -> Result<Arc<dyn ProviderAdapter>> {
        let provider = model.provider.as_str();
        match self.adapters.entry(provider.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let config = self
                    .registry
                    .provider_config(provider)
                    .ok_or_else(|| GatewayError::ProviderNotConfigured(provider.to_string()))?;
                let api_key = self
                    .registry
                    .api_key(provider)
                    .ok_or_else(|| GatewayError::CredentialsUnavailable(provider.to_string()))?;
                let base_url = self
                    .registry
                    .base_url(provider)
                    .unwrap_or_else(|| config.base_url.clone());
                let adapter = self.factory.create(
                    provider,
                    &base_url,
                    &api_key,
                    Duration::from_secs(config.timeout_seconds),
                );
                Ok(entry.insert(adapter).clone())
            }
        }
    }

    /// Execute a unary completion through the chain. Returns the first
    /// successful response along with the attempt audit trail; fails with
    /// the full trail when every candidate is exhausted.
    pub async fn execute_with_fallback(
        &self,
        request: &ProviderRequest,
        primary_model_id: &str,
        fallback_model_ids: &[String],
        timeout_ms: u64,
    ) -> Result<(ProviderResponse, Vec<FallbackAttempt>)> {
        let chain = Self::chain(primary_model_id, fallback_model_ids);
        let mut attempts: Vec<FallbackAttempt> = Vec::new();

        for (attempt_n, model_id) in chain.iter().enumerate() {
            let attempt_n = (attempt_n + 1) as u32;
            let Some(model) = self.prepare_candidate(model_id, attempt_n, &mut attempts) else {
                continue;
            };

            let adapter = match self.adapter(&model) {
                Ok(adapter) => adapter,
                Err(e) => {
                    self.record_setup_failure(&model, attempt_n, &e, &mut attempts);
                    continue;
                }
            };

            let mut attempt_request = request.clone();
            attempt_request.model = model_id.clone();

            let started = Instant::now();
            match timeout(Duration::from_millis(timeout_ms), adapter.complete(&attempt_request)).await
            {
                Ok(Ok(response)) => {
                    let latency_ms = elapsed_ms(started);
                    self.breakers.record_success(&model.provider);
                    if attempt_n > 1 {
                        attempts.push(success_attempt(attempt_n, model_id, &model.provider, latency_ms));
                    }
                    info!(
                        model = %model_id,
                        attempt = attempt_n,
                        chain = chain.len(),
                        "request succeeded"
                    );
                    return Ok((response, attempts));
                }
                Ok(Err(e)) => {
                    let latency_ms = elapsed_ms(started);
                    if e.kind.counts_toward_breaker() {
                        self.breakers.record_failure(&model.provider);
                    }
                    warn!(model = %model_id, attempt = attempt_n, error = %e, "attempt failed");
                    attempts.push(FallbackAttempt {
                        attempt_n,
                        model_id: model_id.clone(),
                        provider: model.provider.clone(),
                        status_code: e.status_code,
                        error_type: Some(e.kind.as_str().to_string()),
                        error_short: Some(truncate_error(&e.message)),
                        latency_ms,
                    });
                }
                Err(_elapsed) => {
                    let latency_ms = elapsed_ms(started);
                    self.breakers.record_failure(&model.provider);
                    warn!(model = %model_id, attempt = attempt_n, timeout_ms, "attempt timed out");
                    attempts.push(FallbackAttempt {
                        attempt_n,
                        model_id: model_id.clone(),
                        provider: model.provider.clone(),
                        status_code: Some(408),
                        error_type: Some("timeout".to_string()),
                        error_short: Some(format!("Request timeout after {timeout_ms}ms")),
                        latency_ms,
                    });
                }
            }
        }

        Err(GatewayError::AllFallbacksFailed { attempts })
    }

    /// Open a streaming completion through the chain. Failover is only
    /// possible before the first byte reaches the caller: the adapter
    /// probes the upstream (status validated on open), so a late
    /// header-level rejection still advances to the next candidate. Once
    /// the returned stream starts yielding, errors are terminal.
    pub async fn stream_with_fallback(
        &self,
        request: &ProviderRequest,
        primary_model_id: &str,
        fallback_model_ids: &[String],
        timeout_ms: u64,
    ) -> Result<StreamOutcome> {
        let chain = Self::chain(primary_model_id, fallback_model_ids);
        let mut attempts: Vec<FallbackAttempt> = Vec::new();

        for (attempt_n, model_id) in chain.iter().enumerate() {
            let attempt_n = (attempt_n + 1) as u32;
            let Some(model) = self.prepare_candidate(model_id, attempt_n, &mut attempts) else {
                continue;
            };

            let adapter = match self.adapter(&model) {
                Ok(adapter) => adapter,
                Err(e) => {
                    self.record_setup_failure(&model, attempt_n, &e, &mut attempts);
                    continue;
                }
            };

            let mut attempt_request = request.clone();
            attempt_request.model = model_id.clone();
            attempt_request.stream = true;

            let started = Instant::now();
            match timeout(
                Duration::from_millis(timeout_ms),
                adapter.stream_complete(&attempt_request),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    let latency_ms = elapsed_ms(started);
                    // Probe accepted: the provider is serving. Mid-stream
                    // failures are terminal and never retried, so this is
                    // the point where the breaker learns of health.
                    self.breakers.record_success(&model.provider);
                    if attempt_n > 1 {
                        attempts.push(success_attempt(attempt_n, model_id, &model.provider, latency_ms));
                    }
                    info!(model = %model_id, attempt = attempt_n, "stream opened");
                    return Ok(StreamOutcome {
                        stream,
                        attempts,
                        model_id: model_id.clone(),
                        provider: model.provider.clone(),
                    });
                }
                Ok(Err(e)) => {
                    let latency_ms = elapsed_ms(started);
                    if e.kind.counts_toward_breaker() {
                        self.breakers.record_failure(&model.provider);
                    }
                    warn!(model = %model_id, attempt = attempt_n, error = %e, "stream open failed");
                    attempts.push(FallbackAttempt {
                        attempt_n,
                        model_id: model_id.clone(),
                        provider: model.provider.clone(),
                        status_code: e.status_code,
                        error_type: Some(e.kind.as_str().to_string()),
                        error_short: Some(truncate_error(&e.message)),
                        latency_ms,
                    });
                }
                Err(_elapsed) => {
                    let latency_ms = elapsed_ms(started);
                    self.breakers.record_failure(&model.provider);
                    warn!(model = %model_id, attempt = attempt_n, timeout_ms, "stream open timed out");
                    attempts.push(FallbackAttempt {
                        attempt_n,
                        model_id: model_id.clone(),
                        provider: model.provider.clone(),
                        status_code: Some(408),
                        error_type: Some("timeout".to_string()),
                        error_short: Some(format!("Stream open timeout after {timeout_ms}ms")),
                        latency_ms,
                    });
                }
            }
        }

        Err(GatewayError::AllFallbacksFailed { attempts })
    }

    fn chain(primary_model_id: &str, fallback_model_ids: &[String]) -> Vec<String> {
        let mut chain = Vec::with_capacity(1 + fallback_model_ids.len());
        chain.push(primary_model_id.to_string());
        chain.extend(fallback_model_ids.iter().cloned());
        chain
    }

    /// Resolve the candidate and consult its breaker. A missing model is
    /// skipped without an attempt record; a rejecting breaker leaves a
    /// synthetic attempt behind and does not itself mutate breaker state.
    fn prepare_candidate(
        &self,
        model_id: &str,
        attempt_n: u32,
        attempts: &mut Vec<FallbackAttempt>,
    ) -> Option<ModelSpec> {
        let Some(model) = self.registry.get_model(model_id) else {
            warn!("model {model_id} not found in registry, skipping");
            return None;
        };

        if !self.breakers.can_attempt(&model.provider) {
            warn!(provider = %model.provider, "circuit breaker open, skipping {model_id}");
            attempts.push(FallbackAttempt {
                attempt_n,
                model_id: model_id.to_string(),
                provider: model.provider.clone(),
                status_code: Some(503),
                error_type: Some("circuit_breaker_open".to_string()),
                error_short: Some("Circuit breaker is open".to_string()),
                latency_ms: 0.0,
            });
            return None;
        }

        Some(model)
    }

    fn record_setup_failure(
        &self,
        model: &ModelSpec,
        attempt_n: u32,
        error: &GatewayError,
        attempts: &mut Vec<FallbackAttempt>,
    ) {
        warn!(model = %model.id, "adapter unavailable: {error}");
        attempts.push(FallbackAttempt {
            attempt_n,
            model_id: model.id.clone(),
            provider: model.provider.clone(),
            status_code: None,
            error_type: Some(error.error_type().to_string()),
            error_short: Some(truncate_error(&error.to_string())),
            latency_ms: 0.0,
        });
    }
}

fn success_attempt(attempt_n: u32, model_id: &str, provider: &str, latency_ms: f64) -> FallbackAttempt {
    FallbackAttempt {
        attempt_n,
        model_id: model_id.to_string(),
        provider: provider.to_string(),
        status_code: Some(200),
        error_type: None,
        error_short: None,
        latency_ms,
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::providers::{ErrorKind, ProviderError};
    use crate::registry::{
        CredentialSource, ProviderConfig, RegistryConfig, RoutePredicate, RouteSpec,
    };
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted adapter outcome for one `complete`/`stream_complete` call.
    #[derive(Clone)]
    enum Scripted {
        Succeed(&'static str),
        Fail(u16),
        Hang,
        StreamChunks(Vec<&'static str>),
    }

    struct MockAdapter {
        provider: String,
        script: Mutex<Vec<Scripted>>,
    }

    impl MockAdapter {
        fn next(&self) -> Scripted {
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                Scripted::Succeed("default")
            } else {
                script.remove(0)
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for MockAdapter {
        fn provider_name(&self) -> &str {
            &self.provider
        }

        fn prepare_request(&self, _request: &ProviderRequest, stream: bool) -> Value {
            serde_json::json!({"stream": stream})
        }

        fn parse_response(
            &self,
            _response: Value,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse::default())
        }

        fn parse_stream_chunk(&self, _chunk: &Value) -> Option<String> {
            None
        }

        async fn complete(
            &self,
            request: &ProviderRequest,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            match self.next() {
                Scripted::Succeed(content) => Ok(ProviderResponse {
                    content: Some(format!("{content} from {}", request.model)),
                    ..Default::default()
                }),
                Scripted::Fail(status) => Err(ProviderError::from_status(status, "scripted failure")),
                Scripted::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!("hung attempt should be cancelled by the deadline")
                }
                Scripted::StreamChunks(_) => Ok(ProviderResponse::default()),
            }
        }

        async fn stream_complete(
            &self,
            _request: &ProviderRequest,
        ) -> std::result::Result<ProviderStream, ProviderError> {
            match self.next() {
                Scripted::StreamChunks(chunks) => {
                    let items: Vec<std::result::Result<String, ProviderError>> =
                        chunks.into_iter().map(|c| Ok(c.to_string())).collect();
                    Ok(Box::pin(futures::stream::iter(items)))
                }
                Scripted::Fail(status) => Err(ProviderError::from_status(status, "scripted failure")),
                Scripted::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!()
                }
                Scripted::Succeed(_) => Ok(Box::pin(futures::stream::empty())),
            }
        }
    }

    struct MockFactory {
        adapters: HashMap<String, Arc<MockAdapter>>,
    }

    impl MockFactory {
        fn new(scripts: Vec<(&str, Vec<Scripted>)>) -> Self {
            let adapters = scripts
                .into_iter()
                .map(|(provider, script)| {
                    (
                        provider.to_string(),
                        Arc::new(MockAdapter {
                            provider: provider.to_string(),
                            script: Mutex::new(script),
                        }),
                    )
                })
                .collect();
            Self { adapters }
        }
    }

    impl AdapterFactory for MockFactory {
        fn create(
            &self,
            provider: &str,
            _base_url: &str,
            _api_key: &str,
            _timeout: Duration,
        ) -> Arc<dyn ProviderAdapter> {
            self.adapters[provider].clone()
        }
    }

    struct TestKeys;

    impl CredentialSource for TestKeys {
        fn api_key(&self) -> Option<String> {
            Some("sk-test".to_string())
        }
    }

    fn test_registry() -> Arc<ModelRegistry> {
        let provider = |name: &str| ProviderConfig {
            base_url: format!("https://{name}.example/v1"),
            api_key_env: "UNSET_TEST_KEY".to_string(),
            timeout_seconds: 5,
        };
        let model = |id: &str, p: &str| crate::registry::ModelSpec {
            id: id.to_string(),
            provider: p.to_string(),
            supports_tools: false,
            supports_vision: false,
            supports_json_schema: false,
            max_context_tokens: 16_000,
            max_output_tokens: 4096,
            reliability_tier: 2,
            cost_tier: 2,
            speed_tier: 2,
            tags: vec![],
        };

        let config = RegistryConfig {
            providers: HashMap::from([
                ("alpha".to_string(), provider("alpha")),
                ("beta".to_string(), provider("beta")),
            ]),
            models: vec![model("alpha-chat", "alpha"), model("beta-chat", "beta")],
            routes: vec![RouteSpec {
                name: "default".to_string(),
                when: RoutePredicate::Always(true),
                use_model: "alpha-chat".to_string(),
                fallback_models: vec!["beta-chat".to_string()],
                timeout_ms: 30_000,
            }],
        };

        let registry = Arc::new(ModelRegistry::from_config(config));
        registry.register_credential_source("alpha", Arc::new(TestKeys));
        registry.register_credential_source("beta", Arc::new(TestKeys));
        registry
    }

    fn executor(
        scripts: Vec<(&str, Vec<Scripted>)>,
        breaker_config: BreakerConfig,
    ) -> FallbackExecutor {
        FallbackExecutor::with_factory(
            test_registry(),
            Arc::new(BreakerRegistry::new(breaker_config)),
            Arc::new(MockFactory::new(scripts)),
        )
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            model: "alpha-chat".to_string(),
            messages: vec![crate::providers::ChatMessage::text("user", "hi")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn primary_success_records_no_attempts() {
        let executor = executor(
            vec![("alpha", vec![Scripted::Succeed("ok")]), ("beta", vec![])],
            BreakerConfig::default(),
        );

        let (response, attempts) = executor
            .execute_with_fallback(&request(), "alpha-chat", &["beta-chat".to_string()], 5000)
            .await
            .unwrap();

        assert_eq!(response.content.as_deref(), Some("ok from alpha-chat"));
        assert!(attempts.is_empty());
    }

    #[tokio::test]
    async fn falls_back_on_server_error() {
        let executor = executor(
            vec![
                ("alpha", vec![Scripted::Fail(500)]),
                ("beta", vec![Scripted::Succeed("ok")]),
            ],
            BreakerConfig::default(),
        );

        let (response, attempts) = executor
            .execute_with_fallback(&request(), "alpha-chat", &["beta-chat".to_string()], 5000)
            .await
            .unwrap();

        assert_eq!(response.content.as_deref(), Some("ok from beta-chat"));
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].error_type.as_deref(), Some("server_error"));
        assert_eq!(attempts[0].status_code, Some(500));
        assert_eq!(attempts[1].error_type, None);
        assert_eq!(attempts[1].status_code, Some(200));
        assert_eq!(attempts[1].attempt_n, 2);
        // One failure charged to the primary's breaker.
        assert_eq!(executor.breakers().breaker("alpha").failure_count(), 1);
    }

    #[tokio::test]
    async fn open_breaker_short_circuits_without_new_failure() {
        let executor = executor(
            vec![("alpha", vec![]), ("beta", vec![Scripted::Succeed("ok")])],
            BreakerConfig {
                failure_threshold: 1,
                cooldown: Duration::from_secs(600),
                half_open_max_probes: 1,
            },
        );
        executor.breakers().record_failure("alpha");
        assert_eq!(executor.breakers().breaker("alpha").failure_count(), 1);

        let (response, attempts) = executor
            .execute_with_fallback(&request(), "alpha-chat", &["beta-chat".to_string()], 5000)
            .await
            .unwrap();

        assert!(response.content.is_some());
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].error_type.as_deref(), Some("circuit_breaker_open"));
        assert_eq!(attempts[0].status_code, Some(503));
        assert_eq!(attempts[0].latency_ms, 0.0);
        // The synthetic attempt itself charges nothing.
        assert_eq!(executor.breakers().breaker("alpha").failure_count(), 1);
    }

    #[tokio::test]
    async fn deadline_expiry_counts_as_timeout() {
        let executor = executor(
            vec![
                ("alpha", vec![Scripted::Hang]),
                ("beta", vec![Scripted::Succeed("ok")]),
            ],
            BreakerConfig::default(),
        );

        let (_, attempts) = executor
            .execute_with_fallback(&request(), "alpha-chat", &["beta-chat".to_string()], 50)
            .await
            .unwrap();

        assert_eq!(attempts[0].error_type.as_deref(), Some("timeout"));
        assert_eq!(attempts[0].status_code, Some(408));
        assert_eq!(executor.breakers().breaker("alpha").failure_count(), 1);
    }

    #[tokio::test]
    async fn caller_errors_do_not_charge_breaker() {
        let executor = executor(
            vec![
                ("alpha", vec![Scripted::Fail(400)]),
                ("beta", vec![Scripted::Succeed("ok")]),
            ],
            BreakerConfig::default(),
        );

        let (_, attempts) = executor
            .execute_with_fallback(&request(), "alpha-chat", &["beta-chat".to_string()], 5000)
            .await
            .unwrap();

        assert_eq!(attempts[0].error_type.as_deref(), Some("invalid_request"));
        assert_eq!(executor.breakers().breaker("alpha").failure_count(), 0);
    }

    #[tokio::test]
    async fn missing_model_is_skipped_without_attempt() {
        let executor = executor(
            vec![("alpha", vec![]), ("beta", vec![Scripted::Succeed("ok")])],
            BreakerConfig::default(),
        );

        let (response, attempts) = executor
            .execute_with_fallback(&request(), "ghost-model", &["beta-chat".to_string()], 5000)
            .await
            .unwrap();

        assert!(response.content.is_some());
        // Only the (successful, second-position) fallback is recorded.
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].attempt_n, 2);
        assert_eq!(attempts[0].model_id, "beta-chat");
    }

    #[tokio::test]
    async fn exhausted_chain_carries_full_audit_trail() {
        let executor = executor(
            vec![
                ("alpha", vec![Scripted::Fail(500)]),
                ("beta", vec![Scripted::Fail(429)]),
            ],
            BreakerConfig::default(),
        );

        let err = executor
            .execute_with_fallback(&request(), "alpha-chat", &["beta-chat".to_string()], 5000)
            .await
            .unwrap_err();

        match err {
            GatewayError::AllFallbacksFailed { attempts } => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].error_type.as_deref(), Some("server_error"));
                assert_eq!(attempts[1].error_type.as_deref(), Some("rate_limit"));
            }
            other => panic!("expected AllFallbacksFailed, got {other:?}"),
        }
        // rate_limit does not charge beta's breaker.
        assert_eq!(executor.breakers().breaker("beta").failure_count(), 0);
    }

    #[tokio::test]
    async fn stream_failover_happens_before_first_byte() {
        use futures::StreamExt;

        let executor = executor(
            vec![
                ("alpha", vec![Scripted::Fail(401)]),
                ("beta", vec![Scripted::StreamChunks(vec!["Hel", "lo"])]),
            ],
            BreakerConfig::default(),
        );

        let outcome = executor
            .stream_with_fallback(&request(), "alpha-chat", &["beta-chat".to_string()], 5000)
            .await
            .unwrap();

        assert_eq!(outcome.model_id, "beta-chat");
        assert_eq!(outcome.provider, "beta");
        assert_eq!(outcome.attempts[0].error_type.as_deref(), Some("authentication"));

        let collected: Vec<String> = outcome
            .stream
            .filter_map(|c| async move { c.ok() })
            .collect()
            .await;
        assert_eq!(collected.join(""), "Hello");
        // Authentication failures never open the breaker.
        assert_eq!(executor.breakers().breaker("alpha").failure_count(), 0);
        // The probe acceptance recorded success for beta.
        assert_eq!(executor.breakers().breaker("beta").failure_count(), 0);
    }

    #[tokio::test]
    async fn fallback_error_classes_follow_policy_table() {
        // 404 on the primary: next candidate is attempted, breaker stays
        // untouched.
        let executor = executor(
            vec![
                ("alpha", vec![Scripted::Fail(404)]),
                ("beta", vec![Scripted::Succeed("ok")]),
            ],
            BreakerConfig::default(),
        );

        let (_, attempts) = executor
            .execute_with_fallback(&request(), "alpha-chat", &["beta-chat".to_string()], 5000)
            .await
            .unwrap();
        assert_eq!(attempts[0].error_type.as_deref(), Some("not_found"));
        assert_eq!(executor.breakers().breaker("alpha").failure_count(), 0);
    }
}
