//! Model router with content analysis and capability matching
//!
//! Builds a routing context from the raw request (code blocks, attachments,
//! tools, response format, estimated context size), evaluates the
//! registry's routes top-to-bottom, and returns a primary model plus a
//! capability-filtered fallback chain. A caller-provided override is
//! honored when the chosen model can actually serve the request.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::providers::ChatMessage;
use crate::registry::{
    ModelRegistry, ModelSpec, RegistrySnapshot, RouteClause, RoutePredicate, RouteSpec,
};

const OVERRIDE_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const LONG_CONTEXT_TOKENS: u64 = 12_000;

/// Context information derived from one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingContext {
    pub last_user_message: String,
    pub messages: Vec<ChatMessage>,
    pub has_code_block: bool,
    pub has_attachments: bool,
    pub rag_enabled: bool,
    pub tools_enabled: bool,
    /// "json_schema" | "json_object" when the caller requires a format.
    pub response_format_required: Option<String>,
    pub estimated_context_tokens: u64,
}

/// Router output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub primary_model_id: String,
    pub fallback_model_ids: Vec<String>,
    pub route_name: String,
    pub route_reason: String,
    pub timeout_ms: u64,
}

/// Pluggable token estimator. Routing semantics only depend on the
/// estimate, so a real tokenizer can replace the heuristic without
/// touching the router.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, messages: &[ChatMessage]) -> u64;
}

/// The coarse default: summed character length of all textual message
/// contents divided by four.
pub struct CharsPerFour;

impl TokenEstimator for CharsPerFour {
    fn estimate(&self, messages: &[ChatMessage]) -> u64 {
        let chars: usize = messages
            .iter()
            .map(|m| m.content.as_text().chars().count())
            .sum();
        (chars / 4) as u64
    }
}

fn code_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```\w*\n").expect("static pattern"))
}

/// Model router that selects the best model for each request based on
/// content analysis and capability requirements.
pub struct ModelRouter {
    registry: Arc<ModelRegistry>,
    estimator: Arc<dyn TokenEstimator>,
    // contains_regex patterns compiled once per router; a pattern that
    // fails to compile is remembered as never-matching.
    regex_cache: DashMap<String, Option<Regex>>,
}

impl ModelRouter {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self::with_estimator(registry, Arc::new(CharsPerFour))
    }

    pub fn with_estimator(registry: Arc<ModelRegistry>, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            registry,
            estimator,
            regex_cache: DashMap::new(),
        }
    }

    /// Analyze raw messages into a routing context.
    pub fn analyze(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Value]>,
        response_format: Option<&Value>,
    ) -> RoutingContext {
        if messages.is_empty() {
            return RoutingContext::default();
        }

        let last_user_message = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_text().to_string())
            .unwrap_or_default();

        let has_code_block = code_block_regex().is_match(&last_user_message);
        let has_attachments = messages.iter().any(|m| m.content.is_structured());
        let tools_enabled = tools.map(|t| !t.is_empty()).unwrap_or(false);
        let response_format_required = response_format
            .and_then(|f| f.get("type"))
            .and_then(Value::as_str)
            .filter(|t| *t == "json_schema" || *t == "json_object")
            .map(str::to_string);

        RoutingContext {
            last_user_message,
            messages: messages.to_vec(),
            has_code_block,
            has_attachments,
            rag_enabled: false,
            tools_enabled,
            response_format_required,
            estimated_context_tokens: self.estimator.estimate(messages),
        }
    }

    /// Route a request: honor a capable override, otherwise first-match
    /// rule evaluation, otherwise the default tier sort. Deterministic for
    /// a given registry snapshot, context, and override.
    pub fn route(&self, context: &RoutingContext, user_model_override: Option<&str>) -> RoutingDecision {
        let snapshot = self.registry.snapshot();

        if let Some(override_id) = user_model_override {
            if let Some(model) = snapshot.get_model(override_id) {
                if validate_capabilities(model, context) {
                    return RoutingDecision {
                        primary_model_id: override_id.to_string(),
                        fallback_model_ids: synthesize_fallbacks(&snapshot, model, context),
                        route_name: "user_override".to_string(),
                        route_reason: format!("User selected {override_id}"),
                        timeout_ms: OVERRIDE_TIMEOUT_MS,
                    };
                }
                warn!(
                    "user selected model {override_id} doesn't meet capability requirements, \
                     falling back to router"
                );
            }
        }

        for route in snapshot.routes() {
            if !self.matches_route(route, context) {
                continue;
            }
            let Some(primary) = snapshot.get_model(&route.use_model) else {
                continue;
            };
            if !validate_capabilities(primary, context) {
                continue;
            }
            return RoutingDecision {
                primary_model_id: route.use_model.clone(),
                fallback_model_ids: filter_fallback_chain(&snapshot, &route.fallback_models, context),
                route_name: route.name.clone(),
                route_reason: build_route_reason(route, context),
                timeout_ms: route.timeout_ms,
            };
        }

        self.default_route(&snapshot, context)
    }

    fn default_route(&self, snapshot: &RegistrySnapshot, context: &RoutingContext) -> RoutingDecision {
        let mut candidates: Vec<&ModelSpec> = snapshot
            .models()
            .iter()
            .filter(|m| validate_capabilities(m, context))
            .collect();

        if candidates.is_empty() {
            // Nothing can serve this request properly; degrade loudly to
            // the first registered model rather than refusing outright.
            warn!("no models meet capability requirements, using first available");
            let first = &snapshot.models()[0];
            return RoutingDecision {
                primary_model_id: first.id.clone(),
                fallback_model_ids: vec![],
                route_name: "fallback_no_match".to_string(),
                route_reason: "No models meet all requirements".to_string(),
                timeout_ms: DEFAULT_TIMEOUT_MS,
            };
        }

        // Default mode prefers fast and cheap.
        candidates.sort_by(|a, b| {
            b.speed_tier
                .cmp(&a.speed_tier)
                .then(a.cost_tier.cmp(&b.cost_tier))
                .then(b.reliability_tier.cmp(&a.reliability_tier))
        });

        RoutingDecision {
            primary_model_id: candidates[0].id.clone(),
            fallback_model_ids: candidates[1..]
                .iter()
                .take(3)
                .map(|m| m.id.clone())
                .collect(),
            route_name: "default".to_string(),
            route_reason: "Default routing: fast and cost-effective".to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    fn matches_route(&self, route: &RouteSpec, context: &RoutingContext) -> bool {
        match &route.when {
            RoutePredicate::Always(always) => *always,
            RoutePredicate::Any(clauses) => {
                clauses.iter().any(|c| self.evaluate_clause(c, context))
            }
            RoutePredicate::All(clauses) => {
                clauses.iter().all(|c| self.evaluate_clause(c, context))
            }
        }
    }

    fn evaluate_clause(&self, clause: &RouteClause, context: &RoutingContext) -> bool {
        match clause {
            RouteClause::HasCodeBlock(expected) => context.has_code_block == *expected,
            RouteClause::HasAttachments(expected) => context.has_attachments == *expected,
            RouteClause::RagEnabled(expected) => context.rag_enabled == *expected,
            RouteClause::ToolsEnabled(expected) => context.tools_enabled == *expected,
            RouteClause::ResponseFormatRequired(expected) => {
                context.response_format_required.as_deref() == Some(expected.as_str())
            }
            RouteClause::ContextEstTokensGt(threshold) => {
                context.estimated_context_tokens > *threshold
            }
            RouteClause::ContainsRegex(pattern) => self.regex_matches(pattern, &context.last_user_message),
        }
    }

    fn regex_matches(&self, pattern: &str, haystack: &str) -> bool {
        let compiled = self
            .regex_cache
            .entry(pattern.to_string())
            .or_insert_with(|| {
                match RegexBuilder::new(pattern).case_insensitive(true).build() {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!("invalid route regex {pattern:?}: {e}");
                        None
                    }
                }
            });
        compiled
            .value()
            .as_ref()
            .map(|re| re.is_match(haystack))
            .unwrap_or(false)
    }
}

/// A model is feasible for a context iff tools and json_schema demands are
/// supported and the estimated context fits. An estimate exactly at the
/// model's limit passes. Vision support is reserved for future use.
fn validate_capabilities(model: &ModelSpec, context: &RoutingContext) -> bool {
    if context.tools_enabled && !model.supports_tools {
        return false;
    }
    if context.response_format_required.as_deref() == Some("json_schema")
        && !model.supports_json_schema
    {
        return false;
    }
    if context.estimated_context_tokens > model.max_context_tokens {
        return false;
    }
    true
}

/// Keep only the declared fallbacks that can actually serve the request.
fn filter_fallback_chain(
    snapshot: &RegistrySnapshot,
    fallback_ids: &[String],
    context: &RoutingContext,
) -> Vec<String> {
    fallback_ids
        .iter()
        .filter(|id| {
            snapshot
                .get_model(id)
                .map(|m| validate_capabilities(m, context))
                .unwrap_or(false)
        })
        .cloned()
        .collect()
}

/// Derive a fallback chain from scratch: every other feasible model,
/// preferring reliable then fast then cheap, top three.
fn synthesize_fallbacks(
    snapshot: &RegistrySnapshot,
    primary: &ModelSpec,
    context: &RoutingContext,
) -> Vec<String> {
    let mut candidates: Vec<&ModelSpec> = snapshot
        .models()
        .iter()
        .filter(|m| m.id != primary.id && validate_capabilities(m, context))
        .collect();

    candidates.sort_by(|a, b| {
        b.reliability_tier
            .cmp(&a.reliability_tier)
            .then(b.speed_tier.cmp(&a.speed_tier))
            .then(a.cost_tier.cmp(&b.cost_tier))
    });

    candidates.iter().take(3).map(|m| m.id.clone()).collect()
}

fn build_route_reason(route: &RouteSpec, context: &RoutingContext) -> String {
    let mut reasons = Vec::new();
    if context.has_code_block {
        reasons.push("code blocks detected".to_string());
    }
    if context.rag_enabled {
        reasons.push("RAG enabled".to_string());
    }
    if context.tools_enabled {
        reasons.push("tools required".to_string());
    }
    if let Some(format) = &context.response_format_required {
        reasons.push(format!("{format} format required"));
    }
    if context.estimated_context_tokens > LONG_CONTEXT_TOKENS {
        reasons.push(format!(
            "long context ({} tokens)",
            context.estimated_context_tokens
        ));
    }

    if reasons.is_empty() {
        format!("Route '{}' matched", route.name)
    } else {
        format!("Route '{}': {}", route.name, reasons.join(", "))
    }
}
