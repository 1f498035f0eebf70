//! Model registry for multi-provider support
//!
//! Loads the declarative gateway configuration (providers, models, routes)
//! from YAML and provides the single source of truth for routing decisions.
//! A loaded configuration is an immutable snapshot; reloads build and
//! validate a complete new snapshot and swap it atomically, so in-flight
//! requests keep observing a consistent view.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{GatewayError, Result};

fn default_timeout_seconds() -> u64 {
    60
}

fn default_max_context() -> u64 {
    4096
}

fn default_max_output() -> u64 {
    2048
}

fn default_tier() -> u8 {
    2
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Upstream provider configuration.
///
/// `api_key_env` is a named environment handle; the literal key is never
/// part of the document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key_env: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

/// Model specification with capabilities and selection metadata.
///
/// Tier fields are in 1..=3: reliability 3 = most reliable, cost 1 =
/// cheapest, speed 3 = fastest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSpec {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default)]
    pub supports_json_schema: bool,
    #[serde(default = "default_max_context")]
    pub max_context_tokens: u64,
    #[serde(default = "default_max_output")]
    pub max_output_tokens: u64,
    #[serde(default = "default_tier")]
    pub reliability_tier: u8,
    #[serde(default = "default_tier")]
    pub cost_tier: u8,
    #[serde(default = "default_tier")]
    pub speed_tier: u8,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A single primitive predicate clause.
///
/// The clause set is closed: a document carrying any other key fails to
/// deserialize at load time instead of silently matching nothing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RouteClause {
    /// The analyzed context contains a fenced code block.
    HasCodeBlock(bool),
    /// Any message carries structured (non-string) content.
    HasAttachments(bool),
    /// Retrieval context was injected into the request.
    RagEnabled(bool),
    /// The request declares tool definitions.
    ToolsEnabled(bool),
    /// Required response format tag ("json_schema" | "json_object").
    ResponseFormatRequired(String),
    /// Estimated context token count strictly greater than the threshold.
    ContextEstTokensGt(u64),
    /// Case-insensitive regex match against the last user message.
    ContainsRegex(String),
}

/// Route matching predicate: unconditional, disjunction, or conjunction of
/// primitive clauses.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RoutePredicate {
    Always(bool),
    Any(Vec<RouteClause>),
    All(Vec<RouteClause>),
}

/// Route specification. Routes are evaluated top-to-bottom; the first
/// matching rule wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RouteSpec {
    pub name: String,
    pub when: RoutePredicate,
    pub use_model: String,
    #[serde(default)]
    pub fallback_models: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Complete registry configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryConfig {
    pub providers: HashMap<String, ProviderConfig>,
    pub models: Vec<ModelSpec>,
    pub routes: Vec<RouteSpec>,
}

/// Optional capability requirements for model listing.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRequirements {
    pub supports_tools: Option<bool>,
    pub supports_vision: Option<bool>,
    pub supports_json_schema: Option<bool>,
    pub min_context_tokens: Option<u64>,
}

/// An application-supplied credential source for a provider whose keys are
/// not resolved from the environment (e.g. the embedding application's own
/// settings store).
pub trait CredentialSource: Send + Sync {
    /// API key for the provider, if the source has one.
    fn api_key(&self) -> Option<String>;

    /// Base URL override for the provider, if the source has one.
    fn base_url(&self) -> Option<String> {
        None
    }
}

/// Immutable view over one loaded configuration.
#[derive(Debug)]
pub struct RegistrySnapshot {
    config: RegistryConfig,
    models_by_id: HashMap<String, ModelSpec>,
    models_by_provider: HashMap<String, Vec<ModelSpec>>,
}

impl RegistrySnapshot {
    fn build(config: RegistryConfig) -> Self {
        let models_by_id = config
            .models
            .iter()
            .map(|m| (m.id.clone(), m.clone()))
            .collect();

        let mut models_by_provider: HashMap<String, Vec<ModelSpec>> = HashMap::new();
        for model in &config.models {
            models_by_provider
                .entry(model.provider.clone())
                .or_default()
                .push(model.clone());
        }

        Self {
            config,
            models_by_id,
            models_by_provider,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn get_model(&self, model_id: &str) -> Option<&ModelSpec> {
        self.models_by_id.get(model_id)
    }

    pub fn models(&self) -> &[ModelSpec] {
        &self.config.models
    }

    pub fn model_count(&self) -> usize {
        self.models_by_id.len()
    }

    pub fn provider_count(&self) -> usize {
        self.config.providers.len()
    }

    pub fn provider_names(&self) -> impl Iterator<Item = &str> {
        self.config.providers.keys().map(String::as_str)
    }

    pub fn provider_config(&self, provider: &str) -> Option<&ProviderConfig> {
        self.config.providers.get(provider)
    }

    pub fn models_by_provider(&self, provider: &str) -> &[ModelSpec] {
        self.models_by_provider
            .get(provider)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn models_by_tag(&self, tag: &str) -> Vec<&ModelSpec> {
        self.config
            .models
            .iter()
            .filter(|m| m.tags.iter().any(|t| t == tag))
            .collect()
    }

    /// Models matching the given capability requirements.
    pub fn models_by_capability(&self, req: &CapabilityRequirements) -> Vec<&ModelSpec> {
        self.config
            .models
            .iter()
            .filter(|m| {
                if let Some(tools) = req.supports_tools {
                    if m.supports_tools != tools {
                        return false;
                    }
                }
                if let Some(vision) = req.supports_vision {
                    if m.supports_vision != vision {
                        return false;
                    }
                }
                if let Some(schema) = req.supports_json_schema {
                    if m.supports_json_schema != schema {
                        return false;
                    }
                }
                if let Some(min_ctx) = req.min_context_tokens {
                    if m.max_context_tokens < min_ctx {
                        return false;
                    }
                }
                true
            })
            .collect()
    }

    pub fn routes(&self) -> &[RouteSpec] {
        &self.config.routes
    }
}

/// Model registry with atomic snapshot reload and credential resolution.
pub struct ModelRegistry {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
    credential_sources: RwLock<HashMap<String, Arc<dyn CredentialSource>>>,
}

impl ModelRegistry {
    /// Load from a YAML document. Never refuses to start: on a missing
    /// file, parse error, or validation failure the registry installs the
    /// minimal built-in default and logs a warning.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let config = match Self::load_document(path) {
            Ok(config) => {
                info!(
                    models = config.models.len(),
                    providers = config.providers.len(),
                    routes = config.routes.len(),
                    "loaded model registry from {}",
                    path.display()
                );
                config
            }
            Err(e) => {
                warn!(
                    "failed to load model registry from {}: {e}; using built-in defaults",
                    path.display()
                );
                Self::default_config()
            }
        };
        Self::with_config(config)
    }

    /// Build from an in-memory configuration, falling back to the built-in
    /// default if validation fails.
    pub fn from_config(config: RegistryConfig) -> Self {
        match validate_config(&config) {
            Ok(()) => Self::with_config(config),
            Err(e) => {
                warn!("invalid model registry config: {e}; using built-in defaults");
                Self::with_config(Self::default_config())
            }
        }
    }

    fn with_config(config: RegistryConfig) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(RegistrySnapshot::build(config))),
            credential_sources: RwLock::new(HashMap::new()),
        }
    }

    fn load_document(path: &Path) -> Result<RegistryConfig> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("read {}: {e}", path.display())))?;
        let config: RegistryConfig = serde_yaml::from_str(&raw)
            .map_err(|e| GatewayError::Config(format!("parse {}: {e}", path.display())))?;
        validate_config(&config).map_err(GatewayError::Config)?;
        Ok(config)
    }

    /// Minimal built-in configuration: one provider, one model, one
    /// catch-all route. Used whenever a real document cannot be loaded so
    /// the service stays up with degraded routing.
    pub fn default_config() -> RegistryConfig {
        RegistryConfig {
            providers: HashMap::from([(
                "openai".to_string(),
                ProviderConfig {
                    base_url: "https://api.openai.com/v1".to_string(),
                    api_key_env: "OPENAI_API_KEY".to_string(),
                    timeout_seconds: default_timeout_seconds(),
                },
            )]),
            models: vec![ModelSpec {
                id: "gpt-4".to_string(),
                provider: "openai".to_string(),
                supports_tools: true,
                supports_vision: true,
                supports_json_schema: true,
                max_context_tokens: 128_000,
                max_output_tokens: 4096,
                reliability_tier: 3,
                cost_tier: 3,
                speed_tier: 2,
                tags: vec!["general".to_string(), "reliable".to_string()],
            }],
            routes: vec![RouteSpec {
                name: "default".to_string(),
                when: RoutePredicate::Always(true),
                use_model: "gpt-4".to_string(),
                fallback_models: vec![],
                timeout_ms: default_timeout_ms(),
            }],
        }
    }

    /// Current snapshot. Callers hold the Arc for the duration of one
    /// request so a concurrent reload cannot mix configurations.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Rebuild the snapshot from a document and swap it in. On failure the
    /// previous snapshot stays active and the error is returned.
    pub fn reload_from_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let config = Self::load_document(path)?;
        let next = Arc::new(RegistrySnapshot::build(config));
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = next;
        info!("model registry reloaded from {}", path.display());
        Ok(())
    }

    /// Register an application-level credential source for one provider.
    /// Takes precedence over the environment handle in the document.
    pub fn register_credential_source(
        &self,
        provider: impl Into<String>,
        source: Arc<dyn CredentialSource>,
    ) {
        self.credential_sources
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(provider.into(), source);
    }

    /// Resolve the API key for a provider: registered source first, then
    /// the named environment handle.
    pub fn api_key(&self, provider: &str) -> Option<String> {
        if let Some(source) = self
            .credential_sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(provider)
        {
            if let Some(key) = source.api_key() {
                return Some(key);
            }
        }

        let snapshot = self.snapshot();
        let config = snapshot.provider_config(provider)?;
        std::env::var(&config.api_key_env).ok()
    }

    /// Resolve the base URL for a provider: registered source first, then
    /// the configured URL.
    pub fn base_url(&self, provider: &str) -> Option<String> {
        if let Some(source) = self
            .credential_sources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(provider)
        {
            if let Some(url) = source.base_url() {
                return Some(url);
            }
        }

        self.snapshot()
            .provider_config(provider)
            .map(|c| c.base_url.clone())
    }

    pub fn get_model(&self, model_id: &str) -> Option<ModelSpec> {
        self.snapshot().get_model(model_id).cloned()
    }

    pub fn provider_config(&self, provider: &str) -> Option<ProviderConfig> {
        self.snapshot().provider_config(provider).cloned()
    }
}

/// Validate a configuration document: unique model ids, resolvable route
/// references, tier fields in range.
fn validate_config(config: &RegistryConfig) -> std::result::Result<(), String> {
    let mut seen = HashSet::new();
    for model in &config.models {
        if !seen.insert(model.id.as_str()) {
            return Err(format!("duplicate model id: {}", model.id));
        }
        for (field, tier) in [
            ("reliability_tier", model.reliability_tier),
            ("cost_tier", model.cost_tier),
            ("speed_tier", model.speed_tier),
        ] {
            if !(1..=3).contains(&tier) {
                return Err(format!(
                    "model {}: {field} must be in 1..=3, got {tier}",
                    model.id
                ));
            }
        }
    }

    if config.models.is_empty() {
        return Err("no models configured".to_string());
    }

    for route in &config.routes {
        if !seen.contains(route.use_model.as_str()) {
            return Err(format!(
                "route {}: unknown model {}",
                route.name, route.use_model
            ));
        }
        for fallback in &route.fallback_models {
            if !seen.contains(fallback.as_str()) {
                return Err(format!(
                    "route {}: unknown fallback model {fallback}",
                    route.name
                ));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
providers:
  deepseek:
    base_url: https://api.deepseek.com/v1
    api_key_env: DEEPSEEK_API_KEY
    timeout_seconds: 30
  openai:
    base_url: https://api.openai.com/v1
    api_key_env: OPENAI_API_KEY

models:
  - id: deepseek-coder
    provider: deepseek
    max_context_tokens: 16000
    max_output_tokens: 4096
    reliability_tier: 2
    cost_tier: 1
    speed_tier: 3
    tags: [coding]
  - id: deepseek-chat
    provider: deepseek
    max_context_tokens: 32000
    cost_tier: 1
    speed_tier: 3
  - id: gpt-3.5-turbo
    provider: openai
    supports_tools: true
    max_context_tokens: 16385
    cost_tier: 1
    speed_tier: 3

routes:
  - name: coding
    when:
      any:
        - has_code_block: true
    use_model: deepseek-coder
    fallback_models: [deepseek-chat, gpt-3.5-turbo]
    timeout_ms: 45000
  - name: default
    when:
      always: true
    use_model: deepseek-chat
"#
    }

    #[test]
    fn parses_sample_document() {
        let config: RegistryConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        assert_eq!(config.models.len(), 3);
        assert_eq!(config.routes.len(), 2);
        assert_eq!(
            config.routes[0].when,
            RoutePredicate::Any(vec![RouteClause::HasCodeBlock(true)])
        );
        assert_eq!(config.routes[0].timeout_ms, 45_000);
        // Defaults fill unspecified fields.
        assert_eq!(config.models[1].reliability_tier, 2);
        assert_eq!(config.routes[1].timeout_ms, 30_000);
    }

    #[test]
    fn unknown_predicate_key_is_rejected() {
        let doc = r#"
providers: {}
models:
  - id: m
    provider: p
routes:
  - name: bad
    when:
      any:
        - has_codeblocks: true
    use_model: m
"#;
        assert!(serde_yaml::from_str::<RegistryConfig>(doc).is_err());
    }

    #[test]
    fn round_trips_effective_rule_set() {
        let config: RegistryConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        let serialized = serde_yaml::to_string(&config).unwrap();
        let reparsed: RegistryConfig = serde_yaml::from_str(&serialized).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn validation_catches_duplicate_ids() {
        let mut config: RegistryConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        let dup = config.models[0].clone();
        config.models.push(dup);
        assert!(validate_config(&config).unwrap_err().contains("duplicate"));
    }

    #[test]
    fn validation_catches_unknown_route_model() {
        let mut config: RegistryConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        config.routes[0].use_model = "missing".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn validation_catches_out_of_range_tier() {
        let mut config: RegistryConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        config.models[0].speed_tier = 4;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn invalid_config_falls_back_to_defaults() {
        let mut config: RegistryConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        config.models[0].cost_tier = 0;
        let registry = ModelRegistry::from_config(config);
        // Degraded but serving: the built-in default is active.
        assert!(registry.get_model("gpt-4").is_some());
        assert!(registry.get_model("deepseek-coder").is_none());
    }

    #[test]
    fn snapshot_queries() {
        let config: RegistryConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        let registry = ModelRegistry::from_config(config);
        let snapshot = registry.snapshot();

        assert_eq!(snapshot.model_count(), 3);
        assert_eq!(snapshot.provider_count(), 2);
        assert_eq!(snapshot.models_by_provider("deepseek").len(), 2);
        assert_eq!(snapshot.models_by_tag("coding").len(), 1);

        let tool_capable = snapshot.models_by_capability(&CapabilityRequirements {
            supports_tools: Some(true),
            ..Default::default()
        });
        assert_eq!(tool_capable.len(), 1);
        assert_eq!(tool_capable[0].id, "gpt-3.5-turbo");

        let roomy = snapshot.models_by_capability(&CapabilityRequirements {
            min_context_tokens: Some(20_000),
            ..Default::default()
        });
        assert_eq!(roomy.len(), 1);
        assert_eq!(roomy[0].id, "deepseek-chat");
    }

    #[test]
    fn reload_swaps_snapshot_atomically() {
        let config: RegistryConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        let registry = ModelRegistry::from_config(config);
        let before = registry.snapshot();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.yaml");
        std::fs::write(&path, sample_yaml().replace("deepseek-coder", "ds-coder")).unwrap();
        registry.reload_from_path(&path).unwrap();

        // The old snapshot is untouched; the new one serves new lookups.
        assert!(before.get_model("deepseek-coder").is_some());
        assert!(registry.get_model("ds-coder").is_some());
        assert!(registry.get_model("deepseek-coder").is_none());
    }

    #[test]
    fn failed_reload_keeps_previous_snapshot() {
        let config: RegistryConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        let registry = ModelRegistry::from_config(config);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.yaml");
        std::fs::write(&path, "routes: [").unwrap();
        assert!(registry.reload_from_path(&path).is_err());
        assert!(registry.get_model("deepseek-coder").is_some());
    }

    struct FixedCredentials;

    impl CredentialSource for FixedCredentials {
        fn api_key(&self) -> Option<String> {
            Some("sk-from-app".to_string())
        }

        fn base_url(&self) -> Option<String> {
            Some("https://proxy.internal/v1".to_string())
        }
    }

    #[test]
    fn credential_source_overrides_environment() {
        let config: RegistryConfig = serde_yaml::from_str(sample_yaml()).unwrap();
        let registry = ModelRegistry::from_config(config);

        assert_eq!(
            registry.base_url("openai").as_deref(),
            Some("https://api.openai.com/v1")
        );

        registry.register_credential_source("openai", Arc::new(FixedCredentials));
        assert_eq!(registry.api_key("openai").as_deref(), Some("sk-from-app"));
        assert_eq!(
            registry.base_url("openai").as_deref(),
            Some("https://proxy.internal/v1")
        );
    }
}
