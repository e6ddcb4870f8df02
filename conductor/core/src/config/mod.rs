//! TOML Configuration File Support
//!
//! Loads the orchestrator configuration from
//! `$XDG_CONFIG_HOME/operator/conductor.toml` (typically
//! `~/.config/operator/conductor.toml`) and turns it into the typed values the
//! core consumes: an [`OrchestratorConfig`] and a [`ProviderRegistry`].
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`OPERATOR_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Credentials
//!
//! API keys never live in the file. Each provider names the environment
//! variable holding its key (`api_key_env`); a provider whose key is missing is
//! disabled with a warning and dropped from every chain.
//!
//! # Example Configuration
//!
//! ```toml
//! [pool]
//! workers = 5
//! queue_capacity = 1000
//! fan_out_limit = 4
//! call_timeout_ms = 30000
//!
//! [retry]
//! max_transient_retries = 1
//! initial_backoff_ms = 200
//!
//! [health]
//! failure_threshold = 5
//! cooldown_secs = 30
//!
//! [[providers]]
//! id = "claude"
//! kind = "anthropic"
//! api_key_env = "ANTHROPIC_API_KEY"
//!
//! [[providers]]
//! id = "grok"
//! kind = "xai"
//! timeout_ms = 20000
//!
//! [chains]
//! financial = ["claude", "grok"]
//! general = ["claude"]
//! ```

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Domain;
use crate::orchestrator::OrchestratorConfig;
use crate::provider::http::{ANTHROPIC_BASE_URL, OPENAI_BASE_URL, XAI_BASE_URL};
use crate::provider::{HttpProvider, ProviderClient, ProviderEndpoint, ProviderId, ScriptedProvider};
use crate::routing::{HealthConfig, ProviderRegistry, RegistryError};

/// Worker pool size override
pub const ENV_WORKERS: &str = "OPERATOR_WORKERS";
/// Queue capacity override
pub const ENV_QUEUE_CAPACITY: &str = "OPERATOR_QUEUE_CAPACITY";
/// Per-call timeout override, in milliseconds
pub const ENV_CALL_TIMEOUT_MS: &str = "OPERATOR_CALL_TIMEOUT_MS";
/// Fan-out limit override
pub const ENV_FAN_OUT_LIMIT: &str = "OPERATOR_FAN_OUT_LIMIT";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// Provider set or chains rejected by the registry
    #[error("Invalid provider registry: {0}")]
    Registry(#[from] RegistryError),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Provider Kinds
// =============================================================================

/// Wire dialect of a configured provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Anthropic Messages API
    Anthropic,
    /// OpenAI Chat Completions
    Openai,
    /// xAI Grok (OpenAI-compatible)
    Xai,
    /// Offline provider that echoes prompts
    Echo,
}

impl ProviderKind {
    fn default_model(self) -> &'static str {
        match self {
            Self::Anthropic => "claude-sonnet-4-20250514",
            Self::Openai => "gpt-4o",
            Self::Xai => "grok-2-1212",
            Self::Echo => "echo",
        }
    }

    fn default_base_url(self) -> &'static str {
        match self {
            Self::Anthropic => ANTHROPIC_BASE_URL,
            Self::Openai => OPENAI_BASE_URL,
            Self::Xai => XAI_BASE_URL,
            Self::Echo => "",
        }
    }

    fn default_api_key_env(self) -> Option<&'static str> {
        match self {
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
            Self::Openai => Some("OPENAI_API_KEY"),
            Self::Xai => Some("XAI_API_KEY"),
            Self::Echo => None,
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[pool]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolToml {
    /// Worker pool size
    pub workers: Option<usize>,
    /// Maximum queued tasks
    pub queue_capacity: Option<usize>,
    /// Maximum concurrent provider calls per multi-mode task
    pub fan_out_limit: Option<usize>,
    /// Per-call timeout in milliseconds
    pub call_timeout_ms: Option<u64>,
}

/// `[retry]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryToml {
    /// Retries for a transient failure
    pub max_transient_retries: Option<u32>,
    /// Initial backoff in milliseconds
    pub initial_backoff_ms: Option<u64>,
    /// Backoff ceiling in milliseconds
    pub max_backoff_ms: Option<u64>,
    /// Backoff multiplier
    pub backoff_multiplier: Option<f32>,
    /// Whether to add jitter
    pub use_jitter: Option<bool>,
}

/// `[health]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthToml {
    /// Outcomes kept per provider
    pub window_size: Option<usize>,
    /// Outcome age limit in seconds
    pub window_secs: Option<u64>,
    /// Trailing failures that open the circuit
    pub failure_threshold: Option<u32>,
    /// Window failure rate that opens the circuit
    pub failure_rate_threshold: Option<f64>,
    /// Samples needed before the rate applies
    pub min_samples: Option<u32>,
    /// Open-circuit cooldown in seconds
    pub cooldown_secs: Option<u64>,
}

/// One `[[providers]]` entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProviderToml {
    /// Provider identifier used in chains
    pub id: String,
    /// Wire dialect
    pub kind: ProviderKind,
    /// Model name (kind default if absent)
    pub model: Option<String>,
    /// Base URL (kind default if absent)
    pub base_url: Option<String>,
    /// Environment variable holding the API key (kind default if absent)
    pub api_key_env: Option<String>,
    /// Request timeout cap in milliseconds
    pub timeout_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConductorToml {
    /// Pool section
    pub pool: PoolToml,
    /// Retry section
    pub retry: RetryToml,
    /// Health section
    pub health: HealthToml,
    /// Providers (replace the defaults when present)
    pub providers: Vec<ProviderToml>,
    /// Domain name -> ordered provider ids (replace the defaults when present)
    pub chains: BTreeMap<String, Vec<String>>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved settings for one provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProviderSettings {
    /// Identifier
    pub id: ProviderId,
    /// Wire dialect
    pub kind: ProviderKind,
    /// Model name
    pub model: String,
    /// Base URL
    pub base_url: String,
    /// Environment variable holding the API key
    pub api_key_env: Option<String>,
    /// Request timeout cap
    pub timeout: Option<Duration>,
}

impl ProviderSettings {
    /// Settings for `kind` with every default applied
    #[must_use]
    pub fn new(id: impl Into<ProviderId>, kind: ProviderKind) -> Self {
        Self {
            id: id.into(),
            kind,
            model: kind.default_model().to_string(),
            base_url: kind.default_base_url().to_string(),
            api_key_env: kind.default_api_key_env().map(String::from),
            timeout: None,
        }
    }

    fn from_toml(toml: &ProviderToml) -> Self {
        let mut settings = Self::new(toml.id.as_str(), toml.kind);
        if let Some(ref model) = toml.model {
            settings.model = model.clone();
        }
        if let Some(ref base_url) = toml.base_url {
            settings.base_url = base_url.clone();
        }
        if toml.api_key_env.is_some() {
            settings.api_key_env = toml.api_key_env.clone();
        }
        settings.timeout = toml.timeout_ms.map(Duration::from_millis);
        settings
    }

    /// Build the client, or `None` if its API key is unavailable
    fn client<F>(&self, lookup: &F) -> Option<Arc<dyn ProviderClient>>
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.kind == ProviderKind::Echo {
            return Some(Arc::new(
                ScriptedProvider::new(self.id.clone()).with_model(self.model.clone()),
            ));
        }

        let Some(var) = self.api_key_env.as_deref() else {
            tracing::warn!(provider = %self.id, "No api_key_env configured, provider disabled");
            return None;
        };
        let Some(api_key) = lookup(var).filter(|key| !key.trim().is_empty()) else {
            tracing::warn!(provider = %self.id, env = var, "API key not set, provider disabled");
            return None;
        };

        let endpoint = match self.kind {
            ProviderKind::Anthropic => ProviderEndpoint::Anthropic {
                base_url: self.base_url.clone(),
                api_key,
                model: self.model.clone(),
            },
            _ => ProviderEndpoint::OpenAiCompatible {
                base_url: self.base_url.clone(),
                api_key,
                model: self.model.clone(),
            },
        };
        let mut provider = HttpProvider::new(self.id.clone(), endpoint);
        if let Some(timeout) = self.timeout {
            provider = provider.with_request_timeout(timeout);
        }
        Some(Arc::new(provider))
    }
}

/// Centralized configuration for the orchestrator
///
/// Use [`load_config`] to load configuration with proper priority handling,
/// then [`ConductorConfig::build_registry`] to instantiate the providers.
#[derive(Clone, Debug)]
pub struct ConductorConfig {
    /// Pool, queue and execution policy
    pub orchestrator: OrchestratorConfig,

    /// Health tracking tunables
    pub health: HealthConfig,

    /// Configured providers, in registration order
    pub providers: Vec<ProviderSettings>,

    /// Fallback chain per domain
    pub chains: BTreeMap<Domain, Vec<ProviderId>>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            health: HealthConfig::default(),
            providers: default_providers(),
            chains: default_chains(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

fn default_providers() -> Vec<ProviderSettings> {
    vec![
        ProviderSettings::new("claude", ProviderKind::Anthropic),
        ProviderSettings::new("openai", ProviderKind::Openai),
        ProviderSettings::new("grok", ProviderKind::Xai),
    ]
}

fn default_chains() -> BTreeMap<Domain, Vec<ProviderId>> {
    let chain = |ids: &[&str]| ids.iter().map(|&id| ProviderId::from(id)).collect::<Vec<_>>();
    BTreeMap::from([
        (Domain::Healthcare, chain(&["openai", "claude"])),
        (Domain::Financial, chain(&["claude", "grok", "openai"])),
        (Domain::Sports, chain(&["openai", "grok"])),
        (Domain::Business, chain(&["claude", "openai"])),
        (Domain::General, chain(&["openai", "claude", "grok"])),
    ])
}

impl ConductorConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Check ranges and cross references
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::ValidationError(msg));
        let pool = &self.orchestrator;
        let retry = &pool.policy.retry;

        if pool.workers == 0 {
            return invalid("pool.workers must be at least 1".into());
        }
        if pool.queue_capacity == 0 {
            return invalid("pool.queue_capacity must be at least 1".into());
        }
        if pool.policy.fan_out_limit == 0 {
            return invalid("pool.fan_out_limit must be at least 1".into());
        }
        if pool.policy.call_timeout.is_zero() {
            return invalid("pool.call_timeout_ms must be positive".into());
        }
        if retry.backoff_multiplier < 1.0 {
            return invalid("retry.backoff_multiplier must be at least 1.0".into());
        }
        if retry.initial_backoff_ms > retry.max_backoff_ms {
            return invalid("retry.initial_backoff_ms exceeds retry.max_backoff_ms".into());
        }

        let health = &self.health;
        if health.failure_threshold == 0 {
            return invalid("health.failure_threshold must be at least 1".into());
        }
        if health.window_size < health.failure_threshold as usize {
            return invalid(format!(
                "health.window_size ({}) is smaller than health.failure_threshold ({})",
                health.window_size, health.failure_threshold
            ));
        }
        if !(health.failure_rate_threshold > 0.0 && health.failure_rate_threshold <= 1.0) {
            return invalid("health.failure_rate_threshold must be in (0, 1]".into());
        }

        let mut ids = HashSet::with_capacity(self.providers.len());
        for provider in &self.providers {
            if provider.id.as_str().is_empty() {
                return invalid("provider id must not be empty".into());
            }
            if !ids.insert(&provider.id) {
                return invalid(format!("provider '{}' is configured twice", provider.id));
            }
            if provider.kind != ProviderKind::Echo && provider.base_url.is_empty() {
                return invalid(format!("provider '{}' has an empty base_url", provider.id));
            }
        }
        for (domain, chain) in &self.chains {
            if let Some(unknown) = chain.iter().find(|id| !ids.contains(id)) {
                return invalid(format!(
                    "chain for {domain} names unknown provider '{unknown}'"
                ));
            }
        }

        Ok(())
    }

    /// Instantiate providers and chains, reading API keys from the environment
    pub fn build_registry(&self) -> Result<ProviderRegistry, ConfigError> {
        self.build_registry_with(|var| std::env::var(var).ok())
    }

    /// Instantiate providers and chains, resolving API keys through `lookup`
    pub fn build_registry_with<F>(&self, lookup: F) -> Result<ProviderRegistry, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = ProviderRegistry::builder().health_config(self.health.clone());
        let mut enabled = HashSet::new();

        for settings in &self.providers {
            if let Some(client) = settings.client(&lookup) {
                enabled.insert(settings.id.clone());
                builder = builder.provider(client);
            }
        }

        for (&domain, chain) in &self.chains {
            let kept: Vec<ProviderId> = chain
                .iter()
                .filter(|id| enabled.contains(*id))
                .cloned()
                .collect();
            if kept.is_empty() {
                tracing::warn!(
                    domain = %domain,
                    "Every provider in the chain is disabled, domain uses the default chain"
                );
                continue;
            }
            builder = builder.chain(domain, kept);
        }

        let registry = builder.build()?;
        tracing::info!(
            providers = registry.len(),
            disabled = self.providers.len() - registry.len(),
            "Provider registry built"
        );
        Ok(registry)
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/operator/conductor.toml` or
/// `~/.config/operator/conductor.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("operator").join("conductor.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// resulting configuration is invalid. A missing config file is not an error.
pub fn load_config() -> Result<ConductorConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// If `path` is `None` or does not exist, only defaults and environment
/// variables are used.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ConductorConfig, ConfigError> {
    load_config_with(path, |var| std::env::var(var).ok())
}

fn load_config_with<F>(path: Option<PathBuf>, env: F) -> Result<ConductorConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ConductorConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ConductorToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut ConductorConfig, toml: &ConductorToml) -> Result<(), ConfigError> {
    let pool = &mut config.orchestrator;
    if let Some(workers) = toml.pool.workers {
        pool.workers = workers;
    }
    if let Some(capacity) = toml.pool.queue_capacity {
        pool.queue_capacity = capacity;
    }
    if let Some(limit) = toml.pool.fan_out_limit {
        pool.policy.fan_out_limit = limit;
    }
    if let Some(ms) = toml.pool.call_timeout_ms {
        pool.policy.call_timeout = Duration::from_millis(ms);
    }

    let retry = &mut pool.policy.retry;
    if let Some(n) = toml.retry.max_transient_retries {
        retry.max_transient_retries = n;
    }
    if let Some(ms) = toml.retry.initial_backoff_ms {
        retry.initial_backoff_ms = ms;
    }
    if let Some(ms) = toml.retry.max_backoff_ms {
        retry.max_backoff_ms = ms;
    }
    if let Some(multiplier) = toml.retry.backoff_multiplier {
        retry.backoff_multiplier = multiplier;
    }
    if let Some(jitter) = toml.retry.use_jitter {
        retry.use_jitter = jitter;
    }

    let health = &mut config.health;
    if let Some(size) = toml.health.window_size {
        health.window_size = size;
    }
    if let Some(secs) = toml.health.window_secs {
        health.window = Duration::from_secs(secs);
    }
    if let Some(threshold) = toml.health.failure_threshold {
        health.failure_threshold = threshold;
    }
    if let Some(rate) = toml.health.failure_rate_threshold {
        health.failure_rate_threshold = rate;
    }
    if let Some(samples) = toml.health.min_samples {
        health.min_samples = samples;
    }
    if let Some(secs) = toml.health.cooldown_secs {
        health.cooldown = Duration::from_secs(secs);
    }

    if !toml.providers.is_empty() {
        config.providers = toml.providers.iter().map(ProviderSettings::from_toml).collect();
        // Default chains reference the default providers
        if toml.chains.is_empty() {
            config.chains.clear();
        }
    }
    if !toml.chains.is_empty() {
        let mut chains = BTreeMap::new();
        for (name, ids) in &toml.chains {
            let domain: Domain = name
                .parse()
                .map_err(|e| ConfigError::ValidationError(format!("chains: {e}")))?;
            chains.insert(domain, ids.iter().map(|id| ProviderId::from(id.as_str())).collect());
        }
        config.chains = chains;
    }

    Ok(())
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut ConductorConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let parsed = |var: &str| env(var).and_then(|value| value.trim().parse::<u64>().ok());

    if let Some(n) = parsed(ENV_WORKERS) {
        config.orchestrator.workers = n as usize;
        config.source = ConfigSource::Env;
    }
    if let Some(n) = parsed(ENV_QUEUE_CAPACITY) {
        config.orchestrator.queue_capacity = n as usize;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = parsed(ENV_CALL_TIMEOUT_MS) {
        config.orchestrator.policy.call_timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(n) = parsed(ENV_FAN_OUT_LIMIT) {
        config.orchestrator.policy.fan_out_limit = n as usize;
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Worker pool size override
    pub workers: Option<usize>,
    /// Per-call timeout override (milliseconds)
    pub call_timeout_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set worker pool size override
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Set per-call timeout override
    #[must_use]
    pub fn with_call_timeout_ms(mut self, ms: u64) -> Self {
        self.call_timeout_ms = Some(ms);
        self
    }

    /// Apply overrides to a configuration and re-validate it
    pub fn apply(&self, config: &mut ConductorConfig) -> Result<(), ConfigError> {
        if self.workers.is_some() || self.call_timeout_ms.is_some() {
            config.source = ConfigSource::Cli;
        }
        if let Some(workers) = self.workers {
            config.orchestrator.workers = workers;
        }
        if let Some(ms) = self.call_timeout_ms {
            config.orchestrator.policy.call_timeout = Duration::from_millis(ms);
        }
        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
