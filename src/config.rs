//! Proxy configuration.
//!
//! Loaded from a YAML file (every field optional, see [`ProxyConfig::default`])
//! and then overlaid with `PROXY_*` environment variables:
//!
//! | Variable | Field |
//! |---|---|
//! | `PROXY_PREFER_REMOTE` | `prefer_remote` |
//! | `PROXY_REQUEST_TIMEOUT_SECS` | `request_timeout_secs` |
//! | `PROXY_LEDGER_PATH` | `ledger_path` |
//! | `PROXY_REDIS_URL` | `cache.redis_url` |
//! | `PROXY_CACHE_ENABLED` | `cache.enabled` |
//! | `PROXY_CACHE_PREFIX` | `cache.key_prefix` |
//! | `PROXY_LOCAL_MODEL`, `PROXY_MID_MODEL`, `PROXY_PREMIUM_MODEL`, `PROXY_VISION_MODEL` | tier models |
//! | `PROXY_OLLAMA_URL` | base URL of the local provider |
//! | `PROXY_BUDGETS` | `budgets`, as `provider=usd,provider=usd` |

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::error::ConfigError;
use crate::pricing::{ModelPrice, PriceEntry, PricingTable};
use crate::providers::{LlmProvider, OllamaProvider, OpenAiCompatibleProvider};
use crate::routing::{RoutingPolicy, TierTarget};

/// Backend implementation of a configured provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Ollama,
    OpenaiCompatible,
}

/// One provider endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl ProviderConfig {
    fn build(&self) -> Result<Arc<dyn LlmProvider>, ConfigError> {
        match self.kind {
            ProviderKind::Ollama => {
                let base_url = self
                    .base_url
                    .clone()
                    .unwrap_or_else(|| crate::providers::OLLAMA_BASE_URL.to_string());
                Ok(Arc::new(OllamaProvider::new(&self.name, base_url)?))
            }
            ProviderKind::OpenaiCompatible => {
                let base_url = self
                    .base_url
                    .clone()
                    .unwrap_or_else(|| crate::providers::OPENROUTER_BASE_URL.to_string());
                let api_key = self
                    .api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok());
                if api_key.is_none() {
                    tracing::warn!(
                        provider = %self.name,
                        env = ?self.api_key_env,
                        "No API key found for provider"
                    );
                }
                Ok(Arc::new(OpenAiCompatibleProvider::new(
                    &self.name, base_url, api_key,
                )?))
            }
        }
    }
}

/// Complete proxy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub providers: Vec<ProviderConfig>,
    pub local: TierTarget,
    pub mid: TierTarget,
    pub premium: TierTarget,
    pub vision: TierTarget,
    /// Send text tasks to the mid tier when it has budget.
    pub prefer_remote: bool,
    /// Monthly USD limit per provider. Zero or absent means unlimited.
    pub budgets: HashMap<String, f64>,
    pub pricing: Vec<PriceEntry>,
    /// Price for metered models with no pricing entry.
    pub default_price: ModelPrice,
    pub request_timeout_secs: u64,
    pub cache: CacheConfig,
    pub ledger_path: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            providers: vec![
                ProviderConfig {
                    name: "ollama".to_string(),
                    kind: ProviderKind::Ollama,
                    base_url: None,
                    api_key_env: None,
                },
                ProviderConfig {
                    name: "openrouter".to_string(),
                    kind: ProviderKind::OpenaiCompatible,
                    base_url: None,
                    api_key_env: Some("OPENROUTER_API_KEY".to_string()),
                },
            ],
            local: TierTarget::new("ollama", "qwen3:8b"),
            mid: TierTarget::new("openrouter", "mistralai/mistral-small-3.2-24b-instruct"),
            premium: TierTarget::new("openrouter", "anthropic/claude-sonnet-4"),
            vision: TierTarget::new("openrouter", "openai/gpt-4o"),
            prefer_remote: false,
            budgets: HashMap::new(),
            pricing: vec![
                PriceEntry {
                    provider: "openrouter".to_string(),
                    model: "mistralai/mistral-small-3.2-24b-instruct".to_string(),
                    input_per_1m: 0.1,
                    output_per_1m: 0.3,
                },
                PriceEntry {
                    provider: "openrouter".to_string(),
                    model: "anthropic/claude-sonnet-4".to_string(),
                    input_per_1m: 3.0,
                    output_per_1m: 15.0,
                },
                PriceEntry {
                    provider: "openrouter".to_string(),
                    model: "openai/gpt-4o".to_string(),
                    input_per_1m: 2.5,
                    output_per_1m: 10.0,
                },
            ],
            default_price: ModelPrice::new(3.0, 15.0),
            request_timeout_secs: 120,
            cache: CacheConfig::default(),
            ledger_path: "llm_proxy_ledger.db".to_string(),
        }
    }
}

impl ProxyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overlaid with `PROXY_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Read a YAML file. Missing fields take their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Overlay `PROXY_*` variables from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Overlay variables from `lookup`.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("PROXY_PREFER_REMOTE") {
            self.prefer_remote = parse_env_bool(&val, "PROXY_PREFER_REMOTE")?;
        }

        if let Some(val) = lookup("PROXY_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = parse_env_value(&val, "PROXY_REQUEST_TIMEOUT_SECS")?;
        }

        if let Some(val) = lookup("PROXY_LEDGER_PATH") {
            self.ledger_path = val;
        }

        // Cache settings
        if let Some(val) = lookup("PROXY_REDIS_URL") {
            self.cache.redis_url = Some(val).filter(|v| !v.is_empty());
        }

        if let Some(val) = lookup("PROXY_CACHE_ENABLED") {
            self.cache.enabled = parse_env_bool(&val, "PROXY_CACHE_ENABLED")?;
        }

        if let Some(val) = lookup("PROXY_CACHE_PREFIX") {
            self.cache.key_prefix = val;
        }

        // Tier models
        if let Some(val) = lookup("PROXY_LOCAL_MODEL") {
            self.local.model = val;
        }
        if let Some(val) = lookup("PROXY_MID_MODEL") {
            self.mid.model = val;
        }
        if let Some(val) = lookup("PROXY_PREMIUM_MODEL") {
            self.premium.model = val;
        }
        if let Some(val) = lookup("PROXY_VISION_MODEL") {
            self.vision.model = val;
        }

        if let Some(val) = lookup("PROXY_OLLAMA_URL") {
            let local = self.local.provider.clone();
            match self.providers.iter_mut().find(|p| p.name == local) {
                Some(provider) => provider.base_url = Some(val),
                None => {
                    return Err(ConfigError::InvalidValue {
                        key: "PROXY_OLLAMA_URL".to_string(),
                        message: format!("local provider '{}' is not configured", local),
                    })
                }
            }
        }

        if let Some(val) = lookup("PROXY_BUDGETS") {
            self.budgets.extend(parse_budgets(&val)?);
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` for out-of-range values,
    /// `MissingLocalProvider` when the local tier's provider is not an
    /// Ollama endpoint, and `UnknownProvider` when an enabled tier names a
    /// provider that is not configured.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.cache.scan_batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "cache.scan_batch_size must be greater than 0".to_string(),
            ));
        }

        if self.cache.memory_max_entries == 0 {
            return Err(ConfigError::ValidationFailed(
                "cache.memory_max_entries must be greater than 0".to_string(),
            ));
        }

        if self.cache.key_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "cache.key_prefix cannot be empty".to_string(),
            ));
        }

        if self.ledger_path.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "ledger_path cannot be empty".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "provider name cannot be empty".to_string(),
                ));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(ConfigError::ValidationFailed(format!(
                    "provider '{}' is configured twice",
                    provider.name
                )));
            }
        }

        match self.providers.iter().find(|p| p.name == self.local.provider) {
            Some(p) if p.kind == ProviderKind::Ollama => {}
            _ => return Err(ConfigError::MissingLocalProvider(self.local.provider.clone())),
        }

        for (tier, target) in [
            ("local", &self.local),
            ("mid", &self.mid),
            ("premium", &self.premium),
            ("vision", &self.vision),
        ] {
            if tier != "local" && !target.enabled {
                continue;
            }
            if target.model.is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{tier} tier model cannot be empty"
                )));
            }
            if !names.contains(target.provider.as_str()) {
                return Err(ConfigError::UnknownProvider(target.provider.clone()));
            }
        }

        for (provider, limit) in &self.budgets {
            if !limit.is_finite() || *limit < 0.0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "budget for '{provider}' must be a non-negative number"
                )));
            }
        }

        for entry in &self.pricing {
            if entry.input_per_1m < 0.0 || entry.output_per_1m < 0.0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "price for '{}/{}' cannot be negative",
                    entry.provider, entry.model
                )));
            }
        }
        if self.default_price.input_per_1m < 0.0 || self.default_price.output_per_1m < 0.0 {
            return Err(ConfigError::ValidationFailed(
                "default_price cannot be negative".to_string(),
            ));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn routing_policy(&self) -> RoutingPolicy {
        RoutingPolicy::new(
            self.local.clone(),
            self.mid.clone(),
            self.premium.clone(),
            self.vision.clone(),
        )
        .with_prefer_remote(self.prefer_remote)
        .with_budgets(self.budgets.clone())
    }

    pub fn pricing_table(&self) -> PricingTable {
        let mut table = PricingTable::new(self.local.provider.clone(), self.default_price);
        table.extend(&self.pricing);
        table
    }

    /// Instantiate every configured provider backend.
    pub fn build_providers(&self) -> Result<Vec<Arc<dyn LlmProvider>>, ConfigError> {
        self.providers.iter().map(ProviderConfig::build).collect()
    }

    /// Builder method to set the ledger path.
    pub fn with_ledger_path(mut self, path: impl Into<String>) -> Self {
        self.ledger_path = path.into();
        self
    }

    /// Builder method to set a monthly budget.
    pub fn with_budget(mut self, provider: impl Into<String>, limit_usd: f64) -> Self {
        self.budgets.insert(provider.into(), limit_usd);
        self
    }

    pub fn with_prefer_remote(mut self, prefer_remote: bool) -> Self {
        self.prefer_remote = prefer_remote;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

/// Parse `provider=usd,provider=usd`.
fn parse_budgets(value: &str) -> Result<HashMap<String, f64>, ConfigError> {
    let mut budgets = HashMap::new();
    for pair in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (provider, limit) = pair.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            key: "PROXY_BUDGETS".to_string(),
            message: format!("expected provider=amount, got '{}'", pair),
        })?;
        budgets.insert(
            provider.trim().to_string(),
            parse_env_value(limit, "PROXY_BUDGETS")?,
        );
    }
    Ok(budgets)
}
