//! Error types for llm-proxy operations.
//!
//! Defines the error taxonomy for every subsystem of the proxy:
//! - Task validation (user-visible)
//! - Provider execution (recovered through the one-shot fallback)
//! - Cost ledger, prompt cache and metrics sinks (logged, never surfaced)
//! - Startup configuration
//!
//! Only [`ProxyError`] crosses the public `generate` boundary.

use thiserror::Error;

/// A malformed task, rejected before routing.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Task id must not be empty")]
    EmptyId,

    #[error("Prompt must not be empty")]
    EmptyPrompt,

    #[error("max_tokens must be greater than zero")]
    ZeroMaxTokens,

    #[error("Temperature {0} is outside the supported range [0.0, 2.0]")]
    TemperatureOutOfRange(f64),

    #[error("batch_size must be greater than zero when set")]
    ZeroBatchSize,

    #[error("Namespace '{0}' must not contain ':'")]
    InvalidNamespace(String),

    #[error("Unknown {field} value '{value}'")]
    UnknownVariant { field: &'static str, value: String },
}

/// Errors raised by a provider backend while executing a request.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("Provider call timed out after {0} ms")]
    Timeout(u64),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Failed to parse provider response: {0}")]
    Parse(String),

    #[error("Stream interrupted: {0}")]
    Stream(String),

    #[error("Provider '{0}' is not registered")]
    NotRegistered(String),
}

/// Soft signal used by the routing engine to demote a tier.
///
/// Never returned to callers; it only appears in debug logs.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Monthly budget exceeded for '{provider}': spent ${spent:.4} of ${limit:.4}")]
pub struct BudgetExceeded {
    pub provider: String,
    pub spent: f64,
    pub limit: f64,
}

/// Errors from the cost ledger store.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Failed to open ledger database: {0}")]
    Open(String),

    #[error("Ledger query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("Invalid date range: {0}")]
    InvalidRange(String),

    #[error("Background ledger task failed: {0}")]
    Join(String),
}

/// Errors from a cache backend. Always swallowed by the prompt cache.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache connection failed: {0}")]
    Connection(String),

    #[error("Cache operation failed: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Errors from the metrics sink. Always swallowed by the orchestrator.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Failed to encode metrics: {0}")]
    Encode(String),
}

/// Startup configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Local provider '{0}' is not registered")]
    MissingLocalProvider(String),

    #[error("Provider '{0}' is referenced by an enabled tier but not registered")]
    UnknownProvider(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("Ledger initialization failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Cache initialization failed: {0}")]
    Cache(#[from] CacheError),

    #[error("Metrics initialization failed: {0}")]
    Metrics(#[from] MetricsError),
}

/// Caller-facing error of `generate` / `generate_streaming`.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The request was invalid and never reached a provider.
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    /// Both the routed provider and the local fallback failed.
    #[error(
        "All providers failed (primary '{primary_provider}': {primary_error}){}",
        fallback_suffix(.fallback_error)
    )]
    AllProvidersFailed {
        primary_provider: String,
        primary_error: ProviderError,
        fallback_error: Option<ProviderError>,
    },
}

fn fallback_suffix(fallback_error: &Option<ProviderError>) -> String {
    fallback_error
        .as_ref()
        .map(|e| format!("; local fallback: {e}"))
        .unwrap_or_default()
}

impl ProxyError {
    /// The last underlying provider error, for diagnostics.
    pub fn last_provider_error(&self) -> Option<&ProviderError> {
        match self {
            ProxyError::Validation(_) => None,
            ProxyError::AllProvidersFailed {
                primary_error,
                fallback_error,
                ..
            } => Some(fallback_error.as_ref().unwrap_or(primary_error)),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ProxyError::Validation(_))
    }
}
