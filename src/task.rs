//! Task and response value types.
//!
//! A [`Task`] describes one generation request as submitted by a caller; a
//! [`Response`] is the terminal result of serving it. Both are plain values:
//! the proxy borrows the task for the duration of one routing and execution
//! cycle and hands back a freshly built response.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ValidationError;

/// Default sampling temperature.
pub const DEFAULT_TEMPERATURE: f64 = 0.7;

/// Default generation budget in tokens.
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Cache namespace used when a task does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Separates the segments of a cache key; forbidden inside namespaces.
pub const NAMESPACE_SEPARATOR: char = ':';

/// A namespace must not contain [`NAMESPACE_SEPARATOR`], so that the key
/// prefix of one namespace is never a prefix of another's.
pub fn check_namespace(namespace: &str) -> Result<(), ValidationError> {
    if namespace.contains(NAMESPACE_SEPARATOR) {
        return Err(ValidationError::InvalidNamespace(namespace.to_string()));
    }
    Ok(())
}

/// Kind of work a task asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Extraction,
    Generation,
    Embedding,
    Vision,
    Summarization,
    Research,
    AnswerGeneration,
    Classification,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Extraction => "extraction",
            TaskType::Generation => "generation",
            TaskType::Embedding => "embedding",
            TaskType::Vision => "vision",
            TaskType::Summarization => "summarization",
            TaskType::Research => "research",
            TaskType::AnswerGeneration => "answer_generation",
            TaskType::Classification => "classification",
        }
    }

    /// Task types that may be sent to the mid tier when remote execution is preferred.
    pub fn prefers_remote(&self) -> bool {
        matches!(
            self,
            TaskType::Extraction
                | TaskType::Generation
                | TaskType::Summarization
                | TaskType::AnswerGeneration
        )
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "extraction" => Ok(TaskType::Extraction),
            "generation" => Ok(TaskType::Generation),
            "embedding" => Ok(TaskType::Embedding),
            "vision" => Ok(TaskType::Vision),
            "summarization" => Ok(TaskType::Summarization),
            "research" => Ok(TaskType::Research),
            "answer_generation" | "answer" => Ok(TaskType::AnswerGeneration),
            "classification" => Ok(TaskType::Classification),
            other => Err(ValidationError::UnknownVariant {
                field: "task_type",
                value: other.to_string(),
            }),
        }
    }
}

/// Privacy class of the data carried in the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClassification {
    #[default]
    Public,
    Pii,
    Hipaa,
    Confidential,
}

impl DataClassification {
    /// Sensitive data must never leave the local provider.
    pub fn is_sensitive(&self) -> bool {
        !matches!(self, DataClassification::Public)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataClassification::Public => "public",
            DataClassification::Pii => "pii",
            DataClassification::Hipaa => "hipaa",
            DataClassification::Confidential => "confidential",
        }
    }
}

impl FromStr for DataClassification {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "public" => Ok(DataClassification::Public),
            "pii" => Ok(DataClassification::Pii),
            "hipaa" => Ok(DataClassification::Hipaa),
            "confidential" => Ok(DataClassification::Confidential),
            other => Err(ValidationError::UnknownVariant {
                field: "data_classification",
                value: other.to_string(),
            }),
        }
    }
}

/// Requested answer quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityRequirement {
    Low,
    #[default]
    #[serde(alias = "medium")]
    Standard,
    High,
    Critical,
}

impl FromStr for QualityRequirement {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(QualityRequirement::Low),
            "standard" | "medium" => Ok(QualityRequirement::Standard),
            "high" => Ok(QualityRequirement::High),
            "critical" => Ok(QualityRequirement::Critical),
            other => Err(ValidationError::UnknownVariant {
                field: "quality_requirement",
                value: other.to_string(),
            }),
        }
    }
}

/// Estimated difficulty of the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
    VeryHigh,
}

impl Complexity {
    pub fn is_high_or_above(&self) -> bool {
        matches!(self, Complexity::High | Complexity::VeryHigh)
    }
}

impl FromStr for Complexity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "low" => Ok(Complexity::Low),
            "medium" => Ok(Complexity::Medium),
            "high" => Ok(Complexity::High),
            "very_high" => Ok(Complexity::VeryHigh),
            other => Err(ValidationError::UnknownVariant {
                field: "complexity",
                value: other.to_string(),
            }),
        }
    }
}

/// Provider grouping by cost, quality and privacy characteristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Local,
    Mid,
    Premium,
    Vision,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Local => "local",
            Tier::Mid => "mid",
            Tier::Premium => "premium",
            Tier::Vision => "vision",
        }
    }
}

/// Optional per-tier model overrides supplied with a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub premium: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision: Option<String>,
}

impl ModelOverrides {
    pub fn for_tier(&self, tier: Tier) -> Option<&str> {
        match tier {
            Tier::Local => self.local.as_deref(),
            Tier::Mid => self.mid.as_deref(),
            Tier::Premium => self.premium.as_deref(),
            Tier::Vision => self.vision.as_deref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_none() && self.mid.is_none() && self.premium.is_none() && self.vision.is_none()
    }

    /// Stable textual form, used as the model component of cache keys.
    ///
    /// Cache lookup happens before routing, so the key cannot depend on the
    /// model the router will eventually pick.
    pub fn cache_label(&self) -> String {
        if self.is_empty() {
            return "auto".to_string();
        }
        [
            ("local", &self.local),
            ("mid", &self.mid),
            ("premium", &self.premium),
            ("vision", &self.vision),
        ]
        .iter()
        .filter_map(|(tier, model)| model.as_ref().map(|m| format!("{tier}={m}")))
        .collect::<Vec<_>>()
        .join(";")
    }
}

/// A generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    pub prompt: String,
    #[serde(default)]
    pub data_classification: DataClassification,
    #[serde(default)]
    pub quality_requirement: QualityRequirement,
    #[serde(default)]
    pub complexity: Complexity,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub model_overrides: ModelOverrides,
    /// Cache partition (tenant). `None` means [`DEFAULT_NAMESPACE`].
    #[serde(default)]
    pub namespace: Option<String>,
    /// Keep the model's reasoning mode enabled.
    #[serde(default)]
    pub deep_reasoning: bool,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

impl Task {
    /// Create a task with a fresh UUID and default knobs.
    pub fn new(task_type: TaskType, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type,
            prompt: prompt.into(),
            data_classification: DataClassification::default(),
            quality_requirement: QualityRequirement::default(),
            complexity: Complexity::default(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            batch_size: None,
            model_overrides: ModelOverrides::default(),
            namespace: None,
            deep_reasoning: false,
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_classification(mut self, classification: DataClassification) -> Self {
        self.data_classification = classification;
        self
    }

    pub fn with_quality(mut self, quality: QualityRequirement) -> Self {
        self.quality_requirement = quality;
        self
    }

    pub fn with_complexity(mut self, complexity: Complexity) -> Self {
        self.complexity = complexity;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn with_model_override(mut self, tier: Tier, model: impl Into<String>) -> Self {
        let model = Some(model.into());
        match tier {
            Tier::Local => self.model_overrides.local = model,
            Tier::Mid => self.model_overrides.mid = model,
            Tier::Premium => self.model_overrides.premium = model,
            Tier::Vision => self.model_overrides.vision = model,
        }
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_deep_reasoning(mut self) -> Self {
        self.deep_reasoning = true;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn namespace(&self) -> &str {
        self.namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Reject malformed tasks before they reach the router.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::EmptyId);
        }
        if self.prompt.trim().is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }
        if self.max_tokens == 0 {
            return Err(ValidationError::ZeroMaxTokens);
        }
        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            return Err(ValidationError::TemperatureOutOfRange(self.temperature));
        }
        if self.batch_size == Some(0) {
            return Err(ValidationError::ZeroBatchSize);
        }
        check_namespace(self.namespace())
    }
}

/// Result of serving a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub content: String,
    pub provider: String,
    pub model: String,
    pub tokens_input: u32,
    pub tokens_output: u32,
    pub tokens_total: u32,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub routing_reason: String,
    pub fallback_used: bool,
    /// True when the token split behind `cost_usd` was estimated.
    #[serde(default)]
    pub cost_estimated: bool,
}

impl Response {
    /// Provider label for responses served from the prompt cache.
    pub const CACHE_PROVIDER: &'static str = "cache";

    /// Routing reason for responses served from the prompt cache.
    pub const CACHE_HIT_REASON: &'static str = "cache_hit";

    pub fn from_cache(content: String, model: String, latency_ms: u64) -> Self {
        Self {
            content,
            provider: Self::CACHE_PROVIDER.to_string(),
            model,
            tokens_input: 0,
            tokens_output: 0,
            tokens_total: 0,
            cost_usd: 0.0,
            latency_ms,
            routing_reason: Self::CACHE_HIT_REASON.to_string(),
            fallback_used: false,
            cost_estimated: false,
        }
    }
}
