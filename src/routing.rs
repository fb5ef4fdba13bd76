//! Routing policy engine.
//!
//! Maps a [`Task`] plus the current monthly spend to a tier, a provider and a
//! model. The policy is a pure function of its inputs: it performs no I/O and
//! holds no locks, so it can be evaluated concurrently from any number of
//! requests.
//!
//! Decision order (first match wins):
//! 1. Sensitive data (PII, HIPAA, confidential) stays on the local provider.
//! 2. Embeddings are always computed locally.
//! 3. Vision tasks go to the vision tier, or locally when it is unavailable.
//! 4. `prefer_remote` sends text tasks to the mid tier.
//! 5. Critical quality on hard tasks uses the premium tier.
//! 6. High quality on high complexity uses the mid tier.
//! 7. Large batches use the mid tier.
//! 8. Everything else runs locally.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::error::BudgetExceeded;
use crate::task::{Complexity, QualityRequirement, Task, TaskType, Tier};

/// Batches strictly larger than this are offloaded to the mid tier.
pub const BATCH_OFFLOAD_THRESHOLD: u32 = 10;

/// Why a route was chosen. Serialized into ledger rows and responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingReason {
    SensitiveDataLocalOnly,
    EmbeddingsLocalOnly,
    VisionTaskCloud,
    VisionTaskLocalFallback,
    PreferRemote,
    CriticalQualityHighComplexity,
    HighQualityHighComplexity,
    BatchProcessing,
    DefaultLocal,
}

impl RoutingReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingReason::SensitiveDataLocalOnly => "sensitive_data_local_only",
            RoutingReason::EmbeddingsLocalOnly => "embeddings_local_only",
            RoutingReason::VisionTaskCloud => "vision_task_cloud",
            RoutingReason::VisionTaskLocalFallback => "vision_task_local_fallback",
            RoutingReason::PreferRemote => "prefer_remote",
            RoutingReason::CriticalQualityHighComplexity => "critical_quality_high_complexity",
            RoutingReason::HighQualityHighComplexity => "high_quality_high_complexity",
            RoutingReason::BatchProcessing => "batch_processing",
            RoutingReason::DefaultLocal => "default_local",
        }
    }
}

impl fmt::Display for RoutingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provider and model backing one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierTarget {
    pub provider: String,
    pub model: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl TierTarget {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Month-to-date spend per provider, in USD.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpendSnapshot {
    spend: HashMap<String, f64>,
}

impl SpendSnapshot {
    pub fn new(spend: HashMap<String, f64>) -> Self {
        Self { spend }
    }

    pub fn spent(&self, provider: &str) -> f64 {
        self.spend.get(provider).copied().unwrap_or(0.0)
    }

    pub fn as_map(&self) -> &HashMap<String, f64> {
        &self.spend
    }

    pub fn into_map(self) -> HashMap<String, f64> {
        self.spend
    }
}

impl From<HashMap<String, f64>> for SpendSnapshot {
    fn from(spend: HashMap<String, f64>) -> Self {
        Self::new(spend)
    }
}

/// Outcome of routing one task.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub tier: Tier,
    pub provider: String,
    pub model: String,
    pub reason: RoutingReason,
}

/// Static routing configuration.
#[derive(Debug, Clone)]
pub struct RoutingPolicy {
    local: TierTarget,
    mid: TierTarget,
    premium: TierTarget,
    vision: TierTarget,
    prefer_remote: bool,
    /// Monthly USD limit per provider. Zero or absent means unlimited.
    budgets: HashMap<String, f64>,
}

impl RoutingPolicy {
    pub fn new(local: TierTarget, mid: TierTarget, premium: TierTarget, vision: TierTarget) -> Self {
        Self {
            local,
            mid,
            premium,
            vision,
            prefer_remote: false,
            budgets: HashMap::new(),
        }
    }

    pub fn with_prefer_remote(mut self, prefer_remote: bool) -> Self {
        self.prefer_remote = prefer_remote;
        self
    }

    pub fn with_budget(mut self, provider: impl Into<String>, limit_usd: f64) -> Self {
        self.budgets.insert(provider.into(), limit_usd);
        self
    }

    pub fn with_budgets(mut self, budgets: HashMap<String, f64>) -> Self {
        self.budgets.extend(budgets);
        self
    }

    pub fn local_provider(&self) -> &str {
        &self.local.provider
    }

    pub fn local_model(&self) -> &str {
        &self.local.model
    }

    pub fn target(&self, tier: Tier) -> &TierTarget {
        match tier {
            Tier::Local => &self.local,
            Tier::Mid => &self.mid,
            Tier::Premium => &self.premium,
            Tier::Vision => &self.vision,
        }
    }

    /// Tiers whose targets are enabled, local always included.
    pub fn enabled_targets(&self) -> impl Iterator<Item = (Tier, &TierTarget)> {
        [Tier::Local, Tier::Mid, Tier::Premium, Tier::Vision]
            .into_iter()
            .map(|tier| (tier, self.target(tier)))
            .filter(|(tier, target)| *tier == Tier::Local || target.enabled)
    }

    pub fn is_local(&self, provider: &str) -> bool {
        provider == self.local.provider
    }

    /// Check a provider's monthly budget.
    ///
    /// The local provider is never over budget. Spending equal to the limit
    /// counts as exceeded.
    pub fn check_budget(
        &self,
        provider: &str,
        snapshot: &SpendSnapshot,
    ) -> Result<(), BudgetExceeded> {
        if self.is_local(provider) {
            return Ok(());
        }
        let limit = match self.budgets.get(provider) {
            Some(limit) if *limit > 0.0 => *limit,
            _ => return Ok(()),
        };
        let spent = snapshot.spent(provider);
        if spent >= limit {
            return Err(BudgetExceeded {
                provider: provider.to_string(),
                spent,
                limit,
            });
        }
        Ok(())
    }

    pub fn is_budget_exceeded(&self, provider: &str, snapshot: &SpendSnapshot) -> bool {
        self.check_budget(provider, snapshot).is_err()
    }

    /// Whether `tier` is enabled and still has budget.
    fn admits(&self, tier: Tier, snapshot: &SpendSnapshot) -> bool {
        let target = self.target(tier);
        if !target.enabled {
            return false;
        }
        match self.check_budget(&target.provider, snapshot) {
            Ok(()) => true,
            Err(signal) => {
                debug!(tier = tier.as_str(), %signal, "Tier demoted by budget");
                false
            }
        }
    }

    fn decide(&self, task: &Task, tier: Tier, reason: RoutingReason) -> RouteDecision {
        let target = self.target(tier);
        let model = task
            .model_overrides
            .for_tier(tier)
            .unwrap_or(&target.model)
            .to_string();
        RouteDecision {
            tier,
            provider: target.provider.clone(),
            model,
            reason,
        }
    }

    /// Pick the tier, provider and model for `task`.
    pub fn route(&self, task: &Task, snapshot: &SpendSnapshot) -> RouteDecision {
        let (tier, reason) = self.select(task, snapshot);
        let decision = self.decide(task, tier, reason);
        debug!(
            task_id = %task.id,
            task_type = %task.task_type,
            tier = decision.tier.as_str(),
            provider = %decision.provider,
            model = %decision.model,
            reason = %decision.reason,
            "Routed task"
        );
        decision
    }

    fn select(&self, task: &Task, snapshot: &SpendSnapshot) -> (Tier, RoutingReason) {
        if task.data_classification.is_sensitive() {
            return (Tier::Local, RoutingReason::SensitiveDataLocalOnly);
        }

        if task.task_type == TaskType::Embedding {
            return (Tier::Local, RoutingReason::EmbeddingsLocalOnly);
        }

        if task.task_type == TaskType::Vision {
            return if self.admits(Tier::Vision, snapshot) {
                (Tier::Vision, RoutingReason::VisionTaskCloud)
            } else {
                (Tier::Local, RoutingReason::VisionTaskLocalFallback)
            };
        }

        if self.prefer_remote
            && task.task_type.prefers_remote()
            && self.admits(Tier::Mid, snapshot)
        {
            return (Tier::Mid, RoutingReason::PreferRemote);
        }

        if task.quality_requirement == QualityRequirement::Critical
            && task.complexity.is_high_or_above()
            && self.admits(Tier::Premium, snapshot)
        {
            return (Tier::Premium, RoutingReason::CriticalQualityHighComplexity);
        }

        if task.quality_requirement == QualityRequirement::High
            && task.complexity == Complexity::High
            && self.admits(Tier::Mid, snapshot)
        {
            return (Tier::Mid, RoutingReason::HighQualityHighComplexity);
        }

        if task.batch_size.unwrap_or(0) > BATCH_OFFLOAD_THRESHOLD && self.admits(Tier::Mid, snapshot) {
            return (Tier::Mid, RoutingReason::BatchProcessing);
        }

        (Tier::Local, RoutingReason::DefaultLocal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::DataClassification;

    fn policy() -> RoutingPolicy {
        RoutingPolicy::new(
            TierTarget::new("ollama", "qwen3:8b"),
            TierTarget::new("openrouter", "mistral-small"),
            TierTarget::new("anthropic", "claude-opus"),
            TierTarget::new("openrouter", "gpt-4o"),
        )
    }

    fn spend(pairs: &[(&str, f64)]) -> SpendSnapshot {
        pairs
            .iter()
            .map(|(p, v)| (p.to_string(), *v))
            .collect::<HashMap<_, _>>()
            .into()
    }

    #[test]
    fn test_sensitive_data_always_local() {
        let policy = policy().with_prefer_remote(true);
        for classification in [
            DataClassification::Pii,
            DataClassification::Hipaa,
            DataClassification::Confidential,
        ] {
            let task = Task::new(TaskType::Generation, "p")
                .with_classification(classification)
                .with_quality(QualityRequirement::Critical)
                .with_complexity(Complexity::VeryHigh)
                .with_batch_size(100);
            let decision = policy.route(&task, &SpendSnapshot::default());
            assert_eq!(decision.provider, "ollama");
            assert_eq!(decision.reason, RoutingReason::SensitiveDataLocalOnly);
        }
    }

    #[test]
    fn test_embeddings_always_local() {
        let task = Task::new(TaskType::Embedding, "p")
            .with_quality(QualityRequirement::Critical)
            .with_complexity(Complexity::High);
        let decision = policy().with_prefer_remote(true).route(&task, &SpendSnapshot::default());
        assert_eq!(decision.tier, Tier::Local);
        assert_eq!(decision.reason, RoutingReason::EmbeddingsLocalOnly);
    }

    #[test]
    fn test_vision_routing() {
        let task = Task::new(TaskType::Vision, "describe");
        let decision = policy().route(&task, &SpendSnapshot::default());
        assert_eq!(decision.tier, Tier::Vision);
        assert_eq!(decision.model, "gpt-4o");
        assert_eq!(decision.reason.as_str(), "vision_task_cloud");

        let mut disabled = policy();
        disabled.vision = disabled.vision.clone().disabled();
        let decision = disabled.route(&task, &SpendSnapshot::default());
        assert_eq!(decision.tier, Tier::Local);
        assert_eq!(decision.reason, RoutingReason::VisionTaskLocalFallback);
    }

    #[test]
    fn test_critical_quality_routes_premium() {
        let task = Task::new(TaskType::Generation, "p")
            .with_quality(QualityRequirement::Critical)
            .with_complexity(Complexity::High);
        let decision = policy()
            .with_budget("anthropic", 10.0)
            .route(&task, &spend(&[("anthropic", 2.0)]));
        assert_eq!(decision.tier, Tier::Premium);
        assert_eq!(decision.provider, "anthropic");
        assert_eq!(decision.reason.as_str(), "critical_quality_high_complexity");
    }

    #[test]
    fn test_budget_exhausted_premium_demotes() {
        let task = Task::new(TaskType::Generation, "p")
            .with_quality(QualityRequirement::Critical)
            .with_complexity(Complexity::VeryHigh);
        let decision = policy()
            .with_budget("anthropic", 10.0)
            .route(&task, &spend(&[("anthropic", 10.0)]));
        assert_eq!(decision.tier, Tier::Local);
        assert_eq!(decision.reason, RoutingReason::DefaultLocal);
    }

    #[test]
    fn test_budget_equality_counts_as_exceeded() {
        let policy = policy().with_budget("openrouter", 5.0);
        assert!(!policy.is_budget_exceeded("openrouter", &spend(&[("openrouter", 4.99)])));
        assert!(policy.is_budget_exceeded("openrouter", &spend(&[("openrouter", 5.0)])));
        assert!(policy.is_budget_exceeded("openrouter", &spend(&[("openrouter", 6.0)])));
    }

    #[test]
    fn test_zero_or_missing_budget_is_unlimited() {
        let policy = policy().with_budget("openrouter", 0.0);
        assert!(!policy.is_budget_exceeded("openrouter", &spend(&[("openrouter", 1e6)])));
        assert!(!policy.is_budget_exceeded("anthropic", &spend(&[("anthropic", 1e6)])));
    }

    #[test]
    fn test_local_provider_never_over_budget() {
        let policy = policy().with_budget("ollama", 1.0);
        assert!(!policy.is_budget_exceeded("ollama", &spend(&[("ollama", 100.0)])));
    }

    #[test]
    fn test_high_quality_and_batch_route_mid() {
        let task = Task::new(TaskType::Summarization, "p")
            .with_quality(QualityRequirement::High)
            .with_complexity(Complexity::High);
        let decision = policy().route(&task, &SpendSnapshot::default());
        assert_eq!(decision.reason, RoutingReason::HighQualityHighComplexity);

        // VeryHigh complexity does not qualify for the high-quality rule.
        let task = task.with_complexity(Complexity::VeryHigh);
        let decision = policy().route(&task, &SpendSnapshot::default());
        assert_eq!(decision.reason, RoutingReason::DefaultLocal);

        let task = Task::new(TaskType::Classification, "p").with_batch_size(11);
        let decision = policy().route(&task, &SpendSnapshot::default());
        assert_eq!(decision.tier, Tier::Mid);
        assert_eq!(decision.reason, RoutingReason::BatchProcessing);

        let task = Task::new(TaskType::Classification, "p").with_batch_size(10);
        let decision = policy().route(&task, &SpendSnapshot::default());
        assert_eq!(decision.reason, RoutingReason::DefaultLocal);
    }

    #[test]
    fn test_prefer_remote_only_for_text_tasks() {
        let policy = policy().with_prefer_remote(true);
        let decision = policy.route(&Task::new(TaskType::Extraction, "p"), &SpendSnapshot::default());
        assert_eq!(decision.reason, RoutingReason::PreferRemote);

        let decision = policy.route(&Task::new(TaskType::Research, "p"), &SpendSnapshot::default());
        assert_eq!(decision.reason, RoutingReason::DefaultLocal);
    }

    #[test]
    fn test_model_override_applies_to_chosen_tier() {
        let task = Task::new(TaskType::Generation, "p")
            .with_model_override(Tier::Local, "llama3:70b")
            .with_model_override(Tier::Premium, "unused");
        let decision = policy().route(&task, &SpendSnapshot::default());
        assert_eq!(decision.tier, Tier::Local);
        assert_eq!(decision.model, "llama3:70b");
    }

    #[test]
    fn test_enabled_targets_always_include_local() {
        let mut policy = policy();
        policy.local = policy.local.clone().disabled();
        policy.mid = policy.mid.clone().disabled();
        let tiers: Vec<Tier> = policy.enabled_targets().map(|(t, _)| t).collect();
        assert_eq!(tiers, vec![Tier::Local, Tier::Premium, Tier::Vision]);
    }
}
