//! Name-to-backend lookup, validated at startup.

use std::collections::HashMap;
use std::sync::Arc;

use super::LlmProvider;
use crate::error::{ConfigError, ProviderError};
use crate::routing::RoutingPolicy;

/// Registered providers keyed by name.
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    local_provider: String,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("ProviderRegistry")
            .field("providers", &names)
            .field("local_provider", &self.local_provider)
            .finish()
    }
}

impl ProviderRegistry {
    /// Build a registry for `policy`.
    ///
    /// # Errors
    ///
    /// - `MissingLocalProvider` if the policy's local provider is not
    ///   registered, or is registered with a non-local backend.
    /// - `UnknownProvider` if an enabled tier names an unregistered provider.
    pub fn new(
        providers: Vec<Arc<dyn LlmProvider>>,
        policy: &RoutingPolicy,
    ) -> Result<Self, ConfigError> {
        let mut map: HashMap<String, Arc<dyn LlmProvider>> = HashMap::new();
        for provider in providers {
            let name = provider.name().to_string();
            if map.insert(name.clone(), provider).is_some() {
                return Err(ConfigError::ValidationFailed(format!(
                    "provider '{name}' registered twice"
                )));
            }
        }

        let local_provider = policy.local_provider().to_string();
        match map.get(&local_provider) {
            Some(provider) if provider.is_local() => {}
            _ => return Err(ConfigError::MissingLocalProvider(local_provider)),
        }

        for (tier, target) in policy.enabled_targets() {
            if !map.contains_key(&target.provider) {
                tracing::error!(
                    tier = tier.as_str(),
                    provider = %target.provider,
                    "Enabled tier references unregistered provider"
                );
                return Err(ConfigError::UnknownProvider(target.provider.clone()));
            }
        }

        Ok(Self {
            providers: map,
            local_provider,
        })
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::NotRegistered(name.to_string()))
    }

    pub fn local(&self) -> Result<Arc<dyn LlmProvider>, ProviderError> {
        self.get(&self.local_provider)
    }

    pub fn local_name(&self) -> &str {
        &self.local_provider
    }

    pub fn is_local(&self, name: &str) -> bool {
        name == self.local_provider
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::providers::{ProviderOutput, ProviderRequest};
    use crate::routing::TierTarget;
    use async_trait::async_trait;

    struct Stub {
        name: &'static str,
        local: bool,
    }

    #[async_trait]
    impl LlmProvider for Stub {
        fn name(&self) -> &str {
            self.name
        }
        fn is_local(&self) -> bool {
            self.local
        }
        async fn execute(&self, _: &ProviderRequest) -> Result<ProviderOutput, ProviderError> {
            Ok(ProviderOutput::default())
        }
    }

    fn stub(name: &'static str, local: bool) -> Arc<dyn LlmProvider> {
        Arc::new(Stub { name, local })
    }

    fn policy() -> RoutingPolicy {
        RoutingPolicy::new(
            TierTarget::new("ollama", "qwen3:8b"),
            TierTarget::new("openrouter", "mistral-small"),
            TierTarget::new("openrouter", "claude-opus"),
            TierTarget::new("openrouter", "gpt-4o").disabled(),
        )
    }

    #[test]
    fn test_valid_registry() {
        let registry =
            ProviderRegistry::new(vec![stub("ollama", true), stub("openrouter", false)], &policy())
                .unwrap();
        assert_eq!(registry.local_name(), "ollama");
        assert!(registry.get("openrouter").is_ok());
        assert!(matches!(
            registry.get("nope"),
            Err(ProviderError::NotRegistered(_))
        ));
        assert_eq!(registry.names(), vec!["ollama", "openrouter"]);
    }

    #[test]
    fn test_missing_local_provider_fails() {
        let result = ProviderRegistry::new(vec![stub("openrouter", false)], &policy());
        assert!(matches!(result, Err(ConfigError::MissingLocalProvider(ref n)) if n == "ollama"));
    }

    #[test]
    fn test_non_local_backend_as_local_fails() {
        let result =
            ProviderRegistry::new(vec![stub("ollama", false), stub("openrouter", false)], &policy());
        assert!(matches!(result, Err(ConfigError::MissingLocalProvider(_))));
    }

    #[test]
    fn test_unregistered_tier_provider_fails() {
        let result = ProviderRegistry::new(vec![stub("ollama", true)], &policy());
        assert!(matches!(result, Err(ConfigError::UnknownProvider(ref n)) if n == "openrouter"));
    }

    #[test]
    fn test_disabled_tier_is_not_checked() {
        let policy = RoutingPolicy::new(
            TierTarget::new("ollama", "qwen3:8b"),
            TierTarget::new("openrouter", "m").disabled(),
            TierTarget::new("anthropic", "p").disabled(),
            TierTarget::new("openrouter", "v").disabled(),
        );
        assert!(ProviderRegistry::new(vec![stub("ollama", true)], &policy).is_ok());
    }

    #[test]
    fn test_duplicate_names_fail() {
        let result = ProviderRegistry::new(
            vec![stub("ollama", true), stub("ollama", true), stub("openrouter", false)],
            &policy(),
        );
        assert!(matches!(result, Err(ConfigError::ValidationFailed(_))));
    }
}
