//! Execution adapter: timed provider calls, pricing and the one-shot fallback.
//!
//! A routed call runs as at most two attempts:
//!
//! 1. [`Attempt::Primary`] on the routed provider and model.
//! 2. [`Attempt::LocalFallback`] on the local provider with the local tier
//!    model, only when the primary failed and was not already local.
//!
//! There are no retries beyond that second attempt.

use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{ProviderError, ProxyError};
use crate::pricing::{PricingTable, ReportedUsage, ResolvedUsage};
use crate::providers::{ChunkStream, ProviderRegistry, ProviderRequest};
use crate::routing::RouteDecision;
use crate::task::{Response, Task};

/// Step of the fallback sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Primary,
    LocalFallback,
}

impl Attempt {
    pub fn as_str(&self) -> &'static str {
        match self {
            Attempt::Primary => "primary",
            Attempt::LocalFallback => "local_fallback",
        }
    }
}

/// Routing reason recorded when the local fallback served a request.
pub fn fallback_reason(failed_provider: &str, original_reason: &str) -> String {
    format!("fallback_from_{}:{}", failed_provider, original_reason)
}

/// Runs provider calls with a deadline and prices their usage.
pub struct Executor {
    registry: Arc<ProviderRegistry>,
    pricing: Arc<PricingTable>,
    timeout: Duration,
    local_model: String,
}

impl Executor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        pricing: Arc<PricingTable>,
        timeout: Duration,
        local_model: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            pricing,
            timeout,
            local_model: local_model.into(),
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis().min(u128::from(u64::MAX)) as u64
    }

    /// Local provider and model to retry on, if `primary_provider` is remote.
    pub fn fallback_target(&self, primary_provider: &str) -> Option<(String, String)> {
        if self.registry.is_local(primary_provider) {
            None
        } else {
            Some((self.registry.local_name().to_string(), self.local_model.clone()))
        }
    }

    /// Fill in missing token counts and compute the cost.
    pub fn price(
        &self,
        provider: &str,
        model: &str,
        usage: &ReportedUsage,
        prompt: &str,
        completion: &str,
    ) -> (ResolvedUsage, f64) {
        let resolved = usage.resolve(prompt, completion);
        let cost = self
            .pricing
            .cost(provider, model, resolved.tokens_input, resolved.tokens_output);
        (resolved, cost)
    }

    /// One timed call. `routing_reason` is left empty for the caller to set.
    pub async fn execute(
        &self,
        provider: &str,
        model: &str,
        task: &Task,
    ) -> Result<Response, ProviderError> {
        let backend = self.registry.get(provider)?;
        let request = ProviderRequest::from_task(task, model);
        let started = Instant::now();

        let output = match tokio::time::timeout(self.timeout, backend.execute(&request)).await {
            Ok(result) => result?,
            Err(_) => return Err(ProviderError::Timeout(self.timeout_ms())),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let (usage, cost_usd) =
            self.price(provider, model, &output.usage, &task.prompt, &output.content);

        Ok(Response {
            content: output.content,
            provider: provider.to_string(),
            model: model.to_string(),
            tokens_input: usage.tokens_input,
            tokens_output: usage.tokens_output,
            tokens_total: usage.tokens_total,
            cost_usd,
            latency_ms,
            routing_reason: String::new(),
            fallback_used: false,
            cost_estimated: usage.estimated,
        })
    }

    async fn attempt(
        &self,
        attempt: Attempt,
        provider: &str,
        model: &str,
        task: &Task,
    ) -> Result<Response, ProviderError> {
        debug!(
            task_id = %task.id,
            attempt = attempt.as_str(),
            provider,
            model,
            "Executing provider call"
        );
        let result = self.execute(provider, model, task).await;
        if let Err(e) = &result {
            warn!(
                task_id = %task.id,
                attempt = attempt.as_str(),
                provider,
                model,
                error = %e,
                "Provider call failed"
            );
        }
        result
    }

    /// Run the routed call, falling back once to the local provider.
    pub async fn execute_with_fallback(
        &self,
        decision: &RouteDecision,
        task: &Task,
    ) -> Result<Response, ProxyError> {
        let original_reason = decision.reason.as_str();

        let primary_error = match self
            .attempt(Attempt::Primary, &decision.provider, &decision.model, task)
            .await
        {
            Ok(mut response) => {
                response.routing_reason = original_reason.to_string();
                return Ok(response);
            }
            Err(e) => e,
        };

        let Some((local, local_model)) = self.fallback_target(&decision.provider) else {
            return Err(ProxyError::AllProvidersFailed {
                primary_provider: decision.provider.clone(),
                primary_error,
                fallback_error: None,
            });
        };

        match self
            .attempt(Attempt::LocalFallback, &local, &local_model, task)
            .await
        {
            Ok(mut response) => {
                response.fallback_used = true;
                response.routing_reason = fallback_reason(&decision.provider, original_reason);
                Ok(response)
            }
            Err(fallback_error) => Err(ProxyError::AllProvidersFailed {
                primary_provider: decision.provider.clone(),
                primary_error,
                fallback_error: Some(fallback_error),
            }),
        }
    }

    /// Open a token stream. Each chunk must arrive within the request timeout.
    pub fn open_stream(&self, provider: &str, model: &str, task: &Task) -> ChunkStream<'static> {
        let backend = self.registry.get(provider);
        let request = ProviderRequest::from_task(task, model);
        let timeout = self.timeout;
        let timeout_ms = self.timeout_ms();

        Box::pin(async_stream::stream! {
            let backend = match backend {
                Ok(backend) => backend,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            let mut inner = backend.stream(request);
            loop {
                match tokio::time::timeout(timeout, inner.next()).await {
                    Ok(Some(item)) => {
                        let failed = item.is_err();
                        yield item;
                        if failed {
                            return;
                        }
                    }
                    Ok(None) => return,
                    Err(_) => {
                        yield Err(ProviderError::Timeout(timeout_ms));
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::ModelPrice;
    use crate::providers::{LlmProvider, ProviderOutput, StreamChunk};
    use crate::routing::{RoutingPolicy, RoutingReason, TierTarget};
    use crate::task::{Tier, TaskType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Provider with a fixed reply, an optional failure and a call counter.
    struct MockProvider {
        name: &'static str,
        local: bool,
        fail: bool,
        delay: Duration,
        calls: AtomicU32,
    }

    impl MockProvider {
        fn new(name: &'static str, local: bool) -> Self {
            Self {
                name,
                local,
                fail: false,
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            }
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        fn name(&self) -> &str {
            self.name
        }
        fn is_local(&self) -> bool {
            self.local
        }
        async fn execute(&self, request: &ProviderRequest) -> Result<ProviderOutput, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(ProviderError::Request("Mock failure".to_string()));
            }
            let suffix = if request.think { " (thinking)" } else { "" };
            Ok(ProviderOutput {
                content: format!("{} says hi{}", self.name, suffix),
                usage: ReportedUsage {
                    tokens_input: Some(1000),
                    tokens_output: Some(500),
                    tokens_total: None,
                },
            })
        }
    }

    fn policy() -> RoutingPolicy {
        RoutingPolicy::new(
            TierTarget::new("local", "small"),
            TierTarget::new("remote", "mid"),
            TierTarget::new("remote", "big"),
            TierTarget::new("remote", "eyes"),
        )
    }

    fn executor(local: Arc<MockProvider>, remote: Arc<MockProvider>, timeout: Duration) -> Executor {
        let policy = policy();
        let registry = ProviderRegistry::new(
            vec![local as Arc<dyn LlmProvider>, remote as Arc<dyn LlmProvider>],
            &policy,
        )
        .unwrap();
        let pricing = PricingTable::new("local", ModelPrice::new(1.0, 2.0));
        Executor::new(Arc::new(registry), Arc::new(pricing), timeout, "small")
    }

    fn premium_decision() -> RouteDecision {
        RouteDecision {
            tier: Tier::Premium,
            provider: "remote".to_string(),
            model: "big".to_string(),
            reason: RoutingReason::CriticalQualityHighComplexity,
        }
    }

    #[tokio::test]
    async fn test_execute_prices_remote_calls() {
        let exec = executor(
            Arc::new(MockProvider::new("local", true)),
            Arc::new(MockProvider::new("remote", false)),
            Duration::from_secs(5),
        );
        let task = Task::new(TaskType::Generation, "hello");
        let response = exec.execute("remote", "big", &task).await.unwrap();
        assert_eq!(response.tokens_total, 1500);
        // 1000 * $1/1M + 500 * $2/1M
        assert!((response.cost_usd - 0.002).abs() < 1e-12);
        assert!(!response.cost_estimated);

        let response = exec.execute("local", "small", &task).await.unwrap();
        assert_eq!(response.cost_usd, 0.0);
    }

    #[tokio::test]
    async fn test_primary_success_keeps_reason() {
        let remote = Arc::new(MockProvider::new("remote", false));
        let local = Arc::new(MockProvider::new("local", true));
        let exec = executor(local.clone(), remote.clone(), Duration::from_secs(5));

        let task = Task::new(TaskType::Generation, "p");
        let response = exec.execute_with_fallback(&premium_decision(), &task).await.unwrap();
        assert_eq!(response.provider, "remote");
        assert_eq!(response.routing_reason, "critical_quality_high_complexity");
        assert!(!response.fallback_used);
        assert_eq!(local.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fallback_to_local_once() {
        let remote = Arc::new(MockProvider::new("remote", false).failing());
        let local = Arc::new(MockProvider::new("local", true));
        let exec = executor(local.clone(), remote.clone(), Duration::from_secs(5));

        let task = Task::new(TaskType::Generation, "p");
        let response = exec.execute_with_fallback(&premium_decision(), &task).await.unwrap();
        assert!(response.fallback_used);
        assert_eq!(response.provider, "local");
        assert_eq!(response.model, "small");
        assert_eq!(response.cost_usd, 0.0);
        assert_eq!(
            response.routing_reason,
            "fallback_from_remote:critical_quality_high_complexity"
        );
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
        assert_eq!(local.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_both_failures_surface_all_providers_failed() {
        let remote = Arc::new(MockProvider::new("remote", false).failing());
        let local = Arc::new(MockProvider::new("local", true).failing());
        let exec = executor(local.clone(), remote, Duration::from_secs(5));

        let task = Task::new(TaskType::Generation, "p");
        let err = exec
            .execute_with_fallback(&premium_decision(), &task)
            .await
            .unwrap_err();
        match err {
            ProxyError::AllProvidersFailed {
                primary_provider,
                fallback_error,
                ..
            } => {
                assert_eq!(primary_provider, "remote");
                assert!(fallback_error.is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(local.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_local_primary_failure_is_not_retried() {
        let local = Arc::new(MockProvider::new("local", true).failing());
        let exec = executor(
            local.clone(),
            Arc::new(MockProvider::new("remote", false)),
            Duration::from_secs(5),
        );
        let decision = RouteDecision {
            tier: Tier::Local,
            provider: "local".to_string(),
            model: "small".to_string(),
            reason: RoutingReason::DefaultLocal,
        };
        let err = exec
            .execute_with_fallback(&decision, &Task::new(TaskType::Generation, "p"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProxyError::AllProvidersFailed { fallback_error: None, .. }
        ));
        assert_eq!(local.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_triggers_fallback() {
        let remote = Arc::new(MockProvider::new("remote", false).slow(Duration::from_millis(500)));
        let local = Arc::new(MockProvider::new("local", true));
        let exec = executor(local, remote, Duration::from_millis(50));

        assert!(matches!(
            exec.execute("remote", "big", &Task::new(TaskType::Generation, "p")).await,
            Err(ProviderError::Timeout(50))
        ));

        let response = exec
            .execute_with_fallback(&premium_decision(), &Task::new(TaskType::Generation, "p"))
            .await
            .unwrap();
        assert!(response.fallback_used);
    }

    #[tokio::test]
    async fn test_deep_reasoning_reaches_provider() {
        let exec = executor(
            Arc::new(MockProvider::new("local", true)),
            Arc::new(MockProvider::new("remote", false)),
            Duration::from_secs(5),
        );
        let task = Task::new(TaskType::Research, "p").with_deep_reasoning();
        let response = exec.execute("local", "small", &task).await.unwrap();
        assert!(response.content.ends_with("(thinking)"));
    }

    #[tokio::test]
    async fn test_open_stream_unknown_provider() {
        let exec = executor(
            Arc::new(MockProvider::new("local", true)),
            Arc::new(MockProvider::new("remote", false)),
            Duration::from_secs(5),
        );
        let items: Vec<_> = exec
            .open_stream("ghost", "m", &Task::new(TaskType::Generation, "p"))
            .collect()
            .await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(ProviderError::NotRegistered(_))));
    }

    #[tokio::test]
    async fn test_open_stream_uses_default_single_chunk() {
        let exec = executor(
            Arc::new(MockProvider::new("local", true)),
            Arc::new(MockProvider::new("remote", false)),
            Duration::from_secs(5),
        );
        let items: Vec<_> = exec
            .open_stream("local", "small", &Task::new(TaskType::Generation, "p"))
            .collect()
            .await;
        assert!(matches!(
            items.first(),
            Some(Ok(StreamChunk::Text(t))) if t == "local says hi"
        ));
    }
}
