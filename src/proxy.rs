//! Request orchestrator.
//!
//! [`LlmProxy::generate`] serves one task to completion:
//!
//! ```text
//! validate -> cache lookup -> hit: cached response
//!                          -> miss: route -> execute [-> local fallback]
//!                                   -> record cost -> populate cache -> metrics
//! ```
//!
//! [`LlmProxy::generate_streaming`] routes and streams tokens as
//! [`StreamEvent`]s. Streams bypass the cache and commit their cost only
//! once the serving stream has finished.

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::PromptCache;
use crate::config::ProxyConfig;
use crate::error::{ConfigError, ProviderError, ProxyError};
use crate::executor::{fallback_reason, Executor};
use crate::ledger::{CostLedger, LedgerEntry};
use crate::metrics::{MetricsSink, RequestSample, RequestStatus};
use crate::pricing::ReportedUsage;
use crate::providers::{ProviderRegistry, StreamChunk};
use crate::routing::{RouteDecision, RoutingPolicy};
use crate::task::{Response, Task};

/// Event of a streamed generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Sent when the first token of a stream arrives. `ttft_ms` counts from
    /// the start of the request, including any failed attempt before it.
    Metadata {
        provider: String,
        model: String,
        routing_reason: String,
        ttft_ms: u64,
    },
    Token {
        content: String,
    },
    /// The routed stream failed and the local provider takes over.
    Fallback {
        failed_provider: String,
        error: String,
    },
    Done {
        total_tokens: u32,
        latency_ms: u64,
        provider: String,
        model: String,
        cost_usd: f64,
        fallback_used: bool,
    },
}

/// Boxed stream of [`StreamEvent`]s.
pub type ProxyEventStream<'a> =
    Pin<Box<dyn Stream<Item = Result<StreamEvent, ProxyError>> + Send + 'a>>;

/// Routing, execution, cost accounting and caching behind one entry point.
pub struct LlmProxy {
    policy: RoutingPolicy,
    executor: Executor,
    ledger: Arc<CostLedger>,
    cache: Arc<PromptCache>,
    metrics: Arc<dyn MetricsSink>,
}

impl LlmProxy {
    pub fn new(
        policy: RoutingPolicy,
        executor: Executor,
        ledger: Arc<CostLedger>,
        cache: Arc<PromptCache>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            policy,
            executor,
            ledger,
            cache,
            metrics,
        }
    }

    /// Build every collaborator from `config`.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, a missing local provider, or when the
    /// ledger database or the cache backend cannot be opened.
    pub async fn from_config(
        config: &ProxyConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let policy = config.routing_policy();
        let registry = ProviderRegistry::new(config.build_providers()?, &policy)?;
        let executor = Executor::new(
            Arc::new(registry),
            Arc::new(config.pricing_table()),
            config.request_timeout(),
            policy.local_model(),
        );
        let ledger = CostLedger::open(&config.ledger_path).await?;
        let cache = PromptCache::connect(config.cache.clone()).await?;

        info!(
            local = policy.local_provider(),
            providers = ?executor.registry().names(),
            ledger = %config.ledger_path,
            "LLM proxy initialized"
        );

        Ok(Self::new(
            policy,
            executor,
            Arc::new(ledger),
            Arc::new(cache),
            metrics,
        ))
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn ledger(&self) -> &Arc<CostLedger> {
        &self.ledger
    }

    pub fn cache(&self) -> &Arc<PromptCache> {
        &self.cache
    }

    /// Route the task against current month-to-date spend.
    pub async fn route(&self, task: &Task) -> RouteDecision {
        let snapshot = self.ledger.snapshot().await;
        self.policy.route(task, &snapshot)
    }

    /// Serve `task` to completion.
    pub async fn generate(&self, task: &Task) -> Result<Response, ProxyError> {
        let started = Instant::now();
        task.validate()?;

        let namespace = task.namespace();
        let model_key = task.model_overrides.cache_label();

        if self.cache.is_enabled() {
            if let Some(content) = self.cache.get(namespace, &model_key, &task.prompt).await {
                self.observe_cache(true);
                debug!(task_id = %task.id, namespace, "Served from prompt cache");
                return Ok(Response::from_cache(
                    content,
                    model_key,
                    elapsed_ms(started),
                ));
            }
            self.observe_cache(false);
        }

        let decision = self.route(task).await;
        let response = match self.executor.execute_with_fallback(&decision, task).await {
            Ok(response) => response,
            Err(e) => {
                warn!(task_id = %task.id, provider = %decision.provider, error = %e, "Request failed");
                self.observe_failure(task, &decision, started);
                return Err(e);
            }
        };

        self.commit_cost(LedgerEntry::from_response(task, &response))
            .await;

        self.cache
            .put(
                namespace,
                &model_key,
                &task.prompt,
                &response.content,
                self.cache.ttl_for(task.task_type),
            )
            .await;

        if response.fallback_used {
            self.observe_fallback(&decision.provider);
        }
        self.observe_response(task, &response);

        info!(
            task_id = %task.id,
            provider = %response.provider,
            model = %response.model,
            tokens = response.tokens_total,
            cost_usd = response.cost_usd,
            latency_ms = response.latency_ms,
            reason = %response.routing_reason,
            "Request served"
        );

        Ok(response)
    }

    /// Route `task` and stream its tokens.
    ///
    /// A failing routed stream is replaced once by a fresh local stream,
    /// announced by [`StreamEvent::Fallback`]. Output a failed stream already
    /// delivered is billed to its provider before the fallback starts.
    /// Dropping the returned stream cancels the provider request and records
    /// no cost.
    pub fn generate_streaming(&self, task: Task) -> ProxyEventStream<'_> {
        Box::pin(async_stream::stream! {
            let started = Instant::now();
            if let Err(e) = task.validate() {
                yield Err(ProxyError::from(e));
                return;
            }

            let decision = self.route(&task).await;
            let original_reason = decision.reason.as_str();
            let mut provider = decision.provider.clone();
            let mut model = decision.model.clone();
            let mut routing_reason = original_reason.to_string();
            let mut primary_error: Option<ProviderError> = None;

            loop {
                let mut chunks = self.executor.open_stream(&provider, &model, &task);
                let mut content = String::new();
                let mut usage = ReportedUsage::default();
                let mut token_events: u32 = 0;
                let mut failure = None;

                while let Some(item) = chunks.next().await {
                    match item {
                        Ok(StreamChunk::Text(text)) => {
                            if text.is_empty() {
                                continue;
                            }
                            if token_events == 0 {
                                let ttft = started.elapsed();
                                if let Err(e) = self.metrics.record_ttft(&provider, &model, ttft.as_secs_f64()) {
                                    warn!(error = %e, "Failed to record time to first token");
                                }
                                yield Ok(StreamEvent::Metadata {
                                    provider: provider.clone(),
                                    model: model.clone(),
                                    routing_reason: routing_reason.clone(),
                                    ttft_ms: ttft.as_millis() as u64,
                                });
                            }
                            token_events += 1;
                            content.push_str(&text);
                            yield Ok(StreamEvent::Token { content: text });
                        }
                        Ok(StreamChunk::Usage(reported)) => usage = reported,
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                drop(chunks);

                let fallback_used = primary_error.is_some();
                let Some(error) = failure else {
                    let response = Response {
                        routing_reason,
                        fallback_used,
                        ..self.stream_response(&task, &provider, &model, &usage, content, started)
                    };
                    self.commit_cost(LedgerEntry::from_response(&task, &response)).await;
                    self.observe_response(&task, &response);
                    debug!(
                        task_id = %task.id,
                        provider = %response.provider,
                        tokens = token_events,
                        cost_usd = response.cost_usd,
                        "Stream completed"
                    );
                    yield Ok(StreamEvent::Done {
                        total_tokens: token_events,
                        latency_ms: response.latency_ms,
                        provider: response.provider,
                        model: response.model,
                        cost_usd: response.cost_usd,
                        fallback_used,
                    });
                    return;
                };

                if !content.is_empty() || usage != ReportedUsage::default() {
                    let partial = Response {
                        routing_reason: routing_reason.clone(),
                        fallback_used,
                        ..self.stream_response(&task, &provider, &model, &usage, content, started)
                    };
                    info!(
                        task_id = %task.id,
                        provider = %partial.provider,
                        tokens = partial.tokens_total,
                        cost_usd = partial.cost_usd,
                        "Billing output of failed stream"
                    );
                    self.commit_cost(LedgerEntry::from_response(&task, &partial)).await;
                }

                if let Some(primary_error) = primary_error.take() {
                    warn!(task_id = %task.id, error = %error, "Local fallback stream failed");
                    self.observe_failure(&task, &decision, started);
                    yield Err(ProxyError::AllProvidersFailed {
                        primary_provider: decision.provider.clone(),
                        primary_error,
                        fallback_error: Some(error),
                    });
                    return;
                }

                let Some((local, local_model)) = self.executor.fallback_target(&provider) else {
                    warn!(task_id = %task.id, provider = %provider, error = %error, "Local stream failed");
                    self.observe_failure(&task, &decision, started);
                    yield Err(ProxyError::AllProvidersFailed {
                        primary_provider: decision.provider.clone(),
                        primary_error: error,
                        fallback_error: None,
                    });
                    return;
                };

                warn!(
                    task_id = %task.id,
                    provider = %provider,
                    error = %error,
                    "Stream failed, falling back to local provider"
                );
                self.observe_fallback(&provider);
                yield Ok(StreamEvent::Fallback {
                    failed_provider: provider.clone(),
                    error: error.to_string(),
                });

                routing_reason = fallback_reason(&provider, original_reason);
                provider = local;
                model = local_model;
                primary_error = Some(error);
            }
        })
    }

    /// Priced response for streamed output. Routing fields are left for the
    /// caller to set.
    fn stream_response(
        &self,
        task: &Task,
        provider: &str,
        model: &str,
        usage: &ReportedUsage,
        content: String,
        started: Instant,
    ) -> Response {
        let (resolved, cost_usd) = self
            .executor
            .price(provider, model, usage, &task.prompt, &content);
        Response {
            content,
            provider: provider.to_string(),
            model: model.to_string(),
            tokens_input: resolved.tokens_input,
            tokens_output: resolved.tokens_output,
            tokens_total: resolved.tokens_total,
            cost_usd,
            latency_ms: elapsed_ms(started),
            routing_reason: String::new(),
            fallback_used: false,
            cost_estimated: resolved.estimated,
        }
    }

    /// Append the entry on a spawned task and wait for it, so a cancelled
    /// caller cannot split the insert from the aggregate update.
    async fn commit_cost(&self, entry: LedgerEntry) {
        let ledger = Arc::clone(&self.ledger);
        let task_id = entry.task_id.clone();
        let handle = tokio::spawn(async move { ledger.record(&entry).await });
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task_id = %task_id, error = %e, "Failed to record cost"),
            Err(e) => warn!(task_id = %task_id, error = %e, "Cost recording task aborted"),
        }
    }

    fn observe_cache(&self, hit: bool) {
        if let Err(e) = self.metrics.record_cache(hit) {
            warn!(error = %e, "Failed to record cache metric");
        }
    }

    fn observe_fallback(&self, failed_provider: &str) {
        if let Err(e) = self.metrics.record_fallback(failed_provider) {
            warn!(error = %e, "Failed to record fallback metric");
        }
    }

    fn observe_response(&self, task: &Task, response: &Response) {
        let status = if response.fallback_used {
            RequestStatus::Fallback
        } else {
            RequestStatus::Success
        };
        let sample = RequestSample {
            provider: &response.provider,
            model: &response.model,
            task_type: task.task_type.as_str(),
            status,
            latency_secs: response.latency_ms as f64 / 1000.0,
            tokens_input: response.tokens_input,
            tokens_output: response.tokens_output,
            cost_usd: response.cost_usd,
        };
        if let Err(e) = self.metrics.record_request(&sample) {
            warn!(error = %e, "Failed to record request metric");
        }
    }

    fn observe_failure(&self, task: &Task, decision: &RouteDecision, started: Instant) {
        let sample = RequestSample {
            provider: &decision.provider,
            model: &decision.model,
            task_type: task.task_type.as_str(),
            status: RequestStatus::Error,
            latency_secs: started.elapsed().as_secs_f64(),
            tokens_input: 0,
            tokens_output: 0,
            cost_usd: 0.0,
        };
        if let Err(e) = self.metrics.record_request(&sample) {
            warn!(error = %e, "Failed to record request metric");
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use crate::pricing::{ModelPrice, PricingTable};
    use crate::providers::{LlmProvider, ProviderOutput, ProviderRequest};
    use crate::routing::TierTarget;
    use crate::task::{Complexity, DataClassification, QualityRequirement, TaskType};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Echo {
        name: &'static str,
        local: bool,
        fail: bool,
        calls: AtomicU32,
    }

    impl Echo {
        fn new(name: &'static str, local: bool, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                local,
                fail,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmProvider for Echo {
        fn name(&self) -> &str {
            self.name
        }
        fn is_local(&self) -> bool {
            self.local
        }
        async fn execute(&self, request: &ProviderRequest) -> Result<ProviderOutput, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::Api {
                    code: 503,
                    message: "overloaded".to_string(),
                });
            }
            Ok(ProviderOutput {
                content: format!("{}:{}", self.name, request.model),
                usage: ReportedUsage {
                    tokens_input: Some(200),
                    tokens_output: Some(100),
                    tokens_total: None,
                },
            })
        }
    }

    async fn proxy(local: Arc<Echo>, remote: Arc<Echo>) -> LlmProxy {
        let policy = RoutingPolicy::new(
            TierTarget::new("local", "small"),
            TierTarget::new("remote", "mid"),
            TierTarget::new("remote", "big"),
            TierTarget::new("remote", "eyes"),
        );
        let registry = ProviderRegistry::new(
            vec![local as Arc<dyn LlmProvider>, remote as Arc<dyn LlmProvider>],
            &policy,
        )
        .unwrap();
        let executor = Executor::new(
            Arc::new(registry),
            Arc::new(PricingTable::new("local", ModelPrice::new(1.0, 1.0))),
            Duration::from_secs(5),
            policy.local_model(),
        );
        LlmProxy::new(
            policy,
            executor,
            Arc::new(CostLedger::in_memory().await.unwrap()),
            Arc::new(PromptCache::in_memory()),
            Arc::new(NoopMetrics),
        )
    }

    fn critical_task(prompt: &str) -> Task {
        Task::new(TaskType::Generation, prompt)
            .with_quality(QualityRequirement::Critical)
            .with_complexity(Complexity::High)
    }

    #[tokio::test]
    async fn test_generate_records_cost_and_caches() {
        let remote = Echo::new("remote", false, false);
        let proxy = proxy(Echo::new("local", true, false), remote.clone()).await;

        let first = proxy.generate(&critical_task("summarize")).await.unwrap();
        assert_eq!(first.provider, "remote");
        assert_eq!(first.content, "remote:big");
        assert!(first.cost_usd > 0.0);

        let spent = proxy.ledger().monthly_spending(Some("remote")).await.unwrap();
        assert!((spent["remote"] - first.cost_usd).abs() < 1e-9);

        let second = proxy.generate(&critical_task("summarize")).await.unwrap();
        assert_eq!(second.provider, Response::CACHE_PROVIDER);
        assert_eq!(second.routing_reason, Response::CACHE_HIT_REASON);
        assert_eq!(second.content, "remote:big");
        assert_eq!(second.cost_usd, 0.0);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 1);
        assert_eq!(proxy.ledger().store().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_validation_happens_before_any_call() {
        let local = Echo::new("local", true, false);
        let proxy = proxy(local.clone(), Echo::new("remote", false, false)).await;

        let err = proxy
            .generate(&Task::new(TaskType::Generation, ""))
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(local.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sensitive_task_never_leaves_local() {
        let remote = Echo::new("remote", false, false);
        let proxy = proxy(Echo::new("local", true, false), remote.clone()).await;

        let task = critical_task("patient notes").with_classification(DataClassification::Hipaa);
        let response = proxy.generate(&task).await.unwrap();
        assert_eq!(response.provider, "local");
        assert_eq!(response.routing_reason, "sensitive_data_local_only");
        assert_eq!(response.cost_usd, 0.0);
        assert_eq!(remote.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached_or_recorded() {
        let proxy = proxy(
            Echo::new("local", true, true),
            Echo::new("remote", false, true),
        )
        .await;

        let err = proxy.generate(&critical_task("p")).await.unwrap_err();
        assert!(matches!(
            err.last_provider_error(),
            Some(ProviderError::Api { code: 503, .. })
        ));
        assert_eq!(proxy.ledger().store().count().await.unwrap(), 0);
        assert_eq!(proxy.cache().get("default", "auto", "p").await, None);
    }

    #[tokio::test]
    async fn test_stream_fallback_restarts_on_local() {
        let proxy = proxy(
            Echo::new("local", true, false),
            Echo::new("remote", false, true),
        )
        .await;

        let events: Vec<_> = proxy
            .generate_streaming(critical_task("p"))
            .collect()
            .await;
        let events: Vec<StreamEvent> = events.into_iter().map(Result::unwrap).collect();

        assert!(matches!(
            &events[0],
            StreamEvent::Fallback { failed_provider, .. } if failed_provider == "remote"
        ));
        assert!(matches!(
            &events[1],
            StreamEvent::Metadata { provider, routing_reason, .. }
                if provider == "local"
                    && routing_reason == "fallback_from_remote:critical_quality_high_complexity"
        ));
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Done { fallback_used: true, cost_usd, .. }) if *cost_usd == 0.0
        ));

        let recent = proxy.ledger().recent_entries(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert!(recent[0].fallback_used);
    }

    #[tokio::test]
    async fn test_dropped_stream_records_nothing() {
        let proxy = proxy(
            Echo::new("local", true, false),
            Echo::new("remote", false, false),
        )
        .await;

        let mut stream = proxy.generate_streaming(critical_task("p"));
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, StreamEvent::Metadata { .. }));
        drop(stream);

        assert_eq!(proxy.ledger().store().count().await.unwrap(), 0);
    }

    #[test]
    fn test_stream_event_json_shape() {
        let event = StreamEvent::Token {
            content: "hi".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "token");
        assert_eq!(json["content"], "hi");
    }
}
