//! Shared fakes for proxy integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use llm_proxy::cache::PromptCache;
use llm_proxy::error::ProviderError;
use llm_proxy::executor::Executor;
use llm_proxy::ledger::CostLedger;
use llm_proxy::metrics::MetricsSink;
use llm_proxy::pricing::{ModelPrice, PricingTable, ReportedUsage};
use llm_proxy::providers::{
    ChunkStream, LlmProvider, ProviderOutput, ProviderRegistry, ProviderRequest, StreamChunk,
};
use llm_proxy::routing::{RoutingPolicy, TierTarget};
use llm_proxy::LlmProxy;

pub const LOCAL: &str = "ollama";
pub const REMOTE: &str = "openrouter";
pub const LOCAL_MODEL: &str = "qwen3:8b";
pub const MID_MODEL: &str = "mistral-small";
pub const PREMIUM_MODEL: &str = "claude-opus";
pub const VISION_MODEL: &str = "gpt-4o";

/// What a scripted provider does when called.
#[derive(Debug, Clone)]
pub enum Script {
    /// Reply with fixed text and usage.
    Reply(String),
    /// Stream these chunks, then report usage.
    Chunks(Vec<String>),
    /// Stream these chunks, then fail without reporting usage.
    ChunksThenFail(Vec<String>, ProviderError),
    /// Fail every call.
    Fail(ProviderError),
}

/// Provider that follows a script and counts its calls.
pub struct ScriptedProvider {
    name: String,
    local: bool,
    script: Script,
    /// Wait before the first response byte.
    delay: Duration,
    calls: AtomicU32,
}

impl ScriptedProvider {
    pub fn new(name: &str, local: bool, script: Script) -> Arc<Self> {
        Self::delayed(name, local, script, Duration::ZERO)
    }

    pub fn delayed(name: &str, local: bool, script: Script, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            local,
            script,
            delay,
            calls: AtomicU32::new(0),
        })
    }

    pub fn chunks(chunks: &[&str]) -> Vec<String> {
        chunks.iter().map(|c| c.to_string()).collect()
    }

    pub fn replying(name: &str, local: bool, text: &str) -> Arc<Self> {
        Self::new(name, local, Script::Reply(text.to_string()))
    }

    pub fn streaming(name: &str, local: bool, chunks: &[&str]) -> Arc<Self> {
        Self::new(name, local, Script::Chunks(Self::chunks(chunks)))
    }

    pub fn failing(name: &str, local: bool) -> Arc<Self> {
        Self::new(
            name,
            local,
            Script::Fail(ProviderError::Api {
                code: 502,
                message: "bad gateway".to_string(),
            }),
        )
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

fn usage(input: u32, output: u32) -> ReportedUsage {
    ReportedUsage {
        tokens_input: Some(input),
        tokens_output: Some(output),
        tokens_total: Some(input + output),
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_local(&self) -> bool {
        self.local
    }

    async fn execute(&self, _request: &ProviderRequest) -> Result<ProviderOutput, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        match &self.script {
            Script::Reply(text) => Ok(ProviderOutput {
                content: text.clone(),
                usage: usage(1_000, 500),
            }),
            Script::Chunks(chunks) => Ok(ProviderOutput {
                content: chunks.concat(),
                usage: usage(1_000, chunks.len() as u32),
            }),
            Script::Fail(e) | Script::ChunksThenFail(_, e) => Err(e.clone()),
        }
    }

    fn stream(&self, _request: ProviderRequest) -> ChunkStream<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.clone();
        let delay = self.delay;
        Box::pin(async_stream::stream! {
            tokio::time::sleep(delay).await;
            match script {
                Script::Reply(text) => {
                    yield Ok(StreamChunk::Text(text));
                    yield Ok(StreamChunk::Usage(usage(1_000, 500)));
                }
                Script::Chunks(chunks) => {
                    let n = chunks.len() as u32;
                    for chunk in chunks {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        yield Ok(StreamChunk::Text(chunk));
                    }
                    yield Ok(StreamChunk::Usage(usage(1_000, n)));
                }
                Script::ChunksThenFail(chunks, e) => {
                    for chunk in chunks {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        yield Ok(StreamChunk::Text(chunk));
                    }
                    yield Err(e);
                }
                Script::Fail(e) => yield Err(e),
            }
        })
    }
}

pub fn policy() -> RoutingPolicy {
    RoutingPolicy::new(
        TierTarget::new(LOCAL, LOCAL_MODEL),
        TierTarget::new(REMOTE, MID_MODEL),
        TierTarget::new(REMOTE, PREMIUM_MODEL),
        TierTarget::new(REMOTE, VISION_MODEL),
    )
}

pub fn pricing() -> PricingTable {
    PricingTable::new(LOCAL, ModelPrice::new(3.0, 15.0))
        .with_price(REMOTE, MID_MODEL, ModelPrice::new(0.1, 0.3))
}

/// Proxy over the given fakes with an in-memory cache.
pub fn build_proxy(
    policy: RoutingPolicy,
    local: Arc<ScriptedProvider>,
    remote: Arc<ScriptedProvider>,
    ledger: Arc<CostLedger>,
    metrics: Arc<dyn MetricsSink>,
) -> LlmProxy {
    let registry = ProviderRegistry::new(
        vec![local as Arc<dyn LlmProvider>, remote as Arc<dyn LlmProvider>],
        &policy,
    )
    .expect("valid registry");
    let executor = Executor::new(
        Arc::new(registry),
        Arc::new(pricing()),
        Duration::from_secs(5),
        policy.local_model(),
    );
    LlmProxy::new(
        policy,
        executor,
        ledger,
        Arc::new(PromptCache::in_memory()),
        metrics,
    )
}
