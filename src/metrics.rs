//! Request metrics.
//!
//! The proxy reports through the [`MetricsSink`] trait. [`PrometheusMetrics`]
//! owns its own `prometheus::Registry` (no global state) and renders the text
//! exposition format; [`NoopMetrics`] discards everything.

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};

use crate::error::MetricsError;

/// Outcome label for a served request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Success,
    Fallback,
    Error,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Fallback => "fallback",
            RequestStatus::Error => "error",
        }
    }
}

/// One completed (or failed) request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSample<'a> {
    pub provider: &'a str,
    pub model: &'a str,
    pub task_type: &'a str,
    pub status: RequestStatus,
    pub latency_secs: f64,
    pub tokens_input: u32,
    pub tokens_output: u32,
    pub cost_usd: f64,
}

/// Destination for proxy metrics. Errors are logged by the caller and never
/// fail a request.
pub trait MetricsSink: Send + Sync {
    fn record_request(&self, sample: &RequestSample<'_>) -> Result<(), MetricsError>;

    fn record_cache(&self, hit: bool) -> Result<(), MetricsError>;

    /// A request on `failed_provider` was served by the local fallback.
    fn record_fallback(&self, failed_provider: &str) -> Result<(), MetricsError>;

    /// Time to first token of a stream.
    fn record_ttft(&self, provider: &str, model: &str, secs: f64) -> Result<(), MetricsError>;
}

/// Sink that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_request(&self, _: &RequestSample<'_>) -> Result<(), MetricsError> {
        Ok(())
    }

    fn record_cache(&self, _: bool) -> Result<(), MetricsError> {
        Ok(())
    }

    fn record_fallback(&self, _: &str) -> Result<(), MetricsError> {
        Ok(())
    }

    fn record_ttft(&self, _: &str, _: &str, _: f64) -> Result<(), MetricsError> {
        Ok(())
    }
}

/// Prometheus-backed sink.
pub struct PrometheusMetrics {
    registry: Registry,
    requests_total: CounterVec,
    tokens_total: CounterVec,
    cost_usd_total: CounterVec,
    cache_requests_total: CounterVec,
    fallbacks_total: CounterVec,
    latency_seconds: HistogramVec,
    ttft_seconds: HistogramVec,
}

impl PrometheusMetrics {
    /// Create and register every metric in a fresh registry.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let requests_total = CounterVec::new(
            Opts::new("llm_proxy_requests_total", "Total proxied LLM requests"),
            &["provider", "model", "task_type", "status"],
        )?;

        let tokens_total = CounterVec::new(
            Opts::new("llm_proxy_tokens_total", "Total tokens used"),
            &["provider", "model", "type"],
        )?;

        let cost_usd_total = CounterVec::new(
            Opts::new("llm_proxy_cost_usd_total", "Total provider cost in USD"),
            &["provider", "model"],
        )?;

        let cache_requests_total = CounterVec::new(
            Opts::new("llm_proxy_cache_requests_total", "Prompt cache lookups"),
            &["result"],
        )?;

        let fallbacks_total = CounterVec::new(
            Opts::new(
                "llm_proxy_fallbacks_total",
                "Requests served by the local fallback",
            ),
            &["provider"],
        )?;

        let latency_seconds = HistogramVec::new(
            HistogramOpts::new("llm_proxy_latency_seconds", "Request latency in seconds")
                .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
            &["provider", "model"],
        )?;

        let ttft_seconds = HistogramVec::new(
            HistogramOpts::new("llm_proxy_ttft_seconds", "Stream time to first token in seconds")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]),
            &["provider", "model"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(tokens_total.clone()))?;
        registry.register(Box::new(cost_usd_total.clone()))?;
        registry.register(Box::new(cache_requests_total.clone()))?;
        registry.register(Box::new(fallbacks_total.clone()))?;
        registry.register(Box::new(latency_seconds.clone()))?;
        registry.register(Box::new(ttft_seconds.clone()))?;

        tracing::info!("Prometheus metrics initialized");

        Ok(Self {
            registry,
            requests_total,
            tokens_total,
            cost_usd_total,
            cache_requests_total,
            fallbacks_total,
            latency_seconds,
            ttft_seconds,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the Prometheus text format.
    pub fn export(&self) -> Result<String, MetricsError> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encode(e.to_string()))
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_request(&self, sample: &RequestSample<'_>) -> Result<(), MetricsError> {
        self.requests_total
            .get_metric_with_label_values(&[
                sample.provider,
                sample.model,
                sample.task_type,
                sample.status.as_str(),
            ])?
            .inc();

        if sample.status == RequestStatus::Error {
            return Ok(());
        }

        self.latency_seconds
            .get_metric_with_label_values(&[sample.provider, sample.model])?
            .observe(sample.latency_secs);
        self.tokens_total
            .get_metric_with_label_values(&[sample.provider, sample.model, "input"])?
            .inc_by(f64::from(sample.tokens_input));
        self.tokens_total
            .get_metric_with_label_values(&[sample.provider, sample.model, "output"])?
            .inc_by(f64::from(sample.tokens_output));
        if sample.cost_usd > 0.0 {
            self.cost_usd_total
                .get_metric_with_label_values(&[sample.provider, sample.model])?
                .inc_by(sample.cost_usd);
        }
        Ok(())
    }

    fn record_cache(&self, hit: bool) -> Result<(), MetricsError> {
        let result = if hit { "hit" } else { "miss" };
        self.cache_requests_total
            .get_metric_with_label_values(&[result])?
            .inc();
        Ok(())
    }

    fn record_fallback(&self, failed_provider: &str) -> Result<(), MetricsError> {
        self.fallbacks_total
            .get_metric_with_label_values(&[failed_provider])?
            .inc();
        Ok(())
    }

    fn record_ttft(&self, provider: &str, model: &str, secs: f64) -> Result<(), MetricsError> {
        self.ttft_seconds
            .get_metric_with_label_values(&[provider, model])?
            .observe(secs);
        Ok(())
    }
}
