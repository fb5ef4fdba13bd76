//! llm-proxy: cost-aware routing of LLM requests.
//!
//! Each request is routed to a local or cloud model based on data
//! sensitivity, task type, quality requirements and month-to-date spend,
//! executed with a one-shot local fallback, priced into a persistent cost
//! ledger and cached by namespace.

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod metrics;
pub mod pricing;
pub mod providers;
pub mod proxy;
pub mod routing;
pub mod task;

// Re-export commonly used types
pub use config::ProxyConfig;
pub use error::{ConfigError, ProviderError, ProxyError, ValidationError};
pub use proxy::{LlmProxy, ProxyEventStream, StreamEvent};
pub use routing::{RouteDecision, RoutingPolicy, RoutingReason};
pub use task::{Complexity, DataClassification, QualityRequirement, Response, Task, TaskType};
