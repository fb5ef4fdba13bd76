//! Operator CLI command definitions for llm-proxy.
//!
//! Every command loads the proxy configuration (YAML file overlaid with
//! `PROXY_*` variables) and works against the configured ledger and cache.

use clap::Parser;
use futures::StreamExt;
use std::io::Write;
use std::sync::Arc;
use tracing::info;

use crate::cache::PromptCache;
use crate::config::ProxyConfig;
use crate::ledger::CostLedger;
use crate::metrics::PrometheusMetrics;
use crate::proxy::{LlmProxy, StreamEvent};
use crate::task::{Complexity, DataClassification, QualityRequirement, Task, TaskType};

/// Cost-aware LLM request router.
#[derive(Parser)]
#[command(name = "llm-proxy")]
#[command(about = "Route LLM requests across local and cloud providers under monthly budgets")]
#[command(version)]
#[command(
    long_about = "llm-proxy routes each request to a local or cloud model based on data sensitivity, \
                  task type, quality requirements and month-to-date spend.\n\n\
                  Example usage:\n  llm-proxy generate --prompt \"Summarize this\" --quality high --complexity high"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// YAML configuration file. `PROXY_*` variables override its values.
    #[arg(short, long, global = true, env = "PROXY_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error) or filter directives.
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Dependencies that log every statement or connection at `info`.
const NOISY_TARGETS: &[&str] = &["sqlx", "hyper", "reqwest", "redis"];

impl Cli {
    /// `tracing` filter directives for `--log-level`.
    ///
    /// A bare level applies to llm-proxy while `NOISY_TARGETS` stay at
    /// `warn`, except at `trace`. A value that already holds directives
    /// (`a=debug,b=info`) is used as given.
    pub fn log_directives(&self) -> String {
        let level = self.log_level.trim();
        if level.contains('=') || level.contains(',') || level.eq_ignore_ascii_case("trace") {
            return level.to_string();
        }
        let mut directives = vec![level.to_string()];
        directives.extend(NOISY_TARGETS.iter().map(|target| format!("{target}=warn")));
        directives.join(",")
    }
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Route and run one request.
    #[command(alias = "gen")]
    Generate(GenerateArgs),

    /// Month-to-date spending per provider.
    Spend(SpendArgs),

    /// Ledger statistics as JSON.
    Stats(StatsArgs),

    /// Delete every cached response of a namespace.
    Invalidate(InvalidateArgs),

    /// Prompt cache statistics as JSON.
    CacheStats,
}

/// Arguments for `llm-proxy generate`.
#[derive(Parser, Debug)]
pub struct GenerateArgs {
    /// Prompt text.
    #[arg(short, long)]
    pub prompt: String,

    /// Task type (research, extraction, generation, embedding, vision, ...).
    #[arg(short = 't', long, default_value = "generation")]
    pub task_type: TaskType,

    /// Data classification (public, pii, hipaa, confidential).
    #[arg(long, default_value = "public")]
    pub classification: DataClassification,

    /// Quality requirement (low, standard, high, critical).
    #[arg(short, long, default_value = "standard")]
    pub quality: QualityRequirement,

    /// Complexity (low, medium, high, very_high).
    #[arg(long, default_value = "medium")]
    pub complexity: Complexity,

    /// Cache namespace.
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Maximum tokens to generate.
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Enable the model's reasoning mode.
    #[arg(long)]
    pub think: bool,

    /// Stream tokens as they arrive.
    #[arg(short, long)]
    pub stream: bool,

    /// Print Prometheus metrics to stderr when done.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `llm-proxy spend`.
#[derive(Parser, Debug)]
pub struct SpendArgs {
    /// Only this provider.
    #[arg(short, long)]
    pub provider: Option<String>,
}

/// Arguments for `llm-proxy stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Window in days.
    #[arg(short, long, default_value = "30")]
    pub days: u32,

    /// Only this provider.
    #[arg(short, long)]
    pub provider: Option<String>,
}

/// Arguments for `llm-proxy invalidate`.
#[derive(Parser, Debug)]
pub struct InvalidateArgs {
    /// Namespace to clear.
    #[arg(short, long)]
    pub namespace: String,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Generate(args) => run_generate_command(&config, args).await,
        Commands::Spend(args) => run_spend_command(&config, args).await,
        Commands::Stats(args) => run_stats_command(&config, args).await,
        Commands::Invalidate(args) => run_invalidate_command(&config, args).await,
        Commands::CacheStats => run_cache_stats_command(&config).await,
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<ProxyConfig> {
    let mut config = match path {
        Some(path) => {
            info!(path, "Loading configuration file");
            ProxyConfig::from_yaml_file(path)
                .map_err(|e| anyhow::anyhow!("Failed to load config '{}': {}", path, e))?
        }
        None => ProxyConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

fn build_task(args: &GenerateArgs) -> Task {
    let mut task = Task::new(args.task_type, args.prompt.clone())
        .with_classification(args.classification)
        .with_quality(args.quality)
        .with_complexity(args.complexity);
    if let Some(namespace) = &args.namespace {
        task = task.with_namespace(namespace.clone());
    }
    if let Some(max_tokens) = args.max_tokens {
        task = task.with_max_tokens(max_tokens);
    }
    if args.think {
        task = task.with_deep_reasoning();
    }
    task
}

async fn run_generate_command(config: &ProxyConfig, args: GenerateArgs) -> anyhow::Result<()> {
    let metrics = Arc::new(PrometheusMetrics::new()?);
    let proxy = LlmProxy::from_config(config, metrics.clone()).await?;
    let task = build_task(&args);

    if args.stream {
        let mut events = proxy.generate_streaming(task);
        let mut stdout = std::io::stdout();
        while let Some(event) = events.next().await {
            match event? {
                StreamEvent::Token { content } => {
                    write!(stdout, "{}", content)?;
                    stdout.flush()?;
                }
                StreamEvent::Metadata {
                    provider,
                    model,
                    routing_reason,
                    ttft_ms,
                } => {
                    eprintln!("[{provider}/{model}] {routing_reason} (ttft {ttft_ms} ms)");
                }
                StreamEvent::Fallback {
                    failed_provider,
                    error,
                } => {
                    eprintln!("\n[fallback] {failed_provider} failed: {error}");
                }
                done @ StreamEvent::Done { .. } => {
                    writeln!(stdout)?;
                    eprintln!("{}", serde_json::to_string(&done)?);
                }
            }
        }
    } else {
        let response = proxy.generate(&task).await?;
        println!("{}", serde_json::to_string_pretty(&response)?);
    }

    if args.metrics {
        eprintln!("{}", metrics.export()?);
    }
    proxy.ledger().close().await;
    Ok(())
}

async fn run_spend_command(config: &ProxyConfig, args: SpendArgs) -> anyhow::Result<()> {
    let ledger = CostLedger::open(&config.ledger_path).await?;
    let spending = ledger.monthly_spending(args.provider.as_deref()).await?;

    let mut providers: Vec<_> = spending.into_iter().collect();
    providers.sort_by(|a, b| a.0.cmp(&b.0));

    if providers.is_empty() {
        println!("No spending recorded this month");
    }
    for (provider, spent) in providers {
        match config.budgets.get(&provider).filter(|limit| **limit > 0.0) {
            Some(limit) => println!("{provider:<20} ${spent:>10.4} / ${limit:.2}"),
            None => println!("{provider:<20} ${spent:>10.4}"),
        }
    }
    ledger.close().await;
    Ok(())
}

async fn run_stats_command(config: &ProxyConfig, args: StatsArgs) -> anyhow::Result<()> {
    let ledger = CostLedger::open(&config.ledger_path).await?;
    let stats = ledger.stats(args.days, args.provider.as_deref()).await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    ledger.close().await;
    Ok(())
}

async fn run_invalidate_command(config: &ProxyConfig, args: InvalidateArgs) -> anyhow::Result<()> {
    let cache = PromptCache::connect(config.cache.clone()).await?;
    let removed = cache.invalidate_namespace(&args.namespace).await;
    println!("Removed {removed} cached entries from namespace '{}'", args.namespace);
    Ok(())
}

async fn run_cache_stats_command(config: &ProxyConfig) -> anyhow::Result<()> {
    let cache = PromptCache::connect(config.cache.clone()).await?;
    let stats = cache.stats().await;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_generate_args() {
        let cli = Cli::try_parse_from([
            "llm-proxy",
            "--log-level",
            "debug",
            "generate",
            "--prompt",
            "hello",
            "--task-type",
            "research",
            "--classification",
            "pii",
            "--quality",
            "critical",
            "--complexity",
            "very_high",
            "--namespace",
            "docs",
            "--stream",
        ])
        .unwrap();

        assert_eq!(cli.log_level, "debug");
        let Commands::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        assert!(args.stream);

        let task = build_task(&args);
        assert_eq!(task.task_type, TaskType::Research);
        assert_eq!(task.data_classification, DataClassification::Pii);
        assert_eq!(task.quality_requirement, QualityRequirement::Critical);
        assert_eq!(task.complexity, Complexity::VeryHigh);
        assert_eq!(task.namespace(), "docs");
        assert!(!task.deep_reasoning);
    }

    #[test]
    fn test_log_directives_quiet_dependencies() {
        let cli = Cli::try_parse_from(["llm-proxy", "cache-stats"]).unwrap();
        assert_eq!(
            cli.log_directives(),
            "info,sqlx=warn,hyper=warn,reqwest=warn,redis=warn"
        );

        let cli = Cli::try_parse_from(["llm-proxy", "-l", "trace", "cache-stats"]).unwrap();
        assert_eq!(cli.log_directives(), "trace");

        let cli = Cli::try_parse_from(["llm-proxy", "-l", "llm_proxy=debug,sqlx=info", "cache-stats"])
            .unwrap();
        assert_eq!(cli.log_directives(), "llm_proxy=debug,sqlx=info");
    }

    #[test]
    fn test_rejects_unknown_task_type() {
        let result = Cli::try_parse_from(["llm-proxy", "generate", "--prompt", "x", "--task-type", "poetry"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_maintenance_commands() {
        let cli = Cli::try_parse_from(["llm-proxy", "invalidate", "--namespace", "docs"]).unwrap();
        assert!(matches!(cli.command, Commands::Invalidate(ref a) if a.namespace == "docs"));

        let cli = Cli::try_parse_from(["llm-proxy", "stats", "--days", "7"]).unwrap();
        assert!(matches!(cli.command, Commands::Stats(ref a) if a.days == 7));

        let cli = Cli::try_parse_from(["llm-proxy", "cache-stats"]).unwrap();
        assert!(matches!(cli.command, Commands::CacheStats));
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.yaml");
        std::fs::write(&path, "ledger_path: /tmp/ledger.db\n").unwrap();
        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.ledger_path, "/tmp/ledger.db");
    }
}
