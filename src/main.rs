//! llm-proxy CLI entry point.
//!
//! Logs go to stderr so that `generate` output on stdout stays pipeable.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = llm_proxy::cli::parse_cli();

    // RUST_LOG wins over --log-level.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_directives()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(filter)
        .init();

    llm_proxy::cli::run_with_cli(cli).await
}
