//! Command-line interface for llm-proxy.
//!
//! Provides commands for running requests and for inspecting spend, ledger
//! statistics and the prompt cache.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
