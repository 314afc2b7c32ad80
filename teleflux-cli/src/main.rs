//! Teleflux CLI - drives the streaming engine against the simulated backend.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use teleflux_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "teleflux")]
#[command(about = "Multi-bot chunked streaming engine")]
struct Cli {
    /// Console log level (RUST_LOG takes precedence)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Directory for the full-detail run log
    #[arg(long)]
    logs_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())?;

    commands::handle_command(cli.command).await
}
