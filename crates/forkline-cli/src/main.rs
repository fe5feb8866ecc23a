//! forkline CLI
//!
//! Runs fork channels over an in-memory cluster and converts routing headers
//! to and from their wire encoding.

mod demo_cmd;
mod header_cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{debug, info};

use forkline_core::config::load_config;
use forkline_core::tracing_init::{default_filter, init_tracing};

#[derive(Parser, Debug)]
#[command(name = "forkline")]
#[command(version, about = "Many logical channels over one shared channel", long_about = None)]
struct Cli {
    /// Log level filter (e.g. "info", "debug"). Overrides the configured level.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    /// Directory holding `.forkline/settings.json`.
    #[arg(long, global = true, env = "FORKLINE_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fork channels on several in-memory nodes and exchange messages.
    Demo(demo_cmd::DemoArgs),
    /// Routing header encoding tools.
    Header {
        #[command(subcommand)]
        action: header_cmd::HeaderAction,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.project_dir.as_deref())?;
    if let Some(level) = cli.log_level {
        config.log.level = level;
    }
    if cli.log_json {
        config.log.json = true;
    }
    init_tracing(&default_filter(&config.log.level), config.log.json);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting forkline");
    debug!(config = ?config, "Resolved configuration");

    match cli.command {
        Command::Demo(args) => demo_cmd::run(args, config.mux).await,
        Command::Header { action } => header_cmd::run(action),
    }
}
