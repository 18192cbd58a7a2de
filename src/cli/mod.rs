//! Command-line surface: serve the control plane, run scripts one-shot,
//! and manage the profile catalog.

mod context;
mod profile;
mod run;
mod serve;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(
    name = "wheelhouse",
    version,
    about = "Browser automation orchestration core"
)]
pub struct CliArgs {
    /// Configuration file (defaults to ./wheelhouse.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `wheelhouse=debug,info`.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the REST + WebSocket control plane.
    Serve(serve::ServeArgs),
    /// Execute one script file and print the result as JSON.
    Run(run::RunArgs),
    /// Manage browser profiles.
    Profile {
        #[command(subcommand)]
        command: profile::ProfileCommand,
    },
}

/// Exit code contract: 0 normal, 1 fatal runtime error, 2 bad configuration.
pub async fn run() -> i32 {
    let cli = CliArgs::parse();
    init_logging(&cli.log_level, cli.json_logs);

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(target: "cli", error = %err, "configuration rejected");
            return 2;
        }
    };

    let outcome: Result<i32> = match cli.command {
        Command::Serve(args) => serve::execute(config, args).await,
        Command::Run(args) => run::execute(config, args).await,
        Command::Profile { command } => profile::execute(config, command).await,
    };

    match outcome {
        Ok(code) => code,
        Err(err) => {
            error!(target: "cli", error = %err, "command failed");
            1
        }
    }
}

fn init_logging(filter: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}
