//! # tg-cli
//!
//! Operator command-line interface for Taint Guard.
//!
//! Works directly on the guard's state directory:
//! - `tg watermark list/show/reset` — inspect and clear session watermarks
//! - `tg policy check/explain/migrate` — validate and debug a guard config
//! - `tg staged list/show/apply/discard` — review writes held back by the guard
//! - `tg audit verify/tail` — inspect the security audit log

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tg_hooks::GuardConfig;
use tracing_subscriber::EnvFilter;

/// Taint Guard CLI — inspect taint state and review held-back actions.
#[derive(Parser)]
#[command(name = "tg", version, about)]
struct Cli {
    /// Guard configuration file (toml, yaml or json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// State directory (overrides the config's `state_dir`).
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and reset session watermarks.
    Watermark {
        #[command(subcommand)]
        command: commands::watermark::WatermarkCommands,
    },
    /// Validate and explain the taint policy.
    Policy {
        #[command(subcommand)]
        command: commands::policy::PolicyCommands,
    },
    /// Review writes staged instead of executed.
    Staged {
        #[command(subcommand)]
        command: commands::staged::StagedCommands,
    },
    /// Inspect the security audit log.
    Audit {
        #[command(subcommand)]
        command: commands::audit::AuditCommands,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("warn".parse()?))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => GuardConfig::load_or_default(path),
        None => GuardConfig::default(),
    };
    if let Some(dir) = &cli.state_dir {
        config = config.with_state_dir(dir);
    }

    match &cli.command {
        Commands::Watermark { command } => commands::watermark::execute(command, &config),
        Commands::Policy { command } => {
            commands::policy::execute(command, cli.config.as_deref(), &config)
        }
        Commands::Staged { command } => commands::staged::execute(command, &config),
        Commands::Audit { command } => commands::audit::execute(command, &config),
    }
}
