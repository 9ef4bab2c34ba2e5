//! # tg-daemon
//!
//! Taint Guard hook bridge.
//!
//! The host agent runtime spawns this process and writes one JSON envelope
//! per lifecycle event to its stdin. Every envelope gets exactly one
//! response line on stdout, in order. Confirmation challenges for the owner
//! are interleaved on the same stream, ahead of the response that caused
//! them.
//!
//! ## Usage
//!
//! ```text
//! tg-daemon --config ~/.config/taintguard/guard.toml
//! ```
//!
//! ```json
//! {"id": 1, "session_key": "tg:42", "event": {"type": "pre_model_call", "tools": ["read", "exec"], "iteration": 1}}
//! ```

mod bridge;
mod protocol;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tg_hooks::{GuardConfig, TaintGuard};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use crate::bridge::{serve, ChannelNotifier};

/// Taint Guard hook bridge.
#[derive(Parser)]
#[command(name = "tg-daemon", about = "Taint Guard hook bridge on stdio")]
struct Cli {
    /// Guard configuration file (toml, yaml or json). Built-in defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for watermarks, staged writes and the audit log.
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Emit logs as JSON objects.
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) -> Result<()> {
    // Logs go to stderr; stdout carries the protocol.
    let filter = EnvFilter::from_default_env()
        .add_directive("tg_hooks=info".parse()?)
        .add_directive("tg_daemon=info".parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json)?;

    let mut config = match &cli.config {
        Some(path) => GuardConfig::load_or_default(path),
        None => GuardConfig::default(),
    };
    if let Some(dir) = cli.state_dir {
        config = config.with_state_dir(dir);
    }

    tracing::info!(state_dir = %config.state_dir().display(), "starting taint guard");

    let (notifier, mut challenges) = ChannelNotifier::channel();
    let guard = Arc::new(TaintGuard::new(config)?.with_notifier(Box::new(notifier)));
    for warning in guard.warnings() {
        tracing::warn!(%warning, "startup");
    }

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    tokio::select! {
        result = serve(guard.clone(), &mut challenges, stdin, stdout) => {
            match result {
                Ok(stats) => tracing::info!(
                    events = stats.events,
                    malformed = stats.malformed,
                    challenges = stats.challenges,
                    "input closed"
                ),
                Err(e) => tracing::error!(error = %e, "bridge failed"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
        }
    }

    let flushing = guard.clone();
    match tokio::task::spawn_blocking(move || flushing.flush()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "failed to flush state at shutdown"),
        Err(e) => tracing::warn!(error = %e, "flush task failed"),
    }

    tracing::info!("taint guard shutting down");
    Ok(())
}
