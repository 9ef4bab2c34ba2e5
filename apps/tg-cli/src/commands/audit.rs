// audit.rs — Audit subcommands: verify, tail.

use std::path::PathBuf;

use clap::Subcommand;
use tg_audit::{AuditError, AuditLog};
use tg_hooks::GuardConfig;

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Verify the security log's hash chain.
    Verify {
        /// Path to the log (defaults to <state_dir>/security.jsonl).
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Show recent security events.
    Tail {
        /// Path to the log (defaults to <state_dir>/security.jsonl).
        #[arg(long)]
        log: Option<PathBuf>,
        /// Number of events to show.
        #[arg(short, default_value = "20")]
        n: usize,
        /// Only events for this session.
        #[arg(long)]
        session: Option<String>,
    },
}

pub fn execute(cmd: &AuditCommands, config: &GuardConfig) -> anyhow::Result<()> {
    match cmd {
        AuditCommands::Verify { log } => {
            let path = log.clone().unwrap_or_else(|| config.audit_log_path());
            if !path.exists() {
                println!("No audit log found at {}", path.display());
                return Ok(());
            }

            match AuditLog::verify_chain(&path) {
                Ok(count) => {
                    println!("Audit log verified: {} event(s), hash chain intact.", count);
                }
                Err(AuditError::IntegrityViolation {
                    line,
                    expected,
                    actual,
                }) => {
                    println!("INTEGRITY VIOLATION at line {}:", line);
                    println!("  Expected previous_hash: {}", expected);
                    println!("  Actual previous_hash:   {}", actual);
                    anyhow::bail!("audit log integrity check failed");
                }
                Err(e) => return Err(e.into()),
            }
        }

        AuditCommands::Tail { log, n, session } => {
            let path = log.clone().unwrap_or_else(|| config.audit_log_path());
            if !path.exists() {
                println!("No audit log found at {}", path.display());
                return Ok(());
            }

            let recent = match session {
                Some(key) => {
                    let events: Vec<_> = AuditLog::read_all(&path)?
                        .into_iter()
                        .filter(|e| &e.session_key == key)
                        .collect();
                    let start = events.len().saturating_sub(*n);
                    events[start..].to_vec()
                }
                None => AuditLog::tail(&path, *n)?,
            };
            if recent.is_empty() {
                println!("No audit events.");
                return Ok(());
            }

            println!(
                "{:<20} {:<20} {:<22} {:<10} {:<10} DETAIL",
                "TIMESTAMP", "SESSION", "ACTION", "TOOL", "LEVEL"
            );
            println!("{}", "-".repeat(110));
            for event in recent {
                println!(
                    "{:<20} {:<20} {:<22} {:<10} {:<10} {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.session_key,
                    event.action.as_str(),
                    event.tool.as_deref().unwrap_or("-"),
                    event.level.as_deref().unwrap_or("-"),
                    event.detail,
                );
            }
        }
    }

    Ok(())
}
