// watermark.rs — Watermark subcommands: list, show, reset.
//
// The daemon keeps its own copy of the watermark document in memory and
// rewrites the file on every flush, so a reset made here while the daemon
// is running is overwritten. Owners of a live session use `.reset-trust`.

use clap::Subcommand;
use tg_audit::{AuditLog, SecurityAction, SecurityEvent};
use tg_hooks::GuardConfig;
use tg_store::WatermarkStore;

#[derive(Subcommand)]
pub enum WatermarkCommands {
    /// List every session with a recorded watermark.
    List,
    /// Show one session's watermark and reset history.
    Show {
        /// Session key.
        session: String,
    },
    /// Clear a session's watermark, keeping an audit record of the reset.
    Reset {
        /// Session key.
        session: String,
        /// Who performed the reset, recorded in the reset history.
        #[arg(long, default_value = "operator")]
        by: String,
    },
}

pub fn execute(cmd: &WatermarkCommands, config: &GuardConfig) -> anyhow::Result<()> {
    let path = config.watermark_path();

    match cmd {
        WatermarkCommands::List => {
            if !path.exists() {
                println!("No watermarks recorded at {}", path.display());
                return Ok(());
            }
            let store = WatermarkStore::open(&path)?;
            let sessions = store.sessions();
            if sessions.is_empty() {
                println!("No tainted sessions.");
                return Ok(());
            }

            println!(
                "{:<32} {:<10} {:<20} REASON",
                "SESSION", "LEVEL", "ESCALATED"
            );
            println!("{}", "-".repeat(90));
            for (key, mark) in sessions {
                println!(
                    "{:<32} {:<10} {:<20} {}",
                    key,
                    mark.level.as_str(),
                    mark.escalated_at.format("%Y-%m-%d %H:%M:%S"),
                    mark.reason,
                );
            }
        }

        WatermarkCommands::Show { session } => {
            let store = WatermarkStore::open(&path)?;
            match store.get(session) {
                Some(mark) => {
                    println!("Session:    {}", session);
                    println!("Level:      {}", mark.level);
                    println!("Reason:     {}", mark.reason);
                    println!("Escalated:  {} by {}", mark.escalated_at, mark.escalated_by);
                    if !mark.reset_history.is_empty() {
                        println!("Earlier resets:");
                        for entry in &mark.reset_history {
                            println!(
                                "  {} by {} (was {}: {})",
                                entry.reset_at.format("%Y-%m-%d %H:%M:%S"),
                                entry.reset_by,
                                entry.level,
                                entry.reason
                            );
                        }
                    }
                }
                None => println!("Session {} has no watermark.", session),
            }

            let resets = store.resets_for(session);
            if !resets.is_empty() {
                println!("Cleared watermarks:");
                for record in resets {
                    println!(
                        "  {} by {}: {} ({})",
                        record.reset_at.format("%Y-%m-%d %H:%M:%S"),
                        record.reset_by,
                        record.cleared.level,
                        record.cleared.reason
                    );
                }
            }
        }

        WatermarkCommands::Reset { session, by } => {
            let store = WatermarkStore::open(&path)?;
            let Some(cleared) = store.clear_with_audit(session, by) else {
                println!("Session {} has no watermark; nothing to reset.", session);
                return Ok(());
            };
            store.flush()?;

            if config.audit {
                let mut log = AuditLog::open(config.audit_log_path())?;
                let mut event = SecurityEvent::new(
                    session.as_str(),
                    SecurityAction::TaintReset,
                    format!("watermark cleared from the command line by {}", by),
                )
                .with_level(cleared.level)
                .with_metadata(serde_json::json!({ "reset_by": by }));
                log.append(&mut event)?;
            }

            println!(
                "Cleared {} watermark for {} (was: {}).",
                cleared.level, session, cleared.reason
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tg_taint::TrustLevel;

    #[test]
    fn reset_clears_and_audits() {
        let dir = tempfile::tempdir().unwrap();
        let config = GuardConfig::default().with_state_dir(dir.path());
        {
            let store = WatermarkStore::open(config.watermark_path()).unwrap();
            store.escalate("s", TrustLevel::External, "web_fetch output", "turn 1");
            store.flush().unwrap();
        }

        let cmd = WatermarkCommands::Reset {
            session: "s".into(),
            by: "ops".into(),
        };
        execute(&cmd, &config).unwrap();

        let store = WatermarkStore::open(config.watermark_path()).unwrap();
        assert!(store.get("s").is_none());
        assert_eq!(store.resets_for("s")[0].reset_by, "ops");
        let audited =
            AuditLog::events_for(config.audit_log_path(), "s", SecurityAction::TaintReset).unwrap();
        assert_eq!(audited.len(), 1);
        assert_eq!(audited[0].level.as_deref(), Some("external"));
    }

    #[test]
    fn reset_of_unknown_session_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let config = GuardConfig::default().with_state_dir(dir.path());
        let cmd = WatermarkCommands::Reset {
            session: "nobody".into(),
            by: "ops".into(),
        };
        execute(&cmd, &config).unwrap();
        assert!(!config.audit_log_path().exists());
    }
}
