// staged.rs — Staged-write subcommands: list, show, apply, discard.

use clap::Subcommand;
use tg_hooks::GuardConfig;
use tg_store::BlockedWriteStore;
use uuid::Uuid;

#[derive(Subcommand)]
pub enum StagedCommands {
    /// List writes held back by the guard.
    List {
        /// Only this session's writes.
        #[arg(long)]
        session: Option<String>,
    },
    /// Show a staged write in full.
    Show {
        /// Staged write ID.
        id: String,
    },
    /// Perform a staged write now.
    Apply {
        /// Staged write ID.
        id: String,
    },
    /// Drop a staged write without performing it.
    Discard {
        /// Staged write ID.
        id: String,
    },
}

pub fn execute(cmd: &StagedCommands, config: &GuardConfig) -> anyhow::Result<()> {
    let store = BlockedWriteStore::new(config.staged_dir())?;

    match cmd {
        StagedCommands::List { session } => {
            let writes = match session {
                Some(key) => store.list_for_session(key)?,
                None => store.list()?,
            };
            if writes.is_empty() {
                println!("No staged writes.");
                return Ok(());
            }

            println!(
                "{:<38} {:<20} {:<10} {:<12} PATH",
                "ID", "SESSION", "TOOL", "TAINT"
            );
            println!("{}", "-".repeat(100));
            for write in writes {
                println!(
                    "{:<38} {:<20} {:<10} {:<12} {}",
                    write.id.to_string(),
                    write.session_key,
                    write.tool,
                    write.taint.as_str(),
                    write.path.display(),
                );
            }
        }

        StagedCommands::Show { id } => {
            let id = parse_id(id)?;
            let Some(write) = store.get(id)? else {
                anyhow::bail!("no staged write {}", id);
            };
            println!("ID:       {}", write.id);
            println!("Session:  {}", write.session_key);
            println!("Tool:     {}", write.tool);
            println!("Path:     {}", write.path.display());
            println!("Taint:    {}", write.taint);
            println!("Reason:   {}", write.reason);
            println!("Staged:   {}", write.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
            if let Some(replaced) = &write.replaced {
                println!();
                println!("--- replaces");
                println!("{}", replaced);
                println!("--- with");
            } else {
                println!();
                println!("--- content");
            }
            println!("{}", write.content);
        }

        StagedCommands::Apply { id } => {
            let write = store.apply(parse_id(id)?)?;
            println!("Applied {} to {}.", write.tool, write.path.display());
        }

        StagedCommands::Discard { id } => {
            let id = parse_id(id)?;
            if store.discard(id)? {
                println!("Discarded {}.", id);
            } else {
                println!("No staged write {}.", id);
            }
        }
    }

    Ok(())
}

fn parse_id(raw: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(raw.trim()).map_err(|e| anyhow::anyhow!("invalid staged write ID '{}': {}", raw, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tg_store::BlockedWrite;
    use tg_taint::TrustLevel;

    #[test]
    fn apply_writes_file_and_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let config = GuardConfig::default().with_state_dir(dir.path().join("state"));
        let target = dir.path().join("out.txt");
        let store = BlockedWriteStore::new(config.staged_dir()).unwrap();
        let write = BlockedWrite::new(
            "s",
            "write",
            &target,
            "staged text",
            TrustLevel::External,
            "held back",
        );
        store.save(&write).unwrap();

        let cmd = StagedCommands::Apply {
            id: write.id.to_string(),
        };
        execute(&cmd, &config).unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "staged text");
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn show_rejects_bad_id() {
        let dir = tempfile::tempdir().unwrap();
        let config = GuardConfig::default().with_state_dir(dir.path());
        let cmd = StagedCommands::Show { id: "nope".into() };
        assert!(execute(&cmd, &config).is_err());
    }
}
