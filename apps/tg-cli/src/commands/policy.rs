// policy.rs — Policy subcommands: check, explain, migrate.

use std::path::{Path, PathBuf};

use clap::Subcommand;
use tg_hooks::{ConfigFormat, GuardConfig};
use tg_policy::{PolicyEngine, CURRENT_POLICY_VERSION};
use tg_taint::TrustLevel;

#[derive(Subcommand)]
pub enum PolicyCommands {
    /// Parse a config, report every correction, and print the effective policy.
    Check {
        /// Config file (defaults to --config).
        file: Option<PathBuf>,
    },
    /// Show how a tool's mode is resolved.
    Explain {
        /// Tool name as the model sees it.
        tool: String,
        /// Taint level to resolve at (all levels when omitted).
        #[arg(long)]
        level: Option<String>,
    },
    /// Rewrite a config with its policy in the current schema.
    Migrate {
        /// Config file (defaults to --config).
        file: Option<PathBuf>,
        /// Overwrite the file instead of printing to stdout.
        #[arg(long)]
        write: bool,
    },
}

pub fn execute(
    cmd: &PolicyCommands,
    config_path: Option<&Path>,
    config: &GuardConfig,
) -> anyhow::Result<()> {
    match cmd {
        PolicyCommands::Check { file } => {
            let loaded;
            let config = match file.as_deref().or(config_path) {
                Some(path) => {
                    loaded = GuardConfig::load(path)?;
                    println!("Config: {}", path.display());
                    &loaded
                }
                None => {
                    println!("Config: built-in defaults");
                    config
                }
            };
            check(config)
        }

        PolicyCommands::Explain { tool, level } => {
            let compiled = config.compile();
            let engine = PolicyEngine::new(compiled.policy, compiled.table);
            let levels = match level {
                Some(raw) => vec![raw.parse::<TrustLevel>()?],
                None => TrustLevel::ALL.to_vec(),
            };

            for level in levels {
                let trace = engine.explain(tool, level);
                println!(
                    "{} at {}: {} ({:?})",
                    trace.tool, trace.level, trace.mode, trace.source
                );
                if trace.classified {
                    println!("  output trust: {}", trace.output_trust);
                } else {
                    println!("  output trust: {} (unclassified)", trace.output_trust);
                }
                for step in &trace.steps {
                    let marker = if step.terminal { "=>" } else { "  " };
                    println!("  {} {:<20} {}", marker, step.check, step.outcome);
                }
            }
            Ok(())
        }

        PolicyCommands::Migrate { file, write } => {
            let Some(path) = file.as_deref().or(config_path) else {
                anyhow::bail!("no config file given; pass a path or --config");
            };
            let format = ConfigFormat::from_path(path)?;
            let loaded = GuardConfig::load(path)?;
            if loaded.document.version >= CURRENT_POLICY_VERSION {
                println!(
                    "{} is already at policy version {}.",
                    path.display(),
                    CURRENT_POLICY_VERSION
                );
                return Ok(());
            }

            let rendered = loaded
                .migrated()
                .render(format)
                .map_err(|e| anyhow::anyhow!("failed to render migrated config: {}", e))?;
            if *write {
                std::fs::write(path, rendered)?;
                println!(
                    "Migrated {} from policy version {} to {}.",
                    path.display(),
                    loaded.document.version,
                    CURRENT_POLICY_VERSION
                );
            } else {
                print!("{}", rendered);
            }
            Ok(())
        }
    }
}

fn check(config: &GuardConfig) -> anyhow::Result<()> {
    let compiled = config.compile();
    let (_, pattern_warnings) = config.protected_patterns();

    println!("Policy version: {}", config.document.version);
    println!();
    println!("{:<12} MODE", "LEVEL");
    for level in TrustLevel::ALL {
        println!("{:<12} {}", level.as_str(), compiled.policy.levels.get(level));
    }

    if !compiled.policy.tool_overrides.is_empty() {
        println!();
        println!("{:<20} {:<12} MODE", "TOOL", "LEVEL");
        for (tool, entry) in &compiled.policy.tool_overrides {
            for (selector, mode) in entry.entries() {
                println!("{:<20} {:<12} {}", tool, selector.to_string(), mode);
            }
        }
    }

    let warnings: Vec<_> = compiled.warnings.iter().chain(&pattern_warnings).collect();
    println!();
    if warnings.is_empty() {
        println!("No corrections needed.");
    } else {
        println!("{} correction(s):", warnings.len());
        for warning in warnings {
            println!("  - {}", warning);
        }
    }
    Ok(())
}
