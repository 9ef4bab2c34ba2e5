// document.rs — Raw policy documents, lenient compilation, versioned migration.
//
// The on-disk form is deliberately stringly-typed so that a single bad entry
// degrades to a warning instead of rejecting the whole file:
//
//   version = 2
//
//   [policy.levels]
//   trusted = "allow"
//   untrusted = "restrict"
//
//   [policy.tool_overrides.exec]
//   "*" = "confirm"
//
//   [tool_trust]
//   my_search = "external"
//
// Version 1 documents use the six-level lattice; `migrate_document` folds
// them into the four-level one before compilation.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tg_taint::{normalize_tool, LegacyTrustLevel, ToolTrustTable, TrustLevel};

use crate::error::PolicyError;
use crate::mode::{validate_monotonicity, LevelSelector, PolicyMode, TaintPolicyConfig};

/// Current schema version of the policy document.
pub const CURRENT_POLICY_VERSION: u32 = 2;

fn default_version() -> u32 {
    CURRENT_POLICY_VERSION
}

/// Level defaults and overrides exactly as written in the document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPolicy {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub levels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_overrides: BTreeMap<String, BTreeMap<String, String>>,
}

/// The policy-related part of a guard configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub policy: RawPolicy,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tool_trust: BTreeMap<String, String>,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            version: CURRENT_POLICY_VERSION,
            policy: RawPolicy::default(),
            tool_trust: BTreeMap::new(),
        }
    }
}

/// Result of compiling a document: the effective policy and trust table,
/// plus every correction that was applied along the way.
#[derive(Debug, Clone)]
pub struct CompiledPolicy {
    pub policy: TaintPolicyConfig,
    pub table: ToolTrustTable,
    pub warnings: Vec<String>,
}

impl PolicyDocument {
    /// Compile into an effective policy. Never fails; anything unusable is
    /// dropped and reported in `warnings`.
    ///
    /// Document overrides merge onto the built-in ones per (tool, selector),
    /// and `tool_trust` entries merge onto the built-in trust table.
    pub fn compile(&self) -> CompiledPolicy {
        let mut warnings = Vec::new();

        let migrated;
        let doc = if self.version < CURRENT_POLICY_VERSION {
            warnings.push(format!(
                "policy document version {} migrated to version {}",
                self.version, CURRENT_POLICY_VERSION
            ));
            migrated = migrate_document(self);
            &migrated
        } else {
            if self.version > CURRENT_POLICY_VERSION {
                warnings.push(
                    PolicyError::UnsupportedVersion {
                        found: self.version,
                        supported: CURRENT_POLICY_VERSION,
                    }
                    .to_string()
                        + "; reading it as the current version",
                );
            }
            self
        };

        let mut policy = TaintPolicyConfig::builtin();

        for (level_name, mode_name) in &doc.policy.levels {
            let level = match TrustLevel::from_str(level_name) {
                Ok(level) => level,
                Err(e) => {
                    warnings.push(format!("policy.levels: {}; entry ignored", e));
                    continue;
                }
            };
            match PolicyMode::from_str(mode_name) {
                Ok(mode) => policy.levels.set(level, mode),
                Err(e) => warnings.push(format!("policy.levels.{}: {}; entry ignored", level, e)),
            }
        }

        let (levels, corrections) = validate_monotonicity(&policy.levels);
        policy.levels = levels;
        warnings.extend(corrections.iter().map(|c| format!("policy.levels: {}", c)));

        for (tool, entries) in &doc.policy.tool_overrides {
            if normalize_tool(tool).is_empty() {
                warnings.push("policy.tool_overrides: empty tool name; entry ignored".to_string());
                continue;
            }
            for (selector_name, mode_name) in entries {
                let selector = match LevelSelector::from_str(selector_name) {
                    Ok(selector) => selector,
                    Err(e) => {
                        warnings.push(format!(
                            "policy.tool_overrides.{}: {}; entry ignored",
                            tool, e
                        ));
                        continue;
                    }
                };
                match PolicyMode::from_str(mode_name) {
                    Ok(mode) => policy.set_override(tool, selector, mode),
                    Err(e) => warnings.push(format!(
                        "policy.tool_overrides.{}.{}: {}; entry ignored",
                        tool, selector, e
                    )),
                }
            }
        }

        let mut table = ToolTrustTable::builtin();
        for (tool, level_name) in &doc.tool_trust {
            match TrustLevel::from_str(level_name) {
                Ok(level) if !normalize_tool(tool).is_empty() => table.set(tool, level),
                Ok(_) => warnings.push("tool_trust: empty tool name; entry ignored".to_string()),
                Err(e) => warnings.push(format!("tool_trust.{}: {}; entry ignored", tool, e)),
            }
        }

        for warning in &warnings {
            tracing::warn!(warning = %warning, "policy configuration corrected");
        }

        CompiledPolicy {
            policy,
            table,
            warnings,
        }
    }
}

/// Map a legacy or canonical level name onto the canonical lattice.
/// Unknown names are returned unchanged so compilation can report them.
fn migrate_level_name(name: &str) -> String {
    match LegacyTrustLevel::from_str(name) {
        Ok(legacy) => legacy.migrate().as_str().to_string(),
        Err(_) => name.to_string(),
    }
}

/// Insert a (key, mode) pair where several legacy keys may collapse into the
/// same canonical key. The stricter parsable mode wins.
fn insert_stricter(map: &mut BTreeMap<String, String>, key: String, mode: &str) {
    match map.get(&key) {
        Some(existing) => {
            let keep_existing = match (
                PolicyMode::from_str(existing),
                PolicyMode::from_str(mode),
            ) {
                (Ok(a), Ok(b)) => a >= b,
                (Ok(_), Err(_)) => true,
                (Err(_), _) => false,
            };
            if !keep_existing {
                map.insert(key, mode.to_string());
            }
        }
        None => {
            map.insert(key, mode.to_string());
        }
    }
}

/// Convert a document of any older schema version to the current one.
///
/// Version 1 used the six-level lattice. `system`, `owner` and `local`
/// collapse into `trusted`; where several collapse into one level, the
/// stricter mode is kept. Documents already at the current version are
/// returned unchanged. Pure: no logging, no I/O.
pub fn migrate_document(doc: &PolicyDocument) -> PolicyDocument {
    if doc.version >= CURRENT_POLICY_VERSION {
        return doc.clone();
    }

    let mut levels = BTreeMap::new();
    for (name, mode) in &doc.policy.levels {
        insert_stricter(&mut levels, migrate_level_name(name), mode);
    }

    let mut tool_overrides = BTreeMap::new();
    for (tool, entries) in &doc.policy.tool_overrides {
        let mut migrated = BTreeMap::new();
        for (selector, mode) in entries {
            let key = if selector.trim() == "*" {
                "*".to_string()
            } else {
                migrate_level_name(selector)
            };
            insert_stricter(&mut migrated, key, mode);
        }
        tool_overrides.insert(tool.clone(), migrated);
    }

    let tool_trust = doc
        .tool_trust
        .iter()
        .map(|(tool, level)| (tool.clone(), migrate_level_name(level)))
        .collect();

    PolicyDocument {
        version: CURRENT_POLICY_VERSION,
        policy: RawPolicy {
            levels,
            tool_overrides,
        },
        tool_trust,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn levels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_document_compiles_to_builtin() {
        let compiled = PolicyDocument::default().compile();
        assert!(compiled.warnings.is_empty());
        assert_eq!(compiled.policy, TaintPolicyConfig::builtin());
        assert_eq!(compiled.table, ToolTrustTable::builtin());
    }

    #[test]
    fn bad_entries_become_warnings() {
        let doc = PolicyDocument {
            policy: RawPolicy {
                levels: levels(&[("shared", "maybe"), ("galaxy", "allow")]),
                tool_overrides: BTreeMap::from([(
                    "exec".to_string(),
                    levels(&[("*", "confirm"), ("nowhere", "allow")]),
                )]),
            },
            tool_trust: levels(&[("my_tool", "sketchy")]),
            ..PolicyDocument::default()
        };
        let compiled = doc.compile();

        assert_eq!(compiled.warnings.len(), 4);
        assert_eq!(compiled.policy.levels.shared, PolicyMode::Confirm);
        assert_eq!(
            compiled.policy.override_for("exec").unwrap().any,
            Some(PolicyMode::Confirm)
        );
        assert!(!compiled.table.is_classified("my_tool"));
    }

    #[test]
    fn non_monotonic_levels_are_corrected_with_warning() {
        let doc = PolicyDocument {
            policy: RawPolicy {
                levels: levels(&[("shared", "restrict"), ("external", "allow")]),
                ..RawPolicy::default()
            },
            ..PolicyDocument::default()
        };
        let compiled = doc.compile();
        assert_eq!(compiled.policy.levels.external, PolicyMode::Restrict);
        assert_eq!(compiled.warnings.len(), 1);
        assert!(compiled.policy.levels.is_monotonic());
    }

    #[test]
    fn tool_trust_merges_onto_builtin() {
        let doc = PolicyDocument {
            tool_trust: levels(&[("Memory_Search", "external"), ("my_tool", "trusted")]),
            ..PolicyDocument::default()
        };
        let compiled = doc.compile();
        assert_eq!(compiled.table.classify_output("memory_search"), TrustLevel::External);
        assert_eq!(compiled.table.classify_output("my_tool"), TrustLevel::Trusted);
        assert_eq!(compiled.table.classify_output("read"), TrustLevel::Trusted);
    }

    #[test]
    fn v1_collapse_keeps_stricter_mode() {
        let doc = PolicyDocument {
            version: 1,
            policy: RawPolicy {
                levels: levels(&[
                    ("system", "allow"),
                    ("owner", "allow"),
                    ("local", "confirm"),
                    ("untrusted", "restrict"),
                ]),
                tool_overrides: BTreeMap::from([(
                    "exec".to_string(),
                    levels(&[("owner", "allow"), ("local", "restrict"), ("*", "confirm")]),
                )]),
            },
            tool_trust: levels(&[("vestige_search", "local")]),
        };
        let migrated = migrate_document(&doc);

        assert_eq!(migrated.version, CURRENT_POLICY_VERSION);
        assert_eq!(migrated.policy.levels.get("trusted").unwrap(), "confirm");
        assert_eq!(migrated.policy.levels.get("untrusted").unwrap(), "restrict");
        assert!(!migrated.policy.levels.contains_key("owner"));
        let exec = &migrated.policy.tool_overrides["exec"];
        assert_eq!(exec.get("trusted").unwrap(), "restrict");
        assert_eq!(exec.get("*").unwrap(), "confirm");
        assert_eq!(migrated.tool_trust.get("vestige_search").unwrap(), "trusted");
    }

    #[test]
    fn migration_is_idempotent_on_current_documents() {
        let doc = PolicyDocument {
            policy: RawPolicy {
                levels: levels(&[("trusted", "confirm")]),
                ..RawPolicy::default()
            },
            ..PolicyDocument::default()
        };
        assert_eq!(migrate_document(&doc), doc);
    }

    #[test]
    fn compile_migrates_v1_and_warns() {
        let doc = PolicyDocument {
            version: 1,
            policy: RawPolicy {
                levels: levels(&[("owner", "allow"), ("shared", "restrict")]),
                ..RawPolicy::default()
            },
            ..PolicyDocument::default()
        };
        let compiled = doc.compile();
        assert_eq!(compiled.policy.levels.shared, PolicyMode::Restrict);
        assert!(compiled.warnings[0].contains("migrated"));
    }

    #[test]
    fn document_parses_from_json() {
        let doc: PolicyDocument = serde_json::from_str(
            r#"{"policy": {"levels": {"untrusted": "confirm"}}, "tool_trust": {"x": "shared"}}"#,
        )
        .unwrap();
        assert_eq!(doc.version, CURRENT_POLICY_VERSION);
        assert_eq!(doc.policy.levels["untrusted"], "confirm");
    }
}
