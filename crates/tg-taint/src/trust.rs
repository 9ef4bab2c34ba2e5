// trust.rs — The trust lattice and tool output classification.
//
// Trust levels are totally ordered from most to least trusted:
//
//   trusted < shared < external < untrusted
//
// The derived `Ord` follows declaration order, so "greater" means "less
// trusted". Merging two observations always keeps the less-trusted one
// (`min_trust`), which is the only merge rule used anywhere taint is folded.
//
// The ToolTrustTable maps an action name to the trust level its *output*
// introduces into the agent's context. Anything not in the table is
// classified as untrusted, so renaming a dangerous tool cannot dodge
// classification.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TaintError;

/// A point on the ordered trustworthiness scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// System configuration and the verified owner.
    Trusted,
    /// Shared memory and group contexts the owner participates in.
    Shared,
    /// Web pages and other fetched content.
    External,
    /// Messages from third parties and anything unclassified.
    Untrusted,
}

impl TrustLevel {
    /// Every level, most trusted first.
    pub const ALL: [TrustLevel; 4] = [
        TrustLevel::Trusted,
        TrustLevel::Shared,
        TrustLevel::External,
        TrustLevel::Untrusted,
    ];

    pub const MOST_TRUSTED: TrustLevel = TrustLevel::Trusted;
    pub const LEAST_TRUSTED: TrustLevel = TrustLevel::Untrusted;

    /// Position in the order (0 = most trusted).
    pub fn rank(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrustLevel::Trusted => "trusted",
            TrustLevel::Shared => "shared",
            TrustLevel::External => "external",
            TrustLevel::Untrusted => "untrusted",
        }
    }

    /// True when `self` is at or below `threshold` in trust.
    pub fn is_at_or_below(self, threshold: TrustLevel) -> bool {
        self >= threshold
    }

    /// Parse a level name, accepting legacy six-level names as well.
    ///
    /// Used when reading configuration documents of unknown vintage.
    pub fn parse_lenient(name: &str) -> Option<TrustLevel> {
        name.parse::<TrustLevel>()
            .ok()
            .or_else(|| name.parse::<LegacyTrustLevel>().ok().map(|l| l.migrate()))
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrustLevel {
    type Err = TaintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trusted" => Ok(TrustLevel::Trusted),
            "shared" => Ok(TrustLevel::Shared),
            "external" => Ok(TrustLevel::External),
            "untrusted" => Ok(TrustLevel::Untrusted),
            _ => Err(TaintError::UnknownTrustLevel(s.to_string())),
        }
    }
}

/// Fold two observations: always yields the less trusted of the two.
///
/// Commutative and idempotent.
pub fn min_trust(a: TrustLevel, b: TrustLevel) -> TrustLevel {
    a.max(b)
}

/// The six-level lattice used by version 1 configuration documents.
///
/// Kept only so old documents can be migrated; nothing evaluates taint
/// against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegacyTrustLevel {
    System,
    Owner,
    Local,
    Shared,
    External,
    Untrusted,
}

impl LegacyTrustLevel {
    pub const ALL: [LegacyTrustLevel; 6] = [
        LegacyTrustLevel::System,
        LegacyTrustLevel::Owner,
        LegacyTrustLevel::Local,
        LegacyTrustLevel::Shared,
        LegacyTrustLevel::External,
        LegacyTrustLevel::Untrusted,
    ];

    /// Map onto the canonical four-level lattice.
    pub fn migrate(self) -> TrustLevel {
        match self {
            LegacyTrustLevel::System | LegacyTrustLevel::Owner | LegacyTrustLevel::Local => {
                TrustLevel::Trusted
            }
            LegacyTrustLevel::Shared => TrustLevel::Shared,
            LegacyTrustLevel::External => TrustLevel::External,
            LegacyTrustLevel::Untrusted => TrustLevel::Untrusted,
        }
    }
}

impl FromStr for LegacyTrustLevel {
    type Err = TaintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Ok(LegacyTrustLevel::System),
            "owner" => Ok(LegacyTrustLevel::Owner),
            "local" => Ok(LegacyTrustLevel::Local),
            "shared" => Ok(LegacyTrustLevel::Shared),
            "external" => Ok(LegacyTrustLevel::External),
            "untrusted" => Ok(LegacyTrustLevel::Untrusted),
            _ => Err(TaintError::UnknownTrustLevel(s.to_string())),
        }
    }
}

/// Built-in output classification.
///
/// Memory-bridge tools are classified as `shared`: their results can contain
/// anything any agent with write access to the memory store has ingested.
const BUILTIN_TOOL_TRUST: &[(&str, TrustLevel)] = &[
    ("read", TrustLevel::Trusted),
    ("write", TrustLevel::Trusted),
    ("edit", TrustLevel::Trusted),
    ("apply_patch", TrustLevel::Trusted),
    ("exec", TrustLevel::Trusted),
    ("process", TrustLevel::Trusted),
    ("session_status", TrustLevel::Trusted),
    ("agents_list", TrustLevel::Trusted),
    ("sessions_list", TrustLevel::Trusted),
    ("cron", TrustLevel::Trusted),
    ("gateway", TrustLevel::Trusted),
    ("tts", TrustLevel::Trusted),
    ("canvas", TrustLevel::Trusted),
    ("nodes", TrustLevel::Trusted),
    ("memory_search", TrustLevel::Shared),
    ("memory_get", TrustLevel::Shared),
    ("vestige_search", TrustLevel::Shared),
    ("vestige_ingest", TrustLevel::Shared),
    ("vestige_smart_ingest", TrustLevel::Shared),
    ("vestige_promote", TrustLevel::Shared),
    ("vestige_demote", TrustLevel::Shared),
    ("vestige_memory", TrustLevel::Shared),
    ("vestige_codebase", TrustLevel::Shared),
    ("vestige_intention", TrustLevel::Shared),
    ("web_search", TrustLevel::External),
    ("web_fetch", TrustLevel::External),
    ("browser", TrustLevel::External),
    ("image", TrustLevel::External),
    ("message", TrustLevel::Untrusted),
    ("sessions_send", TrustLevel::Untrusted),
    ("sessions_history", TrustLevel::Untrusted),
];

/// Maps action names (lowercased) to the trust level of their output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolTrustTable {
    entries: BTreeMap<String, TrustLevel>,
}

impl ToolTrustTable {
    /// An empty table: every tool is unclassified.
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// The built-in classification.
    pub fn builtin() -> Self {
        let entries = BUILTIN_TOOL_TRUST
            .iter()
            .map(|(name, level)| (name.to_string(), *level))
            .collect();
        Self { entries }
    }

    /// Merge overrides onto this table. Existing entries are replaced,
    /// never removed.
    pub fn with_overrides<I, S>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (S, TrustLevel)>,
        S: AsRef<str>,
    {
        for (name, level) in overrides {
            self.entries.insert(normalize_tool(name.as_ref()), level);
        }
        self
    }

    /// Insert or replace a single entry.
    pub fn set(&mut self, tool: &str, level: TrustLevel) {
        self.entries.insert(normalize_tool(tool), level);
    }

    /// Trust level of the tool's output, or `Untrusted` if unknown.
    pub fn classify_output(&self, tool: &str) -> TrustLevel {
        self.entries
            .get(&normalize_tool(tool))
            .copied()
            .unwrap_or(TrustLevel::LEAST_TRUSTED)
    }

    /// Whether the tool appears in the table at all.
    pub fn is_classified(&self, tool: &str) -> bool {
        self.entries.contains_key(&normalize_tool(tool))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, TrustLevel)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ToolTrustTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Classify a tool's output against a table. See [`ToolTrustTable::classify_output`].
pub fn classify_output(tool: &str, table: &ToolTrustTable) -> TrustLevel {
    table.classify_output(tool)
}

/// Tool names are compared case-insensitively and without surrounding whitespace.
pub fn normalize_tool(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}
