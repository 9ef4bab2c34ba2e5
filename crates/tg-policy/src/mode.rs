// mode.rs — Policy modes, per-level defaults and per-tool overrides.
//
// A policy resolves (tool, taint level) to one of three modes, ordered by
// strictness:
//
//   allow < confirm < restrict
//
// `LevelModes` holds the default for each trust level. Its one invariant is
// monotonicity: strictness never decreases as trust decreases. Violations are
// corrected upward toward the stricter neighbour and reported, never
// rejected. A bad config never stops the agent from starting.
//
// A `ToolOverride` *replaces* the level default for one tool, either for an
// exact level or for every level (`*`). That lets a read-only tool stay
// `allow` under a restrictive policy, and keeps a dangerous tool gated under
// a permissive one.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tg_taint::{normalize_tool, TrustLevel};

use crate::error::PolicyError;

/// What the engine does with a candidate action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    /// Offer the action.
    Allow,
    /// Withhold the action until the owner redeems a challenge code.
    Confirm,
    /// Silently withhold the action; no code can unlock it.
    Restrict,
}

impl PolicyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyMode::Allow => "allow",
            PolicyMode::Confirm => "confirm",
            PolicyMode::Restrict => "restrict",
        }
    }

    /// The stricter of two modes.
    pub fn stricter(self, other: PolicyMode) -> PolicyMode {
        self.max(other)
    }
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyMode {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(PolicyMode::Allow),
            "confirm" => Ok(PolicyMode::Confirm),
            "restrict" => Ok(PolicyMode::Restrict),
            _ => Err(PolicyError::UnknownMode(s.to_string())),
        }
    }
}

/// Default mode for each trust level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelModes {
    pub trusted: PolicyMode,
    pub shared: PolicyMode,
    pub external: PolicyMode,
    pub untrusted: PolicyMode,
}

impl LevelModes {
    /// Built-in defaults.
    pub fn builtin() -> Self {
        Self {
            trusted: PolicyMode::Allow,
            shared: PolicyMode::Confirm,
            external: PolicyMode::Confirm,
            untrusted: PolicyMode::Restrict,
        }
    }

    /// The same mode at every level.
    pub fn uniform(mode: PolicyMode) -> Self {
        Self {
            trusted: mode,
            shared: mode,
            external: mode,
            untrusted: mode,
        }
    }

    pub fn get(&self, level: TrustLevel) -> PolicyMode {
        match level {
            TrustLevel::Trusted => self.trusted,
            TrustLevel::Shared => self.shared,
            TrustLevel::External => self.external,
            TrustLevel::Untrusted => self.untrusted,
        }
    }

    pub fn set(&mut self, level: TrustLevel, mode: PolicyMode) {
        match level {
            TrustLevel::Trusted => self.trusted = mode,
            TrustLevel::Shared => self.shared = mode,
            TrustLevel::External => self.external = mode,
            TrustLevel::Untrusted => self.untrusted = mode,
        }
    }

    /// Whether strictness is non-decreasing along the trust order.
    pub fn is_monotonic(&self) -> bool {
        TrustLevel::ALL
            .windows(2)
            .all(|pair| self.get(pair[0]) <= self.get(pair[1]))
    }
}

impl Default for LevelModes {
    fn default() -> Self {
        Self::builtin()
    }
}

/// One upward correction applied by [`validate_monotonicity`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonotonicityCorrection {
    pub level: TrustLevel,
    pub configured: PolicyMode,
    pub corrected: PolicyMode,
}

impl fmt::Display for MonotonicityCorrection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "level '{}' was '{}' but a more trusted level is stricter; raised to '{}'",
            self.level, self.configured, self.corrected
        )
    }
}

/// Walk the trust order from most to least trusted and raise any level that
/// is less strict than its predecessor. Never fails.
pub fn validate_monotonicity(levels: &LevelModes) -> (LevelModes, Vec<MonotonicityCorrection>) {
    let mut corrected = *levels;
    let mut corrections = Vec::new();
    let mut floor = PolicyMode::Allow;

    for level in TrustLevel::ALL {
        let configured = corrected.get(level);
        if configured < floor {
            corrected.set(level, floor);
            let correction = MonotonicityCorrection {
                level,
                configured,
                corrected: floor,
            };
            tracing::warn!(%level, %configured, corrected = %floor, "non-monotonic policy corrected");
            corrections.push(correction);
        } else {
            floor = configured;
        }
    }

    (corrected, corrections)
}

/// Which levels an override entry applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LevelSelector {
    Level(TrustLevel),
    /// `*`: every level without an exact entry.
    Any,
}

impl fmt::Display for LevelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LevelSelector::Level(level) => write!(f, "{}", level),
            LevelSelector::Any => f.write_str("*"),
        }
    }
}

impl FromStr for LevelSelector {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed == "*" {
            return Ok(LevelSelector::Any);
        }
        trimmed
            .parse::<TrustLevel>()
            .map(LevelSelector::Level)
            .map_err(|_| PolicyError::UnknownLevel(s.to_string()))
    }
}

/// Per-tool replacement of the level defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOverride {
    pub by_level: BTreeMap<TrustLevel, PolicyMode>,
    pub any: Option<PolicyMode>,
}

impl ToolOverride {
    pub fn set(&mut self, selector: LevelSelector, mode: PolicyMode) {
        match selector {
            LevelSelector::Level(level) => {
                self.by_level.insert(level, mode);
            }
            LevelSelector::Any => self.any = Some(mode),
        }
    }

    /// All entries as (selector, mode) pairs, exact levels first.
    pub fn entries(&self) -> Vec<(LevelSelector, PolicyMode)> {
        let mut entries: Vec<_> = self
            .by_level
            .iter()
            .map(|(level, mode)| (LevelSelector::Level(*level), *mode))
            .collect();
        if let Some(mode) = self.any {
            entries.push((LevelSelector::Any, mode));
        }
        entries
    }
}

/// Tools that only read and stay available at every taint level.
const READ_ONLY_TOOLS: &[&str] = &[
    "read",
    "memory_search",
    "memory_get",
    "vestige_search",
    "session_status",
    "agents_list",
    "sessions_list",
    "web_search",
    "web_fetch",
    "image",
];

/// The complete taint policy: level defaults plus tool overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaintPolicyConfig {
    pub levels: LevelModes,
    /// Keyed by normalized tool name.
    pub tool_overrides: BTreeMap<String, ToolOverride>,
}

impl TaintPolicyConfig {
    /// Level defaults with no overrides.
    pub fn new(levels: LevelModes) -> Self {
        Self {
            levels,
            tool_overrides: BTreeMap::new(),
        }
    }

    /// Built-in level defaults and overrides.
    pub fn builtin() -> Self {
        let mut config = Self::new(LevelModes::builtin());
        for tool in READ_ONLY_TOOLS {
            config.set_override(tool, LevelSelector::Any, PolicyMode::Allow);
        }
        config.set_override(
            "gateway",
            LevelSelector::Level(TrustLevel::External),
            PolicyMode::Restrict,
        );
        config.set_override(
            "gateway",
            LevelSelector::Level(TrustLevel::Untrusted),
            PolicyMode::Restrict,
        );
        config
    }

    pub fn set_override(&mut self, tool: &str, selector: LevelSelector, mode: PolicyMode) {
        self.tool_overrides
            .entry(normalize_tool(tool))
            .or_default()
            .set(selector, mode);
    }

    /// Builder form of [`set_override`](Self::set_override).
    pub fn with_override(mut self, tool: &str, selector: LevelSelector, mode: PolicyMode) -> Self {
        self.set_override(tool, selector, mode);
        self
    }

    pub fn override_for(&self, tool: &str) -> Option<&ToolOverride> {
        self.tool_overrides.get(&normalize_tool(tool))
    }
}

impl Default for TaintPolicyConfig {
    fn default() -> Self {
        Self::builtin()
    }
}
