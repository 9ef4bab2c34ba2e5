// config.rs — GuardConfig: everything an operator can tune.
//
// Loaded from TOML, YAML or JSON by file extension. Every field has a serde
// default, so an empty file (or no file) yields the built-in behaviour. The
// policy portion (`version`, `[policy]`, `[tool_trust]`) is a flattened
// `PolicyDocument`, compiled leniently: bad entries become warnings, never a
// startup failure.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tg_policy::{
    migrate_document, CompiledPolicy, PolicyDocument, DEFAULT_CODE_LENGTH,
    DEFAULT_CODE_TTL_MINUTES, DEFAULT_MAX_ITERATIONS,
};

use crate::error::GuardError;

/// Name of the state directory under the platform data directory.
const STATE_DIR_NAME: &str = "taintguard";

/// Fallback state directory when the platform has no data directory.
const FALLBACK_STATE_DIR: &str = ".taintguard";

fn default_ttl() -> u32 {
    DEFAULT_CODE_TTL_MINUTES
}

fn default_code_length() -> usize {
    DEFAULT_CODE_LENGTH
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_archive_capacity() -> usize {
    10
}

fn default_session_idle_minutes() -> u64 {
    60
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

/// Supported configuration file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
    Json,
}

impl ConfigFormat {
    /// Pick a format from the file extension.
    pub fn from_path(path: &Path) -> Result<Self, GuardError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match extension.as_str() {
            "toml" => Ok(ConfigFormat::Toml),
            "yaml" | "yml" => Ok(ConfigFormat::Yaml),
            "json" => Ok(ConfigFormat::Json),
            _ => Err(GuardError::UnsupportedFormat {
                path: path.to_path_buf(),
                extension,
            }),
        }
    }
}

/// Guard configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Schema version, level defaults, tool overrides and tool trust.
    #[serde(flatten)]
    pub document: PolicyDocument,

    /// Lifetime of a challenge code.
    #[serde(default = "default_ttl")]
    pub approval_ttl_minutes: u32,

    #[serde(default = "default_code_length")]
    pub code_length: usize,

    /// Iteration ceiling per turn.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Block the model call once the ceiling is exceeded, instead of only
    /// warning.
    #[serde(default)]
    pub hard_stop_on_iteration_limit: bool,

    /// Prefix outgoing text with the current taint state.
    #[serde(default)]
    pub diagnostic: bool,

    /// Glob patterns for files that must not be written below `trusted`.
    #[serde(default)]
    pub protected_paths: Vec<String>,

    /// Sealed graphs kept per session.
    #[serde(default = "default_archive_capacity")]
    pub archive_capacity: usize,

    /// In-memory state of a session with no open turn is dropped after this
    /// long without activity. The watermark is durable and unaffected. Zero
    /// keeps every session.
    #[serde(default = "default_session_idle_minutes")]
    pub session_idle_minutes: u64,

    /// Quiet period before watermark changes are written.
    #[serde(default = "default_debounce_ms")]
    pub persist_debounce_ms: u64,

    /// Record security events in `<state_dir>/security.jsonl`.
    #[serde(default = "default_true")]
    pub audit: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            document: PolicyDocument::default(),
            approval_ttl_minutes: default_ttl(),
            code_length: default_code_length(),
            max_iterations: default_max_iterations(),
            hard_stop_on_iteration_limit: false,
            diagnostic: false,
            protected_paths: Vec::new(),
            archive_capacity: default_archive_capacity(),
            session_idle_minutes: default_session_idle_minutes(),
            persist_debounce_ms: default_debounce_ms(),
            audit: true,
            state_dir: None,
        }
    }
}

impl GuardConfig {
    /// Load from a file; the format follows the extension.
    pub fn load(path: &Path) -> Result<Self, GuardError> {
        let format = ConfigFormat::from_path(path)?;
        let content = std::fs::read_to_string(path).map_err(|source| GuardError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, format).map_err(|message| GuardError::ConfigParse {
            path: path.to_path_buf(),
            message,
        })
    }

    /// Parse configuration text.
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self, String> {
        match format {
            ConfigFormat::Toml => toml::from_str(content).map_err(|e| e.to_string()),
            ConfigFormat::Yaml => {
                if content.trim().is_empty() {
                    return Ok(Self::default());
                }
                serde_yaml::from_str(content).map_err(|e| e.to_string())
            }
            ConfigFormat::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
        }
    }

    /// Load from a file, falling back to defaults. A missing file is normal;
    /// anything else is logged.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no guard config; using defaults");
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "guard config unusable; using defaults");
                Self::default()
            }
        }
    }

    /// Render in the given format.
    pub fn render(&self, format: ConfigFormat) -> Result<String, String> {
        match format {
            ConfigFormat::Toml => toml::to_string_pretty(self).map_err(|e| e.to_string()),
            ConfigFormat::Yaml => serde_yaml::to_string(self).map_err(|e| e.to_string()),
            ConfigFormat::Json => serde_json::to_string_pretty(self).map_err(|e| e.to_string()),
        }
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    pub fn with_document(mut self, document: PolicyDocument) -> Self {
        self.document = document;
        self
    }

    /// The configured state directory, or the platform default.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|dir| dir.join(STATE_DIR_NAME))
                .unwrap_or_else(|| PathBuf::from(FALLBACK_STATE_DIR))
        })
    }

    pub fn watermark_path(&self) -> PathBuf {
        self.state_dir().join("watermarks.json")
    }

    pub fn staged_dir(&self) -> PathBuf {
        self.state_dir().join("staged")
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.state_dir().join("security.jsonl")
    }

    /// Compile the policy portion. See [`PolicyDocument::compile`].
    pub fn compile(&self) -> CompiledPolicy {
        self.document.compile()
    }

    /// The same configuration with the policy document migrated to the
    /// current schema.
    pub fn migrated(&self) -> Self {
        Self {
            document: migrate_document(&self.document),
            ..self.clone()
        }
    }

    /// Compile `protected_paths`. Invalid patterns are dropped with a warning.
    pub fn protected_patterns(&self) -> (Vec<glob::Pattern>, Vec<String>) {
        let mut patterns = Vec::new();
        let mut warnings = Vec::new();
        for raw in &self.protected_paths {
            match glob::Pattern::new(raw) {
                Ok(pattern) => patterns.push(pattern),
                Err(e) => {
                    let warning = format!("protected_paths: '{}' is not a valid glob: {}", raw, e);
                    tracing::warn!(warning = %warning, "protected path ignored");
                    warnings.push(warning);
                }
            }
        }
        (patterns, warnings)
    }
}
