// error.rs — Error types for hook orchestration.

use std::path::PathBuf;

use tg_audit::AuditError;
use tg_store::StoreError;
use tg_taint::TaintError;
use thiserror::Error;

/// Errors that can occur inside the guard.
///
/// None of these reach the host: lifecycle handlers run under
/// [`fail_open`](crate::fail_open::fail_open), which logs them and returns
/// "no effect".
#[derive(Debug, Error)]
pub enum GuardError {
    /// Failed to read a configuration file.
    #[error("failed to read config at {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A configuration file could not be parsed.
    #[error("failed to parse config at {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },

    /// The configuration file extension is not toml, yaml, yml or json.
    #[error("unsupported config format '{extension}' at {path}")]
    UnsupportedFormat { path: PathBuf, extension: String },

    /// A command-grammar pattern failed to compile.
    #[error("invalid command pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Taint(#[from] TaintError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    /// A challenge could not be delivered.
    #[error("challenge delivery failed: {0}")]
    Notify(String),

    /// A handler panicked.
    #[error("handler panicked: {0}")]
    Panic(String),
}

impl GuardError {
    /// Whether this error means the orchestrator itself is broken rather
    /// than that some input or resource misbehaved.
    pub fn is_orchestration_bug(&self) -> bool {
        matches!(
            self,
            GuardError::Taint(TaintError::SealedGraph { .. })
                | GuardError::Taint(TaintError::UnknownNode { .. })
        )
    }
}
