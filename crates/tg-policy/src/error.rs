// error.rs — Error types for the policy subsystem.

use thiserror::Error;

/// Errors that can occur during policy operations.
///
/// Configuration loading never surfaces these to the host: lenient parsing
/// turns them into warnings. They are returned by the strict `FromStr`
/// parsers and by the CLI.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A name did not match any policy mode.
    #[error("unknown policy mode '{0}' (expected allow, confirm or restrict)")]
    UnknownMode(String),

    /// A name did not match any trust level or the `*` wildcard.
    #[error("unknown trust level '{0}'")]
    UnknownLevel(String),

    /// An approval target was empty.
    #[error("approval target must be a tool name or 'all'")]
    EmptyTarget,

    /// The document declares a schema version newer than this build knows.
    #[error("policy document version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}
