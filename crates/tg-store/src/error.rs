// error.rs — Error types for the durable stores.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while reading or writing durable state.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A file I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A document could not be serialized or parsed.
    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// No staged write with this id.
    #[error("staged write not found: {0}")]
    NotFound(Uuid),

    /// An edit cannot be applied because the text it replaces is gone.
    #[error("text to replace no longer present in {path}")]
    ReplacedTextMissing { path: PathBuf },

    /// The watermark document was written by a newer build.
    #[error("watermark document version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::IoError {
            path: path.into(),
            source,
        }
    }
}
