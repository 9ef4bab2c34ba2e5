// staging.rs — BlockedWriteStore: deferred privileged file writes.
//
// When the guard refuses a write, the agent's work is not thrown away. The
// full content (and, for edits, the text it was replacing) is staged as
// `<staged_dir>/<id>.json` for the owner to review, apply or discard.
// Nothing is ever discarded automatically.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tg_taint::TrustLevel;
use uuid::Uuid;

use crate::error::StoreError;

/// A write that was withheld pending review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedWrite {
    pub id: Uuid,
    pub session_key: String,
    pub tool: String,
    pub path: PathBuf,
    /// Full new file content, or the replacement text for an edit.
    pub content: String,
    /// For edits: the text `content` replaces.
    pub replaced: Option<String>,
    pub taint: TrustLevel,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl BlockedWrite {
    pub fn new(
        session_key: impl Into<String>,
        tool: impl Into<String>,
        path: impl Into<PathBuf>,
        content: impl Into<String>,
        taint: TrustLevel,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_key: session_key.into(),
            tool: tool.into(),
            path: path.into(),
            content: content.into(),
            replaced: None,
            taint,
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_replaced(mut self, replaced: impl Into<String>) -> Self {
        self.replaced = Some(replaced.into());
        self
    }

    pub fn is_edit(&self) -> bool {
        self.replaced.is_some()
    }

    /// Perform the write now.
    ///
    /// Full writes create parent directories and overwrite. Edits replace the
    /// first occurrence of `replaced` and fail if it is no longer present.
    pub fn apply(&self) -> Result<(), StoreError> {
        match &self.replaced {
            Some(old) => {
                let current =
                    fs::read_to_string(&self.path).map_err(|e| StoreError::io(&self.path, e))?;
                if !current.contains(old.as_str()) {
                    return Err(StoreError::ReplacedTextMissing {
                        path: self.path.clone(),
                    });
                }
                let updated = current.replacen(old.as_str(), &self.content, 1);
                fs::write(&self.path, updated).map_err(|e| StoreError::io(&self.path, e))?;
            }
            None => {
                if let Some(parent) = self.path.parent() {
                    if !parent.as_os_str().is_empty() {
                        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
                    }
                }
                fs::write(&self.path, &self.content).map_err(|e| StoreError::io(&self.path, e))?;
            }
        }
        tracing::info!(id = %self.id, path = %self.path.display(), "staged write applied");
        Ok(())
    }
}

/// One JSON file per staged write.
pub struct BlockedWriteStore {
    dir: PathBuf,
}

impl BlockedWriteStore {
    /// Open the store, creating the directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn save(&self, write: &BlockedWrite) -> Result<(), StoreError> {
        let path = self.file(write.id);
        let json = serde_json::to_string_pretty(write)?;
        fs::write(&path, json).map_err(|e| StoreError::io(&path, e))?;
        tracing::info!(
            id = %write.id,
            session = %write.session_key,
            tool = %write.tool,
            target = %write.path.display(),
            "blocked write staged"
        );
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Option<BlockedWrite>, StoreError> {
        let path = self.file(id);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    /// Every staged write, newest first. Unparsable files are skipped.
    pub fn list(&self) -> Result<Vec<BlockedWrite>, StoreError> {
        let mut writes = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        for entry in entries {
            let path = entry.map_err(|e| StoreError::io(&self.dir, e))?.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            let json = fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
            match serde_json::from_str::<BlockedWrite>(&json) {
                Ok(write) => writes.push(write),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable staged write"),
            }
        }
        writes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(writes)
    }

    pub fn list_for_session(&self, session_key: &str) -> Result<Vec<BlockedWrite>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|w| w.session_key == session_key)
            .collect())
    }

    /// Apply a staged write and remove it from the store.
    pub fn apply(&self, id: Uuid) -> Result<BlockedWrite, StoreError> {
        let write = self.get(id)?.ok_or(StoreError::NotFound(id))?;
        write.apply()?;
        self.discard(id)?;
        Ok(write)
    }

    /// Remove a staged write. Returns whether it existed.
    pub fn discard(&self, id: Uuid) -> Result<bool, StoreError> {
        let path = self.file(id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
        Ok(true)
    }

    fn file(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}
