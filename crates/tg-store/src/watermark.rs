// watermark.rs — WatermarkStore: the durable, cross-turn taint record.
//
// The in-turn graph forgets everything when the turn ends; the conversation
// history the model reads does not. A session tainted three turns ago must
// still be restricted now, so the worst level a session reaches is kept here
// and re-injected into every new graph.
//
// Storage layout, one pretty-printed JSON document:
//
//   {
//     "version": 1,
//     "sessions": { "<session_key>": SessionWatermark, ... },
//     "resets":   [ ResetRecord, ... ]
//   }
//
// Entries are created lazily: a session that never drops below `trusted`
// has no entry. `escalate` follows the same one-way ratchet as the graph.
// Only `clear_with_audit` (authenticated owner) and `remove` (fresh session
// detected) make a session's record more trusted again.
//
// Mutations touch memory only. Disk writes happen in `flush`, which the
// WatermarkPersister calls off the hook path.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tg_taint::{min_trust, TrustLevel};

use crate::error::StoreError;

/// Current schema version of the watermark document.
pub const WATERMARK_DOCUMENT_VERSION: u32 = 1;

/// One authenticated reset, kept on the session's entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetEntry {
    /// The level that was cleared.
    pub level: TrustLevel,
    /// Why the session had been at that level.
    pub reason: String,
    pub reset_at: DateTime<Utc>,
    pub reset_by: String,
}

/// Durable taint state for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWatermark {
    pub level: TrustLevel,
    pub reason: String,
    pub escalated_at: DateTime<Utc>,
    /// Tool or input that caused the latest escalation.
    pub escalated_by: String,
    #[serde(default)]
    pub reset_history: Vec<ResetEntry>,
}

/// A cleared watermark, moved out of `sessions` by `clear_with_audit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetRecord {
    pub session_key: String,
    pub cleared: SessionWatermark,
    pub reset_at: DateTime<Utc>,
    pub reset_by: String,
}

/// The on-disk document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkDocument {
    pub version: u32,
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionWatermark>,
    #[serde(default)]
    pub resets: Vec<ResetRecord>,
}

impl Default for WatermarkDocument {
    fn default() -> Self {
        Self {
            version: WATERMARK_DOCUMENT_VERSION,
            sessions: BTreeMap::new(),
            resets: Vec::new(),
        }
    }
}

/// Session-keyed watermark store backed by a single JSON file.
///
/// A single lock serializes every write. Escalations happen at most once
/// per level per session, so contention stays low.
#[derive(Debug)]
pub struct WatermarkStore {
    path: Option<PathBuf>,
    document: Mutex<WatermarkDocument>,
    dirty: AtomicBool,
}

impl WatermarkStore {
    /// Open the store at `path`, loading the document if the file exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let document = if path.exists() {
            let json = fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
            let document: WatermarkDocument = serde_json::from_str(&json)?;
            if document.version > WATERMARK_DOCUMENT_VERSION {
                return Err(StoreError::UnsupportedVersion {
                    found: document.version,
                    supported: WATERMARK_DOCUMENT_VERSION,
                });
            }
            document
        } else {
            WatermarkDocument::default()
        };

        tracing::debug!(
            path = %path.display(),
            sessions = document.sessions.len(),
            "watermark store opened"
        );
        Ok(Self {
            path: Some(path),
            document: Mutex::new(document),
            dirty: AtomicBool::new(false),
        })
    }

    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            document: Mutex::new(WatermarkDocument::default()),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, WatermarkDocument> {
        self.document.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, session_key: &str) -> Option<SessionWatermark> {
        self.lock().sessions.get(session_key).cloned()
    }

    /// Every session with a watermark, ordered by key.
    pub fn sessions(&self) -> Vec<(String, SessionWatermark)> {
        self.lock()
            .sessions
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Ratchet the session's watermark toward `level`.
    ///
    /// Returns whether the stored value changed. Nothing is stored while
    /// `level` is the most trusted level.
    pub fn escalate(&self, session_key: &str, level: TrustLevel, reason: &str, cause: &str) -> bool {
        self.escalate_at(session_key, level, reason, cause, Utc::now())
    }

    pub fn escalate_at(
        &self,
        session_key: &str,
        level: TrustLevel,
        reason: &str,
        cause: &str,
        now: DateTime<Utc>,
    ) -> bool {
        if level == TrustLevel::MOST_TRUSTED {
            return false;
        }

        let mut document = self.lock();
        let changed = match document.sessions.get_mut(session_key) {
            Some(existing) => {
                let merged = min_trust(existing.level, level);
                if merged == existing.level {
                    false
                } else {
                    existing.level = merged;
                    existing.reason = reason.to_string();
                    existing.escalated_at = now;
                    existing.escalated_by = cause.to_string();
                    true
                }
            }
            None => {
                let reset_history = reset_history_for(&document, session_key);
                document.sessions.insert(
                    session_key.to_string(),
                    SessionWatermark {
                        level,
                        reason: reason.to_string(),
                        escalated_at: now,
                        escalated_by: cause.to_string(),
                        reset_history,
                    },
                );
                true
            }
        };
        drop(document);

        if changed {
            self.dirty.store(true, Ordering::Release);
            tracing::info!(session = session_key, %level, cause, "watermark escalated");
        }
        changed
    }

    /// Authenticated reset: record the cleared value and remove the entry.
    ///
    /// The returned entry includes the reset just appended to its history.
    pub fn clear_with_audit(&self, session_key: &str, reset_by: &str) -> Option<SessionWatermark> {
        self.clear_with_audit_at(session_key, reset_by, Utc::now())
    }

    pub fn clear_with_audit_at(
        &self,
        session_key: &str,
        reset_by: &str,
        now: DateTime<Utc>,
    ) -> Option<SessionWatermark> {
        let mut document = self.lock();
        let mut cleared = document.sessions.remove(session_key)?;
        cleared.reset_history.push(ResetEntry {
            level: cleared.level,
            reason: cleared.reason.clone(),
            reset_at: now,
            reset_by: reset_by.to_string(),
        });
        document.resets.push(ResetRecord {
            session_key: session_key.to_string(),
            cleared: cleared.clone(),
            reset_at: now,
            reset_by: reset_by.to_string(),
        });
        drop(document);

        self.dirty.store(true, Ordering::Release);
        tracing::info!(session = session_key, level = %cleared.level, reset_by, "watermark cleared");
        Some(cleared)
    }

    /// Drop a session's entry without an audit record. Used when a session
    /// turns out to be genuinely fresh.
    pub fn remove(&self, session_key: &str) -> Option<SessionWatermark> {
        let removed = self.lock().sessions.remove(session_key);
        if removed.is_some() {
            self.dirty.store(true, Ordering::Release);
            tracing::debug!(session = session_key, "watermark dropped for fresh session");
        }
        removed
    }

    /// Every reset record for a session, oldest first.
    pub fn resets_for(&self, session_key: &str) -> Vec<ResetRecord> {
        self.lock()
            .resets
            .iter()
            .filter(|r| r.session_key == session_key)
            .cloned()
            .collect()
    }

    /// A copy of the whole document.
    pub fn snapshot(&self) -> WatermarkDocument {
        self.lock().clone()
    }

    /// Whether there are changes not yet flushed.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Write the document atomically (temp file + rename). The lock is held
    /// only while cloning, never during I/O.
    pub fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            self.dirty.store(false, Ordering::Release);
            return Ok(());
        };

        self.dirty.store(false, Ordering::Release);
        let document = self.snapshot();
        let result = write_atomically(path, &document);
        if result.is_err() {
            self.dirty.store(true, Ordering::Release);
        }
        result
    }
}

fn reset_history_for(document: &WatermarkDocument, session_key: &str) -> Vec<ResetEntry> {
    document
        .resets
        .iter()
        .filter(|r| r.session_key == session_key)
        .filter_map(|r| r.cleared.reset_history.last().cloned())
        .collect()
}

fn write_atomically(path: &Path, document: &WatermarkDocument) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
    }
    let json = serde_json::to_string_pretty(document)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn trusted_level_creates_no_entry() {
        let store = WatermarkStore::in_memory();
        assert!(!store.escalate("s", TrustLevel::Trusted, "owner dm", "sender"));
        assert!(store.get("s").is_none());
        assert!(!store.is_dirty());
    }

    #[test]
    fn escalation_only_moves_toward_less_trusted() {
        let store = WatermarkStore::in_memory();
        assert!(store.escalate("s", TrustLevel::External, "web page", "web_fetch"));
        assert!(!store.escalate("s", TrustLevel::Shared, "memory", "memory_search"));
        assert!(!store.escalate("s", TrustLevel::External, "again", "web_fetch"));
        assert!(store.escalate("s", TrustLevel::Untrusted, "stranger", "message"));

        let mark = store.get("s").unwrap();
        assert_eq!(mark.level, TrustLevel::Untrusted);
        assert_eq!(mark.escalated_by, "message");
    }

    #[test]
    fn reload_returns_identical_entry_and_clear_is_audited() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("watermarks.json");

        {
            let store = WatermarkStore::open(&path).unwrap();
            store.escalate("s", TrustLevel::External, "fetched page", "web_fetch");
            store.flush().unwrap();
        }

        let store = WatermarkStore::open(&path).unwrap();
        let mark = store.get("s").unwrap();
        assert_eq!(mark.level, TrustLevel::External);
        assert_eq!(mark.reason, "fetched page");

        let cleared = store.clear_with_audit("s", "owner").unwrap();
        assert_eq!(cleared.reset_history.len(), 1);
        store.flush().unwrap();

        let reloaded = WatermarkStore::open(&path).unwrap();
        assert!(reloaded.get("s").is_none());
        assert_eq!(reloaded.resets_for("s").len(), 1);
        assert_eq!(reloaded.resets_for("s")[0].cleared.level, TrustLevel::External);
    }

    #[test]
    fn new_entry_inherits_reset_history() {
        let store = WatermarkStore::in_memory();
        store.escalate("s", TrustLevel::External, "a", "web_fetch");
        store.clear_with_audit("s", "owner");
        store.escalate("s", TrustLevel::Shared, "b", "memory_search");
        assert_eq!(store.get("s").unwrap().reset_history.len(), 1);
    }

    #[test]
    fn remove_leaves_no_reset_record() {
        let store = WatermarkStore::in_memory();
        store.escalate("s", TrustLevel::Untrusted, "x", "message");
        assert!(store.remove("s").is_some());
        assert!(store.resets_for("s").is_empty());
        assert!(store.clear_with_audit("s", "owner").is_none());
    }

    #[test]
    fn sessions_are_independent() {
        let store = WatermarkStore::in_memory();
        store.escalate("a", TrustLevel::Shared, "memory", "memory_get");
        store.escalate("b", TrustLevel::Untrusted, "stranger", "message");
        assert_eq!(store.get("a").unwrap().level, TrustLevel::Shared);
        assert_eq!(store.get("b").unwrap().level, TrustLevel::Untrusted);
        assert_eq!(store.sessions().len(), 2);
    }

    #[test]
    fn flush_clears_dirty_flag_and_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("watermarks.json");
        let store = WatermarkStore::open(&path).unwrap();
        store.escalate("s", TrustLevel::External, "x", "browser");
        assert!(store.is_dirty());
        store.flush().unwrap();
        assert!(!store.is_dirty());
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
