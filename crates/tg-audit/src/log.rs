// log.rs — Append-only, hash-chained JSONL security log.
//
// One JSON object per line. Each event's `previous_hash` is the SHA-256 of
// the raw previous line, so inserting, deleting or editing a line breaks the
// chain and `verify_chain` reports where.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::AuditError;
use crate::event::{SecurityAction, SecurityEvent};
use crate::hasher;

/// An append-only security log backed by a JSONL file.
pub struct AuditLog {
    writer: BufWriter<File>,
    path: PathBuf,
    /// Hash of the last line written.
    last_hash: Option<String>,
}

impl AuditLog {
    /// Open (or create) a log, recovering the chain head from existing content.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|source| AuditError::OpenFailed {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        let last_hash = if path.exists() {
            Self::read_last_hash(&path)?
        } else {
            None
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| AuditError::OpenFailed {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(path = %path.display(), resumed = last_hash.is_some(), "audit log opened");
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            last_hash,
        })
    }

    /// Chain the event to the previous one, write it, and flush.
    pub fn append(&mut self, event: &mut SecurityEvent) -> Result<(), AuditError> {
        event.previous_hash = self.last_hash.clone();
        let json = serde_json::to_string(event)?;
        self.last_hash = Some(hasher::hash_str(&json));
        writeln!(self.writer, "{}", json)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Every event in the file, oldest first.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<SecurityEvent>, AuditError> {
        let mut events = Vec::new();
        for line in Self::lines(path.as_ref())? {
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }

    /// The last `n` events, oldest first.
    pub fn tail(path: impl AsRef<Path>, n: usize) -> Result<Vec<SecurityEvent>, AuditError> {
        let mut window: VecDeque<String> = VecDeque::with_capacity(n.min(1024));
        for line in Self::lines(path.as_ref())? {
            if window.len() == n {
                window.pop_front();
            }
            if n > 0 {
                window.push_back(line);
            }
        }
        window
            .iter()
            .map(|line| serde_json::from_str(line).map_err(AuditError::from))
            .collect()
    }

    /// Events for one session with the given action.
    pub fn events_for(
        path: impl AsRef<Path>,
        session_key: &str,
        action: SecurityAction,
    ) -> Result<Vec<SecurityEvent>, AuditError> {
        Ok(Self::read_all(path)?
            .into_iter()
            .filter(|e| e.session_key == session_key && e.action == action)
            .collect())
    }

    /// Walk the chain. Returns the number of events verified, or the first
    /// broken link.
    pub fn verify_chain(path: impl AsRef<Path>) -> Result<usize, AuditError> {
        let file = Self::open_read(path.as_ref())?;
        let mut previous_hash: Option<String> = None;
        let mut verified = 0;

        for (line_num, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: SecurityEvent = serde_json::from_str(&line)?;
            if event.previous_hash != previous_hash {
                return Err(AuditError::IntegrityViolation {
                    line: line_num + 1,
                    expected: previous_hash.unwrap_or_else(|| "None".to_string()),
                    actual: event.previous_hash.unwrap_or_else(|| "None".to_string()),
                });
            }
            // Hash the raw line; re-serializing could reorder fields.
            previous_hash = Some(hasher::hash_str(&line));
            verified += 1;
        }

        Ok(verified)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_read(path: &Path) -> Result<File, AuditError> {
        File::open(path).map_err(|source| AuditError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })
    }

    fn lines(path: &Path) -> Result<Vec<String>, AuditError> {
        let reader = BufReader::new(Self::open_read(path)?);
        let mut lines = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        Ok(lines)
    }

    fn read_last_hash(path: &Path) -> Result<Option<String>, AuditError> {
        Ok(Self::lines(path)?
            .last()
            .map(|line| hasher::hash_str(line)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn event(session: &str, action: SecurityAction) -> SecurityEvent {
        SecurityEvent::new(session, action, "test")
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let mut log = AuditLog::open(&path).unwrap();
            log.append(&mut event("s1", SecurityAction::TaintEscalated).with_level("external"))
                .unwrap();
            log.append(&mut event("s1", SecurityAction::ToolBlocked).with_tool("exec"))
                .unwrap();
        }

        let events = AuditLog::read_all(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].previous_hash.is_none());
        assert!(events[1].previous_hash.is_some());
        assert_eq!(events[1].tool.as_deref(), Some("exec"));
    }

    #[test]
    fn reopened_log_continues_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.jsonl");
        for action in [SecurityAction::TaintReset, SecurityAction::ApprovalGranted] {
            let mut log = AuditLog::open(&path).unwrap();
            log.append(&mut event("s1", action)).unwrap();
        }
        assert_eq!(AuditLog::verify_chain(&path).unwrap(), 2);
    }

    #[test]
    fn tampering_is_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let mut log = AuditLog::open(&path).unwrap();
            for _ in 0..3 {
                log.append(&mut event("s1", SecurityAction::ToolBlocked)).unwrap();
            }
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let tampered = content.replacen("\"detail\":\"test\"", "\"detail\":\"edited\"", 1);
        std::fs::write(&path, tampered).unwrap();

        match AuditLog::verify_chain(&path) {
            Err(AuditError::IntegrityViolation { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected integrity violation, got {:?}", other),
        }
    }

    #[test]
    fn tail_and_filter() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let mut log = AuditLog::open(&path).unwrap();
            log.append(&mut event("a", SecurityAction::TaintReset)).unwrap();
            log.append(&mut event("b", SecurityAction::TaintReset)).unwrap();
            log.append(&mut event("a", SecurityAction::ToolBlocked)).unwrap();
        }

        let last = AuditLog::tail(&path, 2).unwrap();
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].session_key, "b");
        assert!(AuditLog::tail(&path, 0).unwrap().is_empty());

        let resets = AuditLog::events_for(&path, "a", SecurityAction::TaintReset).unwrap();
        assert_eq!(resets.len(), 1);
    }
}
