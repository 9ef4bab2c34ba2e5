//! # tg-audit
//!
//! Append-only security log for Taint Guard.
//!
//! Every escalation, block, challenge, redemption and reset is recorded as a
//! [`SecurityEvent`] in a JSONL file. Each line carries the SHA-256 of the
//! line before it, so [`AuditLog::verify_chain`] detects any edit, insertion
//! or deletion.
//!
//! ```rust,no_run
//! use tg_audit::{AuditLog, SecurityAction, SecurityEvent};
//!
//! let mut log = AuditLog::open("/tmp/security.jsonl").unwrap();
//! let mut event = SecurityEvent::new("session-1", SecurityAction::ToolBlocked, "exec withheld")
//!     .with_tool("exec");
//! log.append(&mut event).unwrap();
//! ```

pub mod error;
pub mod event;
pub mod hasher;
pub mod log;

pub use error::AuditError;
pub use event::{SecurityAction, SecurityEvent};
pub use log::AuditLog;
