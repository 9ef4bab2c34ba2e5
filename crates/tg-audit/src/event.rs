// event.rs — Security event data model.
//
// Everything the guard does that an operator may later need to reconstruct
// becomes a SecurityEvent: escalations, blocks, challenges, redemptions,
// resets, ignored commands and swallowed handler failures. Events form a
// hash chain through `previous_hash`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of security-relevant thing happened.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SecurityAction {
    /// The session watermark got worse.
    TaintEscalated,
    /// A tool was withheld or refused at execution time.
    ToolBlocked,
    /// A challenge code was issued for a batch of tools.
    ConfirmationRequested,
    /// The owner redeemed a code.
    ApprovalGranted,
    /// A redemption failed (wrong code, expired, nothing pending).
    ApprovalRejected,
    /// The owner reset the session's taint.
    TaintReset,
    /// A privileged command came from someone other than the owner.
    CommandIgnored,
    /// A blocked write was staged for review.
    WriteStaged,
    /// A lifecycle handler failed and was turned into a no-op.
    HookFailure,
}

impl SecurityAction {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityAction::TaintEscalated => "taint_escalated",
            SecurityAction::ToolBlocked => "tool_blocked",
            SecurityAction::ConfirmationRequested => "confirmation_requested",
            SecurityAction::ApprovalGranted => "approval_granted",
            SecurityAction::ApprovalRejected => "approval_rejected",
            SecurityAction::TaintReset => "taint_reset",
            SecurityAction::CommandIgnored => "command_ignored",
            SecurityAction::WriteStaged => "write_staged",
            SecurityAction::HookFailure => "hook_failure",
        }
    }
}

impl std::fmt::Display for SecurityAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line in the JSONL audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub session_key: String,
    pub action: SecurityAction,
    pub tool: Option<String>,
    /// Taint level involved, as its lowercase name.
    pub level: Option<String>,
    /// Human-readable description.
    pub detail: String,
    /// Hash of the previous line in the log; `None` for the first event.
    pub previous_hash: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl SecurityEvent {
    pub fn new(
        session_key: impl Into<String>,
        action: SecurityAction,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            session_key: session_key.into(),
            action,
            tool: None,
            level: None,
            detail: detail.into(),
            previous_hash: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = Some(tool.into());
        self
    }

    pub fn with_level(mut self, level: impl ToString) -> Self {
        self.level = Some(level.to_string());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}
