// notify.rs — Delivering approval codes to the owner.
//
// When a batch of confirmations is filed, the code has to reach the owner
// through a channel the model cannot read. The guard hands each new
// `Challenge` to every registered `ChallengeNotifier`; the daemon forwards
// it as a protocol message, and the default notifier just logs it.
//
// A failing notifier is logged and skipped. It never fails the hook.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GuardError;

/// A freshly issued approval code and the tools it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub session_key: String,
    pub code: String,
    pub tools: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl Challenge {
    /// The owner-facing instruction, e.g.
    /// `.approve all K7QM2X` for a batch, `.approve exec K7QM2X` for one tool.
    pub fn instruction(&self) -> String {
        let target = match self.tools.as_slice() {
            [only] => only.as_str(),
            _ => "all",
        };
        format!(".approve {} {}", target, self.code)
    }
}

/// Receives new challenges.
pub trait ChallengeNotifier: Send + Sync {
    fn notify(&self, challenge: &Challenge) -> Result<(), GuardError>;
}

/// Writes challenges to the tracing log. Installed when nothing else is.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl ChallengeNotifier for TracingNotifier {
    fn notify(&self, challenge: &Challenge) -> Result<(), GuardError> {
        tracing::info!(
            session = %challenge.session_key,
            tools = ?challenge.tools,
            expires_at = %challenge.expires_at,
            instruction = %challenge.instruction(),
            "confirmation required"
        );
        Ok(())
    }
}

/// Fans a challenge out to several notifiers.
#[derive(Default)]
pub struct NotifierSet {
    notifiers: Vec<Box<dyn ChallengeNotifier>>,
}

impl NotifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, notifier: Box<dyn ChallengeNotifier>) {
        self.notifiers.push(notifier);
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    /// Deliver to every notifier. Returns how many succeeded.
    pub fn dispatch(&self, challenge: &Challenge) -> usize {
        let mut delivered = 0;
        for notifier in &self.notifiers {
            match notifier.notify(challenge) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!(
                    session = %challenge.session_key,
                    error = %e,
                    "challenge notifier failed"
                ),
            }
        }
        delivered
    }
}

impl std::fmt::Debug for NotifierSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierSet")
            .field("notifiers", &self.notifiers.len())
            .finish()
    }
}
