// approval.rs — Challenge codes and live approvals, isolated per session.
//
// When the engine decides a tool needs confirmation, the orchestrator files
// a *batch* of pending entries that share one random code. The verified owner
// redeems the code with `.approve <tool|all> <code> [minutes]`:
//
//   - `all` approves every unexpired pending entry carrying that code.
//   - a tool name approves only that tool's entry, and only if its code
//     matches and it has not expired.
//
// Grants without a duration are turn-scoped and disappear at
// `clear_turn_scoped`; grants with a duration live until an absolute
// wall-clock expiry. Expiry is checked lazily on every lookup; nothing
// runs in the background.
//
// The code is the load-bearing property: text injected into the conversation
// can say "approve" all it likes, it cannot know a code generated after the
// content arrived.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tg_taint::{normalize_tool, SessionMap};

use crate::error::PolicyError;

/// Tool name used for a wildcard grant.
pub const ALL_TOOLS: &str = "all";

/// Alphabet for challenge codes. Omits 0/O and 1/I so codes survive being
/// read aloud or retyped from a phone.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Default lifetime of a challenge code.
pub const DEFAULT_CODE_TTL_MINUTES: u32 = 10;

/// Default challenge code length.
pub const DEFAULT_CODE_LENGTH: usize = 6;

/// What an `.approve` command names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "target", content = "tool", rename_all = "snake_case")]
pub enum ApprovalTarget {
    All,
    Tool(String),
}

impl fmt::Display for ApprovalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalTarget::All => f.write_str(ALL_TOOLS),
            ApprovalTarget::Tool(tool) => f.write_str(tool),
        }
    }
}

impl FromStr for ApprovalTarget {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = normalize_tool(s);
        match name.as_str() {
            "" => Err(PolicyError::EmptyTarget),
            ALL_TOOLS => Ok(ApprovalTarget::All),
            _ => Ok(ApprovalTarget::Tool(name)),
        }
    }
}

/// One item of a batch about to be filed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub session_key: String,
    pub tool_name: String,
    pub reason: String,
}

/// A confirmation waiting for the owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub session_key: String,
    pub tool_name: String,
    pub reason: String,
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

impl PendingApproval {
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A redeemed approval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveApproval {
    /// A tool name, or [`ALL_TOOLS`].
    pub tool_name: String,
    pub granted_at: DateTime<Utc>,
    /// `None` means valid until the turn ends.
    pub expires_at: Option<DateTime<Utc>>,
}

impl ActiveApproval {
    pub fn is_turn_scoped(&self) -> bool {
        self.expires_at.is_none()
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Why a redemption was refused. Always reported back to the owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    /// Nothing is pending for the named target in this session.
    NoPending { target: String },
    /// Something is pending, but not under this code.
    CodeMismatch,
    /// The code matched, but every entry it covered has expired.
    Expired,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NoPending { target } => {
                write!(f, "no pending confirmation for '{}'", target)
            }
            RejectReason::CodeMismatch => f.write_str("code does not match"),
            RejectReason::Expired => f.write_str("code has expired"),
        }
    }
}

/// Result of `approve_with_code`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved {
        tools: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
    },
    Rejected {
        reason: RejectReason,
    },
}

impl ApprovalOutcome {
    pub fn is_approved(&self) -> bool {
        matches!(self, ApprovalOutcome::Approved { .. })
    }
}

#[derive(Debug, Default)]
struct SessionApprovals {
    /// Keyed by normalized tool name. A newer batch replaces an older entry.
    pending: BTreeMap<String, PendingApproval>,
    /// Keyed by normalized tool name or [`ALL_TOOLS`].
    active: BTreeMap<String, ActiveApproval>,
}

/// Pending challenges and live approvals for every session.
#[derive(Debug)]
pub struct ApprovalStore {
    ttl: Duration,
    code_length: usize,
    sessions: SessionMap<SessionApprovals>,
}

impl ApprovalStore {
    pub fn new(ttl_minutes: u32, code_length: usize) -> Self {
        Self {
            ttl: Duration::minutes(i64::from(ttl_minutes)),
            code_length: code_length.max(4),
            sessions: SessionMap::new(),
        }
    }

    pub fn code_ttl(&self) -> Duration {
        self.ttl
    }

    /// File a batch under one fresh code. Every item expires together.
    pub fn add_pending_batch(&self, items: &[PendingRequest]) -> String {
        self.add_pending_batch_at(items, Utc::now())
    }

    pub fn add_pending_batch_at(&self, items: &[PendingRequest], now: DateTime<Utc>) -> String {
        let code = generate_code(self.code_length);
        let expires_at = now + self.ttl;

        for item in items {
            let tool = normalize_tool(&item.tool_name);
            let entry = PendingApproval {
                session_key: item.session_key.clone(),
                tool_name: tool.clone(),
                reason: item.reason.clone(),
                code: code.clone(),
                expires_at,
            };
            self.sessions.with_entry(&item.session_key, |s| {
                s.pending.insert(tool, entry);
            });
        }

        tracing::debug!(items = items.len(), %expires_at, "pending confirmation batch filed");
        code
    }

    /// The unexpired pending entry for a tool, if any.
    pub fn live_pending_at(
        &self,
        session_key: &str,
        tool: &str,
        now: DateTime<Utc>,
    ) -> Option<PendingApproval> {
        let tool = normalize_tool(tool);
        self.sessions
            .with_existing(session_key, |s| {
                s.pending.get(&tool).filter(|p| p.is_live_at(now)).cloned()
            })
            .flatten()
    }

    /// Every unexpired pending entry for a session, ordered by tool name.
    pub fn pending_for_session_at(
        &self,
        session_key: &str,
        now: DateTime<Utc>,
    ) -> Vec<PendingApproval> {
        self.sessions
            .with_existing(session_key, |s| {
                s.pending
                    .values()
                    .filter(|p| p.is_live_at(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Redeem a code. `duration_minutes == None` makes the grant turn-scoped.
    pub fn approve_with_code(
        &self,
        session_key: &str,
        target: &ApprovalTarget,
        code: &str,
        duration_minutes: Option<u32>,
    ) -> ApprovalOutcome {
        self.approve_with_code_at(session_key, target, code, duration_minutes, Utc::now())
    }

    pub fn approve_with_code_at(
        &self,
        session_key: &str,
        target: &ApprovalTarget,
        code: &str,
        duration_minutes: Option<u32>,
        now: DateTime<Utc>,
    ) -> ApprovalOutcome {
        let code = normalize_code(code);
        let expires_at = duration_minutes.map(|m| now + Duration::minutes(i64::from(m)));
        let grant = |tool_name: &str| ActiveApproval {
            tool_name: tool_name.to_string(),
            granted_at: now,
            expires_at,
        };

        self.sessions.with_entry(session_key, |s| match target {
            ApprovalTarget::All => {
                let matching: Vec<String> = s
                    .pending
                    .values()
                    .filter(|p| p.code == code)
                    .map(|p| p.tool_name.clone())
                    .collect();
                if matching.is_empty() {
                    let reason = if s.pending.is_empty() {
                        RejectReason::NoPending {
                            target: ALL_TOOLS.to_string(),
                        }
                    } else {
                        RejectReason::CodeMismatch
                    };
                    return ApprovalOutcome::Rejected { reason };
                }

                let mut approved = Vec::new();
                for tool in matching {
                    if let Some(entry) = s.pending.remove(&tool) {
                        if entry.is_live_at(now) {
                            approved.push(tool);
                        }
                    }
                }
                if approved.is_empty() {
                    return ApprovalOutcome::Rejected {
                        reason: RejectReason::Expired,
                    };
                }

                s.active.insert(ALL_TOOLS.to_string(), grant(ALL_TOOLS));
                ApprovalOutcome::Approved {
                    tools: approved,
                    expires_at,
                }
            }
            ApprovalTarget::Tool(tool) => {
                let tool = normalize_tool(tool);
                let entry = match s.pending.get(&tool) {
                    None => {
                        return ApprovalOutcome::Rejected {
                            reason: RejectReason::NoPending { target: tool },
                        }
                    }
                    Some(entry) => entry,
                };
                if entry.code != code {
                    return ApprovalOutcome::Rejected {
                        reason: RejectReason::CodeMismatch,
                    };
                }
                let live = entry.is_live_at(now);
                s.pending.remove(&tool);
                if !live {
                    return ApprovalOutcome::Rejected {
                        reason: RejectReason::Expired,
                    };
                }

                s.active.insert(tool.clone(), grant(&tool));
                ApprovalOutcome::Approved {
                    tools: vec![tool],
                    expires_at,
                }
            }
        })
    }

    /// Whether the tool has a live grant, specific or wildcard. Expired
    /// grants found along the way are evicted.
    pub fn is_approved(&self, session_key: &str, tool: &str) -> bool {
        self.is_approved_at(session_key, tool, Utc::now())
    }

    pub fn is_approved_at(&self, session_key: &str, tool: &str, now: DateTime<Utc>) -> bool {
        let tool = normalize_tool(tool);
        self.sessions
            .with_existing(session_key, |s| {
                [tool.as_str(), ALL_TOOLS].iter().any(|key| {
                    match s.active.get(*key).map(|grant| grant.is_live_at(now)) {
                        Some(true) => true,
                        Some(false) => {
                            s.active.remove(*key);
                            false
                        }
                        None => false,
                    }
                })
            })
            .unwrap_or(false)
    }

    /// Live grants for a session, ordered by tool name.
    pub fn active_for_session_at(
        &self,
        session_key: &str,
        now: DateTime<Utc>,
    ) -> Vec<ActiveApproval> {
        self.sessions
            .with_existing(session_key, |s| {
                s.active.retain(|_, grant| grant.is_live_at(now));
                s.active.values().cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Drop every turn-scoped grant for a session. Timed grants survive.
    /// Returns how many were dropped.
    pub fn clear_turn_scoped(&self, session_key: &str) -> usize {
        self.sessions
            .with_existing(session_key, |s| {
                let before = s.active.len();
                s.active.retain(|_, grant| !grant.is_turn_scoped());
                before - s.active.len()
            })
            .unwrap_or(0)
    }

    /// Drop expired entries and, once nothing pending or granted is left,
    /// the session itself. Returns whether the session was dropped.
    pub fn prune_session_at(&self, session_key: &str, now: DateTime<Utc>) -> bool {
        self.sessions
            .remove_if(session_key, |s| {
                s.pending.retain(|_, p| p.is_live_at(now));
                s.active.retain(|_, grant| grant.is_live_at(now));
                s.pending.is_empty() && s.active.is_empty()
            })
            .is_some()
    }

    /// Sessions with any state, live or not yet pruned.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for ApprovalStore {
    fn default() -> Self {
        Self::new(DEFAULT_CODE_TTL_MINUTES, DEFAULT_CODE_LENGTH)
    }
}

fn generate_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(session: &str, tool: &str) -> PendingRequest {
        PendingRequest {
            session_key: session.to_string(),
            tool_name: tool.to_string(),
            reason: format!("{} needs confirmation", tool),
        }
    }

    fn tool(name: &str) -> ApprovalTarget {
        ApprovalTarget::Tool(name.to_string())
    }

    #[test]
    fn codes_use_configured_length_and_alphabet() {
        let store = ApprovalStore::new(10, 8);
        let code = store.add_pending_batch(&[request("s", "exec")]);
        assert_eq!(code.len(), 8);
        assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn batch_approve_all_before_and_after_expiry() {
        let store = ApprovalStore::new(10, 6);
        let now = Utc::now();
        let items = [request("s", "exec"), request("s", "write"), request("s", "cron")];
        let code = store.add_pending_batch_at(&items, now);

        let fresh = store.approve_with_code_at("s", &ApprovalTarget::All, &code, None, now);
        match fresh {
            ApprovalOutcome::Approved { tools, .. } => assert_eq!(tools.len(), 3),
            other => panic!("expected approval, got {:?}", other),
        }

        let code = store.add_pending_batch_at(&items, now);
        let late = now + Duration::minutes(11);
        let outcome = store.approve_with_code_at("t", &ApprovalTarget::All, &code, None, late);
        assert_eq!(
            outcome,
            ApprovalOutcome::Rejected {
                reason: RejectReason::NoPending {
                    target: "all".to_string()
                }
            }
        );
        let outcome = store.approve_with_code_at("s", &ApprovalTarget::All, &code, None, late);
        assert_eq!(
            outcome,
            ApprovalOutcome::Rejected {
                reason: RejectReason::Expired
            }
        );
    }

    #[test]
    fn expired_batch_approves_nothing() {
        let store = ApprovalStore::new(5, 6);
        let now = Utc::now();
        let code = store.add_pending_batch_at(&[request("s", "exec"), request("s", "write")], now);
        let later = now + Duration::minutes(6);

        let outcome = store.approve_with_code_at("s", &ApprovalTarget::All, &code, None, later);
        assert!(!outcome.is_approved());
        assert!(!store.is_approved_at("s", "exec", later));
        assert!(!store.is_approved_at("s", "write", later));
    }

    #[test]
    fn tool_target_requires_matching_code() {
        let store = ApprovalStore::default();
        let now = Utc::now();
        let code = store.add_pending_batch_at(&[request("s", "exec")], now);

        let wrong = store.approve_with_code_at("s", &tool("exec"), "ZZZZZZ", None, now);
        assert_eq!(
            wrong,
            ApprovalOutcome::Rejected {
                reason: RejectReason::CodeMismatch
            }
        );
        let missing = store.approve_with_code_at("s", &tool("write"), &code, None, now);
        assert!(matches!(
            missing,
            ApprovalOutcome::Rejected {
                reason: RejectReason::NoPending { .. }
            }
        ));

        let ok = store.approve_with_code_at("s", &tool("EXEC"), &code.to_lowercase(), None, now);
        assert!(ok.is_approved());
        assert!(store.is_approved_at("s", "exec", now));
        assert!(!store.is_approved_at("s", "write", now));
    }

    #[test]
    fn turn_scoped_grants_are_cleared_timed_grants_survive() {
        let store = ApprovalStore::default();
        let now = Utc::now();
        let code = store.add_pending_batch_at(&[request("s", "exec"), request("s", "write")], now);

        assert!(store
            .approve_with_code_at("s", &tool("exec"), &code, None, now)
            .is_approved());
        assert!(store
            .approve_with_code_at("s", &tool("write"), &code, Some(30), now)
            .is_approved());

        assert_eq!(store.clear_turn_scoped("s"), 1);
        assert!(!store.is_approved_at("s", "exec", now));
        assert!(store.is_approved_at("s", "write", now + Duration::minutes(29)));
        assert!(!store.is_approved_at("s", "write", now + Duration::minutes(31)));
        assert!(store.active_for_session_at("s", now).is_empty());
    }

    #[test]
    fn prune_drops_session_only_when_nothing_is_live() {
        let store = ApprovalStore::new(10, 6);
        let now = Utc::now();
        let code = store.add_pending_batch_at(&[request("s", "exec")], now);
        assert!(!store.prune_session_at("s", now));

        assert!(store
            .approve_with_code_at("s", &tool("exec"), &code, Some(30), now)
            .is_approved());
        assert!(!store.prune_session_at("s", now + Duration::minutes(29)));
        assert!(store.prune_session_at("s", now + Duration::minutes(31)));
        assert_eq!(store.session_count(), 0);
        assert!(!store.prune_session_at("never-seen", now));
    }

    #[test]
    fn wildcard_grant_covers_any_tool() {
        let store = ApprovalStore::default();
        let now = Utc::now();
        let code = store.add_pending_batch_at(&[request("s", "exec")], now);
        assert!(store
            .approve_with_code_at("s", &ApprovalTarget::All, &code, Some(5), now)
            .is_approved());
        assert!(store.is_approved_at("s", "browser", now));
        assert!(!store.is_approved_at("other", "browser", now));
    }

    #[test]
    fn newer_batch_replaces_pending_entry() {
        let store = ApprovalStore::default();
        let now = Utc::now();
        let first = store.add_pending_batch_at(&[request("s", "exec")], now);
        let second = store.add_pending_batch_at(&[request("s", "exec")], now);
        let pending = store.live_pending_at("s", "exec", now).unwrap();
        assert_eq!(pending.code, second);
        if first != second {
            let outcome = store.approve_with_code_at("s", &tool("exec"), &first, None, now);
            assert!(!outcome.is_approved());
        }
        assert_eq!(store.pending_for_session_at("s", now).len(), 1);
    }

    #[test]
    fn target_parsing() {
        assert_eq!("ALL".parse::<ApprovalTarget>().unwrap(), ApprovalTarget::All);
        assert_eq!(" Exec ".parse::<ApprovalTarget>().unwrap(), tool("exec"));
        assert!("  ".parse::<ApprovalTarget>().is_err());
    }
}
