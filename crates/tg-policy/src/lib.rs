//! # tg-policy
//!
//! Taint-aware policy resolution and owner approval challenges.
//!
//! A [`TaintPolicyConfig`] maps each trust level to a default [`PolicyMode`]
//! and lets individual tools override it. The [`PolicyEngine`] resolves the
//! mode for every candidate tool at the turn's current taint, and the
//! [`ApprovalStore`] issues the random codes a verified owner redeems to
//! release confirm-mode tools.
//!
//! ## Key invariants
//!
//! - **Monotonic defaults**: strictness never decreases as trust decreases;
//!   [`validate_monotonicity`] corrects violations upward and never fails.
//! - **Unclassified floor**: a tool missing from the trust table is gated at
//!   least as strictly as the untrusted level.
//! - **Restrict is final**: approvals release `confirm` tools only.
//! - **Codes expire**: expiry is checked lazily on every lookup.

pub mod approval;
pub mod document;
pub mod engine;
pub mod error;
pub mod mode;

pub use approval::{
    ActiveApproval, ApprovalOutcome, ApprovalStore, ApprovalTarget, PendingApproval,
    PendingRequest, RejectReason, ALL_TOOLS, DEFAULT_CODE_LENGTH, DEFAULT_CODE_TTL_MINUTES,
};
pub use document::{
    migrate_document, CompiledPolicy, PolicyDocument, RawPolicy, CURRENT_POLICY_VERSION,
};
pub use engine::{
    get_mode, resolve_mode, Evaluation, EvaluationStep, ModeResolution, ModeSource, ModeTrace,
    PendingConfirmation, PolicyEngine, PolicyVerdict, ToolDecision, DEFAULT_MAX_ITERATIONS,
};
pub use error::PolicyError;
pub use mode::{
    validate_monotonicity, LevelModes, LevelSelector, MonotonicityCorrection, PolicyMode,
    TaintPolicyConfig, ToolOverride,
};
