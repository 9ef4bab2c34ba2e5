//! # tg-hooks
//!
//! Lifecycle hook orchestration: the piece a host agent runtime talks to.
//!
//! The host reports each step of a turn as a [`HookEvent`]. [`TaintGuard`]
//! keeps one provenance graph per session, asks the policy engine which
//! tools the model may see and run at the current taint, files confirmation
//! challenges, honours owner commands, and ratchets the durable watermark
//! when the turn ends.
//!
//! ## Key invariants
//!
//! - **Fail-open**: [`TaintGuard::handle`] never returns an error and never
//!   unwinds into the host. A failing handler yields [`HookResponse::None`].
//! - **Owner-only commands**: `.approve` and `.reset-trust` take effect only
//!   when the host marks the sender as the verified owner.
//! - **Taint only improves by reset**: nothing observed during a turn can
//!   lower its taint; only an owner `.reset-trust` does.
//! - **Session isolation**: state is keyed by session; sessions never share
//!   a graph, a watermark, or an approval.

pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod fail_open;
pub mod guard;
pub mod notify;
pub mod session;

pub use command::{CommandParser, MalformedCommand, OwnerCommand};
pub use config::{ConfigFormat, GuardConfig};
pub use error::GuardError;
pub use event::{HookEvent, HookResponse, ToolCallRequest, TurnStart};
pub use fail_open::{catch_handler, fail_open};
pub use guard::{classify_sender, TaintGuard, WRITE_TOOLS};
pub use notify::{Challenge, ChallengeNotifier, NotifierSet, TracingNotifier};
pub use session::SessionState;
