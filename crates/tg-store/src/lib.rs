//! # tg-store
//!
//! Durable state for Taint Guard.
//!
//! - [`WatermarkStore`]: the worst taint each session has ever reached,
//!   re-injected at the start of every turn so restrictions survive turn
//!   boundaries.
//! - [`WatermarkPersister`]: debounced background flushing, so hook handlers
//!   never wait on disk.
//! - [`BlockedWriteStore`]: privileged writes the guard refused, kept for
//!   owner review instead of being lost.
//!
//! ## Key invariants
//!
//! - **One-way ratchet**: `escalate` only ever moves a session toward less
//!   trusted; only an audited owner reset or a fresh session clears it.
//! - **Lazy entries**: sessions that stay `trusted` have no record.
//! - **Atomic writes**: the watermark document is replaced via rename.

pub mod error;
pub mod persister;
pub mod staging;
pub mod watermark;

pub use error::StoreError;
pub use persister::{WatermarkPersister, DEFAULT_DEBOUNCE};
pub use staging::{BlockedWrite, BlockedWriteStore};
pub use watermark::{
    ResetEntry, ResetRecord, SessionWatermark, WatermarkDocument, WatermarkStore,
    WATERMARK_DOCUMENT_VERSION,
};
