//! # tg-taint
//!
//! Trust lattice and per-turn provenance tracking for Taint Guard.
//!
//! An agent turn ingests content of varying trustworthiness. Each observation
//! becomes a node in a [`TurnGraph`]; the graph folds every node's
//! [`TrustLevel`] into a running high-water mark that never improves within
//! the turn except through an explicit, authenticated reset.
//!
//! ## Key invariants
//!
//! - **Total order**: `trusted < shared < external < untrusted`;
//!   [`min_trust`] always yields the less trusted level.
//! - **Secure default**: tools missing from the [`ToolTrustTable`] produce
//!   untrusted output.
//! - **One-way seal**: a sealed graph rejects every mutation.

pub mod archive;
pub mod error;
pub mod graph;
pub mod session_map;
pub mod trust;

pub use archive::GraphArchive;
pub use error::TaintError;
pub use graph::{
    EdgeRelation, GraphState, NodeId, NodeKind, ProvenanceEdge, ProvenanceNode, TurnGraph,
    TurnSummary,
};
pub use session_map::SessionMap;
pub use trust::{
    classify_output, min_trust, normalize_tool, LegacyTrustLevel, ToolTrustTable, TrustLevel,
};
