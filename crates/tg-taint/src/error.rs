// error.rs — Error types for the taint subsystem.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while tracking taint.
#[derive(Debug, Error)]
pub enum TaintError {
    /// A name did not match any trust level.
    #[error("unknown trust level '{0}'")]
    UnknownTrustLevel(String),

    /// A sealed graph was mutated. This is an orchestration bug, not a
    /// security condition.
    #[error("turn graph {turn_id} is sealed and cannot be modified")]
    SealedGraph { turn_id: Uuid },

    /// An edge referenced a node that does not exist in the graph.
    #[error("node {node} does not exist in turn graph {turn_id}")]
    UnknownNode { turn_id: Uuid, node: u32 },
}
