// session.rs — Per-session orchestrator state.
//
// One `SessionState` per session key, held in a sharded `SessionMap` so that
// concurrent sessions never contend on the same lock. The open graph is
// `Some` between turn start and turn end; sealed graphs move into the
// archive.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tg_taint::{GraphArchive, NodeId, TurnGraph, TurnSummary};

#[derive(Debug, Default)]
pub struct SessionState {
    /// The current turn's graph. Never sealed while stored here.
    pub graph: Option<TurnGraph>,
    /// Created on first archive, with the configured capacity.
    archive: Option<GraphArchive>,
    /// Most recent model-call node, the requester of subsequent actions.
    pub last_model_call: Option<NodeId>,
    /// Normalized names hidden from the model at the last pre-model call.
    pub blocked_tools: BTreeSet<String>,
    /// Whether the turn's sender is the verified owner.
    pub owner_turn: bool,
    /// Command results waiting to be shown to the owner.
    pub feedback: Vec<String>,
    /// Last turn start or turn end.
    pub last_active: Option<DateTime<Utc>>,
}

impl SessionState {
    /// Install a freshly seeded graph and forget per-turn leftovers.
    pub fn begin_turn(&mut self, graph: TurnGraph, owner_turn: bool, feedback: Vec<String>) {
        self.graph = Some(graph);
        self.last_model_call = None;
        self.blocked_tools.clear();
        self.owner_turn = owner_turn;
        self.feedback = feedback;
    }

    /// Take the open graph and clear per-turn state.
    pub fn end_turn(&mut self) -> Option<TurnGraph> {
        self.last_model_call = None;
        self.blocked_tools.clear();
        self.owner_turn = false;
        self.feedback.clear();
        self.graph.take()
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_active = Some(now);
    }

    /// No turn is open and nothing has happened since `cutoff`.
    pub fn is_idle_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.graph.is_none() && self.last_active.map_or(true, |at| at < cutoff)
    }

    /// Keep a sealed graph, evicting the oldest past `capacity`.
    pub fn archive(&mut self, graph: TurnGraph, capacity: usize) {
        self.archive
            .get_or_insert_with(|| GraphArchive::new(capacity))
            .push(graph);
    }

    pub fn archived(&self) -> Vec<TurnSummary> {
        self.archive
            .as_ref()
            .map(GraphArchive::summaries)
            .unwrap_or_default()
    }

    pub fn archived_count(&self) -> usize {
        self.archive.as_ref().map_or(0, GraphArchive::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tg_taint::TrustLevel;

    fn sealed(session: &str) -> TurnGraph {
        let mut graph = TurnGraph::new(session);
        graph.seal().unwrap();
        graph
    }

    #[test]
    fn archive_is_bounded() {
        let mut state = SessionState::default();
        for _ in 0..5 {
            state.archive(sealed("s"), 3);
        }
        assert_eq!(state.archived_count(), 3);
        assert_eq!(state.archived().len(), 3);
    }

    #[test]
    fn open_turn_is_never_idle() {
        let now = Utc::now();
        let mut state = SessionState::default();
        state.touch(now - chrono::Duration::hours(2));
        assert!(state.is_idle_since(now - chrono::Duration::hours(1)));

        state.begin_turn(TurnGraph::new("s"), false, Vec::new());
        assert!(!state.is_idle_since(now));
    }

    #[test]
    fn end_turn_clears_per_turn_state() {
        let mut state = SessionState::default();
        let mut graph = TurnGraph::new("s");
        graph
            .add_context(tg_taint::NodeKind::Context, TrustLevel::External, "page")
            .unwrap();
        state.begin_turn(graph, true, vec!["approved".into()]);
        state.blocked_tools.insert("exec".into());

        let graph = state.end_turn().unwrap();
        assert_eq!(graph.max_taint(), TrustLevel::External);
        assert!(state.graph.is_none());
        assert!(state.blocked_tools.is_empty());
        assert!(state.feedback.is_empty());
        assert!(!state.owner_turn);
    }
}
