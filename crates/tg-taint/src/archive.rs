// archive.rs — Bounded ring buffer of sealed turn graphs.
//
// When a turn ends (or a new turn starts while the previous graph is still
// open) the graph is sealed and pushed here. The oldest graph is evicted once
// the archive reaches capacity.

use std::collections::VecDeque;

use crate::graph::{TurnGraph, TurnSummary};

/// Recently sealed graphs for one session, oldest first.
#[derive(Debug, Clone)]
pub struct GraphArchive {
    capacity: usize,
    graphs: VecDeque<TurnGraph>,
}

impl GraphArchive {
    /// Create an archive holding at most `capacity` graphs (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            graphs: VecDeque::with_capacity(capacity),
        }
    }

    /// Archive a graph, returning the evicted graph if the buffer was full.
    pub fn push(&mut self, graph: TurnGraph) -> Option<TurnGraph> {
        let evicted = if self.graphs.len() == self.capacity {
            self.graphs.pop_front()
        } else {
            None
        };
        self.graphs.push_back(graph);
        evicted
    }

    /// The most recently archived graph.
    pub fn latest(&self) -> Option<&TurnGraph> {
        self.graphs.back()
    }

    /// Summaries of every archived graph that has been sealed, oldest first.
    pub fn summaries(&self) -> Vec<TurnSummary> {
        self.graphs.iter().filter_map(TurnGraph::summary).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TurnGraph> {
        self.graphs.iter()
    }

    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for GraphArchive {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed_graph(session: &str) -> TurnGraph {
        let mut graph = TurnGraph::new(session);
        graph.seal().unwrap();
        graph
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut archive = GraphArchive::new(2);
        let first = sealed_graph("s1");
        let first_id = first.turn_id();
        assert!(archive.push(first).is_none());
        assert!(archive.push(sealed_graph("s1")).is_none());

        let third = sealed_graph("s1");
        let third_id = third.turn_id();
        let evicted = archive.push(third).unwrap();

        assert_eq!(evicted.turn_id(), first_id);
        assert_eq!(archive.len(), 2);
        assert_eq!(archive.latest().unwrap().turn_id(), third_id);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut archive = GraphArchive::new(0);
        assert_eq!(archive.capacity(), 1);
        archive.push(sealed_graph("s1"));
        archive.push(sealed_graph("s1"));
        assert_eq!(archive.len(), 1);
    }

    #[test]
    fn summaries_skip_open_graphs() {
        let mut archive = GraphArchive::new(3);
        archive.push(sealed_graph("s1"));
        archive.push(TurnGraph::new("s1"));
        assert_eq!(archive.summaries().len(), 1);
    }
}
