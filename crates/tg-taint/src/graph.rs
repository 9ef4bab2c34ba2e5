// graph.rs — TurnGraph: the per-turn provenance record.
//
// One TurnGraph exists per agent turn. The orchestrator appends nodes as
// lifecycle events arrive: the system context and inbound message at turn
// start, a model_call node per iteration, a tool_call node per requested
// action, decision nodes when an action is withheld, and an output node for
// the final response.
//
// Every node insertion folds the node's trust into `max_taint` with
// `min_trust`, the high-water mark. Within a turn the value can only get
// worse; the single exception is `reset_taint`, which callers may invoke
// only on behalf of an authenticated owner.
//
// Lifecycle:
//   Open → Sealed (one way). Any mutation of a sealed graph is an
//   orchestration bug and returns `TaintError::SealedGraph`.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaintError;
use crate::trust::{min_trust, normalize_tool, TrustLevel};

/// Identifier of a node within one graph (insertion index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// What a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Context,
    History,
    ModelCall,
    ToolCall,
    Decision,
    Output,
}

/// How two nodes are related.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeRelation {
    Triggers,
    Produces,
    Consumes,
    DerivesFrom,
    BlockedBy,
}

/// One observation in the turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub trust: TrustLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    /// Free-form description (e.g., "system prompt", "watermark").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEdge {
    pub from: NodeId,
    pub to: NodeId,
    pub relation: EdgeRelation,
}

/// Open or sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GraphState {
    Open,
    Sealed { sealed_at: DateTime<Utc> },
}

impl fmt::Display for GraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphState::Open => write!(f, "open"),
            GraphState::Sealed { .. } => write!(f, "sealed"),
        }
    }
}

/// Immutable summary produced when a graph is sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnSummary {
    pub turn_id: Uuid,
    pub session_key: String,
    pub final_taint: TrustLevel,
    /// Tools whose output was at or below `external`.
    pub tainted_tools: Vec<String>,
    pub tools_used: Vec<String>,
    pub tools_blocked: Vec<String>,
    pub iteration_count: u32,
    pub node_count: usize,
    pub edge_count: usize,
    pub started_at: DateTime<Utc>,
    pub sealed_at: DateTime<Utc>,
}

/// The provenance graph for one turn of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnGraph {
    turn_id: Uuid,
    session_key: String,
    started_at: DateTime<Utc>,
    state: GraphState,
    nodes: Vec<ProvenanceNode>,
    edges: Vec<ProvenanceEdge>,
    max_taint: TrustLevel,
    /// The node that most recently lowered `max_taint`.
    taint_source: Option<NodeId>,
    iteration: u32,
    tools_used: Vec<String>,
    tools_blocked: BTreeSet<String>,
}

impl TurnGraph {
    /// Open a new graph. Taint starts at the most trusted level; seed it
    /// with context nodes.
    pub fn new(session_key: impl Into<String>) -> Self {
        Self {
            turn_id: Uuid::new_v4(),
            session_key: session_key.into(),
            started_at: Utc::now(),
            state: GraphState::Open,
            nodes: Vec::new(),
            edges: Vec::new(),
            max_taint: TrustLevel::MOST_TRUSTED,
            taint_source: None,
            iteration: 0,
            tools_used: Vec::new(),
            tools_blocked: BTreeSet::new(),
        }
    }

    pub fn turn_id(&self) -> Uuid {
        self.turn_id
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> &GraphState {
        &self.state
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self.state, GraphState::Sealed { .. })
    }

    /// The worst trust level observed so far in this turn.
    pub fn max_taint(&self) -> TrustLevel {
        self.max_taint
    }

    /// The node responsible for the current taint, if any node lowered it.
    pub fn taint_source(&self) -> Option<&ProvenanceNode> {
        self.taint_source.and_then(|id| self.node(id))
    }

    /// Highest iteration number seen.
    pub fn iteration_count(&self) -> u32 {
        self.iteration
    }

    pub fn nodes(&self) -> &[ProvenanceNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[ProvenanceEdge] {
        &self.edges
    }

    pub fn node(&self, id: NodeId) -> Option<&ProvenanceNode> {
        self.nodes.get(id.0 as usize)
    }

    pub fn tools_used(&self) -> &[String] {
        &self.tools_used
    }

    pub fn tools_blocked(&self) -> &BTreeSet<String> {
        &self.tools_blocked
    }

    /// Append a node and fold its trust into the running taint.
    pub fn add_node(
        &mut self,
        kind: NodeKind,
        trust: TrustLevel,
        tool: Option<&str>,
        iteration: Option<u32>,
    ) -> Result<NodeId, TaintError> {
        self.push(kind, trust, tool, iteration, None, true)
    }

    /// Append a context or history node with a description.
    pub fn add_context(
        &mut self,
        kind: NodeKind,
        trust: TrustLevel,
        label: impl Into<String>,
    ) -> Result<NodeId, TaintError> {
        self.push(kind, trust, None, None, Some(label.into()), true)
    }

    /// Append an edge between two existing nodes.
    pub fn add_edge(
        &mut self,
        from: NodeId,
        to: NodeId,
        relation: EdgeRelation,
    ) -> Result<(), TaintError> {
        self.ensure_open()?;
        for id in [from, to] {
            if self.node(id).is_none() {
                return Err(TaintError::UnknownNode {
                    turn_id: self.turn_id,
                    node: id.0,
                });
            }
        }
        self.edges.push(ProvenanceEdge { from, to, relation });
        Ok(())
    }

    /// Record a model call for an iteration.
    ///
    /// The node carries the taint the model is reasoning under, and
    /// consumes the node that introduced it.
    pub fn record_model_call(&mut self, iteration: u32) -> Result<NodeId, TaintError> {
        let trust = self.max_taint;
        let id = self.push(NodeKind::ModelCall, trust, None, Some(iteration), None, true)?;
        self.iteration = self.iteration.max(iteration);
        if let Some(source) = self.taint_source {
            self.add_edge(id, source, EdgeRelation::Consumes)?;
        }
        Ok(id)
    }

    /// Record an action the model requested, tagged with the trust level
    /// of its output. Adds a `triggers` edge from the requesting model call.
    pub fn record_tool_call(
        &mut self,
        tool: &str,
        output_trust: TrustLevel,
        iteration: u32,
        requested_by: Option<NodeId>,
    ) -> Result<NodeId, TaintError> {
        let tool = normalize_tool(tool);
        let id = self.push(
            NodeKind::ToolCall,
            output_trust,
            Some(&tool),
            Some(iteration),
            None,
            true,
        )?;
        if let Some(model_call) = requested_by {
            self.add_edge(model_call, id, EdgeRelation::Triggers)?;
        }
        if !self.tools_used.contains(&tool) {
            self.tools_used.push(tool);
        }
        Ok(id)
    }

    /// Record that an action was withheld, linked to the node whose taint
    /// caused it.
    pub fn record_block(
        &mut self,
        tool: &str,
        iteration: Option<u32>,
        reason: impl Into<String>,
    ) -> Result<NodeId, TaintError> {
        let tool = normalize_tool(tool);
        let trust = self.max_taint;
        let id = self.push(
            NodeKind::Decision,
            trust,
            Some(&tool),
            iteration,
            Some(reason.into()),
            true,
        )?;
        if let Some(source) = self.taint_source {
            self.add_edge(id, source, EdgeRelation::BlockedBy)?;
        }
        self.tools_blocked.insert(tool);
        Ok(id)
    }

    /// Record the final response, derived from the given model call.
    pub fn record_output(
        &mut self,
        iteration: Option<u32>,
        derived_from: Option<NodeId>,
    ) -> Result<NodeId, TaintError> {
        let trust = self.max_taint;
        let id = self.push(NodeKind::Output, trust, None, iteration, None, true)?;
        if let Some(from) = derived_from {
            self.add_edge(id, from, EdgeRelation::DerivesFrom)?;
        }
        Ok(id)
    }

    /// Replace the running taint with `level`.
    ///
    /// This is the only way taint improves within a turn. Callers must have
    /// authenticated the principal requesting it; nothing derived from
    /// content may reach this method.
    pub fn reset_taint(
        &mut self,
        level: TrustLevel,
        reason: impl Into<String>,
    ) -> Result<NodeId, TaintError> {
        let id = self.push(
            NodeKind::Decision,
            level,
            None,
            None,
            Some(reason.into()),
            false,
        )?;
        self.max_taint = level;
        self.taint_source = if level == TrustLevel::MOST_TRUSTED {
            None
        } else {
            Some(id)
        };
        Ok(id)
    }

    /// Freeze the graph and return its summary.
    pub fn seal(&mut self) -> Result<TurnSummary, TaintError> {
        self.ensure_open()?;
        let sealed_at = Utc::now();
        self.state = GraphState::Sealed { sealed_at };
        Ok(self.summary_at(sealed_at))
    }

    /// Summary of a sealed graph. Returns `None` while the graph is open.
    pub fn summary(&self) -> Option<TurnSummary> {
        match self.state {
            GraphState::Sealed { sealed_at } => Some(self.summary_at(sealed_at)),
            GraphState::Open => None,
        }
    }

    fn summary_at(&self, sealed_at: DateTime<Utc>) -> TurnSummary {
        let mut tainted_tools: Vec<String> = Vec::new();
        for node in &self.nodes {
            if node.kind != NodeKind::ToolCall || !node.trust.is_at_or_below(TrustLevel::External) {
                continue;
            }
            if let Some(tool) = &node.tool {
                if !tainted_tools.contains(tool) {
                    tainted_tools.push(tool.clone());
                }
            }
        }

        TurnSummary {
            turn_id: self.turn_id,
            session_key: self.session_key.clone(),
            final_taint: self.max_taint,
            tainted_tools,
            tools_used: self.tools_used.clone(),
            tools_blocked: self.tools_blocked.iter().cloned().collect(),
            iteration_count: self.iteration,
            node_count: self.nodes.len(),
            edge_count: self.edges.len(),
            started_at: self.started_at,
            sealed_at,
        }
    }

    fn ensure_open(&self) -> Result<(), TaintError> {
        if self.is_sealed() {
            return Err(TaintError::SealedGraph {
                turn_id: self.turn_id,
            });
        }
        Ok(())
    }

    fn push(
        &mut self,
        kind: NodeKind,
        trust: TrustLevel,
        tool: Option<&str>,
        iteration: Option<u32>,
        label: Option<String>,
        fold: bool,
    ) -> Result<NodeId, TaintError> {
        self.ensure_open()?;
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(ProvenanceNode {
            id,
            kind,
            trust,
            tool: tool.map(str::to_string),
            iteration,
            label,
            timestamp: Utc::now(),
        });

        if fold {
            let folded = min_trust(self.max_taint, trust);
            if folded != self.max_taint {
                tracing::debug!(
                    session = %self.session_key,
                    from = %self.max_taint,
                    to = %folded,
                    node = %id,
                    "turn taint escalated"
                );
                self.max_taint = folded;
                self.taint_source = Some(id);
            }
        }
        Ok(id)
    }
}
