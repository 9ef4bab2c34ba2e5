// engine.rs — Taint-aware policy evaluation.
//
// The PolicyEngine answers one question per candidate action: given the
// worst trust level the turn has seen, may the agent use this tool?
//
// Mode resolution (`resolve_mode`), first match wins:
//
// 1. An override for this tool at exactly this level → that mode
// 2. A wildcard (`*`) override for this tool → that mode
// 3. The tool is unclassified → stricter of (level default, untrusted default)
// 4. Otherwise → the level default
//
// Step 3 closes the tool-rename attack: a capability presented under a name
// nobody registered is gated at least as hard as untrusted content would be.
//
// `evaluate` partitions a candidate list into allowed / confirm / restricted
// and flags the iteration ceiling. `evaluate_with_approvals` then folds in
// live grants from the ApprovalStore so the orchestrator gets the final
// removal set and the confirmations it still has to request.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tg_taint::{normalize_tool, ToolTrustTable, TrustLevel, TurnGraph};

use crate::approval::ApprovalStore;
use crate::mode::{LevelSelector, PolicyMode, TaintPolicyConfig};

/// Default iteration ceiling for one turn.
pub const DEFAULT_MAX_ITERATIONS: u32 = 25;

/// Which resolution rule produced a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeSource {
    ExactOverride,
    WildcardOverride,
    UnclassifiedFloor,
    LevelDefault,
}

/// A resolved mode and the rule that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeResolution {
    pub mode: PolicyMode,
    pub source: ModeSource,
}

/// Resolve the mode for a tool at a taint level.
pub fn resolve_mode(
    tool: &str,
    level: TrustLevel,
    policy: &TaintPolicyConfig,
    table: &ToolTrustTable,
) -> ModeResolution {
    if let Some(tool_override) = policy.override_for(tool) {
        if let Some(mode) = tool_override.by_level.get(&level) {
            return ModeResolution {
                mode: *mode,
                source: ModeSource::ExactOverride,
            };
        }
        if let Some(mode) = tool_override.any {
            return ModeResolution {
                mode,
                source: ModeSource::WildcardOverride,
            };
        }
    }

    let default = policy.levels.get(level);
    if !table.is_classified(tool) {
        return ModeResolution {
            mode: default.stricter(policy.levels.get(TrustLevel::LEAST_TRUSTED)),
            source: ModeSource::UnclassifiedFloor,
        };
    }

    ModeResolution {
        mode: default,
        source: ModeSource::LevelDefault,
    }
}

/// Mode for a tool at a taint level. See [`resolve_mode`].
pub fn get_mode(
    tool: &str,
    level: TrustLevel,
    policy: &TaintPolicyConfig,
    table: &ToolTrustTable,
) -> PolicyMode {
    resolve_mode(tool, level, policy, table).mode
}

/// A step in mode resolution, for `tg policy explain`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationStep {
    /// Which check was performed (e.g., "override_exact", "unclassified_floor").
    pub check: String,
    /// The outcome of this check (e.g., "matched: restrict", "no entry").
    pub outcome: String,
    /// Whether this step decided the mode.
    pub terminal: bool,
}

/// Full resolution trace for one (tool, level) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeTrace {
    pub tool: String,
    pub level: TrustLevel,
    pub output_trust: TrustLevel,
    pub classified: bool,
    pub mode: PolicyMode,
    pub source: ModeSource,
    pub steps: Vec<EvaluationStep>,
}

/// Candidates partitioned by resolved mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub level: TrustLevel,
    pub allowed: Vec<String>,
    pub confirm: Vec<String>,
    pub restricted: Vec<String>,
    pub iteration: u32,
    /// Soft warning; the orchestrator decides whether to stop.
    pub iteration_limit_exceeded: bool,
}

/// A confirmation the orchestrator still has to request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub tool: String,
    pub reason: String,
}

/// Final decision for one pre-model-call evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyVerdict {
    pub level: TrustLevel,
    /// Strictest mode actually triggered: `allow` only when nothing was
    /// removed or left pending.
    pub mode: PolicyMode,
    pub allowed: Vec<String>,
    /// Normalized names of every tool to hide from the model.
    pub tool_removals: BTreeSet<String>,
    pub pending: Vec<PendingConfirmation>,
    pub restricted: Vec<String>,
    pub iteration_limit_exceeded: bool,
}

/// Execution-time decision for one tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ToolDecision {
    Allow,
    Confirm { reason: String },
    Restrict { reason: String },
}

/// The policy engine: a policy, the output-trust table, and the iteration
/// ceiling.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    policy: TaintPolicyConfig,
    table: ToolTrustTable,
    max_iterations: u32,
}

impl PolicyEngine {
    pub fn new(policy: TaintPolicyConfig, table: ToolTrustTable) -> Self {
        Self {
            policy,
            table,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn policy(&self) -> &TaintPolicyConfig {
        &self.policy
    }

    pub fn table(&self) -> &ToolTrustTable {
        &self.table
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn mode_for(&self, tool: &str, level: TrustLevel) -> PolicyMode {
        get_mode(tool, level, &self.policy, &self.table)
    }

    /// Resolve a mode and record every check on the way.
    pub fn explain(&self, tool: &str, level: TrustLevel) -> ModeTrace {
        let resolution = resolve_mode(tool, level, &self.policy, &self.table);
        let tool_override = self.policy.override_for(tool);
        let classified = self.table.is_classified(tool);
        let mut steps = Vec::new();

        let exact = tool_override.and_then(|o| o.by_level.get(&level));
        steps.push(EvaluationStep {
            check: "override_exact".to_string(),
            outcome: match exact {
                Some(mode) => format!("matched: {} at {}", mode, LevelSelector::Level(level)),
                None => "no entry".to_string(),
            },
            terminal: resolution.source == ModeSource::ExactOverride,
        });
        if resolution.source == ModeSource::ExactOverride {
            return self.trace(tool, level, classified, resolution, steps);
        }

        let wildcard = tool_override.and_then(|o| o.any);
        steps.push(EvaluationStep {
            check: "override_wildcard".to_string(),
            outcome: match wildcard {
                Some(mode) => format!("matched: {} at {}", mode, LevelSelector::Any),
                None => "no entry".to_string(),
            },
            terminal: resolution.source == ModeSource::WildcardOverride,
        });
        if resolution.source == ModeSource::WildcardOverride {
            return self.trace(tool, level, classified, resolution, steps);
        }

        steps.push(EvaluationStep {
            check: "unclassified_floor".to_string(),
            outcome: if classified {
                format!(
                    "passed: output classified as {}",
                    self.table.classify_output(tool)
                )
            } else {
                format!(
                    "applied: unclassified tool, floor is untrusted default '{}'",
                    self.policy.levels.get(TrustLevel::LEAST_TRUSTED)
                )
            },
            terminal: !classified,
        });
        if !classified {
            return self.trace(tool, level, classified, resolution, steps);
        }

        steps.push(EvaluationStep {
            check: "level_default".to_string(),
            outcome: format!("{} at {}", resolution.mode, level),
            terminal: true,
        });
        self.trace(tool, level, classified, resolution, steps)
    }

    fn trace(
        &self,
        tool: &str,
        level: TrustLevel,
        classified: bool,
        resolution: ModeResolution,
        steps: Vec<EvaluationStep>,
    ) -> ModeTrace {
        ModeTrace {
            tool: normalize_tool(tool),
            level,
            output_trust: self.table.classify_output(tool),
            classified,
            mode: resolution.mode,
            source: resolution.source,
            steps,
        }
    }

    /// Partition candidates by mode at the graph's current taint.
    pub fn evaluate(&self, graph: &TurnGraph, tools: &[String]) -> Evaluation {
        let level = graph.max_taint();
        let mut evaluation = Evaluation {
            level,
            allowed: Vec::new(),
            confirm: Vec::new(),
            restricted: Vec::new(),
            iteration: graph.iteration_count(),
            iteration_limit_exceeded: graph.iteration_count() > self.max_iterations,
        };

        let mut seen = BTreeSet::new();
        for tool in tools {
            if !seen.insert(normalize_tool(tool)) {
                continue;
            }
            match self.mode_for(tool, level) {
                PolicyMode::Allow => evaluation.allowed.push(tool.clone()),
                PolicyMode::Confirm => evaluation.confirm.push(tool.clone()),
                PolicyMode::Restrict => evaluation.restricted.push(tool.clone()),
            }
        }

        if evaluation.iteration_limit_exceeded {
            tracing::warn!(
                session = graph.session_key(),
                iteration = evaluation.iteration,
                max = self.max_iterations,
                "iteration ceiling exceeded"
            );
        }
        evaluation
    }

    /// Evaluate, then let live approvals release confirm-mode tools.
    pub fn evaluate_with_approvals(
        &self,
        graph: &TurnGraph,
        tools: &[String],
        approvals: &ApprovalStore,
    ) -> PolicyVerdict {
        self.evaluate_with_approvals_at(graph, tools, approvals, Utc::now())
    }

    pub fn evaluate_with_approvals_at(
        &self,
        graph: &TurnGraph,
        tools: &[String],
        approvals: &ApprovalStore,
        now: DateTime<Utc>,
    ) -> PolicyVerdict {
        let evaluation = self.evaluate(graph, tools);
        let session_key = graph.session_key();
        let mut allowed = evaluation.allowed;
        let mut pending = Vec::new();
        let mut tool_removals: BTreeSet<String> = evaluation
            .restricted
            .iter()
            .map(|t| normalize_tool(t))
            .collect();

        for tool in evaluation.confirm {
            if approvals.is_approved_at(session_key, &tool, now) {
                allowed.push(tool);
            } else {
                tool_removals.insert(normalize_tool(&tool));
                pending.push(PendingConfirmation {
                    reason: confirmation_reason(&tool, graph),
                    tool,
                });
            }
        }

        let mode = if !evaluation.restricted.is_empty() {
            PolicyMode::Restrict
        } else if !pending.is_empty() {
            PolicyMode::Confirm
        } else {
            PolicyMode::Allow
        };

        PolicyVerdict {
            level: evaluation.level,
            mode,
            allowed,
            tool_removals,
            pending,
            restricted: evaluation.restricted,
            iteration_limit_exceeded: evaluation.iteration_limit_exceeded,
        }
    }

    /// Execution-time check for a single call at the graph's current taint.
    pub fn decide_at(
        &self,
        graph: &TurnGraph,
        tool: &str,
        approvals: &ApprovalStore,
        now: DateTime<Utc>,
    ) -> ToolDecision {
        let level = graph.max_taint();
        match self.mode_for(tool, level) {
            PolicyMode::Allow => ToolDecision::Allow,
            PolicyMode::Confirm if approvals.is_approved_at(graph.session_key(), tool, now) => {
                ToolDecision::Allow
            }
            PolicyMode::Confirm => ToolDecision::Confirm {
                reason: confirmation_reason(tool, graph),
            },
            PolicyMode::Restrict => ToolDecision::Restrict {
                reason: format!(
                    "'{}' is restricted at {} taint{}",
                    normalize_tool(tool),
                    level,
                    describe_source(graph)
                ),
            },
        }
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(TaintPolicyConfig::builtin(), ToolTrustTable::builtin())
    }
}

fn confirmation_reason(tool: &str, graph: &TurnGraph) -> String {
    format!(
        "'{}' requires confirmation at {} taint{}",
        normalize_tool(tool),
        graph.max_taint(),
        describe_source(graph)
    )
}

fn describe_source(graph: &TurnGraph) -> String {
    match graph.taint_source() {
        Some(node) => match (&node.tool, &node.label) {
            (Some(tool), _) => format!(" (introduced by {})", tool),
            (None, Some(label)) => format!(" (introduced by {})", label),
            (None, None) => String::new(),
        },
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalTarget, PendingRequest};
    use crate::mode::LevelModes;
    use tg_taint::NodeKind;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn tainted_graph(session: &str, output: TrustLevel) -> TurnGraph {
        let mut graph = TurnGraph::new(session);
        graph
            .add_context(NodeKind::Context, TrustLevel::Trusted, "system prompt")
            .unwrap();
        let call = graph.record_model_call(1).unwrap();
        graph
            .record_tool_call("probe", output, 1, Some(call))
            .unwrap();
        graph.record_model_call(2).unwrap();
        graph
    }

    #[test]
    fn resolution_order() {
        let policy = TaintPolicyConfig::new(LevelModes::builtin())
            .with_override("exec", LevelSelector::Level(TrustLevel::Shared), PolicyMode::Allow)
            .with_override("exec", LevelSelector::Any, PolicyMode::Restrict);
        let table = ToolTrustTable::builtin();

        let exact = resolve_mode("exec", TrustLevel::Shared, &policy, &table);
        assert_eq!(exact.mode, PolicyMode::Allow);
        assert_eq!(exact.source, ModeSource::ExactOverride);

        let wildcard = resolve_mode("exec", TrustLevel::Trusted, &policy, &table);
        assert_eq!(wildcard.mode, PolicyMode::Restrict);
        assert_eq!(wildcard.source, ModeSource::WildcardOverride);

        let default = resolve_mode("write", TrustLevel::External, &policy, &table);
        assert_eq!(default.mode, PolicyMode::Confirm);
        assert_eq!(default.source, ModeSource::LevelDefault);
    }

    #[test]
    fn unclassified_tool_is_at_least_as_strict_as_untrusted() {
        let policy = TaintPolicyConfig::builtin();
        let table = ToolTrustTable::builtin();
        for level in TrustLevel::ALL {
            let mode = get_mode("totally_new_tool", level, &policy, &table);
            assert!(mode >= policy.levels.get(level));
            assert!(mode >= policy.levels.get(TrustLevel::Untrusted));
        }
        assert_eq!(
            resolve_mode("Renamed_Exec", TrustLevel::Trusted, &policy, &table).source,
            ModeSource::UnclassifiedFloor
        );
    }

    #[test]
    fn overrides_replace_rather_than_strengthen() {
        let engine = PolicyEngine::default();
        // Read-only tools stay allowed even at untrusted taint.
        assert_eq!(engine.mode_for("read", TrustLevel::Untrusted), PolicyMode::Allow);
        // Gateway stays restricted at external even though the default is confirm.
        assert_eq!(engine.mode_for("gateway", TrustLevel::External), PolicyMode::Restrict);
        assert_eq!(engine.mode_for("gateway", TrustLevel::Trusted), PolicyMode::Allow);
    }

    #[test]
    fn evaluate_partitions_by_mode() {
        let engine = PolicyEngine::default();
        let graph = tainted_graph("s", TrustLevel::External);
        let evaluation = engine.evaluate(&graph, &names(&["read", "exec", "gateway", "READ"]));

        assert_eq!(evaluation.level, TrustLevel::External);
        assert_eq!(evaluation.allowed, names(&["read"]));
        assert_eq!(evaluation.confirm, names(&["exec"]));
        assert_eq!(evaluation.restricted, names(&["gateway"]));
        assert!(!evaluation.iteration_limit_exceeded);
    }

    #[test]
    fn iteration_ceiling_is_a_soft_flag() {
        let engine = PolicyEngine::default().with_max_iterations(1);
        let graph = tainted_graph("s", TrustLevel::Trusted);
        let evaluation = engine.evaluate(&graph, &names(&["exec"]));
        assert!(evaluation.iteration_limit_exceeded);
        assert_eq!(evaluation.allowed, names(&["exec"]));
    }

    #[test]
    fn verdict_reports_allow_only_when_nothing_removed() {
        let engine = PolicyEngine::default();
        let approvals = ApprovalStore::default();

        let clean = tainted_graph("s", TrustLevel::Trusted);
        let verdict = engine.evaluate_with_approvals(&clean, &names(&["exec", "write"]), &approvals);
        assert_eq!(verdict.mode, PolicyMode::Allow);
        assert!(verdict.tool_removals.is_empty());

        let dirty = tainted_graph("s", TrustLevel::External);
        let verdict = engine.evaluate_with_approvals(&dirty, &names(&["exec", "read"]), &approvals);
        assert_eq!(verdict.mode, PolicyMode::Confirm);
        assert!(verdict.tool_removals.contains("exec"));
        assert_eq!(verdict.pending.len(), 1);
        assert!(verdict.pending[0].reason.contains("probe"));

        let verdict = engine.evaluate_with_approvals(&dirty, &names(&["exec", "gateway"]), &approvals);
        assert_eq!(verdict.mode, PolicyMode::Restrict);
    }

    #[test]
    fn live_approval_releases_confirm_tools_only() {
        let engine = PolicyEngine::default();
        let approvals = ApprovalStore::default();
        let graph = tainted_graph("s", TrustLevel::External);
        let now = Utc::now();

        let code = approvals.add_pending_batch_at(
            &[
                PendingRequest {
                    session_key: "s".to_string(),
                    tool_name: "exec".to_string(),
                    reason: "r".to_string(),
                },
            ],
            now,
        );
        assert!(approvals
            .approve_with_code_at("s", &ApprovalTarget::All, &code, None, now)
            .is_approved());

        let verdict = engine.evaluate_with_approvals_at(
            &graph,
            &names(&["exec", "gateway"]),
            &approvals,
            now,
        );
        assert!(verdict.allowed.contains(&"exec".to_string()));
        assert!(verdict.tool_removals.contains("gateway"));
        assert!(verdict.pending.is_empty());
        assert_eq!(
            engine.decide_at(&graph, "gateway", &approvals, now),
            ToolDecision::Restrict {
                reason: "'gateway' is restricted at external taint (introduced by probe)"
                    .to_string()
            }
        );
        assert_eq!(engine.decide_at(&graph, "exec", &approvals, now), ToolDecision::Allow);
    }

    #[test]
    fn explain_records_each_check() {
        let engine = PolicyEngine::default();

        let trace = engine.explain("read", TrustLevel::Untrusted);
        assert_eq!(trace.source, ModeSource::WildcardOverride);
        assert_eq!(trace.steps.len(), 2);
        assert!(trace.steps[1].terminal);

        let trace = engine.explain("exec", TrustLevel::Shared);
        assert_eq!(trace.mode, PolicyMode::Confirm);
        assert_eq!(trace.steps.len(), 4);
        assert_eq!(trace.steps[3].check, "level_default");

        let trace = engine.explain("mystery", TrustLevel::Trusted);
        assert_eq!(trace.mode, PolicyMode::Restrict);
        assert!(!trace.classified);
        assert_eq!(trace.output_trust, TrustLevel::Untrusted);
    }
}
