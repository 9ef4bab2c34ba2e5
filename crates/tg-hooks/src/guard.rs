// guard.rs — TaintGuard: the lifecycle hook orchestrator.
//
// The host delivers one `HookEvent` at a time per session; `handle` routes it
// to a handler and returns a `HookResponse`. Every handler runs fail-open, so
// a bug here degrades to "no effect" instead of a stalled agent.
//
// Lock order, when more than one is held: session shard, then approval shard,
// then the watermark document. The audit log is written only after the
// session shard has been released.
//
// Lifecycle of a turn:
//
//   turn_start      seal any abandoned graph, run owner commands, seed a new
//                   graph from the sender and the session watermark
//   pre_model_call  record the call, hide restricted and unapproved tools,
//                   file new confirmations
//   post_model_call record each requested action at its output trust
//   pre_tool_call   re-check the action at the current taint, stage blocked
//                   writes
//   pre_response    record the output, add owner notices
//   turn_end        seal, archive, ratchet the watermark

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tg_audit::{AuditLog, SecurityAction, SecurityEvent};
use tg_policy::{
    ApprovalOutcome, ApprovalStore, ApprovalTarget, PendingApproval, PendingRequest,
    PolicyEngine, ToolDecision,
};
use tg_store::{BlockedWrite, BlockedWriteStore, WatermarkPersister, WatermarkStore};
use tg_taint::{
    normalize_tool, NodeKind, SessionMap, TrustLevel, TurnGraph, TurnSummary,
};

use crate::command::{CommandParser, OwnerCommand};
use crate::config::GuardConfig;
use crate::error::GuardError;
use crate::event::{HookEvent, HookResponse, ToolCallRequest, TurnStart};
use crate::fail_open::fail_open;
use crate::notify::{Challenge, ChallengeNotifier, NotifierSet, TracingNotifier};
use crate::session::SessionState;

/// Tools whose blocked calls are staged for owner review.
pub const WRITE_TOOLS: &[&str] = &["write", "edit", "apply_patch"];

const PATH_PARAMS: &[&str] = &["path", "file_path", "file"];
const CONTENT_PARAMS: &[&str] = &["content", "new_string", "patch", "input"];
const REPLACED_PARAMS: &[&str] = &["old_string", "old_text"];

/// Initial trust of a turn, from who sent it.
///
/// Sub-agents and the owner speaking in a group are `shared`; the owner in a
/// direct conversation is `trusted`; any other identified sender is
/// `untrusted`. With neither sender nor channel the turn was triggered
/// internally (a heartbeat, a timer) and is `trusted`.
pub fn classify_sender(start: &TurnStart) -> TrustLevel {
    if start.spawned_by.is_some() {
        return TrustLevel::Shared;
    }
    if start.is_owner() {
        return if start.group_id.is_some() {
            TrustLevel::Shared
        } else {
            TrustLevel::Trusted
        };
    }
    match (&start.sender_id, &start.message_provider) {
        (None, None) => TrustLevel::Trusted,
        _ => TrustLevel::Untrusted,
    }
}

fn describe_sender(start: &TurnStart) -> String {
    if let Some(parent) = &start.spawned_by {
        return format!("spawned by {}", parent);
    }
    let via = start
        .message_provider
        .as_deref()
        .map(|p| format!(" via {}", p))
        .unwrap_or_default();
    match (&start.sender_id, start.is_owner()) {
        (_, true) if start.group_id.is_some() => format!("owner message in group{}", via),
        (_, true) => format!("owner message{}", via),
        (Some(sender), false) => format!("message from {}{}", sender, via),
        (None, false) if start.message_provider.is_some() => format!("anonymous message{}", via),
        (None, false) => "internal trigger".to_string(),
    }
}

/// What a write-shaped call would have done.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WriteTarget {
    path: PathBuf,
    content: String,
    replaced: Option<String>,
}

fn string_param<'a>(params: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| params.get(*key).and_then(Value::as_str))
}

/// Empty content is a real write (an empty file, a deletion); an empty path
/// is not.
fn write_target(params: &Value) -> Option<WriteTarget> {
    let path = string_param(params, PATH_PARAMS).filter(|p| !p.is_empty())?;
    Some(WriteTarget {
        path: PathBuf::from(path),
        content: string_param(params, CONTENT_PARAMS)?.to_string(),
        replaced: string_param(params, REPLACED_PARAMS).map(str::to_string),
    })
}

/// Where the current taint came from, for logs and watermarks.
fn taint_cause(graph: &TurnGraph) -> String {
    graph
        .taint_source()
        .and_then(|node| node.tool.clone().or_else(|| node.label.clone()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// The hook orchestrator. One instance serves every session of a host.
pub struct TaintGuard {
    config: GuardConfig,
    engine: PolicyEngine,
    approvals: ApprovalStore,
    watermarks: Arc<WatermarkStore>,
    persister: Option<WatermarkPersister>,
    staging: Option<BlockedWriteStore>,
    audit: Option<Mutex<AuditLog>>,
    sessions: SessionMap<SessionState>,
    notifiers: NotifierSet,
    protected: Vec<glob::Pattern>,
    commands: CommandParser,
    warnings: Vec<String>,
}

impl TaintGuard {
    /// Build a guard with durable state under `config.state_dir()`.
    ///
    /// A store that cannot be opened is logged and replaced by an in-memory
    /// one (watermarks) or left out (staging, audit); the guard still starts.
    pub fn new(config: GuardConfig) -> Result<Self, GuardError> {
        let mut guard = Self::in_memory(config)?;

        match WatermarkStore::open(guard.config.watermark_path()) {
            Ok(store) => guard.watermarks = Arc::new(store),
            Err(e) => guard.degrade("watermarks are not persisted", &e),
        }
        let debounce = Duration::from_millis(guard.config.persist_debounce_ms);
        match WatermarkPersister::spawn(guard.watermarks.clone(), debounce) {
            Ok(persister) => guard.persister = Some(persister),
            Err(e) => guard.degrade("watermark persister not started", &e),
        }
        match BlockedWriteStore::new(guard.config.staged_dir()) {
            Ok(store) => guard.staging = Some(store),
            Err(e) => guard.degrade("blocked writes are not staged", &e),
        }
        if guard.config.audit {
            match AuditLog::open(guard.config.audit_log_path()) {
                Ok(log) => guard.audit = Some(Mutex::new(log)),
                Err(e) => guard.degrade("security events are not audited", &e),
            }
        }

        tracing::info!(
            state_dir = %guard.config.state_dir().display(),
            warnings = guard.warnings.len(),
            "taint guard started"
        );
        Ok(guard)
    }

    /// Build a guard that keeps everything in memory: no watermark file, no
    /// staging, no audit log.
    pub fn in_memory(config: GuardConfig) -> Result<Self, GuardError> {
        let commands = CommandParser::new()?;
        let compiled = config.compile();
        let (protected, pattern_warnings) = config.protected_patterns();
        let mut warnings = compiled.warnings;
        warnings.extend(pattern_warnings);

        let engine = PolicyEngine::new(compiled.policy, compiled.table)
            .with_max_iterations(config.max_iterations);
        let approvals = ApprovalStore::new(config.approval_ttl_minutes, config.code_length);
        let mut notifiers = NotifierSet::new();
        notifiers.add(Box::new(TracingNotifier));

        Ok(Self {
            config,
            engine,
            approvals,
            watermarks: Arc::new(WatermarkStore::in_memory()),
            persister: None,
            staging: None,
            audit: None,
            sessions: SessionMap::new(),
            notifiers,
            protected,
            commands,
            warnings,
        })
    }

    /// Register another challenge notifier.
    pub fn with_notifier(mut self, notifier: Box<dyn ChallengeNotifier>) -> Self {
        self.notifiers.add(notifier);
        self
    }

    fn degrade(&mut self, consequence: &str, error: &dyn std::fmt::Display) {
        let warning = format!("{}: {}", consequence, error);
        tracing::error!(error = %error, "{}", consequence);
        self.warnings.push(warning);
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn engine(&self) -> &PolicyEngine {
        &self.engine
    }

    pub fn approvals(&self) -> &ApprovalStore {
        &self.approvals
    }

    pub fn watermarks(&self) -> &WatermarkStore {
        &self.watermarks
    }

    pub fn staging(&self) -> Option<&BlockedWriteStore> {
        self.staging.as_ref()
    }

    /// Configuration corrections and degraded stores, for display.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Taint of the session's open graph, if a turn is in progress.
    pub fn current_taint(&self, session_key: &str) -> Option<TrustLevel> {
        self.sessions
            .with_existing(session_key, |state| {
                state.graph.as_ref().map(TurnGraph::max_taint)
            })
            .flatten()
    }

    /// Tools hidden from the model at the last pre-model call.
    pub fn blocked_tools(&self, session_key: &str) -> Vec<String> {
        self.sessions
            .with_existing(session_key, |state| {
                state.blocked_tools.iter().cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Summaries of the session's archived turns, oldest first.
    pub fn archived(&self, session_key: &str) -> Vec<TurnSummary> {
        self.sessions
            .with_existing(session_key, |state| state.archived())
            .unwrap_or_default()
    }

    pub fn pending_approvals(&self, session_key: &str) -> Vec<PendingApproval> {
        self.approvals.pending_for_session_at(session_key, Utc::now())
    }

    /// Write the watermark document now.
    pub fn flush(&self) -> Result<(), GuardError> {
        self.watermarks.flush()?;
        Ok(())
    }

    /// Handle one lifecycle event. Never fails: errors and panics are logged,
    /// audited, and answered with [`HookResponse::None`].
    pub fn handle(&self, session_key: &str, event: HookEvent) -> HookResponse {
        let hook = event.name();
        fail_open(
            hook,
            session_key,
            || self.dispatch(session_key, event),
            |error| {
                self.record(vec![SecurityEvent::new(
                    session_key,
                    SecurityAction::HookFailure,
                    error.to_string(),
                )
                .with_metadata(json!({ "hook": hook }))])
            },
        )
    }

    fn dispatch(&self, session_key: &str, event: HookEvent) -> Result<HookResponse, GuardError> {
        match event {
            HookEvent::TurnStart(start) => self.on_turn_start(session_key, start),
            HookEvent::PreModelCall {
                tools, iteration, ..
            } => self.on_pre_model_call(session_key, &tools, iteration),
            HookEvent::PostModelCall {
                tool_calls,
                iteration,
            } => self.on_post_model_call(session_key, &tool_calls, iteration),
            HookEvent::PreToolCall {
                tool_name,
                params,
                iteration,
            } => self.on_pre_tool_call(session_key, &tool_name, &params, iteration),
            HookEvent::IterationStart { iteration } | HookEvent::IterationEnd { iteration } => {
                tracing::trace!(session = session_key, iteration, "iteration boundary");
                Ok(HookResponse::None)
            }
            HookEvent::PreResponse { content } => self.on_pre_response(session_key, content),
            HookEvent::TurnEnd => self.on_turn_end(session_key),
        }
    }

    // ── turn start ──────────────────────────────────────────────

    fn on_turn_start(
        &self,
        session_key: &str,
        start: TurnStart,
    ) -> Result<HookResponse, GuardError> {
        let mut events = Vec::new();

        // A turn that never ended still counts toward the watermark.
        let abandoned = self
            .sessions
            .with_existing(session_key, SessionState::end_turn)
            .flatten();
        if let Some(graph) = abandoned {
            tracing::warn!(session = session_key, turn = %graph.turn_id(), "previous turn never ended; sealing it");
            self.retire(session_key, graph, &mut events)?;
        }

        if start.is_fresh_session() && self.watermarks.remove(session_key).is_some() {
            tracing::info!(session = session_key, "fresh session; stale watermark discarded");
            self.schedule_persist();
        }

        let owner = start.is_owner();
        let mut feedback = Vec::new();
        let mut reset_to = None;
        if let Some(prompt) = start.prompt.as_deref() {
            match self.commands.parse(prompt) {
                Ok(None) => {}
                Ok(Some(command)) if !owner => {
                    tracing::warn!(
                        session = session_key,
                        command = command.name(),
                        sender = start.sender_id.as_deref().unwrap_or("unknown"),
                        "privileged command from non-owner ignored"
                    );
                    events.push(
                        SecurityEvent::new(
                            session_key,
                            SecurityAction::CommandIgnored,
                            format!("{} from a non-owner sender", command.name()),
                        )
                        .with_metadata(json!({ "sender": start.sender_id })),
                    );
                }
                Ok(Some(OwnerCommand::Approve {
                    target,
                    code,
                    duration_minutes,
                })) => {
                    let (message, event) =
                        self.redeem(session_key, &target, &code, duration_minutes);
                    feedback.push(message);
                    events.push(event);
                }
                Ok(Some(OwnerCommand::ResetTrust { level })) => {
                    let level = level.unwrap_or(TrustLevel::MOST_TRUSTED);
                    let reset_by = start.sender_id.as_deref().unwrap_or("owner");
                    let (message, event) = self.reset_trust(session_key, level, reset_by);
                    feedback.push(message);
                    events.push(event);
                    reset_to = Some(level);
                }
                Err(malformed) if owner => {
                    feedback.push(format!("Command not understood. {}", malformed));
                }
                Err(malformed) => {
                    tracing::debug!(session = session_key, %malformed, "malformed command from non-owner");
                }
            }
        }

        let mut graph = TurnGraph::new(session_key);
        graph.add_context(
            NodeKind::Context,
            TrustLevel::Trusted,
            format!("system prompt ({} chars)", start.system_prompt_length),
        )?;
        graph.add_context(NodeKind::Context, classify_sender(&start), describe_sender(&start))?;
        self.seed_history(session_key, &mut graph)?;
        if let Some(level) = reset_to {
            graph.reset_taint(level, "owner reset-trust")?;
        }

        tracing::info!(
            session = session_key,
            turn = %graph.turn_id(),
            level = %graph.max_taint(),
            owner,
            "turn started"
        );
        let now = Utc::now();
        self.sessions.with_entry(session_key, |state| {
            state.begin_turn(graph, owner, feedback);
            state.touch(now);
        });
        self.record(events);
        Ok(HookResponse::None)
    }

    fn redeem(
        &self,
        session_key: &str,
        target: &ApprovalTarget,
        code: &str,
        duration_minutes: Option<u32>,
    ) -> (String, SecurityEvent) {
        let outcome = self
            .approvals
            .approve_with_code(session_key, target, code, duration_minutes);
        match outcome {
            ApprovalOutcome::Approved { tools, expires_at } => {
                let scope = match expires_at {
                    Some(at) => format!("until {}", at.format("%H:%M UTC")),
                    None => "for this turn".to_string(),
                };
                // `all` installs a wildcard grant, not one grant per requested tool.
                let covered = match target {
                    ApprovalTarget::All => format!(
                        "all confirm-mode tools (requested: {})",
                        tools.join(", ")
                    ),
                    ApprovalTarget::Tool(_) => tools.join(", "),
                };
                tracing::info!(session = session_key, tools = ?tools, %target, %scope, "approval granted");
                let event = SecurityEvent::new(
                    session_key,
                    SecurityAction::ApprovalGranted,
                    format!("approved {} {}", covered, scope),
                )
                .with_metadata(json!({
                    "target": target.to_string(),
                    "tools": tools,
                    "expires_at": expires_at,
                }));
                (format!("Approved {} {}.", covered, scope), event)
            }
            ApprovalOutcome::Rejected { reason } => {
                tracing::warn!(session = session_key, %target, %reason, "approval rejected");
                let event = SecurityEvent::new(
                    session_key,
                    SecurityAction::ApprovalRejected,
                    format!("approval of {} rejected: {}", target, reason),
                )
                .with_metadata(json!({ "reason": reason }));
                (format!("Approval rejected: {}.", reason), event)
            }
        }
    }

    fn reset_trust(
        &self,
        session_key: &str,
        level: TrustLevel,
        reset_by: &str,
    ) -> (String, SecurityEvent) {
        let cleared = self.watermarks.clear_with_audit(session_key, reset_by);
        if level != TrustLevel::MOST_TRUSTED {
            self.watermarks
                .escalate(session_key, level, "set by owner reset-trust", reset_by);
        }
        self.schedule_persist();

        let previous = cleared.as_ref().map(|mark| mark.level);
        let detail = match previous {
            Some(prev) => format!("watermark {} cleared; taint reset to {}", prev, level),
            None => format!("no watermark; taint reset to {}", level),
        };
        let event = SecurityEvent::new(session_key, SecurityAction::TaintReset, detail)
            .with_level(level)
            .with_metadata(json!({ "reset_by": reset_by, "previous": previous }));
        let message = match previous {
            Some(prev) => format!("Trust reset to {} (was {}).", level, prev),
            None => format!("Trust reset to {}.", level),
        };
        (message, event)
    }

    /// Carry the session watermark into a graph as a history node.
    fn seed_history(&self, session_key: &str, graph: &mut TurnGraph) -> Result<(), GuardError> {
        if let Some(mark) = self.watermarks.get(session_key) {
            graph.add_context(
                NodeKind::History,
                mark.level,
                format!("watermark from {}: {}", mark.escalated_by, mark.reason),
            )?;
        }
        Ok(())
    }

    /// A graph for a session whose turn start was never seen.
    fn implicit_turn(&self, session_key: &str) -> Result<TurnGraph, GuardError> {
        tracing::warn!(session = session_key, "event outside a turn; opening an implicit turn");
        let mut graph = TurnGraph::new(session_key);
        self.seed_history(session_key, &mut graph)?;
        Ok(graph)
    }

    fn open_graph<'a>(
        &self,
        session_key: &str,
        slot: &'a mut Option<TurnGraph>,
    ) -> Result<&'a mut TurnGraph, GuardError> {
        let graph = match slot.take() {
            Some(graph) => graph,
            None => self.implicit_turn(session_key)?,
        };
        Ok(slot.insert(graph))
    }

    // ── model calls ─────────────────────────────────────────────

    fn on_pre_model_call(
        &self,
        session_key: &str,
        tools: &[String],
        iteration: u32,
    ) -> Result<HookResponse, GuardError> {
        let now = Utc::now();
        let mut events = Vec::new();
        let mut batch = Vec::new();

        let response = self.sessions.with_entry(session_key, |state| -> Result<HookResponse, GuardError> {
            let graph = self.open_graph(session_key, &mut state.graph)?;
            state.last_model_call = Some(graph.record_model_call(iteration)?);

            let verdict =
                self.engine
                    .evaluate_with_approvals_at(graph, tools, &self.approvals, now);
            if verdict.iteration_limit_exceeded && self.config.hard_stop_on_iteration_limit {
                let reason = format!(
                    "iteration {} exceeds the limit of {}",
                    graph.iteration_count(),
                    self.engine.max_iterations()
                );
                tracing::warn!(session = session_key, iteration, "model call stopped at iteration limit");
                return Ok(HookResponse::Block { reason });
            }

            let restricted = verdict.restricted.iter().map(|tool| {
                let reason = format!(
                    "'{}' is restricted at {} taint",
                    normalize_tool(tool),
                    verdict.level
                );
                (tool, reason)
            });
            let pending = verdict.pending.iter().map(|p| (&p.tool, p.reason.clone()));
            for (tool, reason) in restricted.chain(pending) {
                let name = normalize_tool(tool);
                if state.blocked_tools.contains(&name) {
                    continue;
                }
                graph.record_block(&name, Some(iteration), &reason)?;
                events.push(
                    SecurityEvent::new(session_key, SecurityAction::ToolBlocked, reason)
                        .with_tool(name)
                        .with_level(verdict.level),
                );
            }

            for p in &verdict.pending {
                if self
                    .approvals
                    .live_pending_at(session_key, &p.tool, now)
                    .is_none()
                {
                    batch.push(PendingRequest {
                        session_key: session_key.to_string(),
                        tool_name: normalize_tool(&p.tool),
                        reason: p.reason.clone(),
                    });
                }
            }

            state.blocked_tools = verdict.tool_removals.clone();
            if verdict.tool_removals.is_empty() {
                return Ok(HookResponse::None);
            }
            tracing::info!(
                session = session_key,
                iteration,
                level = %verdict.level,
                mode = %verdict.mode,
                removed = ?verdict.tool_removals,
                "tools withheld from model"
            );
            Ok(HookResponse::FilterTools {
                tools: tools
                    .iter()
                    .filter(|tool| !verdict.tool_removals.contains(&normalize_tool(tool)))
                    .cloned()
                    .collect(),
            })
        });

        if !batch.is_empty() {
            self.issue_challenge(session_key, &batch, now, &mut events);
        }
        self.record(events);
        response
    }

    fn on_post_model_call(
        &self,
        session_key: &str,
        tool_calls: &[ToolCallRequest],
        iteration: u32,
    ) -> Result<HookResponse, GuardError> {
        self.sessions.with_entry(session_key, |state| -> Result<HookResponse, GuardError> {
            let graph = self.open_graph(session_key, &mut state.graph)?;
            for call in tool_calls {
                let tool = normalize_tool(&call.name);
                // A hidden tool cannot run, so its output cannot taint.
                if state.blocked_tools.contains(&tool) {
                    tracing::debug!(session = session_key, tool = %tool, "call to withheld tool not recorded");
                    continue;
                }
                let before = graph.max_taint();
                let trust = self.engine.table().classify_output(&tool);
                graph.record_tool_call(&tool, trust, iteration, state.last_model_call)?;
                if graph.max_taint() != before {
                    tracing::info!(
                        session = session_key,
                        tool = %tool,
                        from = %before,
                        to = %graph.max_taint(),
                        "taint escalated"
                    );
                }
            }
            Ok(HookResponse::None)
        })
    }

    // ── execution ───────────────────────────────────────────────

    fn is_protected(&self, path: &Path) -> bool {
        self.protected.iter().any(|pattern| pattern.matches_path(path))
    }

    fn on_pre_tool_call(
        &self,
        session_key: &str,
        tool_name: &str,
        params: &Value,
        iteration: Option<u32>,
    ) -> Result<HookResponse, GuardError> {
        let now = Utc::now();
        let tool = normalize_tool(tool_name);
        let target = write_target(params);
        let mut events = Vec::new();
        let mut batch = Vec::new();

        let blocked = self.sessions.with_entry(
            session_key,
            |state| -> Result<Option<(String, TrustLevel)>, GuardError> {
                let graph = self.open_graph(session_key, &mut state.graph)?;
                let level = graph.max_taint();

                let reason = if state.blocked_tools.contains(&tool) {
                    Some(format!("'{}' was withheld from the model at {} taint", tool, level))
                } else {
                    match self.engine.decide_at(graph, &tool, &self.approvals, now) {
                        ToolDecision::Allow => target
                            .as_ref()
                            .filter(|t| level != TrustLevel::MOST_TRUSTED && self.is_protected(&t.path))
                            .map(|t| {
                                format!(
                                    "'{}' is a protected path and taint is {}",
                                    t.path.display(),
                                    level
                                )
                            }),
                        ToolDecision::Confirm { reason } => {
                            if self
                                .approvals
                                .live_pending_at(session_key, &tool, now)
                                .is_none()
                            {
                                batch.push(PendingRequest {
                                    session_key: session_key.to_string(),
                                    tool_name: tool.clone(),
                                    reason: reason.clone(),
                                });
                            }
                            Some(format!("{}; awaiting owner approval", reason))
                        }
                        ToolDecision::Restrict { reason } => Some(reason),
                    }
                };

                match reason {
                    Some(reason) => {
                        graph.record_block(&tool, iteration, &reason)?;
                        Ok(Some((reason, level)))
                    }
                    None => Ok(None),
                }
            },
        );

        if !batch.is_empty() {
            self.issue_challenge(session_key, &batch, now, &mut events);
        }

        let response = match blocked {
            Ok(Some((mut reason, level))) => {
                tracing::info!(session = session_key, tool = %tool, %level, %reason, "tool call blocked");
                events.push(
                    SecurityEvent::new(session_key, SecurityAction::ToolBlocked, reason.clone())
                        .with_tool(tool.clone())
                        .with_level(level),
                );
                if let Some(target) = target {
                    if WRITE_TOOLS.contains(&tool.as_str()) || self.is_protected(&target.path) {
                        if let Some(staged) = self.stage_write(session_key, &tool, target, level, &reason) {
                            reason.push_str(&format!("; the write was staged for owner review as {}", staged.id));
                            events.push(
                                SecurityEvent::new(
                                    session_key,
                                    SecurityAction::WriteStaged,
                                    format!("{} to {} staged", tool, staged.path.display()),
                                )
                                .with_tool(tool.clone())
                                .with_level(level)
                                .with_metadata(json!({ "id": staged.id })),
                            );
                        }
                    }
                }
                Ok(HookResponse::Block { reason })
            }
            Ok(None) => Ok(HookResponse::None),
            Err(e) => Err(e),
        };

        self.record(events);
        response
    }

    /// Save a blocked write. Failure is logged; the call stays blocked.
    fn stage_write(
        &self,
        session_key: &str,
        tool: &str,
        target: WriteTarget,
        level: TrustLevel,
        reason: &str,
    ) -> Option<BlockedWrite> {
        let store = self.staging.as_ref()?;
        let mut write = BlockedWrite::new(
            session_key,
            tool,
            target.path,
            target.content,
            level,
            reason,
        );
        if let Some(replaced) = target.replaced {
            write = write.with_replaced(replaced);
        }
        match store.save(&write) {
            Ok(()) => {
                tracing::info!(session = session_key, id = %write.id, path = %write.path.display(), "blocked write staged");
                Some(write)
            }
            Err(e) => {
                tracing::error!(session = session_key, error = %e, "failed to stage blocked write");
                None
            }
        }
    }

    // ── response and turn end ───────────────────────────────────

    fn on_pre_response(&self, session_key: &str, content: String) -> Result<HookResponse, GuardError> {
        let now = Utc::now();
        type Notes = (Vec<String>, bool, Option<String>);
        let (feedback, owner_turn, diagnostic) = self.sessions.with_entry(session_key, |state| -> Result<Notes, GuardError> {
            let graph = self.open_graph(session_key, &mut state.graph)?;
            let iteration = graph.iteration_count();
            graph.record_output(Some(iteration), state.last_model_call)?;

            let diagnostic = self.config.diagnostic.then(|| {
                let blocked: Vec<&str> = graph.tools_blocked().iter().map(String::as_str).collect();
                format!(
                    "[taint: {} | blocked: {}]",
                    graph.max_taint(),
                    if blocked.is_empty() {
                        "none".to_string()
                    } else {
                        blocked.join(", ")
                    }
                )
            });
            Ok((std::mem::take(&mut state.feedback), state.owner_turn, diagnostic))
        })?;

        let notice = if owner_turn {
            pending_notice(&self.approvals.pending_for_session_at(session_key, now))
        } else {
            None
        };

        let mut parts: Vec<String> = Vec::new();
        parts.extend(diagnostic);
        parts.extend(feedback);
        if parts.is_empty() && notice.is_none() {
            return Ok(HookResponse::None);
        }
        parts.push(content);
        parts.extend(notice);
        Ok(HookResponse::Rewrite {
            content: parts.join("\n\n"),
        })
    }

    fn on_turn_end(&self, session_key: &str) -> Result<HookResponse, GuardError> {
        let now = Utc::now();
        let mut events = Vec::new();
        let graph = self
            .sessions
            .with_existing(session_key, SessionState::end_turn)
            .flatten();
        let result = match graph {
            Some(graph) => self.retire(session_key, graph, &mut events).map(|_| ()),
            None => {
                tracing::debug!(session = session_key, "turn end without an open turn");
                Ok(())
            }
        };

        let dropped = self.approvals.clear_turn_scoped(session_key);
        if dropped > 0 {
            tracing::debug!(session = session_key, dropped, "turn-scoped approvals cleared");
        }
        self.approvals.prune_session_at(session_key, now);
        self.sessions.with_existing(session_key, |state| state.touch(now));
        self.evict_idle_at(now);
        self.record(events);
        result.map(|()| HookResponse::None)
    }

    /// Drop in-memory state of sessions idle past `session_idle_minutes`.
    /// Returns the evicted session keys.
    pub fn evict_idle_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let Ok(minutes) = i64::try_from(self.config.session_idle_minutes) else {
            return Vec::new();
        };
        if minutes == 0 {
            return Vec::new();
        }
        let cutoff = now - chrono::Duration::minutes(minutes);
        let evicted = self.sessions.retain(|_, state| !state.is_idle_since(cutoff));
        for key in &evicted {
            self.approvals.prune_session_at(key, now);
        }
        if !evicted.is_empty() {
            tracing::debug!(evicted = evicted.len(), "idle sessions dropped from memory");
        }
        evicted
    }

    /// Sessions with in-memory state.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Seal a graph, ratchet the watermark toward its taint, and archive it.
    fn retire(
        &self,
        session_key: &str,
        mut graph: TurnGraph,
        events: &mut Vec<SecurityEvent>,
    ) -> Result<TurnSummary, GuardError> {
        let summary = graph.seal()?;
        let level = summary.final_taint;

        if level != TrustLevel::MOST_TRUSTED {
            let cause = taint_cause(&graph);
            let reason = format!("turn {} ended at {} taint", summary.turn_id, level);
            if self.watermarks.escalate(session_key, level, &reason, &cause) {
                events.push(
                    SecurityEvent::new(
                        session_key,
                        SecurityAction::TaintEscalated,
                        format!("watermark raised to {} by {}", level, cause),
                    )
                    .with_level(level)
                    .with_metadata(json!({ "turn_id": summary.turn_id })),
                );
                self.schedule_persist();
            }
        }

        tracing::info!(
            session = session_key,
            turn = %summary.turn_id,
            level = %level,
            iterations = summary.iteration_count,
            tools_used = summary.tools_used.len(),
            tools_blocked = summary.tools_blocked.len(),
            "turn sealed"
        );
        let capacity = self.config.archive_capacity;
        self.sessions
            .with_entry(session_key, |state| state.archive(graph, capacity));
        Ok(summary)
    }

    // ── side effects ────────────────────────────────────────────

    fn issue_challenge(
        &self,
        session_key: &str,
        batch: &[PendingRequest],
        now: DateTime<Utc>,
        events: &mut Vec<SecurityEvent>,
    ) {
        let code = self.approvals.add_pending_batch_at(batch, now);
        let challenge = Challenge {
            session_key: session_key.to_string(),
            code,
            tools: batch.iter().map(|item| item.tool_name.clone()).collect(),
            expires_at: now + self.approvals.code_ttl(),
        };
        self.notifiers.dispatch(&challenge);
        events.push(
            SecurityEvent::new(
                session_key,
                SecurityAction::ConfirmationRequested,
                format!("confirmation requested for {}", challenge.tools.join(", ")),
            )
            .with_metadata(json!({
                "tools": challenge.tools,
                "expires_at": challenge.expires_at,
            })),
        );
    }

    fn schedule_persist(&self) {
        if let Some(persister) = &self.persister {
            persister.schedule();
        }
    }

    /// Append to the audit log. Failures are logged and dropped.
    fn record(&self, events: Vec<SecurityEvent>) {
        let Some(audit) = &self.audit else {
            return;
        };
        if events.is_empty() {
            return;
        }
        let mut log = audit.lock().unwrap_or_else(PoisonError::into_inner);
        for mut event in events {
            if let Err(e) = log.append(&mut event) {
                tracing::warn!(action = %event.action, error = %e, "failed to write security event");
            }
        }
    }
}

/// Owner-facing list of pending confirmations, one line per code.
fn pending_notice(pending: &[PendingApproval]) -> Option<String> {
    let mut by_code: BTreeMap<&str, Challenge> = BTreeMap::new();
    for entry in pending {
        let challenge = by_code.entry(entry.code.as_str()).or_insert_with(|| Challenge {
            session_key: entry.session_key.clone(),
            code: entry.code.clone(),
            tools: Vec::new(),
            expires_at: entry.expires_at,
        });
        challenge.tools.push(entry.tool_name.clone());
        challenge.expires_at = challenge.expires_at.min(entry.expires_at);
    }
    if by_code.is_empty() {
        return None;
    }
    let lines: Vec<String> = by_code
        .values()
        .map(|c| {
            format!(
                "Approval needed for {}: reply `{}` (expires {}).",
                c.tools.join(", "),
                c.instruction(),
                c.expires_at.format("%H:%M UTC")
            )
        })
        .collect();
    Some(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tg_policy::{PolicyDocument, RawPolicy};

    fn start(sender: Option<&str>, owner: bool, provider: Option<&str>) -> TurnStart {
        TurnStart {
            message_count: Some(3),
            sender_id: sender.map(str::to_string),
            sender_is_owner: Some(owner),
            message_provider: provider.map(str::to_string),
            ..TurnStart::default()
        }
    }

    fn guard_with_levels(levels: &[(&str, &str)]) -> TaintGuard {
        let document = PolicyDocument {
            policy: RawPolicy {
                levels: levels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                ..RawPolicy::default()
            },
            ..PolicyDocument::default()
        };
        TaintGuard::in_memory(GuardConfig::default().with_document(document)).unwrap()
    }

    fn tools(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn sender_classification() {
        assert_eq!(classify_sender(&start(Some("me"), true, Some("telegram"))), TrustLevel::Trusted);
        assert_eq!(classify_sender(&start(Some("bob"), false, Some("telegram"))), TrustLevel::Untrusted);
        assert_eq!(classify_sender(&start(None, false, None)), TrustLevel::Trusted);
        assert_eq!(classify_sender(&start(None, false, Some("email"))), TrustLevel::Untrusted);

        let mut group = start(Some("me"), true, Some("telegram"));
        group.group_id = Some("family".into());
        assert_eq!(classify_sender(&group), TrustLevel::Shared);

        let mut child = start(None, false, None);
        child.spawned_by = Some("parent".into());
        assert_eq!(classify_sender(&child), TrustLevel::Shared);
    }

    #[test]
    fn write_target_reads_common_param_names() {
        let target = write_target(&json!({"file_path": "a.txt", "new_string": "x", "old_string": "y"}))
            .unwrap();
        assert_eq!(target.path, PathBuf::from("a.txt"));
        assert_eq!(target.replaced.as_deref(), Some("y"));
        assert!(write_target(&json!({"path": "a.txt"})).is_none());
        assert!(write_target(&json!({"path": "", "content": "x"})).is_none());

        let deletion =
            write_target(&json!({"path": "a.txt", "old_string": "gone\n", "new_string": ""})).unwrap();
        assert_eq!(deletion.content, "");
        assert_eq!(deletion.replaced.as_deref(), Some("gone\n"));
        assert!(write_target(&json!("not an object")).is_none());
    }

    #[test]
    fn untrusted_sender_loses_privileged_tools() {
        let guard = TaintGuard::in_memory(GuardConfig::default()).unwrap();
        guard.handle(
            "s",
            HookEvent::TurnStart(start(Some("stranger"), false, Some("telegram"))),
        );
        assert_eq!(guard.current_taint("s"), Some(TrustLevel::Untrusted));

        let response = guard.handle(
            "s",
            HookEvent::PreModelCall {
                messages: Vec::new(),
                tools: tools(&["read", "exec", "write"]),
                iteration: 1,
            },
        );
        assert_eq!(
            response,
            HookResponse::FilterTools {
                tools: tools(&["read"])
            }
        );
        assert!(guard.pending_approvals("s").is_empty());
    }

    #[test]
    fn owner_turn_keeps_everything() {
        let guard = TaintGuard::in_memory(GuardConfig::default()).unwrap();
        guard.handle("s", HookEvent::TurnStart(start(Some("me"), true, Some("telegram"))));
        let response = guard.handle(
            "s",
            HookEvent::PreModelCall {
                messages: Vec::new(),
                tools: tools(&["read", "exec"]),
                iteration: 1,
            },
        );
        assert!(response.is_none());
    }

    #[test]
    fn taint_within_turn_blocks_at_execution() {
        let guard = guard_with_levels(&[]);
        guard.handle("s", HookEvent::TurnStart(start(Some("me"), true, None)));
        guard.handle(
            "s",
            HookEvent::PostModelCall {
                tool_calls: vec![
                    ToolCallRequest {
                        name: "web_fetch".into(),
                        params: Value::Null,
                    },
                    ToolCallRequest {
                        name: "exec".into(),
                        params: Value::Null,
                    },
                ],
                iteration: 1,
            },
        );
        assert_eq!(guard.current_taint("s"), Some(TrustLevel::External));

        let response = guard.handle(
            "s",
            HookEvent::PreToolCall {
                tool_name: "exec".into(),
                params: Value::Null,
                iteration: Some(1),
            },
        );
        assert!(matches!(response, HookResponse::Block { ref reason } if reason.contains("web_fetch")));
        assert_eq!(guard.pending_approvals("s").len(), 1);
    }

    #[test]
    fn non_owner_commands_are_ignored() {
        let guard = TaintGuard::in_memory(GuardConfig::default()).unwrap();
        guard.watermarks().escalate("s", TrustLevel::External, "page", "web_fetch");

        let mut turn = start(Some("stranger"), false, Some("telegram"));
        turn.prompt = Some(".reset-trust".into());
        guard.handle("s", HookEvent::TurnStart(turn));

        assert_eq!(guard.watermarks().get("s").unwrap().level, TrustLevel::External);
        assert_eq!(guard.current_taint("s"), Some(TrustLevel::Untrusted));
    }

    #[test]
    fn turn_end_ratchets_watermark_and_archives() {
        let guard = TaintGuard::in_memory(GuardConfig::default()).unwrap();
        guard.handle("s", HookEvent::TurnStart(start(None, false, None)));
        guard.handle(
            "s",
            HookEvent::PostModelCall {
                tool_calls: vec![ToolCallRequest {
                    name: "browser".into(),
                    params: Value::Null,
                }],
                iteration: 1,
            },
        );
        guard.handle("s", HookEvent::TurnEnd);

        assert_eq!(guard.current_taint("s"), None);
        let mark = guard.watermarks().get("s").unwrap();
        assert_eq!(mark.level, TrustLevel::External);
        assert_eq!(mark.escalated_by, "browser");
        assert_eq!(guard.archived("s").len(), 1);

        // The next internal turn starts from the watermark.
        guard.handle("s", HookEvent::TurnStart(start(None, false, None)));
        assert_eq!(guard.current_taint("s"), Some(TrustLevel::External));
    }

    #[test]
    fn fresh_session_discards_watermark() {
        let guard = TaintGuard::in_memory(GuardConfig::default()).unwrap();
        guard.watermarks().escalate("s", TrustLevel::Untrusted, "stranger", "message");
        let mut turn = start(None, false, None);
        turn.message_count = Some(0);
        guard.handle("s", HookEvent::TurnStart(turn));

        assert!(guard.watermarks().get("s").is_none());
        assert!(guard.watermarks().resets_for("s").is_empty());
        assert_eq!(guard.current_taint("s"), Some(TrustLevel::Trusted));
    }

    #[test]
    fn missing_message_count_keeps_watermark() {
        let guard = TaintGuard::in_memory(GuardConfig::default()).unwrap();
        guard.watermarks().escalate("s", TrustLevel::Untrusted, "stranger", "message");
        let event: HookEvent = serde_json::from_str(
            r#"{"type":"turn_start","system_prompt_length":10,"sender_id":"me","sender_is_owner":true}"#,
        )
        .unwrap();
        guard.handle("s", event);

        assert_eq!(guard.watermarks().get("s").unwrap().level, TrustLevel::Untrusted);
        assert_eq!(guard.current_taint("s"), Some(TrustLevel::Untrusted));
    }

    #[test]
    fn idle_sessions_are_evicted_but_keep_their_watermark() {
        let guard = TaintGuard::in_memory(GuardConfig::default()).unwrap();
        guard.handle("idle", HookEvent::TurnStart(start(Some("bob"), false, Some("sms"))));
        guard.handle("idle", HookEvent::TurnEnd);
        guard.handle("open", HookEvent::TurnStart(start(None, false, None)));
        assert_eq!(guard.session_count(), 2);

        assert!(guard.evict_idle_at(Utc::now()).is_empty());
        let later = Utc::now() + chrono::Duration::minutes(61);
        assert_eq!(guard.evict_idle_at(later), vec!["idle".to_string()]);
        assert_eq!(guard.session_count(), 1);
        assert!(guard.archived("idle").is_empty());
        assert_eq!(guard.watermarks().get("idle").unwrap().level, TrustLevel::Untrusted);
        assert_eq!(guard.current_taint("open"), Some(TrustLevel::Trusted));
    }

    #[test]
    fn turn_end_prunes_empty_approval_state() {
        let guard = TaintGuard::in_memory(GuardConfig::default()).unwrap();
        let mut turn = start(Some("me"), true, None);
        turn.prompt = Some(".approve exec ABCDEF".into());
        guard.handle("s", HookEvent::TurnStart(turn));
        assert_eq!(guard.approvals().session_count(), 1);
        guard.handle("s", HookEvent::TurnEnd);
        assert_eq!(guard.approvals().session_count(), 0);
    }

    #[test]
    fn abandoned_turn_is_sealed_at_next_start() {
        let guard = TaintGuard::in_memory(GuardConfig::default()).unwrap();
        guard.handle("s", HookEvent::TurnStart(start(Some("bob"), false, Some("sms"))));
        guard.handle("s", HookEvent::TurnStart(start(Some("me"), true, Some("sms"))));

        assert_eq!(guard.archived("s").len(), 1);
        assert_eq!(guard.watermarks().get("s").unwrap().level, TrustLevel::Untrusted);
        assert_eq!(guard.current_taint("s"), Some(TrustLevel::Untrusted));
    }

    #[test]
    fn diagnostic_prefix_and_owner_feedback() {
        let config = GuardConfig {
            diagnostic: true,
            ..GuardConfig::default()
        };
        let guard = TaintGuard::in_memory(config).unwrap();
        let mut turn = start(Some("me"), true, None);
        turn.prompt = Some(".approve exec ABCDEF".into());
        guard.handle("s", HookEvent::TurnStart(turn));

        let response = guard.handle(
            "s",
            HookEvent::PreResponse {
                content: "done".into(),
            },
        );
        let HookResponse::Rewrite { content } = response else {
            panic!("expected rewrite, got {:?}", response);
        };
        assert!(content.starts_with("[taint: trusted | blocked: none]"));
        assert!(content.contains("Approval rejected: no pending confirmation for 'exec'."));
        assert!(content.ends_with("done"));
    }

    #[test]
    fn plain_response_passes_through() {
        let guard = TaintGuard::in_memory(GuardConfig::default()).unwrap();
        guard.handle("s", HookEvent::TurnStart(start(None, false, None)));
        let response = guard.handle(
            "s",
            HookEvent::PreResponse {
                content: "hello".into(),
            },
        );
        assert!(response.is_none());
    }

    #[test]
    fn hard_stop_blocks_model_call() {
        let config = GuardConfig {
            max_iterations: 2,
            hard_stop_on_iteration_limit: true,
            ..GuardConfig::default()
        };
        let guard = TaintGuard::in_memory(config).unwrap();
        guard.handle("s", HookEvent::TurnStart(start(None, false, None)));
        let call = |iteration| HookEvent::PreModelCall {
            messages: Vec::new(),
            tools: tools(&["read"]),
            iteration,
        };
        assert!(guard.handle("s", call(2)).is_none());
        assert!(matches!(guard.handle("s", call(3)), HookResponse::Block { .. }));
    }

    #[test]
    fn pending_notice_groups_by_code() {
        let expires_at = Utc::now();
        let entry = |tool: &str, code: &str| PendingApproval {
            session_key: "s".into(),
            tool_name: tool.into(),
            reason: String::new(),
            code: code.into(),
            expires_at,
        };
        let notice = pending_notice(&[
            entry("exec", "AAAAAA"),
            entry("write", "AAAAAA"),
            entry("cron", "BBBBBB"),
        ])
        .unwrap();
        assert!(notice.contains("exec, write: reply `.approve all AAAAAA`"));
        assert!(notice.contains("cron: reply `.approve cron BBBBBB`"));
        assert!(pending_notice(&[]).is_none());
    }
}
