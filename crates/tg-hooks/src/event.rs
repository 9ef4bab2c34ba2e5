// event.rs — The lifecycle event contract shared with the host runtime.
//
// Every event is one variant of `HookEvent`, tagged by `"type"` on the wire:
//
//   {"type": "pre_model_call", "tools": ["read", "exec"], "iteration": 2}
//
// Handlers answer with a `HookResponse`, tagged by `"action"`. `None` is the
// answer for every observational event and for every handler failure.

use serde::{Deserialize, Serialize};

/// Payload of the turn-start event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnStart {
    #[serde(default)]
    pub system_prompt_length: usize,
    /// Messages already in the conversation. Only an explicit zero marks a
    /// fresh session; an absent count says nothing about history.
    pub message_count: Option<usize>,
    pub sender_id: Option<String>,
    /// Set by the host only for a verified owner identity.
    pub sender_is_owner: Option<bool>,
    pub group_id: Option<String>,
    /// Parent session, for sub-agents.
    pub spawned_by: Option<String>,
    /// Channel the message arrived on (e.g. "telegram"). Absent for internal
    /// triggers such as heartbeats.
    pub message_provider: Option<String>,
    /// Text of the latest inbound message, scanned for owner commands.
    pub prompt: Option<String>,
}

impl TurnStart {
    pub fn is_owner(&self) -> bool {
        self.sender_is_owner == Some(true)
    }

    pub fn is_fresh_session(&self) -> bool {
        self.message_count == Some(0)
    }
}

/// One action the model asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// A lifecycle event delivered by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HookEvent {
    TurnStart(TurnStart),
    PreModelCall {
        #[serde(default)]
        messages: Vec<serde_json::Value>,
        tools: Vec<String>,
        iteration: u32,
    },
    PostModelCall {
        tool_calls: Vec<ToolCallRequest>,
        iteration: u32,
    },
    PreToolCall {
        tool_name: String,
        #[serde(default)]
        params: serde_json::Value,
        iteration: Option<u32>,
    },
    IterationStart {
        iteration: u32,
    },
    IterationEnd {
        iteration: u32,
    },
    PreResponse {
        content: String,
    },
    TurnEnd,
}

impl HookEvent {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            HookEvent::TurnStart(_) => "turn_start",
            HookEvent::PreModelCall { .. } => "pre_model_call",
            HookEvent::PostModelCall { .. } => "post_model_call",
            HookEvent::PreToolCall { .. } => "pre_tool_call",
            HookEvent::IterationStart { .. } => "iteration_start",
            HookEvent::IterationEnd { .. } => "iteration_end",
            HookEvent::PreResponse { .. } => "pre_response",
            HookEvent::TurnEnd => "turn_end",
        }
    }
}

/// What the guard asks the host to do.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HookResponse {
    /// Proceed unchanged.
    #[default]
    None,
    /// Offer the model only these tools.
    FilterTools { tools: Vec<String> },
    /// Do not proceed.
    Block { reason: String },
    /// Emit this text instead.
    Rewrite { content: String },
}

impl HookResponse {
    pub fn is_none(&self) -> bool {
        matches!(self, HookResponse::None)
    }
}
