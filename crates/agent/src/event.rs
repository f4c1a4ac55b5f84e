//! Caller-facing agent events.
//!
//! `AgentEvent` is the only contract the surrounding web and CLI layers
//! consume. The kinds are mutually exclusive per event:
//! - `text_fragment` — live partial text from the model
//! - `tool_call`     — the assistant is invoking a named tool
//! - `done`          — the turn completed normally
//! - `error`         — the turn ended with a terminal failure

use serde::{Deserialize, Serialize};

/// Events emitted by the assistant loop during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Partial text from the model, in arrival order.
    TextFragment { text: String },

    /// The assistant is about to invoke a tool.
    ToolCall { name: String },

    /// The turn completed.
    Done,

    /// The turn ended with an error.
    Error { message: String },
}

impl AgentEvent {
    /// SSE event name for this event kind.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TextFragment { .. } => "text_fragment",
            Self::ToolCall { .. } => "tool_call",
            Self::Done => "done",
            Self::Error { .. } => "error",
        }
    }
}
