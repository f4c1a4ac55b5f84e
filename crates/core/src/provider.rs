//! Completion-provider trait and the streaming event protocol.
//!
//! A `CompletionProvider` knows how to send a conversation to a language
//! model and stream back typed protocol events. The event kinds are an
//! explicit tagged union matched exhaustively downstream — an unhandled kind
//! is a compile error, not a silent fall-through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ProviderError;
use crate::message::Message;

/// A tool definition sent to the model so it knows what it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Human-readable description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's input object
    pub input_schema: serde_json::Value,
}

/// One streaming completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// The model to use
    pub model: String,

    /// Maximum tokens to generate
    pub max_tokens: u32,

    /// System prompt (domain/schema context plus the caller's identity)
    pub system: String,

    /// The full conversation history
    pub messages: Vec<Message>,

    /// Tools the model may invoke
    pub tools: Vec<ToolDefinition>,
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Ordinary completion
    EndTurn,
    /// The model requested tool invocations
    ToolUse,
    /// The length limit was hit
    MaxTokens,
}

impl StopReason {
    /// Map a wire stop-reason string. Unknown strings are treated as an
    /// ordinary completion, with a warning.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "end_turn" => StopReason::EndTurn,
            "tool_use" => StopReason::ToolUse,
            "max_tokens" => StopReason::MaxTokens,
            other => {
                warn!(stop_reason = other, "Unknown stop reason, treating as end_turn");
                StopReason::EndTurn
            }
        }
    }
}

/// The declared kind of a newly opened content block.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    /// A text block; the wire carries an (empty) initial text field.
    Text {
        #[serde(default)]
        text: String,
    },
    /// A tool invocation; the input object arrives as JSON deltas.
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
}

/// An incremental fragment for the currently open block.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    /// A text fragment to append to the open text block.
    #[serde(rename = "text_delta")]
    Text { text: String },
    /// A partial-JSON fragment to append to the open tool-use input buffer.
    #[serde(rename = "input_json_delta")]
    InputJson { partial_json: String },
}

/// The terminal-delta body, carrying the stop reason when present.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageDeltaBody {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

/// An error payload delivered inside the event stream.
#[derive(Debug, Clone, Deserialize)]
pub struct WireError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// One event in the provider's ordered, single-pass stream.
///
/// The variant names follow the wire protocol of the completion provider
/// (`content_block_start` and friends) so payloads deserialize directly.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Stream header; carries no content.
    MessageStart,

    /// Announces a new block of the given kind.
    #[serde(rename = "content_block_start")]
    BlockStart { index: usize, content_block: BlockKind },

    /// A fragment for the currently open block.
    #[serde(rename = "content_block_delta")]
    BlockDelta { index: usize, delta: Delta },

    /// Closes the current block.
    #[serde(rename = "content_block_stop")]
    BlockStop { index: usize },

    /// Terminal delta carrying the stop reason.
    MessageDelta { delta: MessageDeltaBody },

    /// End of stream.
    MessageStop,

    /// Keep-alive; carries nothing.
    Ping,

    /// An in-stream error report.
    Error { error: WireError },
}

/// The completion-provider boundary.
///
/// One call to `stream` issues one request and yields the raw protocol
/// events over a channel. Transport failures mid-stream surface as `Err`
/// items on the channel; request-level failures surface as the outer `Err`.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// A human-readable name for this provider.
    fn name(&self) -> &str;

    /// Issue one streaming completion call.
    async fn stream(
        &self,
        request: CompletionRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamEvent, ProviderError>>,
        ProviderError,
    >;
}
