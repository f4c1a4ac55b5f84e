//! Stream aggregator — reduces provider protocol events into content blocks.
//!
//! The aggregator is small but its correctness is the most delicate part of
//! the core: the live text fragments it surfaces must agree exactly, in
//! content and order, with the final block list it produces.
//!
//! At most one block is "open" at a time: a growing text buffer or a growing
//! tool-invocation buffer (id, name, partial JSON). A block closes on an
//! explicit stop, at end of stream, or — self-healingly — when a new block
//! starts while one is still open.

use mealmind_core::error::ProviderError;
use mealmind_core::message::ContentBlock;
use mealmind_core::provider::{BlockKind, Delta, StopReason, StreamEvent};
use tracing::debug;

/// The currently open accumulation buffer.
enum OpenBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        partial_json: String,
    },
}

/// Reduces one provider call's event stream into discrete content blocks.
pub struct StreamAggregator {
    blocks: Vec<ContentBlock>,
    open: Option<OpenBlock>,
    stop_reason: Option<StopReason>,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            open: None,
            stop_reason: None,
        }
    }

    /// Consume one event. Returns a text fragment when the event carried
    /// live text that should be forwarded immediately, in arrival order.
    pub fn push(&mut self, event: StreamEvent) -> Result<Option<String>, ProviderError> {
        match event {
            StreamEvent::BlockStart { content_block, .. } => {
                // Protocols that omit the stop before the next start still
                // get their previous block flushed
                self.flush_open()?;
                self.open = Some(match content_block {
                    BlockKind::Text { text } => OpenBlock::Text(text),
                    BlockKind::ToolUse { id, name, .. } => OpenBlock::ToolUse {
                        id,
                        name,
                        partial_json: String::new(),
                    },
                });
                Ok(None)
            }
            StreamEvent::BlockDelta { delta, .. } => match (&mut self.open, delta) {
                (Some(OpenBlock::Text(buffer)), Delta::Text { text }) => {
                    buffer.push_str(&text);
                    Ok(Some(text))
                }
                (Some(OpenBlock::ToolUse { partial_json, .. }), Delta::InputJson { partial_json: fragment }) => {
                    partial_json.push_str(&fragment);
                    Ok(None)
                }
                (_, delta) => {
                    // A delta of the wrong kind for the open block; the
                    // protocol should not produce this
                    debug!(?delta, "Ignoring mismatched block delta");
                    Ok(None)
                }
            },
            StreamEvent::BlockStop { .. } => {
                self.flush_open()?;
                Ok(None)
            }
            StreamEvent::MessageDelta { delta } => {
                if let Some(reason) = delta.stop_reason.as_deref() {
                    self.stop_reason = Some(StopReason::from_wire(reason));
                }
                Ok(None)
            }
            StreamEvent::MessageStart | StreamEvent::MessageStop | StreamEvent::Ping => Ok(None),
            StreamEvent::Error { error } => Err(ProviderError::Protocol(format!(
                "in-stream error: {}: {}",
                error.error_type, error.message
            ))),
        }
    }

    /// Close any open block and return the final block list with the
    /// terminal stop reason.
    pub fn finish(mut self) -> Result<(Vec<ContentBlock>, StopReason), ProviderError> {
        self.flush_open()?;
        let stop_reason = self.stop_reason.unwrap_or(StopReason::EndTurn);
        Ok((self.blocks, stop_reason))
    }

    fn flush_open(&mut self) -> Result<(), ProviderError> {
        match self.open.take() {
            None => Ok(()),
            Some(OpenBlock::Text(text)) => {
                self.blocks.push(ContentBlock::Text { text });
                Ok(())
            }
            Some(OpenBlock::ToolUse { id, name, partial_json }) => {
                // No deltas at all means an empty input object, not an error.
                // A malformed accumulated buffer is a protocol violation and
                // fails the call rather than silently degrading.
                let input = if partial_json.is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(&partial_json).map_err(|e| {
                        ProviderError::Protocol(format!(
                            "malformed tool input JSON for '{name}': {e}"
                        ))
                    })?
                };
                self.blocks.push(ContentBlock::ToolUse { id, name, input });
                Ok(())
            }
        }
    }
}

impl Default for StreamAggregator {
    fn default() -> Self {
        Self::new()
    }
}
