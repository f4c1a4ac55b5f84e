//! # Mealmind Core
//!
//! Domain types, traits, and error definitions for the mealmind assistant core —
//! the component that turns a practitioner's chat message into a bounded sequence
//! of completion-provider calls interleaved with tool invocations against the
//! practice's read-only data API.
//!
//! ## Design Philosophy
//!
//! Every subsystem boundary is defined as a trait here. Implementations live in
//! their respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod message;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use message::{ContentBlock, Message, MessageContent, Role};
pub use provider::{
    BlockKind, CompletionProvider, CompletionRequest, Delta, StopReason, StreamEvent,
    ToolDefinition,
};
pub use tool::{Tool, ToolRegistry};
