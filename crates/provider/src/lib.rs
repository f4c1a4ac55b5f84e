//! Completion-provider clients for the mealmind assistant core.
//!
//! The assistant speaks to its language model through the
//! [`mealmind_core::CompletionProvider`] trait; this crate holds the real
//! HTTP implementation.

pub mod anthropic;

pub use anthropic::AnthropicProvider;
