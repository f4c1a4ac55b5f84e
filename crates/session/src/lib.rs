//! Durable conversation sessions for the mealmind assistant core.
//!
//! A user has at most one *active* conversation at a time: the most recently
//! touched conversation whose last activity falls within the TTL. Once the
//! TTL lapses the old conversation becomes inert history and the next save
//! starts a new one. Messages are append-only; a conversation retains at most
//! a fixed number of messages, trimmed oldest-first.

pub mod store;

pub use store::{LoadedSession, SessionPolicy, SessionStore};
