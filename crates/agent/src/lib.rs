//! The mealmind agent loop and its supporting pieces.
//!
//! A turn flows as:
//!
//! 1. **Gate** the caller through the per-user rate limiter
//! 2. **Append** the user message to the exclusively-owned history
//! 3. **Stream** one completion call; the aggregator reduces protocol events
//!    into content blocks while live text fragments are forwarded immediately
//! 4. **If tool use**: dispatch each invocation through the fixed registry,
//!    collect the results into one user message, and loop back to step 3
//! 5. **Otherwise**: emit a completion marker and stop
//!
//! The loop is bounded by an iteration cap, not by wall-clock timeouts.
//! Session persistence happens at the edges, by the surrounding application.

pub mod aggregator;
pub mod event;
pub mod loop_runner;
pub mod prompt;
pub mod rate_limit;

pub use aggregator::StreamAggregator;
pub use event::AgentEvent;
pub use loop_runner::{AssistantLoop, CallerProfile};
pub use prompt::build_system_prompt;
pub use rate_limit::{RateDecision, RateLimiter, RatePolicy};
