//! Per-user dual sliding-window rate limiter.
//!
//! Each user carries two independent counters — a one-minute window and a
//! one-day window — each of which resets wholesale once its duration has
//! elapsed. State lives in process memory only: it is the first line of
//! defense, not an accounting system, so losing an entry merely restarts
//! counting for a user who was idle long past any window.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// The outcome of a rate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub message: Option<String>,
}

impl RateDecision {
    fn allow() -> Self {
        Self { allowed: true, message: None }
    }

    fn deny(message: impl Into<String>) -> Self {
        Self { allowed: false, message: Some(message.into()) }
    }
}

/// Ceilings and timing knobs for the limiter.
///
/// The window and sweep durations are configurable so tests can compress
/// time; production code uses [`RatePolicy::new`] with the real durations.
#[derive(Debug, Clone)]
pub struct RatePolicy {
    pub per_minute: u32,
    pub per_day: u32,
    pub minute_window: Duration,
    pub day_window: Duration,
    pub sweep_interval: Duration,
    pub idle_eviction: Duration,
}

impl RatePolicy {
    pub fn new(per_minute: u32, per_day: u32) -> Self {
        Self {
            per_minute,
            per_day,
            minute_window: Duration::from_secs(60),
            day_window: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            idle_eviction: Duration::from_secs(60 * 60),
        }
    }
}

/// Per-user counters. Both windows count independently.
#[derive(Debug)]
struct RateState {
    minute_count: u32,
    minute_start: Instant,
    day_count: u32,
    day_start: Instant,
    last_access: Instant,
}

impl RateState {
    fn new(now: Instant) -> Self {
        Self {
            minute_count: 0,
            minute_start: now,
            day_count: 0,
            day_start: now,
            last_access: now,
        }
    }
}

/// The shared limiter. Safe under concurrent calls for the same and
/// different users; the map lock is held only to fetch or insert an entry,
/// never across the per-user exclusive section.
pub struct RateLimiter {
    policy: RatePolicy,
    states: Mutex<HashMap<String, Arc<Mutex<RateState>>>>,
    last_sweep: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(policy: RatePolicy) -> Self {
        Self {
            policy,
            states: Mutex::new(HashMap::new()),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Check whether the user may proceed and, if so, record the request.
    ///
    /// A denial does not mutate the counters, so a blocked user does not
    /// push their own window further out. Never fails; absence of prior
    /// state is not an error.
    pub fn check_and_record(&self, user_id: &str) -> RateDecision {
        let now = Instant::now();
        self.maybe_sweep(now);

        let state = {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(
                states
                    .entry(user_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(RateState::new(now)))),
            )
        };

        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());

        if now.duration_since(state.minute_start) > self.policy.minute_window {
            state.minute_count = 0;
            state.minute_start = now;
        }
        if now.duration_since(state.day_start) > self.policy.day_window {
            state.day_count = 0;
            state.day_start = now;
        }

        if state.minute_count >= self.policy.per_minute {
            debug!(user_id, "Rate limited: minute ceiling");
            return RateDecision::deny(format!(
                "You have reached the limit of {} requests per minute. Please wait a moment.",
                self.policy.per_minute
            ));
        }
        if state.day_count >= self.policy.per_day {
            debug!(user_id, "Rate limited: day ceiling");
            return RateDecision::deny(format!(
                "You have reached the limit of {} requests per day. Please try again tomorrow.",
                self.policy.per_day
            ));
        }

        state.minute_count += 1;
        state.day_count += 1;
        state.last_access = now;
        RateDecision::allow()
    }

    /// Best-effort memory bounding: at most once per sweep interval, drop
    /// entries idle past the eviction threshold.
    fn maybe_sweep(&self, now: Instant) {
        {
            let mut last = self.last_sweep.lock().unwrap_or_else(|e| e.into_inner());
            if now.duration_since(*last) < self.policy.sweep_interval {
                return;
            }
            *last = now;
        }

        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let before = states.len();
        states.retain(|_, state| match state.lock() {
            Ok(s) => now.duration_since(s.last_access) < self.policy.idle_eviction,
            Err(_) => false,
        });
        let evicted = before - states.len();
        if evicted > 0 {
            debug!(evicted, "Swept idle rate states");
        }
    }

    /// Number of users currently tracked (for diagnostics and tests).
    pub fn tracked_users(&self) -> usize {
        self.states.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
