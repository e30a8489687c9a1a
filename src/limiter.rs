//! Admission gate for batch creation
//!
//! Sliding-window limiter keyed by actor id. This is an explicit,
//! injectable component rather than ambient session state, and it sits in
//! front of the state machine: exceeding it rejects the call before any
//! request or ledger record exists. The clock is injected so tests can
//! move time instead of sleeping.
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use crate::error::WorkflowError;

pub type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct RateLimiter {
    max_calls: u32,
    window: Duration,
    clock: Clock,
    calls: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
}

impl RateLimiter {
    /// Limiter on the system clock: at most `max_calls` per rolling
    /// `window` per actor.
    pub fn new(max_calls: u32, window: Duration) -> Self {
        Self::with_clock(max_calls, window, Box::new(Utc::now))
    }

    pub fn with_clock(max_calls: u32, window: Duration, clock: Clock) -> Self {
        Self {
            max_calls,
            window,
            clock,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Record one call for `actor`, or reject it if the window is full.
    pub fn check(&self, actor: &str) -> Result<(), WorkflowError> {
        let now = (self.clock)();
        let mut calls = self.calls.lock().expect("rate limiter lock poisoned");
        let recent = calls.entry(actor.to_string()).or_default();

        while let Some(oldest) = recent.front() {
            if now.signed_duration_since(*oldest) >= self.window {
                recent.pop_front();
            } else {
                break;
            }
        }

        if recent.len() as u32 >= self.max_calls {
            tracing::warn!(actor = %actor, "batch creation rate limit hit");
            return Err(WorkflowError::RateLimited(actor.to_string()));
        }
        recent.push_back(now);
        Ok(())
    }
}
