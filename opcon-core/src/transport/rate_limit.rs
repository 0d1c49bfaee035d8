//! Sliding-window admission control for outbound commands.
//!
//! Keeps one timestamp per admitted command for the trailing window.
//! Rejected commands are dropped by the caller, never queued.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Outcome of [`RateLimiter::try_admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected,
}

/// At most `max_per_window` admissions in any trailing `window`.
#[derive(Debug)]
pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            admitted: Mutex::new(VecDeque::with_capacity(max_per_window)),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_per_window, config.window())
    }

    pub fn max_per_window(&self) -> usize {
        self.max_per_window
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admit and record `now`, or reject if the window is full.
    pub fn try_admit(&self, now: Instant) -> Admission {
        let mut admitted = match self.admitted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::evict(&mut admitted, now, self.window);
        if admitted.len() < self.max_per_window {
            admitted.push_back(now);
            Admission::Admitted
        } else {
            Admission::Rejected
        }
    }

    /// Admissions still inside the window at `now`.
    pub fn in_window(&self, now: Instant) -> usize {
        let mut admitted = match self.admitted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::evict(&mut admitted, now, self.window);
        admitted.len()
    }

    // ── Internal ─────────────────────────────────────────────────

    /// Drop entries strictly older than `now - window`.
    fn evict(admitted: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(&ts) = admitted.front() {
            if now.saturating_duration_since(ts) > window {
                admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}

// ── Tests ────────────────────────────────────────────────────────
