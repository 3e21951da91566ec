//! Deadline timers driven by an external clock.

use std::time::{Duration, Instant};

/// One-shot timer with optional exponential backoff.
///
/// The timer never reads the clock itself; callers pass `now` so the engine
/// stays deterministic under a manual clock.
#[derive(Debug, Clone)]
pub struct Timer {
    base: Duration,
    period: Duration,
    max_multiplier: u32,
    deadline: Option<Instant>,
}

impl Timer {
    /// Timer with a fixed period.
    pub fn new(period: Duration) -> Self {
        Self::with_backoff(period, 1)
    }

    /// Timer whose period may double up to `max_multiplier` times the base.
    pub fn with_backoff(period: Duration, max_multiplier: u32) -> Self {
        Self {
            base: period,
            period,
            max_multiplier: max_multiplier.max(1),
            deadline: None,
        }
    }

    /// Arm the timer unless it is already running.
    pub fn start(&mut self, now: Instant) {
        if self.deadline.is_none() {
            self.deadline = Some(now + self.period);
        }
    }

    /// Arm the timer from `now`, replacing any pending deadline.
    pub fn restart(&mut self, now: Instant) {
        self.deadline = Some(now + self.period);
    }

    /// Disarm the timer.
    pub fn stop(&mut self) {
        self.deadline = None;
    }

    /// True while armed.
    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    /// Pending deadline.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Current period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Disarm and report true if the deadline has passed.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Double the period, capped at the configured multiplier.
    pub fn backoff(&mut self) {
        let cap = self.base * self.max_multiplier;
        self.period = (self.period * 2).min(cap);
    }

    /// Return the period to its base value.
    pub fn reset_period(&mut self) {
        self.period = self.base;
    }
}
