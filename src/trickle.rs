//! [Trickle timer](https://datatracker.ietf.org/doc/html/rfc6206) used to
//! pace DHCPv6 solicit retransmissions.
//!
//! The timer picks a transmit point uniformly in the second half of the
//! current interval. When the interval ends it doubles, capped at the
//! configured maximum. An inconsistency report collapses the interval back
//! to the minimum. The timer itself keeps no thread or task, callers drive
//! it by sleeping until [`next_deadline`](TrickleTimer::next_deadline) and
//! then calling [`handle_expired`](TrickleTimer::handle_expired).

use std::time::{Duration, Instant};

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the transmit point within the interval.
    Transmit,
    /// Transmit point passed, waiting for the interval to end.
    IntervalEnd,
}

/// A trickle timer instance.
#[derive(Debug, Clone)]
pub struct TrickleTimer {
    interval_min: Duration,
    interval_max: Duration,
    interval: Duration,
    phase: Phase,
    transmit_at: Instant,
    interval_end: Instant,
    running: bool,
}

impl TrickleTimer {
    /// Create a new, stopped `TrickleTimer` with the given interval
    /// bounds.
    pub fn new(interval_min: Duration, interval_max: Duration) -> Self {
        let epoch = Instant::now();
        Self {
            interval_min,
            interval_max: interval_max.max(interval_min),
            interval: interval_min,
            phase: Phase::Transmit,
            transmit_at: epoch,
            interval_end: epoch,
            running: false,
        }
    }

    /// Start the timer at the minimum interval.
    pub fn start(&mut self, now: Instant) {
        self.running = true;
        self.interval = self.interval_min;
        self.begin_interval(now);
    }

    /// Stop the timer.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Whether the timer is running.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Report an inconsistency, collapsing the interval back to the
    /// minimum.
    pub fn indicate_inconsistent(&mut self, now: Instant) {
        if self.running && self.interval > self.interval_min {
            self.interval = self.interval_min;
            self.begin_interval(now);
        }
    }

    /// The next point in time [`handle_expired`](Self::handle_expired)
    /// wants to run, or `None` when the timer is stopped.
    pub fn next_deadline(&self) -> Option<Instant> {
        if !self.running {
            return None;
        }
        Some(match self.phase {
            Phase::Transmit => self.transmit_at,
            Phase::IntervalEnd => self.interval_end,
        })
    }

    /// Advance the timer state. Returns `true` when the caller should
    /// transmit now.
    pub fn handle_expired(&mut self, now: Instant) -> bool {
        if !self.running {
            return false;
        }
        match self.phase {
            Phase::Transmit => {
                self.phase = Phase::IntervalEnd;
                true
            }
            Phase::IntervalEnd => {
                self.interval = (self.interval * 2).min(self.interval_max);
                self.begin_interval(now);
                false
            }
        }
    }

    fn begin_interval(&mut self, now: Instant) {
        let half = self.interval / 2;
        let offset = if half.is_zero() {
            half
        } else {
            rand::thread_rng().gen_range(half..=self.interval)
        };
        self.transmit_at = now + offset;
        self.interval_end = now + self.interval;
        self.phase = Phase::Transmit;
    }
}
