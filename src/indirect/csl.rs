//! Coordinated sampled listening transmit scheduling.
//!
//! Children negotiating a CSL schedule sample the channel in a short
//! window once per period. Instead of waiting for a data poll, the parent
//! can transmit into the next sample window. The scheduler tracks the
//! earliest upcoming window over all children holding an indirect
//! message.

use std::time::{Duration, Instant};

use tracing::trace;

use crate::child::{ChildIndex, ChildTable};

/// Picks the next CSL transmit slot over the child table.
#[derive(Debug, Default)]
pub struct CslTxScheduler {
    next_tx: Option<(ChildIndex, Instant)>,
}

impl CslTxScheduler {
    /// Create a new `CslTxScheduler`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recompute the next transmit slot. Called whenever a child's
    /// indirect message or CSL schedule changes.
    pub fn update(&mut self, children: &ChildTable, now: Instant) {
        self.next_tx = None;

        for (index, child) in children.iter() {
            if child.indirect_message().is_none() {
                continue;
            }
            let (Some(period), Some(synchronized_at)) =
                (child.csl_period, child.csl_synchronized_at)
            else {
                continue;
            };
            if period.is_zero() {
                continue;
            }

            // First sample window at or after now. Windows open at
            // `synchronized_at + phase + k * period` for whole k >= 0.
            let elapsed = now.saturating_duration_since(synchronized_at);
            let offset = if elapsed <= child.csl_phase {
                child.csl_phase
            } else {
                let periods = (elapsed - child.csl_phase)
                    .as_nanos()
                    .div_ceil(period.as_nanos());
                let nanos = child
                    .csl_phase
                    .as_nanos()
                    .saturating_add(periods.saturating_mul(period.as_nanos()));
                match u64::try_from(nanos) {
                    Ok(nanos) => Duration::from_nanos(nanos),
                    // Out of range for a Duration, no usable slot.
                    Err(_) => continue,
                }
            };
            let slot = synchronized_at + offset;

            match self.next_tx {
                Some((_, best)) if best <= slot => {}
                _ => self.next_tx = Some((index, slot)),
            }
        }

        if let Some((index, slot)) = self.next_tx {
            trace!(child = index, in_micros = %slot.saturating_duration_since(now).as_micros(), "Next CSL transmit slot");
        }
    }

    /// The child and time of the next transmit slot, if any.
    pub fn next_tx(&self) -> Option<(ChildIndex, Instant)> {
        self.next_tx
    }

    /// Forget any scheduled slot.
    pub fn clear(&mut self) {
        self.next_tx = None;
    }
}
