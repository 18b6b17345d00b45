//! Delay policy between failed attempts.
//!
//! The job loop retries immediately by default. A [`Backoff`] other than
//! [`Backoff::None`] inserts a pause after a failed acquisition or a failed
//! unit of work; the sequence resets once a lock is granted.

use std::cmp;
use std::time::Duration;

/// Pause inserted after a failure before the loop tries again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backoff {
    /// Retry at once.
    #[default]
    None,
    /// Wait the same delay after every failure.
    Fixed(Duration),
    /// Start at `initial`, multiply by `factor` per consecutive failure, cap at `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        factor: u32,
    },
}

/// Running position in a [`Backoff`] sequence.
#[derive(Debug, Clone)]
pub(crate) struct BackoffState {
    policy: Backoff,
    current: Option<Duration>,
}

impl BackoffState {
    pub(crate) fn new(policy: Backoff) -> Self {
        Self {
            policy,
            current: None,
        }
    }

    /// Returns the delay for this failure and advances the sequence.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        match self.policy {
            Backoff::None => None,
            Backoff::Fixed(delay) => Some(delay),
            Backoff::Exponential {
                initial,
                max,
                factor,
            } => {
                let delay = match self.current {
                    None => cmp::min(initial, max),
                    Some(previous) => cmp::min(previous.saturating_mul(cmp::max(factor, 1)), max),
                };
                self.current = Some(delay);
                Some(delay)
            }
        }
    }

    pub(crate) fn reset(&mut self) {
        self.current = None;
    }
}
