//! Capped exponential backoff with bounded jitter.
//!
//! Every retry loop in the agent derives its delays from a [`BackoffPolicy`]
//! and sleeps through [`sleep`], which resolves early when the shared
//! cancellation token fires.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Jitter is uniform in `[0, capped / 4]`.
const JITTER_DIVISOR: u64 = 4;

/// Capped exponential delay: `min(initial * 2^attempt, max)` plus jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        debug_assert!(initial <= max, "initial delay must not exceed max delay");
        Self { initial, max }
    }

    pub fn from_millis(initial_ms: u64, max_ms: u64) -> Self {
        Self::new(Duration::from_millis(initial_ms), Duration::from_millis(max_ms))
    }

    /// The capped delay for `attempt` (starting at 0), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial.as_millis() as u64;
        let shifted = if attempt >= 63 {
            u64::MAX
        } else {
            initial_ms.saturating_mul(1u64 << attempt)
        };
        Duration::from_millis(shifted.min(self.max.as_millis() as u64))
    }

    /// The delay for `attempt`, with uniform jitter in `[0, 25%]` of the
    /// capped value.
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = self.base_delay(attempt).as_millis() as u64;
        let jitter = if capped == 0 {
            0
        } else {
            rand::rng().random_range(0..=capped / JITTER_DIVISOR)
        };
        Duration::from_millis(capped + jitter)
    }
}

/// Outcome of a cancellation-aware sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    Elapsed,
    Aborted,
}

impl SleepOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(self, SleepOutcome::Aborted)
    }
}

/// Sleep for `duration`, resolving immediately with [`SleepOutcome::Aborted`]
/// when `cancel` fires.
pub async fn sleep(duration: Duration, cancel: &CancellationToken) -> SleepOutcome {
    tokio::select! {
        _ = cancel.cancelled() => SleepOutcome::Aborted,
        _ = tokio::time::sleep(duration) => SleepOutcome::Elapsed,
    }
}
