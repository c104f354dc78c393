//! Retry schedule for failed deliveries.
//!
//! Delays grow linearly in odd steps: with the default base of one minute and
//! step of two minutes, attempts 1..5 are followed by 1, 3, 5, 7 and 9 minute
//! waits. The attempt cap decides when a failing event is given up on.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of delivery attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first attempt
    pub base_delay: Duration,
    /// Added to the delay for every further attempt
    pub step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(60),
            step: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Delay between attempt `attempt` (1-based) and the next one, `None` on overflow
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        self.step
            .checked_mul(attempt.saturating_sub(1))?
            .checked_add(self.base_delay)
    }

    /// Earliest time the event may be leased again after `attempt`
    pub fn next_attempt_at(&self, attempted_at: DateTime<Utc>, attempt: u32) -> Result<DateTime<Utc>> {
        let delay = self
            .delay_after(attempt)
            .ok_or_else(|| anyhow!("Retry delay after attempt {} overflows", attempt))?;
        let delay = chrono::Duration::from_std(delay)
            .with_context(|| format!("Retry delay {:?} out of range", delay))?;

        attempted_at
            .checked_add_signed(delay)
            .ok_or_else(|| anyhow!("Next attempt time after attempt {} out of range", attempt))
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}
