//! Worker leases over queued events.
//!
//! A lease is the `worker_id` column. It carries no expiry of its own: a
//! leased event whose `modified_at` has not moved for longer than the
//! abandonment window is presumed orphaned and handed back to the pool.

use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, Context, Result};
use hq_common::Event;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::repository::EventRepository;

/// Default abandonment window
pub const DEFAULT_ABANDON_AFTER: Duration = Duration::from_secs(180);

pub struct LeaseManager {
    repository: Arc<dyn EventRepository>,
    clock: Arc<dyn Clock>,
    abandon_after: Duration,
}

impl LeaseManager {
    pub fn new(
        repository: Arc<dyn EventRepository>,
        clock: Arc<dyn Clock>,
        abandon_after: Duration,
    ) -> Self {
        Self {
            repository,
            clock,
            abandon_after,
        }
    }

    pub fn abandon_after(&self) -> Duration {
        self.abandon_after
    }

    /// Release leases on queued events untouched for the abandonment window
    pub async fn reclaim_abandoned(&self) -> Result<u64> {
        let now = self.clock.now();
        let window = chrono::Duration::from_std(self.abandon_after)
            .with_context(|| format!("Abandonment window {:?} out of range", self.abandon_after))?;
        let cutoff = now
            .checked_sub_signed(window)
            .ok_or_else(|| anyhow!("Abandonment window {:?} out of range", self.abandon_after))?;

        let released = self.repository.release_abandoned(cutoff, now).await?;
        if released > 0 {
            info!(released, "Reclaimed abandoned leases");
        }
        Ok(released)
    }

    /// Lease up to `limit` due events to `worker_id`, earliest due first
    pub async fn acquire(&self, worker_id: &str, limit: u32) -> Result<Vec<Event>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let leased = self
            .repository
            .lease_due(worker_id, limit, self.clock.now())
            .await?;

        if !leased.is_empty() {
            debug!(worker_id, count = leased.len(), "Acquired event leases");
        }
        Ok(leased)
    }

    pub async fn leased(&self, worker_id: &str) -> Result<Vec<Event>> {
        self.repository.leased_to(worker_id).await
    }
}
