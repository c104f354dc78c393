//! Worker control loop
//!
//! Each cycle reclaims abandoned leases, tops the worker's own lease up to
//! the queue depth, then dispatches the leased events one at a time. Shutdown
//! is only honoured between cycles, between events, and during the sleep.

use std::time::Duration;
use anyhow::Result;
use hq_common::{QueueError, MAX_WORKER_ID_LEN};
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::dispatcher::{DispatchOutcome, EventDispatcher};
use crate::lease::LeaseManager;
use crate::signals::InterruptGate;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Number of events a worker keeps leased
    pub queue_depth: u32,
    /// Sleep between cycles
    pub poll_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue_depth: 5,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Counters for one worker cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub reclaimed: u64,
    pub acquired: usize,
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Delivered => self.delivered += 1,
            DispatchOutcome::RetryScheduled { .. } => self.retried += 1,
            DispatchOutcome::GaveUp => self.failed += 1,
            DispatchOutcome::Skipped(_) => self.skipped += 1,
        }
    }

    /// Events a dispatch was attempted for
    pub fn dispatched(&self) -> usize {
        self.delivered + self.retried + self.failed + self.skipped + self.errors
    }
}

pub struct Worker {
    worker_id: String,
    settings: WorkerSettings,
    lease: LeaseManager,
    dispatcher: EventDispatcher,
    gate: InterruptGate,
}

impl Worker {
    pub fn new(
        worker_id: impl Into<String>,
        settings: WorkerSettings,
        lease: LeaseManager,
        dispatcher: EventDispatcher,
        gate: InterruptGate,
    ) -> Result<Self> {
        let worker_id = worker_id.into();
        let len = worker_id.chars().count();
        if len == 0 || len > MAX_WORKER_ID_LEN {
            return Err(QueueError::Validation(format!(
                "worker id must be 1..={} characters, got {}",
                MAX_WORKER_ID_LEN, len
            ))
            .into());
        }

        Ok(Self {
            worker_id,
            settings,
            lease,
            dispatcher,
            gate,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn gate(&self) -> &InterruptGate {
        &self.gate
    }

    /// Run one reclaim, top-up and dispatch pass
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport {
            reclaimed: self.lease.reclaim_abandoned().await?,
            ..Default::default()
        };

        let mut leased = self.lease.leased(&self.worker_id).await?;
        let shortfall = (self.settings.queue_depth as usize).saturating_sub(leased.len());
        if shortfall > 0 {
            let limit = u32::try_from(shortfall).unwrap_or(u32::MAX);
            report.acquired = self.lease.acquire(&self.worker_id, limit).await?.len();
            leased = self.lease.leased(&self.worker_id).await?;
        }

        for event in leased {
            if self.gate.is_shutdown() {
                debug!(worker_id = %self.worker_id, "Shutdown requested, leaving remaining events leased");
                break;
            }

            let _guard = self.gate.defer();
            match self.dispatcher.dispatch(event.id, &self.worker_id).await {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    error!(event_id = event.id, worker_id = %self.worker_id, error = %e, "Failed to dispatch event");
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Loop until the gate requests shutdown
    pub async fn run(&self) {
        info!(
            worker_id = %self.worker_id,
            queue_depth = self.settings.queue_depth,
            "Starting worker"
        );

        while !self.gate.is_shutdown() {
            match self.run_cycle().await {
                Ok(report) if report.dispatched() > 0 || report.reclaimed > 0 => {
                    info!(
                        reclaimed = report.reclaimed,
                        acquired = report.acquired,
                        delivered = report.delivered,
                        retried = report.retried,
                        failed = report.failed,
                        skipped = report.skipped,
                        errors = report.errors,
                        "Worker cycle complete"
                    );
                }
                Ok(_) => debug!("Worker cycle found nothing to do"),
                Err(e) => error!("Worker cycle failed: {}", e),
            }

            tokio::select! {
                _ = sleep(self.settings.poll_interval) => {}
                _ = self.gate.wait_shutdown() => {}
            }
        }

        info!(worker_id = %self.worker_id, "Worker stopped");
    }
}
