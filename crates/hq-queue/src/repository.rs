use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hq_common::{Event, EventPatch, EventStatus, NewEvent};
use anyhow::Result;

/// Durable event storage.
///
/// Every method that mutates a row also sets `modified_at` to the supplied
/// `now`, which is what lease staleness is measured against.
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Create the events table and indexes if missing
    async fn init_schema(&self) -> Result<()>;

    async fn insert(&self, event: NewEvent, now: DateTime<Utc>) -> Result<Event>;

    async fn find_by_id(&self, id: i64) -> Result<Option<Event>>;

    async fn find_by_status(&self, status: EventStatus, limit: u32) -> Result<Vec<Event>>;

    /// Write the fields set in `patch`; `None` if the event does not exist
    async fn update(&self, id: i64, patch: &EventPatch, now: DateTime<Utc>) -> Result<Option<Event>>;

    async fn delete(&self, id: i64) -> Result<bool>;

    /// Queued events leased to `worker_id`, earliest due first
    async fn leased_to(&self, worker_id: &str) -> Result<Vec<Event>>;

    /// Clear the lease of queued events last modified at or before `cutoff`
    async fn release_abandoned(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64>;

    /// Atomically lease up to `limit` queued, unleased events due at `now`
    async fn lease_due(&self, worker_id: &str, limit: u32, now: DateTime<Utc>) -> Result<Vec<Event>>;

    /// Record the start of an attempt.
    ///
    /// Succeeds only while the event is queued, leased to `worker_id` and has
    /// exactly `expected_attempts` attempts, in which case `num_attempts`
    /// becomes `expected_attempts + 1`.
    async fn begin_attempt(
        &self,
        id: i64,
        worker_id: &str,
        expected_attempts: u32,
        attempted_at: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Record the outcome of attempt number `attempt`.
    ///
    /// Returns `false` without writing if the event has moved on to another
    /// attempt in the meantime.
    async fn finish_attempt(
        &self,
        id: i64,
        attempt: u32,
        patch: &EventPatch,
        now: DateTime<Utc>,
    ) -> Result<bool>;
}

/// Timestamps are stored as milliseconds since the Unix epoch
#[cfg(any(feature = "sqlite", feature = "postgres"))]
pub(crate) fn from_millis(ms: i64) -> hq_common::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(hq_common::QueueError::InvalidTimestamp(ms))
}
