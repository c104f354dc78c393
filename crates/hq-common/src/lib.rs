use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// Maximum length of an event name, matching the `name` column width.
pub const MAX_NAME_LEN: usize = 128;

/// Maximum length of a worker identity (a hyphenated UUID).
pub const MAX_WORKER_ID_LEN: usize = 36;

/// Maximum number of characters kept from a webhook response body or error.
pub const MAX_RESPONSE_TEXT_LEN: usize = 256;

/// Response code recorded when an attempt failed before any HTTP response.
pub const TRANSPORT_FAILURE_CODE: i32 = -1;

// ============================================================================
// Event Types
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    /// Waiting for (another) delivery attempt
    Queued,
    /// Delivered and acknowledged by the webhook endpoint
    Processed,
    /// Gave up after the attempt cap
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Queued => "queued",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventStatus::Queued)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(EventStatus::Queued),
            "processed" => Ok(EventStatus::Processed),
            "failed" => Ok(EventStatus::Failed),
            other => Err(QueueError::InvalidStatus(other.to_string())),
        }
    }
}

/// A persisted event row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: i64,
    pub name: String,
    pub data: serde_json::Value,
    pub status: EventStatus,
    /// Worker currently holding the lease, `None` when available
    pub worker_id: Option<String>,
    pub num_attempts: u32,
    pub attempted_at: Option<DateTime<Utc>>,
    pub next_attempt_at: DateTime<Utc>,
    pub response_code: Option<i32>,
    pub response_text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Event {
    pub fn is_leased_by(&self, worker_id: &str) -> bool {
        self.worker_id.as_deref() == Some(worker_id)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EventStatus::Queued && self.next_attempt_at <= now
    }
}

/// Producer input for a new event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub name: String,
    pub data: serde_json::Value,
    #[serde(default = "default_status")]
    pub status: EventStatus,
}

fn default_status() -> EventStatus {
    EventStatus::Queued
}

impl NewEvent {
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            data,
            status: EventStatus::Queued,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let len = self.name.chars().count();
        if len == 0 || len > MAX_NAME_LEN {
            return Err(QueueError::Validation(format!(
                "event name must be 1..={} characters, got {}",
                MAX_NAME_LEN, len
            )));
        }
        if !self.data.is_object() {
            return Err(QueueError::Validation(
                "event data must be a JSON object".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Partial Updates
// ============================================================================

/// A patchable field: either left untouched or set to a value.
///
/// Nullable columns use `Field<Option<T>>` so that "clear" (`Set(None)`)
/// and "leave alone" (`Unset`) stay distinct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field<T> {
    Unset,
    Set(T),
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Unset
    }
}

impl<T> Field<T> {
    pub fn is_set(&self) -> bool {
        matches!(self, Field::Set(_))
    }

    pub fn as_set(&self) -> Option<&T> {
        match self {
            Field::Set(value) => Some(value),
            Field::Unset => None,
        }
    }

    /// Apply the field to `target` if set
    pub fn apply_to(&self, target: &mut T)
    where
        T: Clone,
    {
        if let Field::Set(value) = self {
            *target = value.clone();
        }
    }
}

impl<T> From<Option<T>> for Field<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Field::Set(v),
            None => Field::Unset,
        }
    }
}

/// Partial update of an event. Only fields marked `Set` are written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPatch {
    pub status: Field<EventStatus>,
    pub worker_id: Field<Option<String>>,
    pub num_attempts: Field<u32>,
    pub attempted_at: Field<Option<DateTime<Utc>>>,
    pub next_attempt_at: Field<DateTime<Utc>>,
    pub response_code: Field<Option<i32>>,
    pub response_text: Field<Option<String>>,
}

impl EventPatch {
    pub fn is_empty(&self) -> bool {
        !(self.status.is_set()
            || self.worker_id.is_set()
            || self.num_attempts.is_set()
            || self.attempted_at.is_set()
            || self.next_attempt_at.is_set()
            || self.response_code.is_set()
            || self.response_text.is_set())
    }

    /// Apply the patch to an in-memory copy of an event
    pub fn apply(&self, event: &mut Event, now: DateTime<Utc>) {
        self.status.apply_to(&mut event.status);
        self.worker_id.apply_to(&mut event.worker_id);
        self.num_attempts.apply_to(&mut event.num_attempts);
        self.attempted_at.apply_to(&mut event.attempted_at);
        self.next_attempt_at.apply_to(&mut event.next_attempt_at);
        self.response_code.apply_to(&mut event.response_code);
        self.response_text.apply_to(&mut event.response_text);
        event.modified_at = now;
    }
}

/// Truncate text to at most `MAX_RESPONSE_TEXT_LEN` characters
pub fn truncate_response_text(text: &str) -> String {
    text.chars().take(MAX_RESPONSE_TEXT_LEN).collect()
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid event status: {0}")]
    InvalidStatus(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
