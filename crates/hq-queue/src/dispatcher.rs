//! Single delivery attempts for leased events.
//!
//! The attempt is recorded before the webhook is called and the outcome is
//! written afterwards whatever the sender does, including panicking. Both
//! writes are conditional so a worker that lost its lease never touches the
//! row.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use hq_common::{
    truncate_response_text, EventPatch, EventStatus, Field, TRANSPORT_FAILURE_CODE,
};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::repository::EventRepository;
use crate::retry::RetryPolicy;

/// What the webhook endpoint answered, or why it could not be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResponse {
    /// HTTP status, or `-1` when no response was received
    pub code: i32,
    pub text: String,
}

impl DeliveryResponse {
    pub fn new(code: i32, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    pub fn transport_failure(error: impl std::fmt::Display) -> Self {
        Self::new(TRANSPORT_FAILURE_CODE, error.to_string())
    }

    /// Only `200` with a body of `OK` (surrounding whitespace ignored) counts
    pub fn is_success(&self) -> bool {
        self.code == 200 && self.text.trim() == "OK"
    }
}

/// Outbound webhook transport
#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn deliver(&self, name: &str, data: &serde_json::Value) -> DeliveryResponse;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The event no longer exists
    NotFound,
    /// The event is leased to someone else, unleased, or no longer queued
    LeaseLost,
    /// A newer attempt was recorded while this one was in flight
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    RetryScheduled { next_attempt_at: DateTime<Utc> },
    GaveUp,
    Skipped(SkipReason),
}

pub struct EventDispatcher {
    repository: Arc<dyn EventRepository>,
    sender: Arc<dyn WebhookSender>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl EventDispatcher {
    pub fn new(
        repository: Arc<dyn EventRepository>,
        sender: Arc<dyn WebhookSender>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            repository,
            sender,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Make one delivery attempt for an event leased to `worker_id`
    pub async fn dispatch(&self, event_id: i64, worker_id: &str) -> Result<DispatchOutcome> {
        let Some(event) = self.repository.find_by_id(event_id).await? else {
            debug!(event_id, "Event vanished before dispatch");
            return Ok(DispatchOutcome::Skipped(SkipReason::NotFound));
        };

        if event.status != EventStatus::Queued || !event.is_leased_by(worker_id) {
            debug!(event_id, worker_id, "Lease lost before dispatch");
            return Ok(DispatchOutcome::Skipped(SkipReason::LeaseLost));
        }

        // The cap can be lowered between runs; never exceed it
        if self.policy.is_exhausted(event.num_attempts) {
            return self.give_up_exhausted(event.id, event.num_attempts).await;
        }

        let attempt = event.num_attempts + 1;
        let attempted_at = self.clock.now();
        let next_attempt_at = self.policy.next_attempt_at(attempted_at, attempt)?;

        let started = self
            .repository
            .begin_attempt(event.id, worker_id, event.num_attempts, attempted_at, next_attempt_at)
            .await?;
        if !started {
            debug!(event_id, worker_id, "Lease lost while starting attempt");
            return Ok(DispatchOutcome::Skipped(SkipReason::LeaseLost));
        }

        let response = match AssertUnwindSafe(self.sender.deliver(&event.name, &event.data))
            .catch_unwind()
            .await
        {
            Ok(response) => response,
            Err(panic) => {
                let message = panic_message(&*panic);
                warn!(event_id, attempt, "Webhook sender panicked: {}", message);
                DeliveryResponse::transport_failure(format!("sender panicked: {}", message))
            }
        };

        let mut patch = EventPatch {
            worker_id: Field::Set(None),
            response_code: Field::Set(Some(response.code)),
            response_text: Field::Set(Some(truncate_response_text(&response.text))),
            ..Default::default()
        };

        let outcome = if response.is_success() {
            patch.status = Field::Set(EventStatus::Processed);
            DispatchOutcome::Delivered
        } else if self.policy.is_exhausted(attempt) {
            patch.status = Field::Set(EventStatus::Failed);
            DispatchOutcome::GaveUp
        } else {
            DispatchOutcome::RetryScheduled { next_attempt_at }
        };

        let written = self
            .repository
            .finish_attempt(event.id, attempt, &patch, self.clock.now())
            .await?;
        if !written {
            warn!(event_id, attempt, "Attempt superseded, outcome discarded");
            return Ok(DispatchOutcome::Skipped(SkipReason::Superseded));
        }

        match &outcome {
            DispatchOutcome::Delivered => {
                info!(event_id, attempt, response_code = response.code, "Event delivered");
            }
            DispatchOutcome::RetryScheduled { next_attempt_at } => {
                info!(
                    event_id,
                    attempt,
                    response_code = response.code,
                    next_attempt_at = %next_attempt_at,
                    "Delivery failed, retry scheduled"
                );
            }
            DispatchOutcome::GaveUp => {
                warn!(event_id, attempt, response_code = response.code, "Delivery failed, giving up");
            }
            DispatchOutcome::Skipped(_) => {}
        }

        Ok(outcome)
    }

    async fn give_up_exhausted(&self, event_id: i64, attempts: u32) -> Result<DispatchOutcome> {
        let patch = EventPatch {
            status: Field::Set(EventStatus::Failed),
            worker_id: Field::Set(None),
            ..Default::default()
        };
        if self
            .repository
            .finish_attempt(event_id, attempts, &patch, self.clock.now())
            .await?
        {
            warn!(event_id, attempts, "Attempt cap already reached, marking failed");
            Ok(DispatchOutcome::GaveUp)
        } else {
            Ok(DispatchOutcome::Skipped(SkipReason::Superseded))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
