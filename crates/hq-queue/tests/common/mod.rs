#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use hq_common::{Event, NewEvent};
use hq_queue::sqlite::SqliteEventRepository;
use hq_queue::{
    Clock, DeliveryResponse, EventDispatcher, EventRepository, LeaseManager, ManualClock,
    RetryPolicy, WebhookSender,
};

pub const ABANDON_AFTER: Duration = Duration::from_secs(180);

/// Single-connection in-memory database; the connection must never be
/// recycled or the schema disappears with it
pub async fn memory_repository() -> Arc<SqliteEventRepository> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None::<Duration>)
        .max_lifetime(None::<Duration>)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let repo = SqliteEventRepository::new(pool);
    repo.init_schema().await.unwrap();
    Arc::new(repo)
}

/// File-backed database shared by several connections
pub async fn file_repository(path: &Path, connections: u32) -> Arc<SqliteEventRepository> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(10));
    let pool = SqlitePoolOptions::new()
        .max_connections(connections)
        .connect_with(options)
        .await
        .unwrap();
    let repo = SqliteEventRepository::new(pool);
    repo.init_schema().await.unwrap();
    Arc::new(repo)
}

pub async fn insert_event(
    repo: &Arc<SqliteEventRepository>,
    name: &str,
    data: serde_json::Value,
    now: DateTime<Utc>,
) -> Event {
    repo.insert(NewEvent::new(name, data), now).await.unwrap()
}

pub fn lease_manager(repo: Arc<SqliteEventRepository>, clock: &ManualClock) -> LeaseManager {
    LeaseManager::new(repo, Arc::new(clock.clone()) as Arc<dyn Clock>, ABANDON_AFTER)
}

pub fn dispatcher(
    repo: Arc<SqliteEventRepository>,
    sender: Arc<dyn WebhookSender>,
    clock: &ManualClock,
) -> EventDispatcher {
    EventDispatcher::new(repo, sender, Arc::new(clock.clone()), RetryPolicy::default())
}

/// Sender replaying canned responses, then repeating a fallback
pub struct ScriptedSender {
    script: parking_lot::Mutex<VecDeque<DeliveryResponse>>,
    fallback: DeliveryResponse,
    calls: parking_lot::Mutex<Vec<(String, serde_json::Value)>>,
}

impl ScriptedSender {
    pub fn always(response: DeliveryResponse) -> Self {
        Self::scripted(Vec::new(), response)
    }

    pub fn scripted(script: Vec<DeliveryResponse>, fallback: DeliveryResponse) -> Self {
        Self {
            script: parking_lot::Mutex::new(script.into()),
            fallback,
            calls: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn ok() -> Self {
        Self::always(DeliveryResponse::new(200, "OK"))
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn called_names(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(name, _)| name.clone()).collect()
    }
}

#[async_trait]
impl WebhookSender for ScriptedSender {
    async fn deliver(&self, name: &str, data: &serde_json::Value) -> DeliveryResponse {
        self.calls.lock().push((name.to_string(), data.clone()));
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}
