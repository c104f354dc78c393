use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hq_common::{Event, EventPatch, EventStatus, Field, NewEvent};
use crate::repository::{from_millis, EventRepository};
use anyhow::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, info};

const EVENT_COLUMNS: &str = "id, name, data, status, worker_id, num_attempts, attempted_at, \
    next_attempt_at, response_code, response_text, created_at, modified_at";

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        data TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'queued',
        worker_id TEXT,
        num_attempts INTEGER NOT NULL DEFAULT 0,
        attempted_at BIGINT,
        next_attempt_at BIGINT NOT NULL,
        response_code INTEGER,
        response_text TEXT,
        created_at BIGINT NOT NULL,
        modified_at BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_status ON events(status)",
    "CREATE INDEX IF NOT EXISTS idx_events_due ON events(status, worker_id, next_attempt_at)",
];

pub struct SqliteEventRepository {
    pool: SqlitePool,
}

impl SqliteEventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start an `UPDATE events SET ...` statement covering the fields set in `patch`
    fn update_builder(patch: &EventPatch, now: DateTime<Utc>) -> QueryBuilder<'static, Sqlite> {
        let mut qb = QueryBuilder::new("UPDATE events SET modified_at = ");
        qb.push_bind(now.timestamp_millis());

        if let Field::Set(status) = &patch.status {
            qb.push(", status = ").push_bind(status.as_str().to_string());
        }
        if let Field::Set(worker_id) = &patch.worker_id {
            qb.push(", worker_id = ").push_bind(worker_id.clone());
        }
        if let Field::Set(num_attempts) = &patch.num_attempts {
            qb.push(", num_attempts = ").push_bind(i64::from(*num_attempts));
        }
        if let Field::Set(attempted_at) = &patch.attempted_at {
            qb.push(", attempted_at = ")
                .push_bind(attempted_at.map(|t| t.timestamp_millis()));
        }
        if let Field::Set(next_attempt_at) = &patch.next_attempt_at {
            qb.push(", next_attempt_at = ")
                .push_bind(next_attempt_at.timestamp_millis());
        }
        if let Field::Set(response_code) = &patch.response_code {
            qb.push(", response_code = ").push_bind(*response_code);
        }
        if let Field::Set(response_text) = &patch.response_text {
            qb.push(", response_text = ").push_bind(response_text.clone());
        }
        qb
    }
}

fn event_from_row(row: &SqliteRow) -> Result<Event> {
    let data: String = row.try_get("data")?;
    let status: String = row.try_get("status")?;

    Ok(Event {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        data: serde_json::from_str(&data)?,
        status: status.parse()?,
        worker_id: row.try_get("worker_id")?,
        num_attempts: u32::try_from(row.try_get::<i64, _>("num_attempts")?)?,
        attempted_at: row
            .try_get::<Option<i64>, _>("attempted_at")?
            .map(from_millis)
            .transpose()?,
        next_attempt_at: from_millis(row.try_get("next_attempt_at")?)?,
        response_code: row.try_get("response_code")?,
        response_text: row.try_get("response_text")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        modified_at: from_millis(row.try_get("modified_at")?)?,
    })
}

#[async_trait]
impl EventRepository for SqliteEventRepository {
    async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn insert(&self, event: NewEvent, now: DateTime<Utc>) -> Result<Event> {
        event.validate()?;
        let now_ms = now.timestamp_millis();

        let row = sqlx::query(&format!(
            "INSERT INTO events (name, data, status, next_attempt_at, created_at, modified_at) \
             VALUES (?, ?, ?, ?, ?, ?) RETURNING {}",
            EVENT_COLUMNS
        ))
        .bind(event.name.as_str())
        .bind(serde_json::to_string(&event.data)?)
        .bind(event.status.as_str())
        .bind(now_ms)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_one(&self.pool)
        .await?;

        event_from_row(&row)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Event>> {
        let row = sqlx::query(&format!("SELECT {} FROM events WHERE id = ?", EVENT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(event_from_row).transpose()
    }

    async fn find_by_status(&self, status: EventStatus, limit: u32) -> Result<Vec<Event>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM events WHERE status = ? ORDER BY id LIMIT ?",
            EVENT_COLUMNS
        ))
        .bind(status.as_str())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn update(&self, id: i64, patch: &EventPatch, now: DateTime<Utc>) -> Result<Option<Event>> {
        let mut qb = Self::update_builder(patch, now);
        qb.push(" WHERE id = ").push_bind(id);

        let result = qb.build().execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.find_by_id(id).await
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM events WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn leased_to(&self, worker_id: &str) -> Result<Vec<Event>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM events WHERE status = 'queued' AND worker_id = ? \
             ORDER BY next_attempt_at, id",
            EVENT_COLUMNS
        ))
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }

    async fn release_abandoned(&self, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET worker_id = NULL, modified_at = ?
            WHERE status = 'queued'
            AND worker_id IS NOT NULL
            AND modified_at <= ?
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(cutoff.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected();
        if released > 0 {
            info!("Released {} abandoned event leases (SQLite)", released);
        }
        Ok(released)
    }

    async fn lease_due(&self, worker_id: &str, limit: u32, now: DateTime<Utc>) -> Result<Vec<Event>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now_ms = now.timestamp_millis();

        // A single statement, so SQLite's writer lock makes selection and
        // assignment one atomic step.
        let rows = sqlx::query(&format!(
            r#"
            UPDATE events
            SET worker_id = ?, modified_at = ?
            WHERE worker_id IS NULL
            AND id IN (
                SELECT id FROM events
                WHERE status = 'queued'
                AND worker_id IS NULL
                AND next_attempt_at <= ?
                ORDER BY next_attempt_at, id
                LIMIT ?
            )
            RETURNING {}
            "#,
            EVENT_COLUMNS
        ))
        .bind(worker_id)
        .bind(now_ms)
        .bind(now_ms)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut events = rows.iter().map(event_from_row).collect::<Result<Vec<_>>>()?;
        events.sort_by(|a, b| (a.next_attempt_at, a.id).cmp(&(b.next_attempt_at, b.id)));
        debug!("Leased {} events to worker {}", events.len(), worker_id);
        Ok(events)
    }

    async fn begin_attempt(
        &self,
        id: i64,
        worker_id: &str,
        expected_attempts: u32,
        attempted_at: DateTime<Utc>,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE events
            SET num_attempts = num_attempts + 1,
                attempted_at = ?,
                next_attempt_at = ?,
                modified_at = ?
            WHERE id = ?
            AND worker_id = ?
            AND status = 'queued'
            AND num_attempts = ?
            "#,
        )
        .bind(attempted_at.timestamp_millis())
        .bind(next_attempt_at.timestamp_millis())
        .bind(attempted_at.timestamp_millis())
        .bind(id)
        .bind(worker_id)
        .bind(i64::from(expected_attempts))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn finish_attempt(
        &self,
        id: i64,
        attempt: u32,
        patch: &EventPatch,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut qb = Self::update_builder(patch, now);
        qb.push(" WHERE id = ").push_bind(id);
        qb.push(" AND num_attempts = ").push_bind(i64::from(attempt));

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;

    async fn repository() -> SqliteEventRepository {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let repo = SqliteEventRepository::new(pool);
        repo.init_schema().await.unwrap();
        repo
    }

    #[tokio::test]
    async fn test_init_schema_is_idempotent() {
        let repo = repository().await;
        repo.init_schema().await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let repo = repository().await;
        let now = Utc::now();

        let created = repo
            .insert(NewEvent::new("user.created", json!({"id": 7})), now)
            .await
            .unwrap();

        assert_eq!(created.status, EventStatus::Queued);
        assert_eq!(created.worker_id, None);
        assert_eq!(created.num_attempts, 0);
        assert_eq!(created.next_attempt_at, created.created_at);
        assert_eq!(created.created_at.timestamp_millis(), now.timestamp_millis());

        let found = repo.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(found, created);
        assert_eq!(found.data, json!({"id": 7}));

        assert!(repo.find_by_id(created.id + 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_rejects_invalid_event() {
        let repo = repository().await;
        let result = repo.insert(NewEvent::new("", json!({})), Utc::now()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_ids_increase() {
        let repo = repository().await;
        let now = Utc::now();
        let a = repo.insert(NewEvent::new("a", json!({})), now).await.unwrap();
        let b = repo.insert(NewEvent::new("b", json!({})), now).await.unwrap();
        assert!(b.id > a.id);
    }

    #[tokio::test]
    async fn test_update_touches_only_set_fields() {
        let repo = repository().await;
        let now = Utc::now();
        let created = repo.insert(NewEvent::new("ping", json!({})), now).await.unwrap();
        let later = now + chrono::Duration::seconds(10);

        let patch = EventPatch {
            worker_id: Field::Set(Some("w1".to_string())),
            response_text: Field::Set(Some("hello".to_string())),
            ..Default::default()
        };
        let updated = repo.update(created.id, &patch, later).await.unwrap().unwrap();

        assert_eq!(updated.worker_id.as_deref(), Some("w1"));
        assert_eq!(updated.response_text.as_deref(), Some("hello"));
        assert_eq!(updated.status, EventStatus::Queued);
        assert_eq!(updated.response_code, None);
        assert_eq!(updated.modified_at.timestamp_millis(), later.timestamp_millis());

        let clear = EventPatch {
            worker_id: Field::Set(None),
            ..Default::default()
        };
        let cleared = repo.update(created.id, &clear, later).await.unwrap().unwrap();
        assert_eq!(cleared.worker_id, None);
        assert_eq!(cleared.response_text.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_update_missing_event() {
        let repo = repository().await;
        let patch = EventPatch {
            status: Field::Set(EventStatus::Failed),
            ..Default::default()
        };
        assert!(repo.update(42, &patch, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let repo = repository().await;
        let created = repo.insert(NewEvent::new("ping", json!({})), Utc::now()).await.unwrap();

        assert!(repo.delete(created.id).await.unwrap());
        assert!(!repo.delete(created.id).await.unwrap());
        assert!(repo.find_by_id(created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_status() {
        let repo = repository().await;
        let now = Utc::now();
        let a = repo.insert(NewEvent::new("a", json!({})), now).await.unwrap();
        let mut failed = NewEvent::new("b", json!({}));
        failed.status = EventStatus::Failed;
        repo.insert(failed, now).await.unwrap();

        let queued = repo.find_by_status(EventStatus::Queued, 10).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, a.id);
        assert_eq!(repo.find_by_status(EventStatus::Failed, 10).await.unwrap().len(), 1);
        assert!(repo.find_by_status(EventStatus::Processed, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_begin_attempt_requires_expected_lease_and_count() {
        let repo = repository().await;
        let now = Utc::now();
        let created = repo.insert(NewEvent::new("ping", json!({})), now).await.unwrap();
        repo.lease_due("w1", 1, now).await.unwrap();
        let next = now + chrono::Duration::minutes(1);

        assert!(!repo.begin_attempt(created.id, "w2", 0, now, next).await.unwrap());
        assert!(!repo.begin_attempt(created.id, "w1", 1, now, next).await.unwrap());
        assert!(repo.begin_attempt(created.id, "w1", 0, now, next).await.unwrap());
        // Same expectation again is stale now
        assert!(!repo.begin_attempt(created.id, "w1", 0, now, next).await.unwrap());

        let event = repo.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(event.num_attempts, 1);
        assert_eq!(event.next_attempt_at.timestamp_millis(), next.timestamp_millis());
    }

    #[tokio::test]
    async fn test_finish_attempt_rejects_stale_attempt() {
        let repo = repository().await;
        let now = Utc::now();
        let created = repo.insert(NewEvent::new("ping", json!({})), now).await.unwrap();
        repo.lease_due("w1", 1, now).await.unwrap();
        repo.begin_attempt(created.id, "w1", 0, now, now).await.unwrap();

        let patch = EventPatch {
            status: Field::Set(EventStatus::Processed),
            ..Default::default()
        };
        assert!(!repo.finish_attempt(created.id, 2, &patch, now).await.unwrap());
        assert!(repo.finish_attempt(created.id, 1, &patch, now).await.unwrap());

        let event = repo.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Processed);
    }
}
