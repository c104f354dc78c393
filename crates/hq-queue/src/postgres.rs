use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hq_common::{Event, EventPatch, EventStatus, Field, NewEvent};
use crate::repository::{from_millis, EventRepository};
use anyhow::Result;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};

const EVENT_COLUMNS: &str = "id, name, data, status, worker_id, num_attempts, attempted_at, \
    next_attempt_at, response_code, response_text, created_at, modified_at";

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id BIGSERIAL PRIMARY KEY,
        name VARCHAR(128) NOT NULL,
        data TEXT NOT NULL,
        status VARCHAR(16) NOT NULL DEFAULT 'queued',
        worker_id VARCHAR(36),
        num_attempts INTEGER NOT NULL DEFAULT 0,
        attempted_at BIGINT,
        next_attempt_at BIGINT NOT NULL,
        response_code INTEGER,
        response_text VARCHAR(256),
        created_at BIGINT NOT NULL,
        modified_at BIGINT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_status ON events(status)",
    "CREATE INDEX IF NOT EXISTS idx_events_due ON events(status, worker_id, next_attempt_at)",
];

pub struct PostgresEventRepository {
    pool: PgPool,
}

impl PostgresEventRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn update_builder(patch: &EventPatch, now: DateTime<Utc>) -> QueryBuilder<'static, Postgres> {
        let mut qb = QueryBuilder::new("UPDATE events SET modified_at = ");
        qb.push_bind(now.timestamp_millis());

        if let Field::Set(status) = &patch.status {
            qb.push(", status = ").push_bind(status.as_str().to_string());
        }
        if let Field::Set(worker_id) = &patch.worker_id {
            qb.push(", worker_id = ").push_bind(worker_id.clone());
        }
        if let Field::Set(num_attempts) = &patch.num_attempts {
            qb.push(", num_attempts = ")
                .push_bind(attempts_param(*num_attempts));
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

fn event_from_row(row: &PgRow) -> Result<Event> {
    let data: String = row.try_get("data")?;
    let status: String = row.try_get("status")?;

    Ok(Event {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        data: serde_json::from_str(&data)?,
        status: status.parse()?,
        worker_id: row.try_get("worker_id")?,
        num_attempts: u32::try_from(row.try_get::<i32, _>("num_attempts")?)?,
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

fn attempts_param(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}

#[async_trait]
impl EventRepository for PostgresEventRepository {
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
             VALUES ($1, $2, $3, $4, $4, $4) RETURNING {}",
            EVENT_COLUMNS
        ))
        .bind(event.name.as_str())
        .bind(serde_json::to_string(&event.data)?)
        .bind(event.status.as_str())
        .bind(now_ms)
        .fetch_one(&self.pool)
        .await?;

        event_from_row(&row)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Event>> {
        let row = sqlx::query(&format!("SELECT {} FROM events WHERE id = $1", EVENT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(event_from_row).transpose()
    }

    async fn find_by_status(&self, status: EventStatus, limit: u32) -> Result<Vec<Event>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM events WHERE status = $1 ORDER BY id LIMIT $2",
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
        qb.push(format!(" RETURNING {}", EVENT_COLUMNS));

        let row = qb.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(event_from_row).transpose()
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM events WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn leased_to(&self, worker_id: &str) -> Result<Vec<Event>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM events WHERE status = 'queued' AND worker_id = $1 \
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
            SET worker_id = NULL, modified_at = $1
            WHERE status = 'queued'
            AND worker_id IS NOT NULL
            AND modified_at <= $2
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(cutoff.timestamp_millis())
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected();
        if released > 0 {
            info!("Released {} abandoned event leases (PostgreSQL)", released);
        }
        Ok(released)
    }

    async fn lease_due(&self, worker_id: &str, limit: u32, now: DateTime<Utc>) -> Result<Vec<Event>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now_ms = now.timestamp_millis();
        let mut tx = self.pool.begin().await?;

        // SKIP LOCKED lets concurrent workers pass over rows another
        // transaction is already claiming instead of queueing behind it
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM events
            WHERE status = 'queued'
            AND worker_id IS NULL
            AND next_attempt_at <= $1
            ORDER BY next_attempt_at, id
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now_ms)
        .bind(i64::from(limit))
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            "UPDATE events SET worker_id = $1, modified_at = $2 \
             WHERE id = ANY($3) AND worker_id IS NULL RETURNING {}",
            EVENT_COLUMNS
        ))
        .bind(worker_id)
        .bind(now_ms)
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

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
                attempted_at = $1,
                next_attempt_at = $2,
                modified_at = $1
            WHERE id = $3
            AND worker_id = $4
            AND status = 'queued'
            AND num_attempts = $5
            "#,
        )
        .bind(attempted_at.timestamp_millis())
        .bind(next_attempt_at.timestamp_millis())
        .bind(id)
        .bind(worker_id)
        .bind(attempts_param(expected_attempts))
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
        qb.push(" AND num_attempts = ").push_bind(attempts_param(attempt));

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }
}
