//! PostgreSQL Repository Tests
//!
//! Tests for:
//! - `SKIP LOCKED` leasing under concurrent workers
//! - Guarded `begin_attempt` / `finish_attempt` writes
//!
//! These need a live server and are ignored by default. Run them with
//! `HQ_TEST_DATABASE_URL=postgres://... cargo test -- --ignored`. Each test
//! works in its own schema, dropped when the test passes.

#![cfg(feature = "postgres")]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};

use hq_common::{EventPatch, EventStatus, Field, NewEvent};
use hq_queue::postgres::PostgresEventRepository;
use hq_queue::{Clock, EventRepository, ManualClock};

struct TestSchema {
    admin: PgPool,
    name: String,
}

impl TestSchema {
    async fn remove(self) {
        sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", self.name))
            .execute(&self.admin)
            .await
            .unwrap();
    }
}

/// Repository bound to a fresh schema, or `None` when no database is configured
async fn postgres_repository(test: &str) -> Option<(Arc<PostgresEventRepository>, TestSchema)> {
    let Ok(url) = std::env::var("HQ_TEST_DATABASE_URL") else {
        eprintln!("HQ_TEST_DATABASE_URL not set, skipping {}", test);
        return None;
    };

    let name = format!("hq_test_{}_{}", test, std::process::id());
    let admin = PgPool::connect(&url).await.unwrap();
    sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", name))
        .execute(&admin)
        .await
        .unwrap();
    sqlx::query(&format!("CREATE SCHEMA {}", name))
        .execute(&admin)
        .await
        .unwrap();

    let search_path = format!("SET search_path TO {}", name);
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .acquire_timeout(Duration::from_secs(10))
        .after_connect(move |conn, _meta| {
            let search_path = search_path.clone();
            Box::pin(async move {
                conn.execute(search_path.as_str()).await?;
                Ok(())
            })
        })
        .connect(&url)
        .await
        .unwrap();

    let repo = PostgresEventRepository::new(pool);
    repo.init_schema().await.unwrap();
    Some((Arc::new(repo), TestSchema { admin, name }))
}

async fn insert(repo: &PostgresEventRepository, name: &str, now: DateTime<Utc>) -> i64 {
    repo.insert(NewEvent::new(name, json!({"source": "postgres"})), now)
        .await
        .unwrap()
        .id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires HQ_TEST_DATABASE_URL"]
async fn test_concurrent_lease_due_never_double_leases() {
    let Some((repo, schema)) = postgres_repository("lease").await else {
        return;
    };
    let clock = ManualClock::starting_now();
    let now = clock.now();

    for i in 0..20 {
        insert(&repo, &format!("event.{}", i), now).await;
    }

    let mut handles = Vec::new();
    for w in 0..8 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            let worker_id = format!("worker-{}", w);
            let leased = repo.lease_due(&worker_id, 5, now).await.unwrap();
            (worker_id, leased)
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let (worker_id, leased) = handle.await.unwrap();
        assert!(leased.len() <= 5);
        for event in leased {
            assert_eq!(event.worker_id.as_deref(), Some(worker_id.as_str()));
            assert!(seen.insert(event.id), "event {} leased twice", event.id);
        }
    }

    // Whatever the racing workers skipped is still available, and only once
    for event in repo.lease_due("sweeper", 100, now).await.unwrap() {
        assert!(seen.insert(event.id), "event {} leased twice", event.id);
    }
    assert_eq!(seen.len(), 20);
    assert!(repo.lease_due("late", 100, now).await.unwrap().is_empty());

    schema.remove().await;
}

#[tokio::test]
#[ignore = "requires HQ_TEST_DATABASE_URL"]
async fn test_lease_due_skips_future_and_leased_events() {
    let Some((repo, schema)) = postgres_repository("due").await else {
        return;
    };
    let clock = ManualClock::starting_now();
    let now = clock.now();

    let due = insert(&repo, "due", now).await;
    let later = insert(&repo, "later", now).await;
    let patch = EventPatch {
        next_attempt_at: Field::Set(now + chrono::Duration::minutes(5)),
        ..Default::default()
    };
    repo.update(later, &patch, now).await.unwrap();

    let leased = repo.lease_due("w1", 5, now).await.unwrap();
    assert_eq!(leased.iter().map(|e| e.id).collect::<Vec<_>>(), vec![due]);
    assert!(repo.lease_due("w2", 5, now).await.unwrap().is_empty());

    clock.advance(Duration::from_secs(300));
    let leased = repo.lease_due("w2", 5, clock.now()).await.unwrap();
    assert_eq!(leased.iter().map(|e| e.id).collect::<Vec<_>>(), vec![later]);

    schema.remove().await;
}

#[tokio::test]
#[ignore = "requires HQ_TEST_DATABASE_URL"]
async fn test_attempt_writes_are_guarded() {
    let Some((repo, schema)) = postgres_repository("attempt").await else {
        return;
    };
    let clock = ManualClock::starting_now();
    let now = clock.now();
    let next = now + chrono::Duration::minutes(1);

    let id = insert(&repo, "ping", now).await;
    repo.lease_due("w1", 1, now).await.unwrap();

    assert!(!repo.begin_attempt(id, "w2", 0, now, next).await.unwrap());
    assert!(!repo.begin_attempt(id, "w1", 1, now, next).await.unwrap());
    assert!(repo.begin_attempt(id, "w1", 0, now, next).await.unwrap());
    assert!(!repo.begin_attempt(id, "w1", 0, now, next).await.unwrap());

    let event = repo.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(event.num_attempts, 1);
    assert_eq!(event.attempted_at, Some(now));
    assert_eq!(event.next_attempt_at, next);

    let patch = EventPatch {
        status: Field::Set(EventStatus::Processed),
        worker_id: Field::Set(None),
        response_code: Field::Set(Some(200)),
        response_text: Field::Set(Some("OK".to_string())),
        ..Default::default()
    };
    assert!(!repo.finish_attempt(id, 2, &patch, now).await.unwrap());
    let event = repo.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Queued);
    assert_eq!(event.worker_id.as_deref(), Some("w1"));

    assert!(repo.finish_attempt(id, 1, &patch, now).await.unwrap());
    let event = repo.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(event.status, EventStatus::Processed);
    assert_eq!(event.worker_id, None);
    assert_eq!(event.response_code, Some(200));
    assert_eq!(event.response_text.as_deref(), Some("OK"));

    // Terminal events cannot be attempted again
    assert!(!repo.begin_attempt(id, "w1", 1, now, next).await.unwrap());

    schema.remove().await;
}
