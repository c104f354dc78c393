//! Hookqueue Worker
//!
//! Leases due events from the shared event store and delivers each as an
//! outbound webhook, rescheduling failures until the attempt cap.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `HQ_CONFIG_FILE` | - | Optional TOML config file |
//! | `HQ_DATABASE_URL` | `sqlite://hookqueue.db?mode=rwc` | `sqlite://` or `postgres://` URL |
//! | `HQ_WEBHOOK_URL` | `http://localhost:8080/webhook` | Webhook endpoint |
//! | `HQ_WORKER_ID` | random UUID | Worker identity used for leases |
//! | `HQ_QUEUE_DEPTH` | `5` | Events kept leased per cycle |
//! | `HQ_POLL_INTERVAL_SECS` | `5` | Sleep between cycles |
//! | `HQ_HEALTH_PORT` | `9090` | Health endpoint port |
//! | `HQ_LOG_FORMAT` | `text` | `json` for JSON logs |
//! | `RUST_LOG` | `info` | Log level |
//!
//! The remaining `HQ_*` overrides are listed on `HookQueueConfig`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;
use axum::extract::State;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hq_config::HookQueueConfig;
use hq_queue::{
    listen_for_interrupts, EventDispatcher, EventRepository, HttpWebhookClient, HttpWebhookConfig,
    InterruptGate, LeaseManager, RetryPolicy, SystemClock, Worker, WorkerSettings,
};

use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;

fn init_logging() {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    let json = std::env::var("HQ_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting Hookqueue Worker");

    let config_path = std::env::var("HQ_CONFIG_FILE").ok().map(PathBuf::from);
    let config = HookQueueConfig::load(config_path.as_deref())?;

    let worker_id = config
        .worker
        .worker_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let repository = create_event_repository(&config).await?;
    let clock = Arc::new(SystemClock);

    let sender = Arc::new(HttpWebhookClient::new(HttpWebhookConfig {
        url: config.webhook.url.clone(),
        connect_timeout: config.webhook.timeout(),
        request_timeout: config.webhook.timeout(),
    })?);
    info!("Delivering webhooks to {}", config.webhook.url);

    let policy = RetryPolicy {
        max_attempts: config.worker.max_attempts,
        base_delay: config.worker.retry_base_delay(),
        step: config.worker.retry_step(),
    };

    let gate = InterruptGate::new(config.worker.force_exit_after());
    let worker = Worker::new(
        worker_id.clone(),
        WorkerSettings {
            queue_depth: config.worker.queue_depth,
            poll_interval: config.worker.poll_interval(),
        },
        LeaseManager::new(repository.clone(), clock.clone(), config.worker.abandon_after()),
        EventDispatcher::new(repository, sender, clock, policy),
        gate.clone(),
    )?;

    // Signals
    let signal_handle = {
        let gate = gate.clone();
        tokio::spawn(async move {
            if let Err(e) = listen_for_interrupts(gate.clone()).await {
                error!("Signal listener failed: {}", e);
                gate.request_shutdown();
            }
        })
    };

    // Health server
    let health_addr = SocketAddr::from(([0, 0, 0, 0], config.health.port));
    info!("Health server listening on http://{}/health", health_addr);

    let health_app = axum::Router::new()
        .route("/health", axum::routing::get(health_handler))
        .route("/ready", axum::routing::get(ready_handler))
        .with_state(Arc::new(worker_id.clone()));

    let health_listener = tokio::net::TcpListener::bind(health_addr).await?;
    let health_handle = {
        let gate = gate.clone();
        tokio::spawn(async move {
            axum::serve(health_listener, health_app)
                .with_graceful_shutdown(async move { gate.wait_shutdown().await })
                .await
                .ok();
        })
    };

    info!(worker_id = %worker_id, "Hookqueue Worker started");
    info!("Press Ctrl+C to shutdown");

    worker.run().await;

    let _ = tokio::time::timeout(Duration::from_secs(10), health_handle).await;
    signal_handle.abort();

    info!("Hookqueue Worker shutdown complete");
    Ok(())
}

async fn create_event_repository(config: &HookQueueConfig) -> Result<Arc<dyn EventRepository>> {
    let url = config.database.url.as_str();

    if url.starts_with("sqlite:") {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(url)
            .await?;
        let repo = hq_queue::sqlite::SqliteEventRepository::new(pool);
        repo.init_schema().await?;
        info!("Using SQLite event store: {}", url);
        Ok(Arc::new(repo))
    } else if url.starts_with("postgres:") || url.starts_with("postgresql:") {
        let pool = PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(url)
            .await?;
        let repo = hq_queue::postgres::PostgresEventRepository::new(pool);
        repo.init_schema().await?;
        info!("Using PostgreSQL event store");
        Ok(Arc::new(repo))
    } else {
        Err(anyhow::anyhow!(
            "Unsupported database URL: {}. Use sqlite:// or postgres://",
            url
        ))
    }
}

async fn health_handler(State(worker_id): State<Arc<String>>) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "UP",
        "worker_id": worker_id.as_str(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn ready_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "READY"
    }))
}
