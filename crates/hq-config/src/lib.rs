//! Hookqueue configuration
//!
//! Settings are read from an optional TOML file and then overridden by
//! `HQ_*` environment variables. Every section has defaults that match the
//! queue's reference behaviour, so an empty file (or no file) is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Upper bound for any configured duration or retry delay (ten years)
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HookQueueConfig {
    pub database: DatabaseConfig,
    pub webhook: WebhookConfig,
    pub worker: WorkerConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://hookqueue.db?mode=rwc".to_string(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: String,
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080/webhook".to_string(),
            timeout_secs: 5,
        }
    }
}

impl WebhookConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Fixed worker identity; a random one is generated when absent
    pub worker_id: Option<String>,
    /// Number of events a worker tries to keep leased
    pub queue_depth: u32,
    pub poll_interval_secs: u64,
    /// Leases untouched for this long are considered abandoned
    pub abandon_after_secs: u64,
    pub max_attempts: u32,
    pub retry_base_delay_secs: u64,
    pub retry_step_secs: u64,
    /// Interrupts received before the worker exits without a clean shutdown, 0 disables
    pub force_exit_after_interrupts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            queue_depth: 5,
            poll_interval_secs: 5,
            abandon_after_secs: 180,
            max_attempts: 5,
            retry_base_delay_secs: 60,
            retry_step_secs: 120,
            force_exit_after_interrupts: 3,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn abandon_after(&self) -> Duration {
        Duration::from_secs(self.abandon_after_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay_secs)
    }

    pub fn retry_step(&self) -> Duration {
        Duration::from_secs(self.retry_step_secs)
    }

    pub fn force_exit_after(&self) -> Option<u32> {
        (self.force_exit_after_interrupts > 0).then_some(self.force_exit_after_interrupts)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { port: 9090 }
    }
}

impl HookQueueConfig {
    /// Load from an optional TOML file, apply environment overrides and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        debug!("Loaded config file {}", path.display());
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Override settings from `HQ_*` variables provided by `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HQ_DATABASE_URL") {
            self.database.url = v;
        }
        override_parsed(&lookup, "HQ_DATABASE_MAX_CONNECTIONS", &mut self.database.max_connections)?;

        if let Some(v) = lookup("HQ_WEBHOOK_URL") {
            self.webhook.url = v;
        }
        override_parsed(&lookup, "HQ_WEBHOOK_TIMEOUT_SECS", &mut self.webhook.timeout_secs)?;

        if let Some(v) = lookup("HQ_WORKER_ID") {
            self.worker.worker_id = Some(v);
        }
        override_parsed(&lookup, "HQ_QUEUE_DEPTH", &mut self.worker.queue_depth)?;
        override_parsed(&lookup, "HQ_POLL_INTERVAL_SECS", &mut self.worker.poll_interval_secs)?;
        override_parsed(&lookup, "HQ_ABANDON_AFTER_SECS", &mut self.worker.abandon_after_secs)?;
        override_parsed(&lookup, "HQ_MAX_ATTEMPTS", &mut self.worker.max_attempts)?;
        override_parsed(&lookup, "HQ_RETRY_BASE_DELAY_SECS", &mut self.worker.retry_base_delay_secs)?;
        override_parsed(&lookup, "HQ_RETRY_STEP_SECS", &mut self.worker.retry_step_secs)?;
        override_parsed(
            &lookup,
            "HQ_FORCE_EXIT_AFTER_INTERRUPTS",
            &mut self.worker.force_exit_after_interrupts,
        )?;

        override_parsed(&lookup, "HQ_HEALTH_PORT", &mut self.health.port)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Invalid("database.url must not be empty".into()));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid("database.max_connections must be at least 1".into()));
        }
        if self.webhook.url.trim().is_empty() {
            return Err(ConfigError::Invalid("webhook.url must not be empty".into()));
        }
        if self.webhook.timeout_secs == 0 {
            return Err(ConfigError::Invalid("webhook.timeout_secs must be at least 1".into()));
        }
        if self.worker.queue_depth == 0 {
            return Err(ConfigError::Invalid("worker.queue_depth must be at least 1".into()));
        }
        if self.worker.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid("worker.poll_interval_secs must be at least 1".into()));
        }
        if self.worker.max_attempts == 0 {
            return Err(ConfigError::Invalid("worker.max_attempts must be at least 1".into()));
        }
        for (key, secs) in [
            ("webhook.timeout_secs", self.webhook.timeout_secs),
            ("worker.poll_interval_secs", self.worker.poll_interval_secs),
            ("worker.abandon_after_secs", self.worker.abandon_after_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{} ({}) must not exceed {}",
                    key, secs, MAX_DURATION_SECS
                )));
            }
        }
        let longest_retry = self
            .worker
            .retry_step_secs
            .checked_mul(u64::from(self.worker.max_attempts - 1))
            .and_then(|steps| steps.checked_add(self.worker.retry_base_delay_secs))
            .filter(|secs| *secs <= MAX_DURATION_SECS);
        if longest_retry.is_none() {
            return Err(ConfigError::Invalid(format!(
                "retry delay after {} attempts must not exceed {} seconds",
                self.worker.max_attempts, MAX_DURATION_SECS
            )));
        }
        // A lease must outlive the slowest possible attempt
        if self.worker.abandon_after_secs <= self.webhook.timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "worker.abandon_after_secs ({}) must exceed webhook.timeout_secs ({})",
                self.worker.abandon_after_secs, self.webhook.timeout_secs
            )));
        }
        if let Some(ref id) = self.worker.worker_id {
            if id.is_empty() || id.chars().count() > 36 {
                return Err(ConfigError::Invalid(
                    "worker.worker_id must be 1..=36 characters".into(),
                ));
            }
        }
        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *target = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}
