//! Configuration management.
//!
//! Values come from an optional file layered under `TASKQ__*` environment
//! variables (`TASKQ__DISPATCHER__MAX_RETRIES=5`,
//! `TASKQ__WORKER__POLL_INTERVAL=500ms`).

use chrono_tz::Tz;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{QueueError, Result};
use crate::jobs::dispatcher::DispatcherConfig;
use crate::jobs::worker::{ExecutionMode, WorkerConfig};
use crate::telemetry::LoggingConfig;

const ENV_PREFIX: &str = "TASKQ";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Job table database
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Control-state store
    #[serde(default)]
    pub redis: RedisConfig,

    /// Claim/execute engine
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Daemon supervision
    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// How long to wait for a pooled connection
    #[serde(default = "default_acquire_timeout", with = "humantime_serde")]
    pub acquire_timeout: Duration,

    /// Apply bundled migrations on connect
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            acquire_timeout: default_acquire_timeout(),
            run_migrations: default_run_migrations(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix for control keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// IANA timezone used for `at("HH:MM")` and calendar arithmetic
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
        }
    }
}

impl SchedulerConfig {
    pub fn tz(&self) -> Result<Tz> {
        self.timezone.parse::<Tz>().map_err(|e| {
            QueueError::with_internal(
                crate::error::ErrorCode::InvalidTimezone,
                format!("Unknown timezone '{}'", self.timezone),
                e.to_string(),
            )
        })
    }
}

// Default value functions
fn default_database_url() -> String { "postgres://localhost:5432/taskq".to_string() }
fn default_max_connections() -> u32 { 10 }
fn default_min_connections() -> u32 { 1 }
fn default_acquire_timeout() -> Duration { Duration::from_secs(5) }
fn default_run_migrations() -> bool { true }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_key_prefix() -> String { "taskq".to_string() }
fn default_timezone() -> String { "UTC".to_string() }

impl Config {
    /// Load configuration from the environment (and `.env` when present).
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with environment overrides on top.
    pub fn from_file(path: &str) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.dispatcher.batch_size == 0 {
            return Err(QueueError::configuration("dispatcher.batch_size must be at least 1"));
        }
        if self.worker.iterations_per_child == 0 {
            return Err(QueueError::configuration("worker.iterations_per_child must be at least 1"));
        }
        if self.worker.mode == ExecutionMode::Pool && self.worker.max_workers == 0 {
            return Err(QueueError::configuration("worker.max_workers must be at least 1 in pool mode"));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(QueueError::configuration(
                "database.min_connections exceeds database.max_connections",
            ));
        }
        self.scheduler.tz()?;
        Ok(())
    }
}
