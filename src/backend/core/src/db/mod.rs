//! Database layer.
//!
//! Uses PostgreSQL for the job table with sqlx. The claim path relies on
//! `SELECT ... FOR UPDATE` inside a transaction; see [`jobs::PgJobRepository`].

pub mod jobs;

pub use jobs::PgJobRepository;

use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::{Duration, Instant};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::Result;

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new connection pool, applying migrations if configured.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;

        let db = Self { pool };
        if config.run_migrations {
            db.migrate().await?;
        }
        info!(max_connections = config.max_connections, "Database pool ready");
        Ok(db)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Round-trip a trivial query.
    pub async fn check_connectivity(&self) -> Result<Duration> {
        let started = Instant::now();
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(started.elapsed())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("pool_size", &self.pool.size()).finish()
    }
}
