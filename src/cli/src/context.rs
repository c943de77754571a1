//! Connections shared by every command.

use anyhow::{Context, Result};
use std::sync::Arc;

use taskq_core::{
    config::Config,
    control::{ControlStore, RedisControlStore},
    db::{Database, PgJobRepository},
    jobs::{builtin_registry, system_clock, Queue, QueueDispatcher, QueueManager, WorkerControl},
};

pub struct CliContext {
    pub config: Config,
    pub manager: QueueManager,
    pub control: Arc<dyn ControlStore>,
}

impl CliContext {
    pub async fn connect(config_path: Option<&str>) -> Result<Self> {
        let config = match config_path {
            Some(path) => Config::from_file(path).with_context(|| format!("loading {}", path))?,
            None => Config::load().context("loading configuration")?,
        };

        let db = Database::connect(&config.database)
            .await
            .context("connecting to the job database")?;
        let control: Arc<dyn ControlStore> = Arc::new(
            RedisControlStore::connect(&config.redis)
                .await
                .context("connecting to the control store")?,
        );

        let clock = system_clock();
        let repository = Arc::new(PgJobRepository::new(db.pool().clone(), clock.clone()));
        let manager = QueueManager::new(
            repository,
            Arc::new(builtin_registry()),
            clock,
            config.scheduler.tz()?,
        );

        Ok(Self {
            config,
            manager,
            control,
        })
    }

    pub fn worker_control(&self) -> WorkerControl {
        WorkerControl::new(self.control.clone(), &self.config.worker)
    }

    /// Dispatcher without the pause check, for admin passes.
    pub fn dispatcher(&self) -> QueueDispatcher {
        let mut config = self.config.dispatcher.clone();
        config.check_pause = false;
        QueueDispatcher::new(self.manager.clone(), config)
    }

    pub fn producer(&self) -> Queue {
        Queue::new(self.manager.clone())
    }
}
