//! taskqd - queue worker daemon.
//!
//! Serves one queue until its control record asks it to stop or it receives
//! SIGINT/SIGTERM.

use std::sync::Arc;

use clap::Parser;
use taskq_core::{
    config::Config,
    control::RedisControlStore,
    db::{Database, PgJobRepository},
    jobs::{builtin_registry, system_clock, ExecutionMode, QueueDispatcher, QueueManager, Worker},
    telemetry,
};

#[derive(Parser, Debug)]
#[command(name = "taskqd", version, about = "Queue worker daemon")]
struct Args {
    /// Queue to serve
    #[arg(long, env = "TASKQ_QUEUE")]
    queue: String,

    /// Configuration file layered under TASKQ__* environment variables
    #[arg(long, env = "TASKQ_CONFIG")]
    config: Option<String>,

    /// Run dispatch cycles on the daemon task instead of a child pool
    #[arg(long)]
    inline: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match args.config.as_deref() {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    if args.inline {
        config.worker.mode = ExecutionMode::Inline;
    }

    telemetry::init_logging(&config.logging)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        queue = %args.queue,
        "Starting taskqd"
    );

    let db = Database::connect(&config.database).await?;
    let latency = db.check_connectivity().await?;
    tracing::info!(latency_ms = latency.as_millis() as u64, "Connected to database");

    let control = Arc::new(RedisControlStore::connect(&config.redis).await?);
    tracing::info!("Connected to control store");

    let clock = system_clock();
    let repository = Arc::new(PgJobRepository::new(db.pool().clone(), clock.clone()));
    let registry = Arc::new(builtin_registry());
    tracing::info!(tasks = ?registry.names(), "Task registry ready");

    let manager = QueueManager::new(repository, registry, clock, config.scheduler.tz()?);
    let dispatcher = QueueDispatcher::new(manager, config.dispatcher.clone()).with_control(control.clone());

    Worker::new(args.queue, dispatcher, control, config.worker.clone())
        .start()
        .await?;

    tracing::info!("taskqd shutdown complete");
    Ok(())
}
