#![allow(clippy::result_large_err)]
//! # taskq core
//!
//! Durable background job queue with a supervising worker daemon.
//!
//! ## Architecture
//!
//! - **Jobs**: task contract, enqueueing, claim/execute dispatch and the worker daemon
//! - **Control**: per-queue control record shared by the daemon and admin commands
//! - **Database**: Postgres job repository and migrations
//! - **Telemetry**: structured logging setup
//! - **Config**: file and environment configuration

pub mod config;
pub mod control;
pub mod db;
pub mod error;
pub mod jobs;
pub mod system;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorSeverity, QueueError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::control::{ControlState, ControlStore, InMemoryControlStore, RedisControlStore, WorkerStatus};
    pub use crate::db::{Database, PgJobRepository};
    pub use crate::error::{ErrorCode, ErrorContext, ErrorSeverity, QueueError, Result};
    pub use crate::jobs::{
        builtin_registry, DispatchOutcome, DispatchReport, DispatcherConfig, InMemoryJobRepository, JobCounts,
        JobId, JobRepository, JobStatus, Occurrence, Queue, QueueDispatcher, QueueManager, QueuedJob, Scheduler,
        Task, TaskContext, TaskOutcome, TaskRegistry, Worker, WorkerConfig, WorkerControl, WorkerEvent,
    };
}
