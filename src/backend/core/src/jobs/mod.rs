//! Durable background jobs.
//!
//! - **Task**: typed job logic, registered by name in a [`TaskRegistry`]
//! - **QueueManager**: validates, schedules and persists new jobs
//! - **QueueDispatcher**: claims due rows under a row lock and executes them
//! - **Worker**: per-queue daemon supervising a bounded pool of dispatch children
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │  producer                                                                 │
//! │  Queue::dispatch ──▶ QueueManager ──▶ Scheduler (run_after)               │
//! │                           │                                               │
//! │                           ▼                                               │
//! │                   ┌───────────────┐                                       │
//! │                   │ JobRepository │◀──────── lock / reserve / mark ──┐    │
//! │                   └───────────────┘                                  │    │
//! │                                                                      │    │
//! │  taskqd                                                              │    │
//! │  Worker ──▶ ChildPool ──▶ child ──▶ DispatchRun ──▶ TaskRegistry ──▶ Task │
//! │    ▲                                                                      │
//! │    └── ControlStore (worker:{queue}) ◀── WorkerControl (taskq worker …)   │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use taskq_core::jobs::{builtin::EchoData, builtin::EchoTask, Queue};
//!
//! let queue = Queue::new(manager);
//! queue.dispatch::<EchoTask>("mail", &EchoData { message: "hi".into(), fail: false }).await?;
//!
//! let outcome = dispatcher.pending("mail").run().await?;
//! println!("{}", outcome);
//! ```

pub mod builtin;
pub mod clock;
pub mod dispatcher;
pub mod facade;
pub mod job;
pub mod manager;
pub mod payload;
pub mod pool;
pub mod repository;
pub mod scheduler;
pub mod task;
pub mod worker;

pub use builtin::{builtin_registry, EchoData, EchoTask, PurgeData, PurgeJobsTask};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use dispatcher::{DispatchMode, DispatchOutcome, DispatchReport, DispatchRun, DispatcherConfig, QueueDispatcher};
pub use facade::Queue;
pub use job::{JobCounts, JobId, JobStatus, NewJob, QueuedJob};
pub use manager::{DeferredJobs, PendingJob, QueueManager};
pub use payload::JobPayload;
pub use pool::{ChildPool, ChildPoolStats};
pub use repository::{InMemoryJobRepository, JobRepository, JobTransaction};
pub use scheduler::Scheduler;
pub use task::{DynTask, Occurrence, Task, TaskContext, TaskOutcome, TaskRegistry, TaskStatus};
pub use worker::{
    ExecutionMode, Worker, WorkerConfig, WorkerControl, WorkerEvent, WorkerObserver, WorkerStatusReport,
};
