//! Claim and execute engine.
//!
//! A [`DispatchRun`] is one pass over a queue bucket:
//!
//! ```text
//!  pause check ──▶ stuck sweep ──▶ candidates ──▶ per row:
//!                                                  begin ─▶ lock ─▶ re-validate ─▶ reserve
//!                                                    ─▶ decode ─▶ run ─▶ commit ─▶ mark success
//!                                                                          └─ error ─▶ rollback ─▶ handle_failure
//! ```
//!
//! Row-level errors are logged and never abort the batch.

use futures::FutureExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::control::{load_state, ControlStore, WorkerStatus};
use crate::error::{ErrorCode, QueueError, Result};
use crate::jobs::job::{JobId, QueuedJob};
use crate::jobs::manager::{DeferredJobs, QueueManager};
use crate::jobs::payload::JobPayload;
use crate::jobs::repository::{JobRepository, JobTransaction};
use crate::jobs::task::{Occurrence, TaskContext};

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    /// Rows fetched per pass
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Failures after which a job stays Failed
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Reservations older than this are reclaimed
    #[serde(default = "default_stuck_timeout")]
    pub stuck_timeout_minutes: u32,

    /// Delay before a failed job becomes eligible again
    #[serde(default = "default_retry_delay")]
    pub retry_delay_minutes: u32,

    /// Skip the pass while the queue's worker is paused
    #[serde(default = "default_check_pause")]
    pub check_pause: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            stuck_timeout_minutes: default_stuck_timeout(),
            retry_delay_minutes: default_retry_delay(),
            check_pause: default_check_pause(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_stuck_timeout() -> u32 {
    15
}

fn default_retry_delay() -> u32 {
    5
}

fn default_check_pause() -> bool {
    true
}

// ═══════════════════════════════════════════════════════════════════════════════
// Reports
// ═══════════════════════════════════════════════════════════════════════════════

/// Which bucket a run works on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    Pending,
    Failed,
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Tallies of one completed pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub queue: String,
    pub mode: DispatchMode,
    /// Stale reservations released by the sweep
    pub reclaimed: u64,
    /// Candidates returned by the query
    pub fetched: usize,
    pub processed: usize,
    pub retried: usize,
    pub failed: usize,
    /// Lost claim races
    pub skipped: usize,
    /// Failed rows put back to Pending
    pub requeued: usize,
}

impl DispatchReport {
    fn new(queue: &str, mode: DispatchMode) -> Self {
        Self {
            queue: queue.to_string(),
            mode,
            reclaimed: 0,
            fetched: 0,
            processed: 0,
            retried: 0,
            failed: 0,
            skipped: 0,
            requeued: 0,
        }
    }

    fn record(&mut self, row: RowOutcome) {
        match row {
            RowOutcome::Processed => self.processed += 1,
            RowOutcome::Retried => self.retried += 1,
            RowOutcome::Failed => self.failed += 1,
            RowOutcome::Skipped => self.skipped += 1,
            RowOutcome::Errored => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum DispatchOutcome {
    Paused { queue: String },
    Completed(DispatchReport),
}

impl DispatchOutcome {
    pub fn is_paused(&self) -> bool {
        matches!(self, Self::Paused { .. })
    }

    pub fn report(&self) -> Option<&DispatchReport> {
        match self {
            Self::Completed(report) => Some(report),
            Self::Paused { .. } => None,
        }
    }
}

impl fmt::Display for DispatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paused { queue } => write!(f, "queue '{}' is paused", queue),
            Self::Completed(r) => write!(
                f,
                "queue '{}' ({}): {} processed, {} retried, {} failed, {} skipped, {} requeued, {} reclaimed",
                r.queue, r.mode, r.processed, r.retried, r.failed, r.skipped, r.requeued, r.reclaimed
            ),
        }
    }
}

/// What happened to a single candidate row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Processed,
    Retried,
    Failed,
    Skipped,
    /// Logged storage error; the stuck sweep recovers the row
    Errored,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatcher
// ═══════════════════════════════════════════════════════════════════════════════

/// Runs passes over queue buckets.
#[derive(Clone)]
pub struct QueueDispatcher {
    manager: QueueManager,
    control: Option<Arc<dyn ControlStore>>,
    config: DispatcherConfig,
}

impl QueueDispatcher {
    pub fn new(manager: QueueManager, config: DispatcherConfig) -> Self {
        Self {
            manager,
            control: None,
            config,
        }
    }

    /// Consult `store` for the pause flag.
    pub fn with_control(mut self, store: Arc<dyn ControlStore>) -> Self {
        self.control = Some(store);
        self
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn manager(&self) -> &QueueManager {
        &self.manager
    }

    /// Pass over due Pending rows of `queue`.
    pub fn pending(&self, queue: impl Into<String>) -> DispatchRun {
        DispatchRun {
            dispatcher: self.clone(),
            queue: queue.into(),
            mode: DispatchMode::Pending,
        }
    }

    /// Pass that re-queues Failed rows of `queue` with retries left.
    pub fn failed(&self, queue: impl Into<String>) -> DispatchRun {
        DispatchRun {
            dispatcher: self.clone(),
            queue: queue.into(),
            mode: DispatchMode::Failed,
        }
    }

    fn repository(&self) -> &Arc<dyn JobRepository> {
        self.manager.repository()
    }

    async fn is_paused(&self, queue: &str) -> bool {
        let Some(store) = self.control.as_ref().filter(|_| self.config.check_pause) else {
            return false;
        };
        match load_state(store.as_ref(), queue).await {
            Ok(Some(state)) => state.status == WorkerStatus::Paused,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(queue = %queue, error = %e, "Could not read pause flag, dispatching anyway");
                false
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pending rows
    // ─────────────────────────────────────────────────────────────────────────

    async fn process(&self, candidate: &QueuedJob) -> RowOutcome {
        let mut tx = match self.repository().begin().await {
            Ok(tx) => tx,
            Err(e) => {
                tracing::warn!(job_id = %candidate.id, error = %e, "Could not open claim transaction");
                return RowOutcome::Errored;
            }
        };

        let job = match self.claim(tx.as_mut(), candidate.id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                finish(tx.rollback().await, candidate.id);
                tracing::debug!(job_id = %candidate.id, "Job claimed elsewhere, skipping");
                return RowOutcome::Skipped;
            }
            Err(e) => {
                finish(tx.rollback().await, candidate.id);
                return self.fail(candidate.id, &e.detail()).await;
            }
        };

        let (message, deferred) = match self.execute(&job).await {
            Ok(done) => done,
            Err(e) => {
                finish(tx.rollback().await, job.id);
                return self.fail(job.id, &e.detail()).await;
            }
        };

        if let Err(e) = tx.commit().await {
            let dropped = deferred.discard();
            tracing::warn!(job_id = %job.id, error = %e, dropped, "Claim commit failed after execution");
            return self.fail(job.id, &e.detail()).await;
        }

        if let Err(e) = self.repository().mark_success(&job, &message).await {
            tracing::error!(job_id = %job.id, error = %e, "Job ran but its success could not be recorded");
            return RowOutcome::Errored;
        }
        counter!("taskq_jobs_processed_total", "queue" => job.queue.clone()).increment(1);
        tracing::info!(job_id = %job.id, queue = %job.queue, attempts = job.attempts, message = %message, "Job succeeded");

        if let Err(e) = deferred.flush().await {
            tracing::error!(job_id = %job.id, error = %e, "Failed to enqueue follow-up jobs");
        }
        RowOutcome::Processed
    }

    /// Lock and reserve `id`; `None` when the row is no longer claimable.
    async fn claim(&self, tx: &mut dyn JobTransaction, id: JobId) -> Result<Option<QueuedJob>> {
        let Some(current) = tx.lock_job(id).await? else {
            return Ok(None);
        };
        if !current.is_available(self.manager.clock().now()) {
            return Ok(None);
        }
        tx.reserve(&current).await.map(Some)
    }

    /// Decode, run and re-schedule `job`. Task code panicking at any step is
    /// an execution failure.
    async fn execute(&self, job: &QueuedJob) -> Result<(String, DeferredJobs)> {
        match AssertUnwindSafe(self.run_task(job)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(QueueError::new(
                ErrorCode::TaskPanicked,
                format!(
                    "Task '{}' panicked: {}",
                    task_type(job),
                    panic_message(panic.as_ref())
                ),
            )),
        }
    }

    async fn run_task(&self, job: &QueuedJob) -> Result<(String, DeferredJobs)> {
        let payload = JobPayload::from_value(&job.payload)?;
        let task = self.manager.registry().decode(&payload)?;
        let ctx = TaskContext::new(job.id, job.queue.clone(), job.attempts, self.manager.clone());

        let outcome = task.run(&ctx).await;
        if !outcome.is_success() {
            return Err(QueueError::task_failed(outcome.message));
        }

        if task.occurrence() == Occurrence::Always {
            self.manager
                .job(&job.queue, &payload.task_type, payload.data.clone())?
                .defer(ctx.deferred());
        }

        Ok((outcome.message, ctx.deferred().clone()))
    }

    async fn fail(&self, id: JobId, message: &str) -> RowOutcome {
        match self.repository().job_by_id(id).await {
            Ok(Some(job)) => self.handle_failure(&job, message).await,
            Ok(None) => {
                tracing::warn!(job_id = %id, "Failed job vanished before its failure was recorded");
                RowOutcome::Skipped
            }
            Err(e) => {
                tracing::error!(job_id = %id, error = %e, "Could not reload failed job");
                RowOutcome::Errored
            }
        }
    }

    /// Retry while failures stay under `max_retries`, otherwise mark Failed.
    async fn handle_failure(&self, job: &QueuedJob, message: &str) -> RowOutcome {
        let failures = job.attempts.saturating_add(1);

        if failures < self.config.max_retries {
            match self
                .repository()
                .retry(job, self.config.retry_delay_minutes, Some(message))
                .await
            {
                Ok(()) => {
                    counter!("taskq_jobs_retried_total", "queue" => job.queue.clone()).increment(1);
                    tracing::warn!(
                        job_id = %job.id,
                        queue = %job.queue,
                        attempts = failures,
                        delay_minutes = self.config.retry_delay_minutes,
                        message = %message,
                        "Job failed, retry scheduled"
                    );
                    RowOutcome::Retried
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Could not schedule retry");
                    RowOutcome::Errored
                }
            }
        } else {
            match self.repository().mark_failed(job, message).await {
                Ok(()) => {
                    counter!("taskq_jobs_failed_total", "queue" => job.queue.clone()).increment(1);
                    tracing::error!(
                        job_id = %job.id,
                        queue = %job.queue,
                        attempts = failures,
                        message = %message,
                        "Job failed permanently"
                    );
                    RowOutcome::Failed
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, error = %e, "Could not mark job failed");
                    RowOutcome::Errored
                }
            }
        }
    }
}

impl fmt::Debug for QueueDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueDispatcher")
            .field("config", &self.config)
            .field("control", &self.control.as_ref().map(|c| c.name()))
            .finish()
    }
}

fn finish(result: Result<()>, id: JobId) {
    if let Err(e) = result {
        tracing::warn!(job_id = %id, error = %e, "Claim rollback failed");
    }
}

fn task_type(job: &QueuedJob) -> &str {
    job.payload
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("unknown")
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Run
// ═══════════════════════════════════════════════════════════════════════════════

/// One pass over a bucket. Safe to call on every poll tick.
#[derive(Debug, Clone)]
pub struct DispatchRun {
    dispatcher: QueueDispatcher,
    queue: String,
    mode: DispatchMode,
}

impl DispatchRun {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Fails only when the stuck sweep or the candidate query fails.
    pub async fn run(&self) -> Result<DispatchOutcome> {
        let dispatcher = &self.dispatcher;
        if dispatcher.is_paused(&self.queue).await {
            tracing::debug!(queue = %self.queue, "Queue paused, skipping pass");
            return Ok(DispatchOutcome::Paused {
                queue: self.queue.clone(),
            });
        }

        let repository = dispatcher.repository();
        let mut report = DispatchReport::new(&self.queue, self.mode);

        report.reclaimed = repository
            .clean_stuck_jobs(dispatcher.config.stuck_timeout_minutes)
            .await?;
        if report.reclaimed > 0 {
            counter!("taskq_jobs_reclaimed_total", "queue" => self.queue.clone()).increment(report.reclaimed);
            tracing::warn!(queue = %self.queue, reclaimed = report.reclaimed, "Released stale reservations");
        }

        match self.mode {
            DispatchMode::Pending => {
                let candidates = repository
                    .available_jobs(&self.queue, dispatcher.config.batch_size)
                    .await?;
                report.fetched = candidates.len();
                for candidate in &candidates {
                    report.record(dispatcher.process(candidate).await);
                }
            }
            DispatchMode::Failed => {
                let candidates = repository
                    .failed_jobs(&self.queue, dispatcher.config.batch_size, dispatcher.config.max_retries)
                    .await?;
                report.fetched = candidates.len();
                for job in &candidates {
                    match repository.retry(job, dispatcher.config.retry_delay_minutes, None).await {
                        Ok(()) => report.requeued += 1,
                        Err(e) => tracing::error!(job_id = %job.id, error = %e, "Could not re-queue failed job"),
                    }
                }
            }
        }

        tracing::debug!(
            queue = %report.queue,
            mode = %report.mode,
            fetched = report.fetched,
            processed = report.processed,
            retried = report.retried,
            failed = report.failed,
            skipped = report.skipped,
            requeued = report.requeued,
            "Dispatch pass finished"
        );
        Ok(DispatchOutcome::Completed(report))
    }
}
