//! Building and persisting job rows.
//!
//! [`QueueManager::job`] validates the task type and data against the
//! registry, asks the task for its first run time, and returns a
//! [`PendingJob`] that is either queued now or deferred until the surrounding
//! unit of work completes.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::jobs::clock::SharedClock;
use crate::jobs::job::{NewJob, QueuedJob};
use crate::jobs::payload::JobPayload;
use crate::jobs::repository::JobRepository;
use crate::jobs::scheduler::Scheduler;
use crate::jobs::task::{Task, TaskRegistry};

/// Entry point for enqueueing work.
#[derive(Clone)]
pub struct QueueManager {
    repository: Arc<dyn JobRepository>,
    registry: Arc<TaskRegistry>,
    clock: SharedClock,
    timezone: Tz,
}

impl QueueManager {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        registry: Arc<TaskRegistry>,
        clock: SharedClock,
        timezone: Tz,
    ) -> Self {
        Self {
            repository,
            registry,
            clock,
            timezone,
        }
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repository
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// A scheduler positioned at "now".
    pub fn scheduler(&self) -> Scheduler {
        Scheduler::from_clock(self.clock.as_ref(), self.timezone)
    }

    /// Prepare a job for `task_type` with already-serialized data.
    pub fn job(&self, queue: &str, task_type: &str, data: serde_json::Value) -> Result<PendingJob> {
        let task = self.registry.instantiate(task_type, data.clone())?;
        let run_after = match task.period(self.scheduler())? {
            Some(scheduler) => scheduler.time(),
            None => self.clock.now(),
        };

        Ok(PendingJob {
            job: NewJob {
                queue: queue.to_string(),
                payload: JobPayload::new(task_type, data).to_value(),
                run_after,
            },
            repository: self.repository.clone(),
        })
    }

    /// Prepare a job for `T` from typed data.
    pub fn job_for<T: Task>(&self, queue: &str, data: &T::Data) -> Result<PendingJob> {
        let payload = JobPayload::encode(T::NAME, data)?;
        self.job(queue, T::NAME, payload.data)
    }
}

impl fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueManager")
            .field("registry", &self.registry)
            .field("timezone", &self.timezone)
            .finish()
    }
}

/// A validated job that has not been written yet.
pub struct PendingJob {
    job: NewJob,
    repository: Arc<dyn JobRepository>,
}

impl PendingJob {
    pub fn queue_name(&self) -> &str {
        &self.job.queue
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.job.payload
    }

    pub fn run_after(&self) -> DateTime<Utc> {
        self.job.run_after
    }

    /// Persist the job now.
    pub async fn queue(self) -> Result<QueuedJob> {
        let created = self.repository.create(self.job).await?;
        tracing::debug!(
            job_id = %created.id,
            queue = %created.queue,
            task_type = ?created.task_type(),
            run_after = %created.run_after,
            "Job queued"
        );
        Ok(created)
    }

    /// Persist the job when `deferred` is flushed.
    pub fn defer(self, deferred: &DeferredJobs) {
        deferred.push(self);
    }
}

impl fmt::Debug for PendingJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingJob").field("job", &self.job).finish()
    }
}

/// Jobs waiting for the current unit of work to finish.
#[derive(Clone, Default)]
pub struct DeferredJobs {
    jobs: Arc<Mutex<Vec<PendingJob>>>,
}

impl DeferredJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: PendingJob) {
        self.jobs.lock().push(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Drop everything buffered; returns how many jobs were discarded.
    pub fn discard(&self) -> usize {
        let mut jobs = self.jobs.lock();
        let count = jobs.len();
        jobs.clear();
        count
    }

    /// Persist buffered jobs in order. On error the unwritten jobs stay
    /// buffered.
    pub async fn flush(&self) -> Result<Vec<QueuedJob>> {
        let batch: Vec<PendingJob> = std::mem::take(&mut *self.jobs.lock());
        let mut created = Vec::with_capacity(batch.len());
        let mut remaining = batch.into_iter();

        while let Some(job) = remaining.next() {
            let retained = PendingJob {
                job: job.job.clone(),
                repository: job.repository.clone(),
            };
            match job.queue().await {
                Ok(row) => created.push(row),
                Err(e) => {
                    let mut jobs = self.jobs.lock();
                    let newer = std::mem::take(&mut *jobs);
                    jobs.push(retained);
                    jobs.extend(remaining);
                    jobs.extend(newer);
                    return Err(e);
                }
            }
        }
        Ok(created)
    }
}

impl fmt::Debug for DeferredJobs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredJobs").field("len", &self.len()).finish()
    }
}
