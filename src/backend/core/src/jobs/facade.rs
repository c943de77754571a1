//! Static-style entry points for producers.

use crate::error::Result;
use crate::jobs::job::QueuedJob;
use crate::jobs::manager::{DeferredJobs, QueueManager};
use crate::jobs::task::Task;

/// Producer handle: dispatch now or defer until [`Queue::flush_deferred`].
#[derive(Clone, Debug)]
pub struct Queue {
    manager: QueueManager,
    deferred: DeferredJobs,
}

impl Queue {
    pub fn new(manager: QueueManager) -> Self {
        Self {
            manager,
            deferred: DeferredJobs::new(),
        }
    }

    pub fn manager(&self) -> &QueueManager {
        &self.manager
    }

    /// Enqueue `T` on `queue` immediately.
    pub async fn dispatch<T: Task>(&self, queue: &str, data: &T::Data) -> Result<QueuedJob> {
        self.manager.job_for::<T>(queue, data)?.queue().await
    }

    /// Enqueue by task name with already-serialized data.
    pub async fn dispatch_named(&self, queue: &str, task_type: &str, data: serde_json::Value) -> Result<QueuedJob> {
        self.manager.job(queue, task_type, data)?.queue().await
    }

    /// Validate now, write on the next [`flush_deferred`](Self::flush_deferred).
    pub fn deferred<T: Task>(&self, queue: &str, data: &T::Data) -> Result<()> {
        self.manager.job_for::<T>(queue, data)?.defer(&self.deferred);
        Ok(())
    }

    pub async fn flush_deferred(&self) -> Result<Vec<QueuedJob>> {
        self.deferred.flush().await
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }
}
