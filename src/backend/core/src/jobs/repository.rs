//! Job storage contract and the in-memory implementation.
//!
//! Claiming is transactional: [`JobRepository::begin`] opens a
//! [`JobTransaction`], [`JobTransaction::lock_job`] takes a row lock and
//! re-reads the row, and only the lock holder may reserve it. Everything else
//! is a single-statement write.
//!
//! The Postgres implementation lives in [`crate::db`].

use async_trait::async_trait;
use chrono::Duration;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{ErrorCode, QueueError, Result};
use crate::jobs::clock::SharedClock;
use crate::jobs::job::{JobCounts, JobId, JobStatus, NewJob, QueuedJob};

// ═══════════════════════════════════════════════════════════════════════════════
// Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Persistent store of queued jobs.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a new Pending row.
    async fn create(&self, job: NewJob) -> Result<QueuedJob>;

    /// Open a claim transaction.
    async fn begin(&self) -> Result<Box<dyn JobTransaction>>;

    /// Mark a job Success and clear its reservation.
    async fn mark_success(&self, job: &QueuedJob, message: &str) -> Result<()>;

    /// Mark a job permanently Failed, counting this failure.
    async fn mark_failed(&self, job: &QueuedJob, message: &str) -> Result<()>;

    /// Count a failure and return the job to Pending after `delay_minutes`.
    async fn retry(&self, job: &QueuedJob, delay_minutes: u32, message: Option<&str>) -> Result<()>;

    /// Unreserve Pending rows reserved more than `timeout_minutes` ago.
    async fn clean_stuck_jobs(&self, timeout_minutes: u32) -> Result<u64>;

    /// Due, unreserved Pending rows of `queue`, oldest first.
    async fn available_jobs(&self, queue: &str, limit: usize) -> Result<Vec<QueuedJob>>;

    /// Failed rows of `queue` with fewer than `max_retries` failures.
    async fn failed_jobs(&self, queue: &str, limit: usize, max_retries: u32) -> Result<Vec<QueuedJob>>;

    async fn job_by_id(&self, id: JobId) -> Result<Option<QueuedJob>>;

    /// Delete rows with `status`, optionally restricted to one queue.
    async fn delete_by_status(&self, queue: Option<&str>, status: JobStatus) -> Result<u64>;

    async fn counts(&self, queue: &str) -> Result<JobCounts>;
}

/// A unit of work holding row locks until commit or rollback.
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait JobTransaction: Send {
    /// Lock the row and return its current state, `None` if it is gone.
    async fn lock_job(&mut self, id: JobId) -> Result<Option<QueuedJob>>;

    /// Set `reserved_at` on a row locked by this transaction.
    async fn reserve(&mut self, job: &QueuedJob) -> Result<QueuedJob>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Implementation
// ═══════════════════════════════════════════════════════════════════════════════

struct MemoryState {
    rows: RwLock<BTreeMap<JobId, QueuedJob>>,
    locks: DashMap<JobId, Arc<Mutex<()>>>,
    next_id: AtomicI64,
    clock: SharedClock,
}

impl MemoryState {
    fn row_lock(&self, id: JobId) -> Arc<Mutex<()>> {
        self.locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Apply a single-row write under the row lock, like an UPDATE would.
    async fn update<F>(&self, id: JobId, apply: F) -> Result<()>
    where
        F: FnOnce(&mut QueuedJob) + Send,
    {
        let lock = self.row_lock(id);
        let _guard = lock.lock().await;

        let mut rows = self.rows.write();
        let row = rows.get_mut(&id).ok_or_else(|| QueueError::job_not_found(id))?;
        apply(row);
        row.updated_at = self.clock.now();
        Ok(())
    }
}

/// Job repository held in process memory.
///
/// Used by tests and by single-process embedding.
#[derive(Clone)]
pub struct InMemoryJobRepository {
    state: Arc<MemoryState>,
}

impl InMemoryJobRepository {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            state: Arc::new(MemoryState {
                rows: RwLock::new(BTreeMap::new()),
                locks: DashMap::new(),
                next_id: AtomicI64::new(1),
                clock,
            }),
        }
    }

    /// Snapshot of every row of `queue`, by id.
    pub fn jobs(&self, queue: &str) -> Vec<QueuedJob> {
        self.state
            .rows
            .read()
            .values()
            .filter(|row| row.queue == queue)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for InMemoryJobRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryJobRepository").field("rows", &self.len()).finish()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn create(&self, job: NewJob) -> Result<QueuedJob> {
        let now = self.state.clock.now();
        let id = JobId(self.state.next_id.fetch_add(1, Ordering::SeqCst));
        let row = QueuedJob {
            id,
            queue: job.queue,
            payload: job.payload,
            status: JobStatus::Pending,
            reserved_at: None,
            attempts: 0,
            run_after: job.run_after,
            message: None,
            created_at: now,
            updated_at: now,
        };
        self.state.rows.write().insert(id, row.clone());
        Ok(row)
    }

    async fn begin(&self) -> Result<Box<dyn JobTransaction>> {
        Ok(Box::new(MemoryTransaction {
            state: self.state.clone(),
            held: Vec::new(),
            finished: false,
        }))
    }

    async fn mark_success(&self, job: &QueuedJob, message: &str) -> Result<()> {
        let message = message.to_string();
        self.state
            .update(job.id, move |row| {
                row.status = JobStatus::Success;
                row.reserved_at = None;
                row.message = Some(message);
            })
            .await
    }

    async fn mark_failed(&self, job: &QueuedJob, message: &str) -> Result<()> {
        let message = message.to_string();
        self.state
            .update(job.id, move |row| {
                row.status = JobStatus::Failed;
                row.reserved_at = None;
                row.attempts += 1;
                row.message = Some(message);
            })
            .await
    }

    async fn retry(&self, job: &QueuedJob, delay_minutes: u32, message: Option<&str>) -> Result<()> {
        let run_after = self.state.clock.now() + Duration::minutes(i64::from(delay_minutes));
        let message = message.map(str::to_string);
        self.state
            .update(job.id, move |row| {
                row.status = JobStatus::Pending;
                row.reserved_at = None;
                row.attempts += 1;
                row.run_after = run_after;
                if message.is_some() {
                    row.message = message;
                }
            })
            .await
    }

    async fn clean_stuck_jobs(&self, timeout_minutes: u32) -> Result<u64> {
        let now = self.state.clock.now();
        let cutoff = now - Duration::minutes(i64::from(timeout_minutes));
        let mut rows = self.state.rows.write();
        let mut reclaimed = 0;
        for row in rows.values_mut() {
            let stale = matches!(row.reserved_at, Some(at) if at < cutoff);
            if row.status == JobStatus::Pending && stale {
                row.reserved_at = None;
                row.updated_at = now;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn available_jobs(&self, queue: &str, limit: usize) -> Result<Vec<QueuedJob>> {
        let now = self.state.clock.now();
        Ok(self
            .state
            .rows
            .read()
            .values()
            .filter(|row| row.queue == queue && row.is_available(now))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn failed_jobs(&self, queue: &str, limit: usize, max_retries: u32) -> Result<Vec<QueuedJob>> {
        Ok(self
            .state
            .rows
            .read()
            .values()
            .filter(|row| row.queue == queue && row.status == JobStatus::Failed && row.attempts < max_retries)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn job_by_id(&self, id: JobId) -> Result<Option<QueuedJob>> {
        Ok(self.state.rows.read().get(&id).cloned())
    }

    async fn delete_by_status(&self, queue: Option<&str>, status: JobStatus) -> Result<u64> {
        let mut rows = self.state.rows.write();
        let before = rows.len();
        rows.retain(|_, row| !(row.status == status && queue.map_or(true, |q| row.queue == q)));
        let removed = before - rows.len();
        drop(rows);
        self.state
            .locks
            .retain(|id, lock| Arc::strong_count(lock) > 1 || self.state.rows.read().contains_key(id));
        Ok(removed as u64)
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts> {
        let mut counts = JobCounts::default();
        for row in self.state.rows.read().values().filter(|row| row.queue == queue) {
            match (row.status, row.reserved_at) {
                (JobStatus::Pending, None) => counts.pending += 1,
                (JobStatus::Pending, Some(_)) => counts.reserved += 1,
                (JobStatus::Success, _) => counts.success += 1,
                (JobStatus::Failed, _) => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

struct HeldRow {
    id: JobId,
    snapshot: Option<QueuedJob>,
    _guard: OwnedMutexGuard<()>,
}

struct MemoryTransaction {
    state: Arc<MemoryState>,
    held: Vec<HeldRow>,
    finished: bool,
}

impl MemoryTransaction {
    fn restore(&mut self) {
        let mut rows = self.state.rows.write();
        for held in self.held.iter() {
            match &held.snapshot {
                Some(snapshot) => {
                    rows.insert(held.id, snapshot.clone());
                }
                None => {
                    rows.remove(&held.id);
                }
            }
        }
    }
}

#[async_trait]
impl JobTransaction for MemoryTransaction {
    async fn lock_job(&mut self, id: JobId) -> Result<Option<QueuedJob>> {
        if self.held.iter().any(|held| held.id == id) {
            return Ok(self.state.rows.read().get(&id).cloned());
        }

        let lock = self.state.row_lock(id);
        let guard = lock.lock_owned().await;
        let snapshot = self.state.rows.read().get(&id).cloned();
        self.held.push(HeldRow {
            id,
            snapshot: snapshot.clone(),
            _guard: guard,
        });
        Ok(snapshot)
    }

    async fn reserve(&mut self, job: &QueuedJob) -> Result<QueuedJob> {
        if !self.held.iter().any(|held| held.id == job.id) {
            return Err(QueueError::new(
                ErrorCode::JobReservationFailed,
                format!("Job {} must be locked before it is reserved", job.id),
            ));
        }

        let now = self.state.clock.now();
        let mut rows = self.state.rows.write();
        let row = rows.get_mut(&job.id).ok_or_else(|| QueueError::job_not_found(job.id))?;
        row.reserved_at = Some(now);
        row.updated_at = now;
        Ok(row.clone())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        self.finished = true;
        self.held.clear();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.restore();
        self.finished = true;
        self.held.clear();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished && !self.held.is_empty() {
            self.restore();
        }
    }
}
