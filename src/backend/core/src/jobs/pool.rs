//! Bounded set of child tasks supervised by a worker.
//!
//! The `ChildPool` provides:
//! - A hard cap on concurrently running children
//! - Reaping of children that ran to completion
//! - Graceful termination with a grace window, then abort
//! - Lifetime statistics

use metrics::counter;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const REAP_INTERVAL: Duration = Duration::from_millis(25);

/// A running child.
struct Child {
    id: Uuid,
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    started_at: Instant,
}

#[derive(Default)]
struct PoolCounters {
    spawned: AtomicU64,
    reaped: AtomicU64,
    killed: AtomicU64,
    peak: AtomicUsize,
}

impl PoolCounters {
    fn record_spawn(&self, active: usize) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
        self.peak.fetch_max(active, Ordering::Relaxed);
    }

    fn record_reap(&self, count: usize) {
        self.reaped.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn record_kill(&self, count: usize) {
        self.killed.fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Children of one worker.
pub struct ChildPool {
    name: String,
    max_children: usize,
    children: Vec<Child>,
    counters: PoolCounters,
    created_at: Instant,
}

impl ChildPool {
    pub fn new(name: impl Into<String>, max_children: usize) -> Self {
        let name = name.into();
        tracing::debug!(pool_name = %name, max_children, "Child pool created");
        Self {
            name,
            max_children,
            children: Vec::new(),
            counters: PoolCounters::default(),
            created_at: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_children(&self) -> usize {
        self.max_children
    }

    /// Children not yet reaped, finished or not.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn available_slots(&self) -> usize {
        self.max_children.saturating_sub(self.children.len())
    }

    /// Drop finished children; returns how many were removed.
    pub fn reap(&mut self) -> usize {
        let before = self.children.len();
        self.children.retain(|child| {
            let done = child.handle.is_finished();
            if done {
                tracing::trace!(
                    pool_name = %self.name,
                    child_id = %child.id,
                    lifetime_ms = child.started_at.elapsed().as_millis() as u64,
                    "Child reaped"
                );
            }
            !done
        });
        let reaped = before - self.children.len();
        self.counters.record_reap(reaped);
        reaped
    }

    /// Spawn children until the pool is full. `make` receives the child's
    /// cancellation token. Returns how many were started.
    pub fn fill<F, Fut>(&mut self, mut make: F) -> usize
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let slots = self.available_slots();
        for _ in 0..slots {
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(make(cancel.clone()));
            self.children.push(Child {
                id: Uuid::new_v4(),
                handle,
                cancel,
                started_at: Instant::now(),
            });
            self.counters.record_spawn(self.children.len());
        }

        if slots > 0 {
            counter!("taskq_worker_children_spawned_total", "pool" => self.name.clone()).increment(slots as u64);
            tracing::debug!(pool_name = %self.name, spawned = slots, active = self.children.len(), "Children spawned");
        }
        slots
    }

    /// Cancel every child, wait up to `grace` for them to exit, then abort
    /// the rest. Returns how many had to be aborted.
    pub async fn terminate_all(&mut self, grace: Duration) -> usize {
        if self.children.is_empty() {
            return 0;
        }

        for child in &self.children {
            child.cancel.cancel();
        }

        let deadline = Instant::now() + grace;
        loop {
            self.reap();
            if self.children.is_empty() || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(REAP_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))).await;
        }

        let survivors: Vec<Child> = self.children.drain(..).collect();
        let killed = survivors.len();
        for child in survivors {
            child.handle.abort();
            // Cancelled is the expected result.
            let _ = child.handle.await;
        }
        self.counters.record_kill(killed);

        if killed > 0 {
            tracing::warn!(pool_name = %self.name, killed, grace_ms = grace.as_millis() as u64, "Children aborted after grace window");
        } else {
            tracing::debug!(pool_name = %self.name, "All children exited");
        }
        killed
    }

    pub fn stats(&self) -> ChildPoolStats {
        ChildPoolStats {
            name: self.name.clone(),
            max_children: self.max_children,
            active: self.children.len(),
            spawned: self.counters.spawned.load(Ordering::Relaxed),
            reaped: self.counters.reaped.load(Ordering::Relaxed),
            killed: self.counters.killed.load(Ordering::Relaxed),
            peak: self.counters.peak.load(Ordering::Relaxed),
            uptime_secs: self.created_at.elapsed().as_secs(),
        }
    }
}

impl Drop for ChildPool {
    fn drop(&mut self) {
        for child in self.children.drain(..) {
            child.cancel.cancel();
            child.handle.abort();
        }
    }
}

/// Statistics for a child pool.
#[derive(Debug, Clone)]
pub struct ChildPoolStats {
    pub name: String,
    pub max_children: usize,
    /// Children not yet reaped
    pub active: usize,
    pub spawned: u64,
    pub reaped: u64,
    /// Children aborted after the grace window
    pub killed: u64,
    /// Peak concurrent children observed
    pub peak: usize,
    pub uptime_secs: u64,
}
