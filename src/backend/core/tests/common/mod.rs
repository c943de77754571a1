//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use taskq_core::control::InMemoryControlStore;
use taskq_core::jobs::{
    builtin_registry, DispatcherConfig, InMemoryJobRepository, ManualClock, Occurrence, QueueDispatcher,
    QueueManager, Scheduler, Task, TaskContext, TaskOutcome, TaskRegistry,
};
use taskq_core::Result;

/// Executions per token, shared by every test in the binary.
static RUNS: LazyLock<DashMap<String, AtomicUsize>> = LazyLock::new(DashMap::new);

/// Last data seen per token.
static SEEN: LazyLock<DashMap<String, serde_json::Value>> = LazyLock::new(DashMap::new);

pub fn runs(token: &str) -> usize {
    RUNS.get(token).map(|n| n.load(Ordering::SeqCst)).unwrap_or(0)
}

pub fn seen(token: &str) -> Option<serde_json::Value> {
    SEEN.get(token).map(|v| v.clone())
}

fn record_run(token: &str) {
    RUNS.entry(token.to_string())
        .or_insert_with(|| AtomicUsize::new(0))
        .fetch_add(1, Ordering::SeqCst);
}

// ============================================================================
// Tasks
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub token: String,
}

impl Token {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

/// Succeeds after a short await, counting executions.
pub struct CountingTask(Token);

#[async_trait]
impl Task for CountingTask {
    const NAME: &'static str = "counting";
    type Data = Token;

    fn from_data(data: Token) -> Self {
        Self(data)
    }

    async fn run(&self, _ctx: &TaskContext) -> TaskOutcome {
        record_run(&self.0.token);
        tokio::time::sleep(Duration::from_millis(2)).await;
        TaskOutcome::success(format!("counted {}", self.0.token))
    }
}

/// Always reports failure.
pub struct FailingTask(Token);

#[async_trait]
impl Task for FailingTask {
    const NAME: &'static str = "failing";
    type Data = Token;

    fn from_data(data: Token) -> Self {
        Self(data)
    }

    async fn run(&self, _ctx: &TaskContext) -> TaskOutcome {
        record_run(&self.0.token);
        TaskOutcome::failure("mail server refused connection")
    }
}

/// Re-enqueues itself ten minutes out after every success.
pub struct RecurringTask(Token);

#[async_trait]
impl Task for RecurringTask {
    const NAME: &'static str = "recurring";
    type Data = Token;

    fn from_data(data: Token) -> Self {
        Self(data)
    }

    async fn run(&self, _ctx: &TaskContext) -> TaskOutcome {
        record_run(&self.0.token);
        TaskOutcome::success("tick")
    }

    fn period(&self, scheduler: Scheduler) -> Result<Option<Scheduler>> {
        Ok(Some(scheduler.minute(10)))
    }

    fn occurrence(&self) -> Occurrence {
        Occurrence::Always
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    pub token: String,
    pub fail_after_defer: bool,
}

/// Defers a follow-up counting job, then optionally fails.
pub struct ChainTask(Chain);

#[async_trait]
impl Task for ChainTask {
    const NAME: &'static str = "chain";
    type Data = Chain;

    fn from_data(data: Chain) -> Self {
        Self(data)
    }

    async fn run(&self, ctx: &TaskContext) -> TaskOutcome {
        let follow_up = Token::new(format!("{}-follow-up", self.0.token));
        if let Err(e) = ctx.defer::<CountingTask>(ctx.queue(), &follow_up) {
            return TaskOutcome::failure(e.to_string());
        }
        if self.0.fail_after_defer {
            TaskOutcome::failure("failed after deferring")
        } else {
            TaskOutcome::success("chained")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub token: String,
    pub customer: Customer,
    pub lines: Vec<(String, u32)>,
    pub notes: Option<String>,
    pub tags: std::collections::BTreeMap<String, bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: u64,
    pub email: String,
}

/// Records the data it was decoded with.
pub struct RecordingTask(Invoice);

#[async_trait]
impl Task for RecordingTask {
    const NAME: &'static str = "recording";
    type Data = Invoice;

    fn from_data(data: Invoice) -> Self {
        Self(data)
    }

    async fn run(&self, _ctx: &TaskContext) -> TaskOutcome {
        match serde_json::to_value(&self.0) {
            Ok(value) => {
                SEEN.insert(self.0.token.clone(), value);
                TaskOutcome::success("recorded")
            }
            Err(e) => TaskOutcome::failure(e.to_string()),
        }
    }
}

pub fn test_registry() -> TaskRegistry {
    builtin_registry()
        .with::<CountingTask>()
        .with::<FailingTask>()
        .with::<RecurringTask>()
        .with::<ChainTask>()
        .with::<RecordingTask>()
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub repo: InMemoryJobRepository,
    pub control: Arc<InMemoryControlStore>,
    pub manager: QueueManager,
}

impl Harness {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()));
        let repo = InMemoryJobRepository::new(clock.clone());
        let manager = QueueManager::new(
            Arc::new(repo.clone()),
            Arc::new(test_registry()),
            clock.clone(),
            chrono_tz::UTC,
        );
        Self {
            clock,
            repo,
            control: Arc::new(InMemoryControlStore::new()),
            manager,
        }
    }

    pub fn dispatcher(&self, config: DispatcherConfig) -> QueueDispatcher {
        QueueDispatcher::new(self.manager.clone(), config).with_control(self.control.clone())
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
