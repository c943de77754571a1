//! Task definitions and the registry that allows them to be decoded.
//!
//! - **Task trait**: typed job logic, constructed from its `Data` per execution
//! - **DynTask**: the object-safe view the dispatcher drives
//! - **TaskRegistry**: name → decoder map built at startup; the only path from
//!   a stored payload to executable code
//! - **TaskContext**: handles passed to a running task

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{QueueError, Result};
use crate::jobs::job::JobId;
use crate::jobs::manager::{DeferredJobs, QueueManager};
use crate::jobs::payload::JobPayload;
use crate::jobs::repository::JobRepository;
use crate::jobs::scheduler::Scheduler;

// ═══════════════════════════════════════════════════════════════════════════════
// Outcomes
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Success,
    Failure,
}

/// What a task reports back after running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    pub message: String,
}

impl TaskOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Success,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failure,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

impl<E: fmt::Display> From<std::result::Result<String, E>> for TaskOutcome {
    fn from(result: std::result::Result<String, E>) -> Self {
        match result {
            Ok(message) => Self::success(message),
            Err(e) => Self::failure(e.to_string()),
        }
    }
}

/// Whether a task re-enqueues itself after each successful run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurrence {
    Once,
    Always,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context handed to [`Task::run`].
#[derive(Clone)]
pub struct TaskContext {
    job_id: JobId,
    queue: String,
    attempts: u32,
    manager: QueueManager,
    deferred: DeferredJobs,
}

impl TaskContext {
    pub fn new(job_id: JobId, queue: impl Into<String>, attempts: u32, manager: QueueManager) -> Self {
        Self {
            job_id,
            queue: queue.into(),
            attempts,
            manager,
            deferred: DeferredJobs::new(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Failures recorded before this execution.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        self.manager.repository()
    }

    pub fn manager(&self) -> &QueueManager {
        &self.manager
    }

    /// Enqueue follow-up work once this job commits. Dropped if it fails.
    pub fn defer<T: Task>(&self, queue: &str, data: &T::Data) -> Result<()> {
        self.manager.job_for::<T>(queue, data)?.defer(&self.deferred);
        Ok(())
    }

    pub(crate) fn deferred(&self) -> &DeferredJobs {
        &self.deferred
    }

    pub fn log_info(&self, message: &str) {
        tracing::info!(job_id = %self.job_id, queue = %self.queue, attempts = self.attempts, "{}", message);
    }

    pub fn log_warn(&self, message: &str) {
        tracing::warn!(job_id = %self.job_id, queue = %self.queue, attempts = self.attempts, "{}", message);
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("job_id", &self.job_id)
            .field("queue", &self.queue)
            .field("attempts", &self.attempts)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Task Traits
// ═══════════════════════════════════════════════════════════════════════════════

/// Job logic that can be queued.
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize)]
/// struct Mail { to: String }
///
/// struct SendMail(Mail);
///
/// #[async_trait]
/// impl Task for SendMail {
///     const NAME: &'static str = "send_mail";
///     type Data = Mail;
///
///     fn from_data(data: Mail) -> Self { Self(data) }
///
///     async fn run(&self, _ctx: &TaskContext) -> TaskOutcome {
///         TaskOutcome::success(format!("sent to {}", self.0.to))
///     }
/// }
/// ```
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Name stored in the payload envelope.
    const NAME: &'static str;

    /// Serialized form of the task arguments. Use `serde_json::Value` to
    /// accept arbitrary plain data.
    type Data: Serialize + DeserializeOwned + Send + Sync + 'static;

    fn from_data(data: Self::Data) -> Self
    where
        Self: Sized;

    async fn run(&self, ctx: &TaskContext) -> TaskOutcome;

    /// Customise when the job first becomes eligible.
    fn period(&self, _scheduler: Scheduler) -> Result<Option<Scheduler>> {
        Ok(None)
    }

    fn occurrence(&self) -> Occurrence {
        Occurrence::Once
    }
}

/// Object-safe view of a decoded task.
#[async_trait]
pub trait DynTask: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &TaskContext) -> TaskOutcome;

    fn period(&self, scheduler: Scheduler) -> Result<Option<Scheduler>>;

    fn occurrence(&self) -> Occurrence;
}

#[async_trait]
impl<T: Task> DynTask for T {
    fn name(&self) -> &'static str {
        T::NAME
    }

    async fn run(&self, ctx: &TaskContext) -> TaskOutcome {
        Task::run(self, ctx).await
    }

    fn period(&self, scheduler: Scheduler) -> Result<Option<Scheduler>> {
        Task::period(self, scheduler)
    }

    fn occurrence(&self) -> Occurrence {
        Task::occurrence(self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

type Decoder = fn(serde_json::Value) -> Result<Box<dyn DynTask>>;

fn decode_as<T: Task>(data: serde_json::Value) -> Result<Box<dyn DynTask>> {
    let data: T::Data =
        serde_json::from_value(data).map_err(|e| QueueError::payload_rejected(T::NAME, e.to_string()))?;
    Ok(Box::new(T::from_data(data)))
}

/// Allow-list of task types, keyed by [`Task::NAME`].
#[derive(Clone, Default)]
pub struct TaskRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T`, replacing any earlier task with the same name.
    pub fn register<T: Task>(&mut self) -> &mut Self {
        if self.decoders.insert(T::NAME, decode_as::<T> as Decoder).is_some() {
            tracing::warn!(task_type = T::NAME, "Task registered twice, keeping the latest");
        }
        self
    }

    /// Chaining form of [`register`](Self::register).
    pub fn with<T: Task>(mut self) -> Self {
        self.register::<T>();
        self
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.decoders.contains_key(task_type)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.decoders.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Build a task from its name and serialized data.
    pub fn instantiate(&self, task_type: &str, data: serde_json::Value) -> Result<Box<dyn DynTask>> {
        let decoder = self
            .decoders
            .get(task_type)
            .ok_or_else(|| QueueError::unknown_task(task_type))?;
        decoder(data)
    }

    /// Build a task from a stored envelope.
    pub fn decode(&self, payload: &JobPayload) -> Result<Box<dyn DynTask>> {
        self.instantiate(&payload.task_type, payload.data.clone())
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry").field("tasks", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Mail {
        to: String,
        retries: Option<u8>,
    }

    struct SendMail(Mail);

    #[async_trait]
    impl Task for SendMail {
        const NAME: &'static str = "send_mail";
        type Data = Mail;

        fn from_data(data: Mail) -> Self {
            Self(data)
        }

        async fn run(&self, _ctx: &TaskContext) -> TaskOutcome {
            TaskOutcome::success(format!("sent to {}", self.0.to))
        }

        fn occurrence(&self) -> Occurrence {
            Occurrence::Always
        }
    }

    struct Anything(serde_json::Value);

    #[async_trait]
    impl Task for Anything {
        const NAME: &'static str = "anything";
        type Data = serde_json::Value;

        fn from_data(data: serde_json::Value) -> Self {
            Self(data)
        }

        async fn run(&self, _ctx: &TaskContext) -> TaskOutcome {
            TaskOutcome::success(self.0.to_string())
        }
    }

    #[test]
    fn test_registry_decodes_registered_types() {
        let registry = TaskRegistry::new().with::<SendMail>().with::<Anything>();
        assert_eq!(registry.names(), vec!["anything", "send_mail"]);

        let task = registry.instantiate("send_mail", json!({"to": "a@b.c", "retries": 2})).unwrap();
        assert_eq!(task.name(), "send_mail");
        assert_eq!(task.occurrence(), Occurrence::Always);

        let plain = registry.instantiate("anything", json!([1, "two", {"three": 3}])).unwrap();
        assert_eq!(plain.occurrence(), Occurrence::Once);
    }

    #[test]
    fn test_registry_rejects_unknown_type() {
        let registry = TaskRegistry::new().with::<SendMail>();
        let err = registry.instantiate("rm_rf", json!({})).err().expect("expected error");
        assert_eq!(err.code(), ErrorCode::UnknownTaskType);
    }

    #[test]
    fn test_registry_rejects_mismatched_data() {
        let registry = TaskRegistry::new().with::<SendMail>();
        let err = registry.instantiate("send_mail", json!({"recipient": "x"})).err().expect("expected error");
        assert_eq!(err.code(), ErrorCode::PayloadRejected);
    }

    #[test]
    fn test_outcome_from_result() {
        let ok: TaskOutcome = Ok::<_, std::io::Error>("done".to_string()).into();
        assert!(ok.is_success());

        let err: TaskOutcome = Err::<String, _>("boom").into();
        assert_eq!(err, TaskOutcome::failure("boom"));
    }
}
