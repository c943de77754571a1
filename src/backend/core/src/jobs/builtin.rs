//! Built-in tasks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::jobs::job::JobStatus;
use crate::jobs::scheduler::Scheduler;
use crate::jobs::task::{Occurrence, Task, TaskContext, TaskOutcome, TaskRegistry};

/// Registry with every built-in task.
pub fn builtin_registry() -> TaskRegistry {
    TaskRegistry::new().with::<EchoTask>().with::<PurgeJobsTask>()
}

// ═══════════════════════════════════════════════════════════════════════════════
// Echo
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoData {
    pub message: String,
    /// Report failure instead of success
    #[serde(default)]
    pub fail: bool,
}

/// Task: log a message. Used to smoke-test a queue end to end.
#[derive(Debug, Clone)]
pub struct EchoTask {
    data: EchoData,
}

#[async_trait]
impl Task for EchoTask {
    const NAME: &'static str = "echo";
    type Data = EchoData;

    fn from_data(data: EchoData) -> Self {
        Self { data }
    }

    async fn run(&self, ctx: &TaskContext) -> TaskOutcome {
        if self.data.fail {
            ctx.log_warn(&format!("Echo failing on request: {}", self.data.message));
            return TaskOutcome::failure(self.data.message.clone());
        }
        ctx.log_info(&self.data.message);
        TaskOutcome::success(self.data.message.clone())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Purge
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeData {
    /// Limit the purge to one queue; all queues when absent
    #[serde(default)]
    pub queue: Option<String>,

    #[serde(default = "default_purge_status")]
    pub status: JobStatus,

    /// Daily run time, `HH:MM` in the scheduler timezone
    #[serde(default = "default_purge_at")]
    pub at: String,
}

impl Default for PurgeData {
    fn default() -> Self {
        Self {
            queue: None,
            status: default_purge_status(),
            at: default_purge_at(),
        }
    }
}

fn default_purge_status() -> JobStatus {
    JobStatus::Success
}

fn default_purge_at() -> String {
    "03:00".to_string()
}

/// Task: delete finished rows once a day, then schedule the next run.
#[derive(Debug, Clone)]
pub struct PurgeJobsTask {
    data: PurgeData,
}

#[async_trait]
impl Task for PurgeJobsTask {
    const NAME: &'static str = "purge_jobs";
    type Data = PurgeData;

    fn from_data(data: PurgeData) -> Self {
        Self { data }
    }

    async fn run(&self, ctx: &TaskContext) -> TaskOutcome {
        if !self.data.status.is_terminal() {
            return TaskOutcome::failure("refusing to purge pending jobs");
        }

        match ctx
            .repository()
            .delete_by_status(self.data.queue.as_deref(), self.data.status)
            .await
        {
            Ok(deleted) => {
                let scope = self.data.queue.as_deref().unwrap_or("all queues");
                ctx.log_info(&format!("Purged {} {} jobs from {}", deleted, self.data.status, scope));
                TaskOutcome::success(format!("purged {} {} jobs", deleted, self.data.status))
            }
            Err(e) => TaskOutcome::failure(e.detail()),
        }
    }

    fn period(&self, scheduler: Scheduler) -> Result<Option<Scheduler>> {
        Ok(Some(scheduler.day(1).at(&self.data.at)?))
    }

    fn occurrence(&self) -> Occurrence {
        Occurrence::Always
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::clock::ManualClock;
    use crate::jobs::job::NewJob;
    use crate::jobs::manager::QueueManager;
    use crate::jobs::repository::{InMemoryJobRepository, JobRepository};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;

    fn manager() -> (QueueManager, InMemoryJobRepository) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 15, 0, 0).unwrap()));
        let repo = InMemoryJobRepository::new(clock.clone());
        let manager = QueueManager::new(Arc::new(repo.clone()), Arc::new(builtin_registry()), clock, chrono_tz::UTC);
        (manager, repo)
    }

    #[test]
    fn test_builtin_registry() {
        assert_eq!(builtin_registry().names(), vec!["echo", "purge_jobs"]);
    }

    #[tokio::test]
    async fn test_echo_reports_requested_outcome() {
        let (manager, _repo) = manager();
        let ctx = TaskContext::new(1.into(), "mail", 0, manager);

        let ok = EchoTask::from_data(EchoData {
            message: "hello".into(),
            fail: false,
        });
        assert_eq!(ok.run(&ctx).await, TaskOutcome::success("hello"));

        let failing = EchoTask::from_data(EchoData {
            message: "nope".into(),
            fail: true,
        });
        assert!(!failing.run(&ctx).await.is_success());
    }

    #[tokio::test]
    async fn test_purge_is_scheduled_daily() {
        let (manager, _repo) = manager();
        let pending = manager.job("maintenance", "purge_jobs", json!({})).unwrap();
        assert_eq!(pending.run_after(), Utc.with_ymd_and_hms(2024, 6, 2, 3, 0, 0).unwrap());

        let task = manager.registry().instantiate("purge_jobs", json!({})).unwrap();
        assert_eq!(task.occurrence(), Occurrence::Always);
    }

    #[tokio::test]
    async fn test_purge_deletes_only_requested_status() {
        let (manager, repo) = manager();
        for queue in ["mail", "reports"] {
            let job = repo
                .create(NewJob {
                    queue: queue.into(),
                    payload: json!({"type": "echo", "data": {"message": "x"}}),
                    run_after: Utc::now(),
                })
                .await
                .unwrap();
            repo.mark_success(&job, "done").await.unwrap();
        }

        let ctx = TaskContext::new(99.into(), "maintenance", 0, manager);
        let task = PurgeJobsTask::from_data(PurgeData {
            queue: Some("mail".into()),
            ..Default::default()
        });
        let outcome = task.run(&ctx).await;
        assert_eq!(outcome, TaskOutcome::success("purged 1 success jobs"));
        assert!(repo.jobs("mail").is_empty());
        assert_eq!(repo.jobs("reports").len(), 1);
    }

    #[tokio::test]
    async fn test_purge_refuses_pending() {
        let (manager, _repo) = manager();
        let ctx = TaskContext::new(1.into(), "maintenance", 0, manager);
        let task = PurgeJobsTask::from_data(PurgeData {
            status: JobStatus::Pending,
            ..Default::default()
        });
        assert!(!task.run(&ctx).await.is_success());
    }
}
