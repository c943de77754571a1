//! Persisted job rows.
//!
//! - **QueuedJob**: one durable unit of queued work
//! - **JobStatus**: Pending, Success or Failed
//! - **NewJob**: the insert shape produced by the queue manager
//! - **JobCounts**: per-status totals for a queue

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ErrorCode, QueueError};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Row identifier of a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle status of a job row.
///
/// Whether a Pending row is in flight is carried by `reserved_at`, not by the
/// status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to run, or claimed and running when `reserved_at` is set
    Pending,
    /// Finished successfully
    Success,
    /// Failed with retries exhausted
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(QueueError::new(
                ErrorCode::InvalidStateTransition,
                format!("Unknown job status '{}'", other),
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rows
// ═══════════════════════════════════════════════════════════════════════════════

/// A durable job row.
///
/// `payload` is kept as raw JSON so a corrupt envelope can still be loaded
/// and routed to failure handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub queue: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub reserved_at: Option<DateTime<Utc>>,
    /// Number of failed executions recorded so far
    pub attempts: u32,
    pub run_after: DateTime<Utc>,
    /// Outcome message of the last execution
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn is_reserved(&self) -> bool {
        self.reserved_at.is_some()
    }

    /// Pending, unreserved and due.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.reserved_at.is_none() && self.run_after <= now
    }

    /// The `type` field of the envelope, if the payload has one.
    pub fn task_type(&self) -> Option<&str> {
        self.payload.get("type").and_then(|t| t.as_str())
    }
}

/// Insert shape for a new Pending job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub queue: String,
    pub payload: serde_json::Value,
    pub run_after: DateTime<Utc>,
}

/// Per-status totals for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    /// Pending and not reserved
    pub pending: u64,
    /// Pending and reserved
    pub reserved: u64,
    pub success: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.reserved + self.success + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(now: DateTime<Utc>) -> QueuedJob {
        QueuedJob {
            id: JobId(1),
            queue: "mail".into(),
            payload: serde_json::json!({"type": "send_mail", "data": {}}),
            status: JobStatus::Pending,
            reserved_at: None,
            attempts: 0,
            run_after: now,
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_status_parse_and_display() {
        for status in [JobStatus::Pending, JobStatus::Success, JobStatus::Failed] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!("running".parse::<JobStatus>().is_err());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }

    #[test]
    fn test_availability() {
        let now = Utc::now();
        let mut row = job(now);
        assert!(row.is_available(now));

        row.run_after = now + Duration::minutes(1);
        assert!(!row.is_available(now));

        row.run_after = now;
        row.reserved_at = Some(now);
        assert!(!row.is_available(now));

        row.reserved_at = None;
        row.status = JobStatus::Failed;
        assert!(!row.is_available(now));
    }

    #[test]
    fn test_task_type_from_payload() {
        let row = job(Utc::now());
        assert_eq!(row.task_type(), Some("send_mail"));
    }
}
