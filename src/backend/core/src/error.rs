//! Error handling for the taskq core.
//!
//! This module provides:
//! - A single error type with machine-readable codes and chaining
//! - Operator-facing messages separate from detailed internal messages
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use taskq_core::error::{ErrorCode, ErrorContext, QueueError, Result};
//!
//! fn load() -> Result<String> {
//!     std::fs::read_to_string("jobs.toml")
//!         .with_error_code(ErrorCode::MissingConfiguration)
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and are surfaced by the CLI in json/yaml output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job Errors (1000-1099)
    JobNotFound,
    JobReservationFailed,
    InvalidStateTransition,

    // Task Errors (1100-1199)
    UnknownTaskType,
    PayloadRejected,
    MalformedPayload,
    TaskExecutionFailed,
    TaskPanicked,

    // Worker Errors (1200-1299)
    WorkerAlreadyRunning,
    WorkerNotRunning,
    ControlTimeout,
    SignalRegistrationFailed,

    // Scheduler Errors (1300-1399)
    InvalidArgument,
    InvalidTimezone,

    // Database Errors (2000-2099)
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    DatabaseTransactionFailed,
    RecordNotFound,

    // Control Store Errors (2100-2199)
    ControlStoreError,
    ControlStoreConnectionFailed,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,
    InvalidJson,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::JobNotFound => 1000,
            Self::JobReservationFailed => 1001,
            Self::InvalidStateTransition => 1002,

            Self::UnknownTaskType => 1100,
            Self::PayloadRejected => 1101,
            Self::MalformedPayload => 1102,
            Self::TaskExecutionFailed => 1103,
            Self::TaskPanicked => 1104,

            Self::WorkerAlreadyRunning => 1200,
            Self::WorkerNotRunning => 1201,
            Self::ControlTimeout => 1202,
            Self::SignalRegistrationFailed => 1203,

            Self::InvalidArgument => 1300,
            Self::InvalidTimezone => 1301,

            Self::DatabaseError => 2000,
            Self::DatabaseConnectionFailed => 2001,
            Self::DatabaseQueryFailed => 2002,
            Self::DatabaseTransactionFailed => 2003,
            Self::RecordNotFound => 2004,

            Self::ControlStoreError => 2100,
            Self::ControlStoreConnectionFailed => 2101,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,
            Self::InvalidJson => 2202,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
            Self::UnknownError => 9099,
        }
    }

    /// Check if an operation failing with this code is worth retrying as-is.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::DatabaseConnectionFailed
                | Self::DatabaseQueryFailed
                | Self::DatabaseTransactionFailed
                | Self::ControlStoreConnectionFailed
                | Self::ControlStoreError
                | Self::ControlTimeout
                | Self::TaskExecutionFailed
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            1100..=1199 => "task",
            1200..=1299 => "worker",
            1300..=1399 => "scheduler",
            2000..=2099 => "database",
            2100..=2199 => "control_store",
            2200..=2299 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging and alerting).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad arguments, unknown tasks)
    Low,
    /// Operational issues (task failures, timeouts)
    Medium,
    /// System errors (database failures)
    High,
    /// Errors that stop the daemon
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::JobNotFound
            | ErrorCode::RecordNotFound
            | ErrorCode::InvalidArgument
            | ErrorCode::InvalidTimezone
            | ErrorCode::UnknownTaskType
            | ErrorCode::PayloadRejected
            | ErrorCode::InvalidStateTransition
            | ErrorCode::WorkerAlreadyRunning
            | ErrorCode::WorkerNotRunning => Self::Low,

            ErrorCode::TaskExecutionFailed
            | ErrorCode::MalformedPayload
            | ErrorCode::JobReservationFailed
            | ErrorCode::ControlTimeout
            | ErrorCode::ControlStoreError
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::InvalidJson => Self::Medium,

            ErrorCode::DatabaseError
            | ErrorCode::DatabaseQueryFailed
            | ErrorCode::DatabaseTransactionFailed
            | ErrorCode::TaskPanicked
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration
            | ErrorCode::InternalError
            | ErrorCode::UnknownError => Self::High,

            ErrorCode::DatabaseConnectionFailed
            | ErrorCode::ControlStoreConnectionFailed
            | ErrorCode::SignalRegistrationFailed => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for the queue.
#[derive(Error, Debug)]
pub struct QueueError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Operator-facing message
    message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Structured context (queue, job id, ...)
    context: HashMap<String, serde_json::Value>,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl QueueError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both operator and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add internal message.
    pub fn with_internal_message(mut self, message: impl Into<String>) -> Self {
        self.internal_message = Some(message.into());
        self
    }

    /// Add a structured context value.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn context(&self) -> &HashMap<String, serde_json::Value> {
        &self.context
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    /// Message suitable for persisting on a job row: the internal detail when
    /// present, the operator message otherwise.
    pub fn detail(&self) -> String {
        match &self.internal_message {
            Some(internal) => format!("{}: {}", self.message, internal),
            None => self.message.to_string(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    context = ?self.context,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    internal_message = ?self.internal_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    message = %self.message,
                    "Low severity error"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "taskq_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "severity" => format!("{:?}", self.severity()),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let detail = e.to_string();
            QueueError::with_internal(ErrorCode::InternalError, message.into(), detail).with_source(e)
        })
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| QueueError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| QueueError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| QueueError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for QueueError {
    fn from(error: sqlx::Error) -> Self {
        let (code, msg) = match &error {
            sqlx::Error::RowNotFound => (ErrorCode::RecordNotFound, "The requested row was not found"),
            sqlx::Error::Database(_) => (ErrorCode::DatabaseQueryFailed, "A database error occurred"),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, msg, error.to_string()).with_source(error)
    }
}

impl From<sqlx::migrate::MigrateError> for QueueError {
    fn from(error: sqlx::migrate::MigrateError) -> Self {
        Self::with_internal(
            ErrorCode::DatabaseError,
            "Failed to apply job table migrations",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(error: redis::RedisError) -> Self {
        let (code, msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::ControlStoreConnectionFailed, "Unable to connect to the control store")
        } else if error.is_timeout() {
            (ErrorCode::ControlStoreError, "Control store operation timed out")
        } else {
            (ErrorCode::ControlStoreError, "A control store error occurred")
        };

        Self::with_internal(code, msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() {
            ErrorCode::DeserializationError
        } else if error.is_eof() {
            ErrorCode::InvalidJson
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string()).with_source(error)
    }
}

impl From<std::io::Error> for QueueError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::RecordNotFound, "File or resource not found"),
            ErrorKind::TimedOut => (ErrorCode::ControlTimeout, "Operation timed out"),
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, msg, error.to_string()).with_source(error)
    }
}

impl From<tokio::task::JoinError> for QueueError {
    fn from(error: tokio::task::JoinError) -> Self {
        let code = if error.is_panic() {
            ErrorCode::TaskPanicked
        } else {
            ErrorCode::InternalError
        };
        Self::with_internal(code, "A background task did not complete", error.to_string())
    }
}

impl From<anyhow::Error> for QueueError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<QueueError>() {
            Ok(queue_error) => queue_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for QueueError {
    fn from(error: config::ConfigError) -> Self {
        let (code, msg) = match &error {
            config::ConfigError::NotFound(_) => {
                (ErrorCode::MissingConfiguration, "Required configuration not found")
            }
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => {
                (ErrorCode::InvalidConfiguration, "Configuration file is invalid")
            }
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl QueueError {
    pub fn job_not_found(id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", id)).with_context("job_id", id.to_string())
    }

    pub fn unknown_task(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ErrorCode::UnknownTaskType, format!("No task registered under '{}'", name))
            .with_context("task_type", name)
    }

    pub fn payload_rejected(task_type: &str, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::PayloadRejected,
            format!("Payload does not match task '{}'", task_type),
            reason,
        )
        .with_context("task_type", task_type)
    }

    pub fn malformed_payload(reason: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::MalformedPayload, "Job payload envelope is corrupt", reason)
    }

    pub fn task_failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self::new(ErrorCode::TaskExecutionFailed, message)
    }

    pub fn invalid_argument(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn worker_already_running(queue: &str, pid: u32) -> Self {
        Self::new(
            ErrorCode::WorkerAlreadyRunning,
            format!("Queue '{}' is already served by live process {}", queue, pid),
        )
        .with_context("queue", queue)
        .with_context("pid", pid)
    }

    pub fn worker_not_running(queue: &str) -> Self {
        Self::new(
            ErrorCode::WorkerNotRunning,
            format!("No worker is recorded for queue '{}'", queue),
        )
        .with_context("queue", queue)
    }

    pub fn control_timeout(queue: &str, action: &str, waited_secs: u64) -> Self {
        Self::new(
            ErrorCode::ControlTimeout,
            format!(
                "Worker for queue '{}' did not acknowledge {} within {}s",
                queue, action, waited_secs
            ),
        )
        .with_context("queue", queue)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InvalidConfiguration, "Invalid configuration", message)
    }
}
