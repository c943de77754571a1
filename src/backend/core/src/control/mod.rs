//! Worker control state shared between the daemon and admin commands.
//!
//! One record per queue, stored under [`worker_key`] as JSON:
//!
//! ```text
//! {"status": "started" | "paused" | "restarting" | "", "pid": 4242, "last_seen": "2024-06-01T12:00:00Z"}
//! ```
//!
//! The daemon polls it every tick and heartbeats into it. Admin commands write
//! the `status` field last-writer-wins; the daemon's own refreshes go through
//! [`ControlStore::replace`] so they never clobber a command.

pub mod memory;
pub mod redis_store;

pub use memory::InMemoryControlStore;
pub use redis_store::RedisControlStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

// ═══════════════════════════════════════════════════════════════════════════════
// Store Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Key/value store holding control records.
#[async_trait]
pub trait ControlStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>>;

    async fn write(&self, key: &str, value: &str) -> Result<()>;

    /// Set `key` to `value` only while it still holds `expected`. Returns
    /// whether the write happened.
    async fn replace(&self, key: &str, expected: &str, value: &str) -> Result<bool>;

    async fn has(&self, key: &str) -> Result<bool>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Control key of a queue's worker.
pub fn worker_key(queue: &str) -> String {
    format!("worker:{}", queue)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Control Record
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    #[serde(rename = "started")]
    Started,
    #[serde(rename = "paused")]
    Paused,
    #[serde(rename = "restarting")]
    Restarting,
    /// Stop requested; the daemon exits on its next tick
    #[serde(rename = "")]
    Stopped,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Stopped => "",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlState {
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl ControlState {
    pub fn started(pid: u32, now: DateTime<Utc>) -> Self {
        Self {
            status: WorkerStatus::Started,
            pid: Some(pid),
            last_seen: Some(now),
        }
    }

    pub fn stop_request() -> Self {
        Self {
            status: WorkerStatus::Stopped,
            pid: None,
            last_seen: None,
        }
    }

    pub fn with_status(mut self, status: WorkerStatus) -> Self {
        self.status = status;
        self
    }

    /// Parse a stored value. An empty or unreadable value is a stop request.
    pub fn parse(raw: &str) -> Self {
        if raw.trim().is_empty() {
            return Self::stop_request();
        }
        match serde_json::from_str(raw) {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(error = %e, raw = %raw, "Unreadable control record, treating as stop request");
                Self::stop_request()
            }
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_stop_request(&self) -> bool {
        self.status == WorkerStatus::Stopped
    }
}

/// Read and parse the control record of `queue`.
pub async fn load_state(store: &dyn ControlStore, queue: &str) -> Result<Option<ControlState>> {
    Ok(store.read(&worker_key(queue)).await?.map(|raw| ControlState::parse(&raw)))
}

pub async fn save_state(store: &dyn ControlStore, queue: &str, state: &ControlState) -> Result<()> {
    store.write(&worker_key(queue), &state.encode()?).await
}

/// Replace the record of `queue` with `state` unless it changed since `raw`
/// was read.
pub async fn swap_state(store: &dyn ControlStore, queue: &str, raw: &str, state: &ControlState) -> Result<bool> {
    store.replace(&worker_key(queue), raw, &state.encode()?).await
}

pub async fn clear_state(store: &dyn ControlStore, queue: &str) -> Result<bool> {
    store.delete(&worker_key(queue)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_wire_format() {
        let now = "2024-06-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let state = ControlState::started(4242, now);
        let encoded = state.encode().unwrap();
        assert_eq!(
            encoded,
            r#"{"status":"started","pid":4242,"last_seen":"2024-06-01T12:00:00Z"}"#
        );
        assert_eq!(ControlState::parse(&encoded), state);
    }

    #[test]
    fn test_empty_and_garbage_are_stop_requests() {
        assert!(ControlState::parse("").is_stop_request());
        assert!(ControlState::parse("   ").is_stop_request());
        assert!(ControlState::parse("not json").is_stop_request());
        assert!(ControlState::parse(r#"{"status":""}"#).is_stop_request());
        assert!(!ControlState::parse(r#"{"status":"paused","pid":1}"#).is_stop_request());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(WorkerStatus::Stopped.to_string(), "stopped");
        assert_eq!(WorkerStatus::Restarting.to_string(), "restarting");
        assert_eq!(worker_key("mail"), "worker:mail");
    }

    #[tokio::test]
    async fn test_state_helpers_roundtrip_through_store() {
        let store = InMemoryControlStore::new();
        assert!(load_state(&store, "mail").await.unwrap().is_none());

        let state = ControlState::started(7, Utc::now()).with_status(WorkerStatus::Paused);
        save_state(&store, "mail", &state).await.unwrap();
        assert_eq!(load_state(&store, "mail").await.unwrap(), Some(state));

        assert!(clear_state(&store, "mail").await.unwrap());
        assert!(!clear_state(&store, "mail").await.unwrap());
    }

    #[tokio::test]
    async fn test_swap_state_refuses_changed_record() {
        let store = InMemoryControlStore::new();
        let started = ControlState::started(7, Utc::now());
        save_state(&store, "mail", &started).await.unwrap();
        let raw = store.read(&worker_key("mail")).await.unwrap().unwrap();

        store.write(&worker_key("mail"), "").await.unwrap();
        assert!(!swap_state(&store, "mail", &raw, &started).await.unwrap());
        assert!(load_state(&store, "mail").await.unwrap().unwrap().is_stop_request());

        assert!(swap_state(&store, "mail", "", &started).await.unwrap());
        assert_eq!(load_state(&store, "mail").await.unwrap(), Some(started));
    }
}
