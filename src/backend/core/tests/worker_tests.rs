//! Integration tests for the worker daemon and its control client.
//!
//! Tests cover:
//! - Refusing a queue owned by a live process
//! - Stop, pause, resume and restart through the control record
//! - Pool and inline execution
//! - Memory cooldown
//! - Local shutdown

mod common;

use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use common::{eventually, runs, Harness};
use taskq_core::control::{load_state, save_state, worker_key, ControlState, ControlStore, WorkerStatus};
use taskq_core::error::ErrorCode;
use taskq_core::jobs::{
    DispatcherConfig, ExecutionMode, JobRepository, JobStatus, Worker, WorkerConfig, WorkerControl, WorkerEvent,
};
use taskq_core::system;

fn fast_config(mode: ExecutionMode) -> WorkerConfig {
    WorkerConfig {
        max_workers: 2,
        iterations_per_child: 2,
        child_pause: Duration::from_millis(5),
        poll_interval: Duration::from_millis(20),
        pause_poll: Duration::from_millis(20),
        memory_limit_mb: 0,
        memory_cooldown: Duration::from_millis(20),
        shutdown_grace: Duration::from_millis(200),
        command_timeout: Duration::from_secs(5),
        ack_poll: Duration::from_millis(10),
        mode,
        handle_signals: false,
        ..Default::default()
    }
}

type Events = Arc<Mutex<Vec<WorkerEvent>>>;

fn worker(h: &Harness, queue: &str, config: WorkerConfig) -> (Worker, Events) {
    let events: Events = Arc::default();
    let sink = events.clone();
    let worker = Worker::new(queue, h.dispatcher(DispatcherConfig::default()), h.control.clone(), config)
        .with_observer(move |event| sink.lock().push(event.clone()));
    (worker, events)
}

async fn wait_for_record(h: &Harness, queue: &str) {
    let store = h.control.clone();
    let key = worker_key(queue);
    assert!(eventually(|| async { store.has(&key).await.unwrap() }).await);
}

async fn enqueue_counting(h: &Harness, queue: &str, token: &str) {
    h.manager
        .job(queue, "counting", json!({ "token": token }))
        .unwrap()
        .queue()
        .await
        .unwrap();
}

// ============================================================================
// Start
// ============================================================================

#[tokio::test]
async fn test_start_refuses_live_owner() {
    let h = Harness::new();
    let owner = ControlState::started(system::current_pid(), chrono::Utc::now());
    save_state(h.control.as_ref(), "owned", &owner).await.unwrap();

    let (worker, events) = worker(&h, "owned", fast_config(ExecutionMode::Inline));
    let err = worker.start().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::WorkerAlreadyRunning);
    assert!(events.lock().is_empty());

    // The existing record is untouched.
    let state = load_state(h.control.as_ref(), "owned").await.unwrap().unwrap();
    assert_eq!(state, owner);
}

#[cfg(unix)]
#[tokio::test]
async fn test_start_takes_over_dead_owner() {
    let h = Harness::new();
    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = child.id();
    child.wait().unwrap();
    save_state(h.control.as_ref(), "orphan", &ControlState::started(dead_pid, chrono::Utc::now()))
        .await
        .unwrap();

    let (worker, _events) = worker(&h, "orphan", fast_config(ExecutionMode::Inline));
    let daemon = tokio::spawn(worker.start());

    let store = h.control.clone();
    assert!(
        eventually(|| async {
            load_state(store.as_ref(), "orphan").await.unwrap().and_then(|s| s.pid) == Some(system::current_pid())
        })
        .await
    );

    let control = WorkerControl::new(h.control.clone(), &fast_config(ExecutionMode::Inline));
    assert!(control.stop("orphan").await.unwrap());
    daemon.await.unwrap().unwrap();
}

// ============================================================================
// Control Commands
// ============================================================================

#[tokio::test]
async fn test_empty_status_stops_daemon_and_removes_record() {
    let h = Harness::new();
    let (worker, events) = worker(&h, "stopper", fast_config(ExecutionMode::Inline));
    let daemon = tokio::spawn(worker.start());
    wait_for_record(&h, "stopper").await;

    h.control.write(&worker_key("stopper"), "").await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), daemon)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(!h.control.has(&worker_key("stopper")).await.unwrap());

    let events = events.lock();
    assert!(matches!(events.first(), Some(WorkerEvent::Started { .. })));
    assert!(matches!(events.last(), Some(WorkerEvent::Stopped { .. })));
}

#[tokio::test]
async fn test_client_stop_waits_for_acknowledgement() {
    let h = Harness::new();
    let config = fast_config(ExecutionMode::Inline);
    let (worker, _events) = worker(&h, "graceful", config.clone());
    let daemon = tokio::spawn(worker.start());
    wait_for_record(&h, "graceful").await;

    let control = WorkerControl::new(h.control.clone(), &config);
    let status = control.status("graceful").await.unwrap();
    assert_eq!(status.status, WorkerStatus::Started);
    assert_eq!(status.pid, Some(system::current_pid()));
    assert!(status.last_seen.is_some());

    assert!(control.stop("graceful").await.unwrap());
    assert!(!h.control.has(&worker_key("graceful")).await.unwrap());
    daemon.await.unwrap().unwrap();

    assert!(!control.stop("graceful").await.unwrap());
}

#[tokio::test]
async fn test_pause_and_resume() {
    let h = Harness::new();
    let config = fast_config(ExecutionMode::Inline);
    let (worker, events) = worker(&h, "pausable", config.clone());
    let control = WorkerControl::new(h.control.clone(), &config);

    let daemon = tokio::spawn(worker.start());
    wait_for_record(&h, "pausable").await;

    assert!(control.pause("pausable").await.unwrap());
    let ev = events.clone();
    assert!(eventually(|| async { ev.lock().iter().any(|e| matches!(e, WorkerEvent::Paused { .. })) }).await);

    enqueue_counting(&h, "pausable", "pause-resume").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runs("pause-resume"), 0);
    assert_eq!(control.status("pausable").await.unwrap().status, WorkerStatus::Paused);

    assert!(control.resume("pausable").await.unwrap());
    assert!(eventually(|| async { runs("pause-resume") == 1 }).await);

    control.stop("pausable").await.unwrap();
    daemon.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_restart_is_acknowledged() {
    let h = Harness::new();
    let config = fast_config(ExecutionMode::Pool);
    let (worker, events) = worker(&h, "restartable", config.clone());
    let control = WorkerControl::new(h.control.clone(), &config);

    let daemon = tokio::spawn(worker.start());
    wait_for_record(&h, "restartable").await;

    assert!(control.restart("restartable").await.unwrap());
    assert_eq!(control.status("restartable").await.unwrap().status, WorkerStatus::Started);
    let ev = events.clone();
    assert!(eventually(|| async { ev.lock().iter().any(|e| matches!(e, WorkerEvent::Restarted { .. })) }).await);

    control.stop("restartable").await.unwrap();
    daemon.await.unwrap().unwrap();
}

// ============================================================================
// Execution
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_mode_drains_queue() {
    let h = Harness::new();
    for i in 0..6 {
        enqueue_counting(&h, "pool", &format!("pool-{}", i)).await;
    }

    let config = fast_config(ExecutionMode::Pool);
    let (worker, events) = worker(&h, "pool", config.clone());
    let daemon = tokio::spawn(worker.start());

    let repo = h.repo.clone();
    assert!(eventually(|| async { repo.counts("pool").await.unwrap().success == 6 }).await);
    for i in 0..6 {
        assert_eq!(runs(&format!("pool-{}", i)), 1);
    }

    WorkerControl::new(h.control.clone(), &config).stop("pool").await.unwrap();
    daemon.await.unwrap().unwrap();

    let events = events.lock();
    let spawned: usize = events
        .iter()
        .filter_map(|e| match e {
            WorkerEvent::ChildrenSpawned { count, .. } => Some(*count),
            _ => None,
        })
        .sum();
    assert!(spawned >= 2);
    assert!(events.iter().all(|e| match e {
        WorkerEvent::ChildrenSpawned { count, .. } => *count <= 2,
        _ => true,
    }));
}

#[tokio::test]
async fn test_inline_mode_processes_jobs() {
    let h = Harness::new();
    enqueue_counting(&h, "inline", "inline-job").await;

    let config = fast_config(ExecutionMode::Inline);
    let (worker, events) = worker(&h, "inline", config.clone());
    let daemon = tokio::spawn(worker.start());

    assert!(eventually(|| async { runs("inline-job") == 1 }).await);
    let jobs = h.repo.jobs("inline");
    assert_eq!(jobs[0].status, JobStatus::Success);

    WorkerControl::new(h.control.clone(), &config).stop("inline").await.unwrap();
    daemon.await.unwrap().unwrap();
    assert!(!events
        .lock()
        .iter()
        .any(|e| matches!(e, WorkerEvent::ChildrenSpawned { .. })));
}

#[tokio::test]
async fn test_memory_pressure_suspends_dispatch() {
    let h = Harness::new();
    enqueue_counting(&h, "heavy", "memory-job").await;

    let config = WorkerConfig {
        memory_limit_mb: 64,
        ..fast_config(ExecutionMode::Inline)
    };
    let (worker, events) = worker(&h, "heavy", config.clone());
    let worker = worker.with_memory_probe(|| Some(4_u64 << 30));
    let daemon = tokio::spawn(worker.start());

    let ev = events.clone();
    assert!(
        eventually(|| async {
            ev.lock()
                .iter()
                .any(|e| matches!(e, WorkerEvent::MemoryCooldown { resident_mb: 4096, .. }))
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(runs("memory-job"), 0);

    WorkerControl::new(h.control.clone(), &config).stop("heavy").await.unwrap();
    daemon.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_token_stops_daemon() {
    let h = Harness::new();
    let (worker, events) = worker(&h, "local", fast_config(ExecutionMode::Pool));
    let token = worker.shutdown_token();
    let daemon = tokio::spawn(worker.start());
    wait_for_record(&h, "local").await;

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), daemon)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(!h.control.has(&worker_key("local")).await.unwrap());
    assert!(matches!(events.lock().last(), Some(WorkerEvent::Stopped { .. })));
}
