//! Integration tests for the claim and execute engine.
//!
//! Tests cover:
//! - Success, retry and exhaustion paths
//! - Exactly-once execution under concurrent passes
//! - Lost claim races and the stuck-reservation sweep
//! - Corrupt and unknown payloads
//! - Pause handling, recurring tasks and deferred follow-ups
//! - The failed-job sweep
//! - Payload round trips

mod common;

use chrono::Duration;
use serde_json::json;
use std::collections::BTreeMap;

use common::{runs, seen, Chain, Customer, FailingTask, Harness, Invoice, Token};
use taskq_core::control::{save_state, ControlState, WorkerStatus};
use taskq_core::jobs::{
    Clock, DispatchOutcome, DispatchReport, DispatcherConfig, EchoData, EchoTask, JobPayload, JobRepository, JobStatus,
    NewJob, Queue,
};

fn report(outcome: DispatchOutcome) -> DispatchReport {
    match outcome {
        DispatchOutcome::Completed(report) => report,
        DispatchOutcome::Paused { queue } => panic!("queue {} unexpectedly paused", queue),
    }
}

// ============================================================================
// Outcomes
// ============================================================================

#[tokio::test]
async fn test_successful_job_is_marked_success() {
    let h = Harness::new();
    let queue = Queue::new(h.manager.clone());
    queue
        .dispatch::<EchoTask>(
            "mail",
            &EchoData {
                message: "welcome aboard".into(),
                fail: false,
            },
        )
        .await
        .unwrap();

    let r = report(h.dispatcher(DispatcherConfig::default()).pending("mail").run().await.unwrap());
    assert_eq!(r.fetched, 1);
    assert_eq!(r.processed, 1);

    let jobs = h.repo.jobs("mail");
    assert_eq!(jobs[0].status, JobStatus::Success);
    assert_eq!(jobs[0].message.as_deref(), Some("welcome aboard"));
    assert!(jobs[0].reserved_at.is_none());
}

#[tokio::test]
async fn test_mail_scenario_retries_then_fails() {
    let h = Harness::new();
    let config = DispatcherConfig {
        max_retries: 2,
        retry_delay_minutes: 1,
        ..Default::default()
    };
    let dispatcher = h.dispatcher(config);
    for i in 0..3 {
        h.manager
            .job_for::<FailingTask>("mail", &Token::new(format!("mail-scenario-{}", i)))
            .unwrap()
            .queue()
            .await
            .unwrap();
    }

    let first = report(dispatcher.pending("mail").run().await.unwrap());
    assert_eq!(first.retried, 3);
    for job in h.repo.jobs("mail") {
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert!(job.reserved_at.is_none());
        assert_eq!(job.run_after, h.clock.now() + Duration::minutes(1));
    }

    // Not due yet.
    let early = report(dispatcher.pending("mail").run().await.unwrap());
    assert_eq!(early.fetched, 0);

    h.clock.advance(Duration::minutes(1));
    let second = report(dispatcher.pending("mail").run().await.unwrap());
    assert_eq!(second.failed, 3);
    for job in h.repo.jobs("mail") {
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.message.as_deref(), Some("mail server refused connection"));
    }

    h.clock.advance(Duration::minutes(10));
    let after = report(dispatcher.pending("mail").run().await.unwrap());
    assert_eq!(after.fetched, 0);
    for i in 0..3 {
        assert_eq!(runs(&format!("mail-scenario-{}", i)), 2);
    }
}

// ============================================================================
// Claiming
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_passes_execute_each_job_once() {
    let h = Harness::new();
    for i in 0..20 {
        h.manager
            .job("bulk", "counting", json!({"token": format!("once-{}", i)}))
            .unwrap()
            .queue()
            .await
            .unwrap();
    }

    let dispatcher = h.dispatcher(DispatcherConfig {
        batch_size: 50,
        ..Default::default()
    });
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let run = dispatcher.pending("bulk");
            tokio::spawn(async move { run.run().await })
        })
        .collect();

    let mut processed = 0;
    for handle in handles {
        processed += report(handle.await.unwrap().unwrap()).processed;
    }

    assert_eq!(processed, 20);
    for i in 0..20 {
        assert_eq!(runs(&format!("once-{}", i)), 1, "job once-{} ran more than once", i);
    }
    assert!(h.repo.jobs("bulk").iter().all(|j| j.status == JobStatus::Success));
}

#[tokio::test]
async fn test_lost_claim_race_is_skipped() {
    let h = Harness::new();
    let job = h
        .manager
        .job("race", "counting", json!({"token": "race-lost"}))
        .unwrap()
        .queue()
        .await
        .unwrap();

    // Another executor holds the row lock.
    let mut tx = h.repo.begin().await.unwrap();
    let locked = tx.lock_job(job.id).await.unwrap().unwrap();

    let run = h.dispatcher(DispatcherConfig::default()).pending("race");
    let pass = tokio::spawn(async move { run.run().await });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    tx.reserve(&locked).await.unwrap();
    tx.commit().await.unwrap();

    let r = report(pass.await.unwrap().unwrap());
    assert_eq!(r.fetched, 1);
    assert_eq!(r.skipped, 1);
    assert_eq!(r.processed, 0);
    assert_eq!(runs("race-lost"), 0);
}

#[tokio::test]
async fn test_stuck_reservations_are_reclaimed() {
    let h = Harness::new();
    let stale = h
        .manager
        .job("stuck", "counting", json!({"token": "stuck-stale"}))
        .unwrap()
        .queue()
        .await
        .unwrap();
    let fresh = h
        .manager
        .job("stuck", "counting", json!({"token": "stuck-fresh"}))
        .unwrap()
        .queue()
        .await
        .unwrap();

    for (job, wait) in [(&stale, 10), (&fresh, 6)] {
        let mut tx = h.repo.begin().await.unwrap();
        let locked = tx.lock_job(job.id).await.unwrap().unwrap();
        tx.reserve(&locked).await.unwrap();
        tx.commit().await.unwrap();
        h.clock.advance(Duration::minutes(wait));
    }

    let r = report(h.dispatcher(DispatcherConfig::default()).pending("stuck").run().await.unwrap());
    assert_eq!(r.reclaimed, 1);
    assert_eq!(r.processed, 1);

    let fresh = h.repo.job_by_id(fresh.id).await.unwrap().unwrap();
    assert_eq!(fresh.status, JobStatus::Pending);
    assert!(fresh.reserved_at.is_some());
    assert_eq!(runs("stuck-stale"), 1);
}

// ============================================================================
// Payloads
// ============================================================================

#[tokio::test]
async fn test_corrupt_and_unknown_payloads_fail() {
    let h = Harness::new();
    for payload in [
        json!({"garbage": true}),
        json!({"type": "rm_rf", "data": {}}),
        json!({"type": "echo", "data": {"msg": 1}}),
    ] {
        h.repo
            .create(NewJob {
                queue: "bad".into(),
                payload,
                run_after: h.clock.now(),
            })
            .await
            .unwrap();
    }

    let r = report(
        h.dispatcher(DispatcherConfig {
            max_retries: 1,
            ..Default::default()
        })
        .pending("bad")
        .run()
        .await
        .unwrap(),
    );
    assert_eq!(r.failed, 3);

    let jobs = h.repo.jobs("bad");
    assert!(jobs.iter().all(|j| j.status == JobStatus::Failed && j.attempts == 1));
    assert!(jobs[0].message.as_deref().unwrap().contains("corrupt"));
    assert!(jobs[1].message.as_deref().unwrap().contains("rm_rf"));
    assert!(jobs[2].message.as_deref().unwrap().contains("echo"));
}

#[tokio::test]
async fn test_payload_round_trip() {
    let h = Harness::new();
    let invoice = Invoice {
        token: "round-trip".into(),
        customer: Customer {
            id: u64::MAX,
            email: "ops@example.com".into(),
        },
        lines: vec![("widget".into(), 3), ("ünïcödé".into(), 0)],
        notes: None,
        tags: BTreeMap::from([("priority".to_string(), true)]),
    };
    let job = Queue::new(h.manager.clone())
        .dispatch::<common::RecordingTask>("billing", &invoice)
        .await
        .unwrap();

    let envelope = JobPayload::from_value(&job.payload).unwrap();
    assert_eq!(envelope.task_type, "recording");

    h.dispatcher(DispatcherConfig::default()).pending("billing").run().await.unwrap();
    let decoded: Invoice = serde_json::from_value(seen("round-trip").unwrap()).unwrap();
    assert_eq!(decoded, invoice);
}

// ============================================================================
// Pause, recurrence and deferral
// ============================================================================

#[tokio::test]
async fn test_paused_queue_resumes() {
    let h = Harness::new();
    h.manager
        .job("paused", "counting", json!({"token": "paused-job"}))
        .unwrap()
        .queue()
        .await
        .unwrap();
    let dispatcher = h.dispatcher(DispatcherConfig::default());

    let paused = ControlState::started(1, chrono::Utc::now()).with_status(WorkerStatus::Paused);
    save_state(h.control.as_ref(), "paused", &paused).await.unwrap();
    let outcome = dispatcher.pending("paused").run().await.unwrap();
    assert!(outcome.is_paused());
    assert_eq!(runs("paused-job"), 0);

    save_state(h.control.as_ref(), "paused", &paused.with_status(WorkerStatus::Started))
        .await
        .unwrap();
    assert_eq!(report(dispatcher.pending("paused").run().await.unwrap()).processed, 1);

    // Pause checks can be disabled.
    let unchecked = h.dispatcher(DispatcherConfig {
        check_pause: false,
        ..Default::default()
    });
    assert!(!unchecked.pending("paused").run().await.unwrap().is_paused());
}

#[tokio::test]
async fn test_recurring_task_reenqueues_after_success() {
    let h = Harness::new();
    h.manager
        .job("cron", "recurring", json!({"token": "recurring"}))
        .unwrap()
        .queue()
        .await
        .unwrap();
    let dispatcher = h.dispatcher(DispatcherConfig::default());

    // First run is scheduled ten minutes out.
    assert_eq!(report(dispatcher.pending("cron").run().await.unwrap()).fetched, 0);
    h.clock.advance(Duration::minutes(10));
    assert_eq!(report(dispatcher.pending("cron").run().await.unwrap()).processed, 1);

    let jobs = h.repo.jobs("cron");
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].status, JobStatus::Success);
    assert_eq!(jobs[1].status, JobStatus::Pending);
    assert_eq!(jobs[1].payload, jobs[0].payload);
    assert_eq!(jobs[1].run_after, h.clock.now() + Duration::minutes(10));
}

#[tokio::test]
async fn test_deferred_jobs_follow_the_outcome() {
    let h = Harness::new();
    for (token, fail) in [("chain-ok", false), ("chain-fail", true)] {
        h.manager
            .job_for::<common::ChainTask>(
                "chain",
                &Chain {
                    token: token.into(),
                    fail_after_defer: fail,
                },
            )
            .unwrap()
            .queue()
            .await
            .unwrap();
    }

    let r = report(h.dispatcher(DispatcherConfig::default()).pending("chain").run().await.unwrap());
    assert_eq!(r.processed, 1);
    assert_eq!(r.retried, 1);

    let follow_ups: Vec<_> = h
        .repo
        .jobs("chain")
        .into_iter()
        .filter(|j| j.task_type() == Some("counting"))
        .collect();
    assert_eq!(follow_ups.len(), 1);
    assert_eq!(follow_ups[0].payload["data"]["token"], "chain-ok-follow-up");
}

#[tokio::test]
async fn test_facade_deferred_until_flush() {
    let h = Harness::new();
    let queue = Queue::new(h.manager.clone());
    queue
        .deferred::<EchoTask>(
            "later",
            &EchoData {
                message: "after commit".into(),
                fail: false,
            },
        )
        .unwrap();
    assert!(h.repo.is_empty());
    assert_eq!(queue.deferred_len(), 1);

    let created = queue.flush_deferred().await.unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(h.repo.jobs("later").len(), 1);
}

// ============================================================================
// Failed Sweep
// ============================================================================

#[tokio::test]
async fn test_failed_sweep_requeues_jobs_with_retries_left() {
    let h = Harness::new();
    for i in 0..2 {
        h.manager
            .job_for::<FailingTask>("sweep", &Token::new(format!("sweep-{}", i)))
            .unwrap()
            .queue()
            .await
            .unwrap();
    }
    let strict = h.dispatcher(DispatcherConfig {
        max_retries: 1,
        ..Default::default()
    });
    assert_eq!(report(strict.pending("sweep").run().await.unwrap()).failed, 2);

    // Exhaust the second job beyond the sweep limit.
    let jobs = h.repo.jobs("sweep");
    h.repo.mark_failed(&jobs[1], "again").await.unwrap();
    h.repo.mark_failed(&jobs[1], "again").await.unwrap();

    let sweeper = h.dispatcher(DispatcherConfig {
        max_retries: 3,
        retry_delay_minutes: 2,
        ..Default::default()
    });
    let r = report(sweeper.failed("sweep").run().await.unwrap());
    assert_eq!(r.fetched, 1);
    assert_eq!(r.requeued, 1);

    let requeued = h.repo.job_by_id(jobs[0].id).await.unwrap().unwrap();
    assert_eq!(requeued.status, JobStatus::Pending);
    assert_eq!(requeued.attempts, 2);
    assert_eq!(requeued.run_after, h.clock.now() + Duration::minutes(2));

    let exhausted = h.repo.job_by_id(jobs[1].id).await.unwrap().unwrap();
    assert_eq!(exhausted.status, JobStatus::Failed);
    assert_eq!(exhausted.attempts, 3);
}
