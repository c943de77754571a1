//! Queue worker daemon and the client used to control it.
//!
//! The daemon owns one queue. Each tick it reads the queue's control record,
//! reacts to the requested status, keeps its child pool topped up and
//! heartbeats back into the record:
//!
//! ```text
//!            ┌──────────── restarting ────────────┐
//!            ▼                                    │
//!  start ─▶ started ◀──── resume ────▶ paused     │
//!            │  ▲                                 │
//!            │  └─────────────────────────────────┘
//!            └── "" / SIGINT / SIGTERM ─▶ stopped (record deleted)
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::control::{
    clear_state, load_state, save_state, swap_state, worker_key, ControlState, ControlStore, WorkerStatus,
};
use crate::error::{ErrorCode, QueueError, Result};
use crate::jobs::dispatcher::{DispatchRun, QueueDispatcher};
use crate::jobs::pool::{ChildPool, ChildPoolStats};
use crate::system;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// How dispatch cycles are executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Bounded pool of child tasks
    #[default]
    Pool,
    /// One cycle per tick on the daemon task
    Inline,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Children running concurrently in pool mode
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Dispatch cycles a child runs before it exits
    #[serde(default = "default_iterations_per_child")]
    pub iterations_per_child: usize,

    /// Pause between a child's cycles
    #[serde(default = "default_child_pause", with = "humantime_serde")]
    pub child_pause: Duration,

    /// Daemon tick interval
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Tick interval while paused
    #[serde(default = "default_pause_poll", with = "humantime_serde")]
    pub pause_poll: Duration,

    /// Resident memory above which dispatch is suspended; 0 disables the check
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,

    #[serde(default = "default_memory_cooldown", with = "humantime_serde")]
    pub memory_cooldown: Duration,

    /// How long children get to exit before they are aborted
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,

    /// Client wait for stop/restart acknowledgement
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,

    #[serde(default = "default_ack_poll", with = "humantime_serde")]
    pub ack_poll: Duration,

    /// Heartbeat age after which a record is considered abandoned where the
    /// pid cannot be probed
    #[serde(default = "default_stale_after", with = "humantime_serde")]
    pub stale_after: Duration,

    #[serde(default)]
    pub mode: ExecutionMode,

    /// Stop on SIGINT/SIGTERM
    #[serde(default = "default_handle_signals")]
    pub handle_signals: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            iterations_per_child: default_iterations_per_child(),
            child_pause: default_child_pause(),
            poll_interval: default_poll_interval(),
            pause_poll: default_pause_poll(),
            memory_limit_mb: default_memory_limit_mb(),
            memory_cooldown: default_memory_cooldown(),
            shutdown_grace: default_shutdown_grace(),
            command_timeout: default_command_timeout(),
            ack_poll: default_ack_poll(),
            stale_after: default_stale_after(),
            mode: ExecutionMode::default(),
            handle_signals: default_handle_signals(),
        }
    }
}

fn default_max_workers() -> usize {
    4
}

fn default_iterations_per_child() -> usize {
    5
}

fn default_child_pause() -> Duration {
    Duration::from_millis(500)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_pause_poll() -> Duration {
    Duration::from_secs(2)
}

fn default_memory_limit_mb() -> u64 {
    512
}

fn default_memory_cooldown() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_command_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_ack_poll() -> Duration {
    Duration::from_millis(200)
}

fn default_stale_after() -> Duration {
    Duration::from_secs(120)
}

fn default_handle_signals() -> bool {
    true
}

// ═══════════════════════════════════════════════════════════════════════════════
// Events
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle notifications delivered to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Started { queue: String, pid: u32 },
    Paused { queue: String },
    Restarted { queue: String },
    MemoryCooldown { queue: String, resident_mb: u64 },
    ChildrenSpawned { queue: String, count: usize },
    ChildrenReaped { queue: String, count: usize },
    Stopped { queue: String },
}

pub type WorkerObserver = Arc<dyn Fn(&WorkerEvent) + Send + Sync>;

type MemoryProbe = fn() -> Option<u64>;

// ═══════════════════════════════════════════════════════════════════════════════
// Worker
// ═══════════════════════════════════════════════════════════════════════════════

/// Daemon serving one queue.
pub struct Worker {
    queue: String,
    dispatcher: QueueDispatcher,
    control: Arc<dyn ControlStore>,
    config: WorkerConfig,
    observers: Vec<WorkerObserver>,
    pool: ChildPool,
    shutdown: CancellationToken,
    /// Ends the signal listener once the daemon stops
    signal_guard: CancellationToken,
    signal_task: Option<JoinHandle<()>>,
    memory_probe: MemoryProbe,
    pid: u32,
    paused: bool,
}

impl Worker {
    pub fn new(
        queue: impl Into<String>,
        dispatcher: QueueDispatcher,
        control: Arc<dyn ControlStore>,
        config: WorkerConfig,
    ) -> Self {
        let queue = queue.into();
        let pool = ChildPool::new(queue.clone(), config.max_workers);
        let shutdown = CancellationToken::new();
        let signal_guard = shutdown.child_token();
        Self {
            queue,
            dispatcher,
            control,
            config,
            observers: Vec::new(),
            pool,
            shutdown,
            signal_guard,
            signal_task: None,
            memory_probe: system::resident_memory_bytes,
            pid: system::current_pid(),
            paused: false,
        }
    }

    pub fn with_observer(mut self, observer: impl Fn(&WorkerEvent) + Send + Sync + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Replace the resident memory probe.
    pub fn with_memory_probe(mut self, probe: MemoryProbe) -> Self {
        self.memory_probe = probe;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Cancelling this token stops the daemon on its next tick.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn pool_stats(&self) -> ChildPoolStats {
        self.pool.stats()
    }

    /// Claim the queue and run until stopped.
    ///
    /// Fails with `WorkerAlreadyRunning` when the control record names a live
    /// process.
    pub async fn start(mut self) -> Result<()> {
        self.claim().await?;
        if self.config.handle_signals {
            self.listen_for_signals()?;
        }

        tracing::info!(
            queue = %self.queue,
            pid = self.pid,
            mode = ?self.config.mode,
            max_workers = self.config.max_workers,
            store = self.control.name(),
            "Worker started"
        );
        self.emit(WorkerEvent::Started {
            queue: self.queue.clone(),
            pid: self.pid,
        });

        self.run_loop().await;
        self.stop().await;
        Ok(())
    }

    async fn claim(&self) -> Result<()> {
        if let Some(state) = load_state(self.control.as_ref(), &self.queue).await? {
            if let Some(pid) = state.pid {
                if owner_alive(&state, self.config.stale_after) {
                    return Err(QueueError::worker_already_running(&self.queue, pid));
                }
                tracing::warn!(queue = %self.queue, stale_pid = pid, "Taking over abandoned control record");
            }
        }
        save_state(
            self.control.as_ref(),
            &self.queue,
            &ControlState::started(self.pid, Utc::now()),
        )
        .await
    }

    fn listen_for_signals(&mut self) -> Result<()> {
        #[cfg(unix)]
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .map_err(|e| {
                QueueError::with_internal(
                    ErrorCode::SignalRegistrationFailed,
                    "Failed to install SIGTERM handler",
                    e.to_string(),
                )
            })?;

        let shutdown = self.shutdown.clone();
        let guard = self.signal_guard.clone();
        let queue = self.queue.clone();
        self.signal_task = Some(tokio::spawn(async move {
            let ctrl_c = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "Ctrl+C handler unavailable");
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                terminate.recv().await;
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => {},
                _ = terminate => {},
                _ = guard.cancelled() => return,
            }

            tracing::info!(queue = %queue, "Shutdown signal received");
            shutdown.cancel();
        }));
        Ok(())
    }

    async fn run_loop(&mut self) {
        loop {
            if self.shutdown.is_cancelled() {
                return;
            }

            let state = match load_state(self.control.as_ref(), &self.queue).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(queue = %self.queue, error = %e, "Could not read control record");
                    self.sleep(self.config.poll_interval).await;
                    continue;
                }
            };

            let Some(state) = state.filter(|s| !s.is_stop_request()) else {
                tracing::info!(queue = %self.queue, "Stop requested");
                return;
            };

            let wait = match state.status {
                WorkerStatus::Restarting => {
                    self.restart().await;
                    self.config.poll_interval
                }
                WorkerStatus::Paused => {
                    if !self.paused {
                        self.paused = true;
                        tracing::info!(queue = %self.queue, "Worker paused");
                        self.emit(WorkerEvent::Paused {
                            queue: self.queue.clone(),
                        });
                    }
                    self.config.pause_poll
                }
                WorkerStatus::Started | WorkerStatus::Stopped => {
                    if self.paused {
                        self.paused = false;
                        tracing::info!(queue = %self.queue, "Worker resumed");
                    }
                    match self.memory_pressure() {
                        Some(resident_mb) => {
                            tracing::warn!(
                                queue = %self.queue,
                                resident_mb,
                                limit_mb = self.config.memory_limit_mb,
                                "Memory limit exceeded, cooling down"
                            );
                            self.emit(WorkerEvent::MemoryCooldown {
                                queue: self.queue.clone(),
                                resident_mb,
                            });
                            self.config.memory_cooldown
                        }
                        None => {
                            self.execute().await;
                            self.config.poll_interval
                        }
                    }
                }
            };

            self.heartbeat().await;
            self.sleep(wait).await;
        }
    }

    /// Resident MB when above the configured limit.
    fn memory_pressure(&self) -> Option<u64> {
        if self.config.memory_limit_mb == 0 {
            return None;
        }
        let resident_mb = (self.memory_probe)()? / (1024 * 1024);
        (resident_mb > self.config.memory_limit_mb).then_some(resident_mb)
    }

    async fn execute(&mut self) {
        let run = self.dispatcher.pending(self.queue.clone());

        match self.config.mode {
            ExecutionMode::Inline => {
                if let Err(e) = run.run().await {
                    e.with_context("queue", &self.queue).log();
                }
            }
            ExecutionMode::Pool => {
                let reaped = self.pool.reap();
                if reaped > 0 {
                    self.emit(WorkerEvent::ChildrenReaped {
                        queue: self.queue.clone(),
                        count: reaped,
                    });
                }

                let iterations = self.config.iterations_per_child;
                let pause = self.config.child_pause;
                let spawned = self
                    .pool
                    .fill(|cancel| run_child(run.clone(), iterations, pause, cancel));
                if spawned > 0 {
                    self.emit(WorkerEvent::ChildrenSpawned {
                        queue: self.queue.clone(),
                        count: spawned,
                    });
                }
            }
        }
    }

    async fn restart(&mut self) {
        tracing::info!(queue = %self.queue, "Restart requested");
        self.pool.terminate_all(self.config.shutdown_grace).await;
        self.paused = false;

        match self.acknowledge_restart().await {
            Ok(true) => self.emit(WorkerEvent::Restarted {
                queue: self.queue.clone(),
            }),
            Ok(false) => tracing::info!(queue = %self.queue, "Restart superseded by a newer command"),
            Err(e) => tracing::error!(queue = %self.queue, error = %e, "Could not acknowledge restart"),
        }
    }

    /// Write a fresh `started` record if the restart request is still current.
    async fn acknowledge_restart(&self) -> Result<bool> {
        let Some(raw) = self.control.read(&worker_key(&self.queue)).await? else {
            return Ok(false);
        };
        if ControlState::parse(&raw).status != WorkerStatus::Restarting {
            return Ok(false);
        }
        let fresh = ControlState::started(self.pid, Utc::now());
        swap_state(self.control.as_ref(), &self.queue, &raw, &fresh).await
    }

    async fn heartbeat(&self) {
        if let Err(e) = self.refresh_record().await {
            tracing::warn!(queue = %self.queue, error = %e, "Heartbeat failed");
        }
    }

    /// Refresh pid and last_seen without touching the requested status. A
    /// command written since the read wins; the refresh is skipped.
    async fn refresh_record(&self) -> Result<()> {
        let Some(raw) = self.control.read(&worker_key(&self.queue)).await? else {
            return Ok(());
        };
        let state = ControlState::parse(&raw);
        if state.is_stop_request() {
            return Ok(());
        }

        let refreshed = ControlState {
            pid: Some(self.pid),
            last_seen: Some(Utc::now()),
            ..state
        };
        if !swap_state(self.control.as_ref(), &self.queue, &raw, &refreshed).await? {
            tracing::debug!(queue = %self.queue, "Control record changed during heartbeat, skipped");
        }
        Ok(())
    }

    async fn stop(&mut self) {
        self.signal_guard.cancel();
        if let Some(listener) = self.signal_task.take() {
            if let Err(e) = listener.await {
                tracing::warn!(queue = %self.queue, error = %e, "Signal listener ended abnormally");
            }
        }

        let killed = self.pool.terminate_all(self.config.shutdown_grace).await;
        if let Err(e) = clear_state(self.control.as_ref(), &self.queue).await {
            tracing::error!(queue = %self.queue, error = %e, "Could not remove control record");
        }

        let stats = self.pool.stats();
        tracing::info!(
            queue = %self.queue,
            pid = self.pid,
            children_spawned = stats.spawned,
            children_killed = killed,
            "Worker stopped"
        );
        self.emit(WorkerEvent::Stopped {
            queue: self.queue.clone(),
        });
    }

    async fn sleep(&self, duration: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {},
            _ = tokio::time::sleep(duration) => {},
        }
    }

    fn emit(&self, event: WorkerEvent) {
        for observer in &self.observers {
            observer(&event);
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("queue", &self.queue)
            .field("pid", &self.pid)
            .field("config", &self.config)
            .field("observers", &self.observers.len())
            .finish()
    }
}

async fn run_child(run: DispatchRun, iterations: usize, pause: Duration, cancel: CancellationToken) {
    for _ in 0..iterations {
        if cancel.is_cancelled() {
            break;
        }
        if let Err(e) = run.run().await {
            e.with_context("queue", run.queue()).log();
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {},
        }
    }
}

/// Whether the process named in `state` still runs. Falls back to heartbeat
/// age where pids cannot be probed.
fn owner_alive(state: &ControlState, stale_after: Duration) -> bool {
    let Some(pid) = state.pid else {
        return false;
    };
    if let Some(alive) = system::process_alive(pid) {
        return alive;
    }
    let stale_after = chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::days(365));
    state
        .last_seen
        .map(|seen| Utc::now() - seen < stale_after)
        .unwrap_or(false)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Control Client
// ═══════════════════════════════════════════════════════════════════════════════

/// What `WorkerControl::status` reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatusReport {
    pub queue: String,
    pub status: WorkerStatus,
    pub pid: Option<u32>,
    pub alive: bool,
    pub last_seen: Option<chrono::DateTime<Utc>>,
}

/// Admin side of the control record.
#[derive(Clone)]
pub struct WorkerControl {
    store: Arc<dyn ControlStore>,
    command_timeout: Duration,
    ack_poll: Duration,
    stale_after: Duration,
}

impl WorkerControl {
    pub fn new(store: Arc<dyn ControlStore>, config: &WorkerConfig) -> Self {
        Self {
            store,
            command_timeout: config.command_timeout,
            ack_poll: config.ack_poll,
            stale_after: config.stale_after,
        }
    }

    /// Ask the daemon to exit and wait until it removed its record. Returns
    /// `false` when no daemon was recorded.
    pub async fn stop(&self, queue: &str) -> Result<bool> {
        let Some(state) = load_state(self.store.as_ref(), queue).await? else {
            return Ok(false);
        };
        save_state(self.store.as_ref(), queue, &state.with_status(WorkerStatus::Stopped)).await?;

        let key = worker_key(queue);
        self.wait_for(queue, "stop", || async { Ok::<_, QueueError>(!self.store.has(&key).await?) })
            .await?;
        tracing::info!(queue = %queue, "Worker stopped");
        Ok(true)
    }

    /// Ask the daemon to restart its children and wait for the acknowledgement.
    pub async fn restart(&self, queue: &str) -> Result<bool> {
        let Some(state) = load_state(self.store.as_ref(), queue).await? else {
            return Ok(false);
        };
        save_state(self.store.as_ref(), queue, &state.with_status(WorkerStatus::Restarting)).await?;

        self.wait_for(queue, "restart", || async {
            let state = load_state(self.store.as_ref(), queue).await?;
            Ok::<_, QueueError>(state.map_or(true, |s| s.status != WorkerStatus::Restarting))
        })
        .await?;
        tracing::info!(queue = %queue, "Worker restarted");
        Ok(true)
    }

    pub async fn pause(&self, queue: &str) -> Result<bool> {
        self.set_status(queue, WorkerStatus::Paused).await
    }

    pub async fn resume(&self, queue: &str) -> Result<bool> {
        self.set_status(queue, WorkerStatus::Started).await
    }

    pub async fn status(&self, queue: &str) -> Result<WorkerStatusReport> {
        let report = match load_state(self.store.as_ref(), queue).await? {
            Some(state) => WorkerStatusReport {
                queue: queue.to_string(),
                status: state.status,
                pid: state.pid,
                alive: owner_alive(&state, self.stale_after),
                last_seen: state.last_seen,
            },
            None => WorkerStatusReport {
                queue: queue.to_string(),
                status: WorkerStatus::Stopped,
                pid: None,
                alive: false,
                last_seen: None,
            },
        };
        Ok(report)
    }

    async fn set_status(&self, queue: &str, status: WorkerStatus) -> Result<bool> {
        let Some(state) = load_state(self.store.as_ref(), queue).await? else {
            return Ok(false);
        };
        save_state(self.store.as_ref(), queue, &state.with_status(status)).await?;
        tracing::info!(queue = %queue, status = %status, "Worker status set");
        Ok(true)
    }

    async fn wait_for<F, Fut>(&self, queue: &str, action: &str, mut done: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<bool>>,
    {
        let started = Instant::now();
        loop {
            if done().await? {
                return Ok(());
            }
            if started.elapsed() >= self.command_timeout {
                return Err(QueueError::control_timeout(queue, action, self.command_timeout.as_secs()));
            }
            tokio::time::sleep(self.ack_poll).await;
        }
    }
}

impl fmt::Debug for WorkerControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerControl")
            .field("store", &self.store.name())
            .field("command_timeout", &self.command_timeout)
            .finish()
    }
}
