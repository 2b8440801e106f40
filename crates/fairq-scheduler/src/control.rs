//! Control surface over a running scheduler
//!
//! Reads go through the snapshot the scheduler publishes after every cycle.
//! Mutations are sent as commands and applied by the scheduler task itself.

use chrono::{DateTime, Utc};
use fairq_core::{FairqError, FairqResult, Job};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;
use uuid::Uuid;

use crate::gpu_allocator::DeviceStatus;

/// Predicate selecting pending jobs for deletion
pub type JobPredicate = Box<dyn Fn(&Job) -> bool + Send + Sync>;

/// Commands applied by the scheduler task
pub enum ControlCommand {
    /// Remove matching jobs from the pending queue, replying with the count
    DeletePending {
        predicate: JobPredicate,
        reply: oneshot::Sender<usize>,
    },
    /// Empty the history, replying with the number of removed jobs
    ClearHistory { reply: oneshot::Sender<usize> },
}

/// Lifecycle of the scheduler loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    NotStarted,
    Running,
    Terminated,
}

impl std::fmt::Display for SchedulerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerPhase::NotStarted => write!(f, "not started"),
            SchedulerPhase::Running => write!(f, "running"),
            SchedulerPhase::Terminated => write!(f, "terminated"),
        }
    }
}

/// Lifecycle of the ingestion worker feeding the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestPhase {
    NotStarted,
    Running,
    Stopped,
}

impl std::fmt::Display for IngestPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestPhase::NotStarted => write!(f, "not started"),
            IngestPhase::Running => write!(f, "running"),
            IngestPhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// Ingestion worker state as shown in the status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestStatus {
    pub phase: IngestPhase,
    /// `subprocess` or `task`
    pub mode: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Only while running
    pub uptime_secs: Option<i64>,
}

#[derive(Debug)]
struct IngestState {
    phase: IngestPhase,
    mode: Option<String>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
}

impl Default for IngestState {
    fn default() -> Self {
        Self {
            phase: IngestPhase::NotStarted,
            mode: None,
            started_at: None,
            stopped_at: None,
        }
    }
}

/// Shared record of the ingestion worker's lifecycle
///
/// The daemon marks the start; either the daemon or the scheduler (when
/// the ticket channel closes) marks the stop, whichever comes first.
#[derive(Debug, Clone, Default)]
pub struct IngestTracker {
    state: Arc<Mutex<IngestState>>,
}

impl IngestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, IngestState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn started(&self, mode: &str) {
        let mut state = self.state();
        state.phase = IngestPhase::Running;
        state.mode = Some(mode.to_string());
        state.started_at = Some(Utc::now());
        state.stopped_at = None;
    }

    /// Idempotent; the first stop time is kept
    pub fn stopped(&self) {
        let mut state = self.state();
        if state.phase == IngestPhase::Stopped {
            return;
        }
        state.phase = IngestPhase::Stopped;
        state.stopped_at = Some(Utc::now());
    }

    pub fn status(&self) -> IngestStatus {
        let state = self.state();
        let uptime_secs = match state.phase {
            IngestPhase::Running => state
                .started_at
                .map(|started| (Utc::now() - started).num_seconds()),
            _ => None,
        };
        IngestStatus {
            phase: state.phase,
            mode: state.mode.clone(),
            started_at: state.started_at,
            stopped_at: state.stopped_at,
            uptime_secs,
        }
    }
}

/// Per-user statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStats {
    pub user: String,
    /// Fairness penalty, rounded to four decimals
    pub penalty: f64,
    /// Jobs of the user in history
    pub jobs_run: usize,
    /// Jobs of the user waiting in the pending queue
    pub jobs_enqueued: usize,
}

/// State published by the scheduler task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSnapshot {
    pub phase: SchedulerPhase,
    pub started_at: Option<DateTime<Utc>>,
    pub pending: Vec<Job>,
    pub running: Vec<Job>,
    /// Most recent first
    pub history: Vec<Job>,
    pub users: Vec<UserStats>,
    pub gpus: DeviceStatus,
    pub updated_at: DateTime<Utc>,
}

impl Default for SchedulerSnapshot {
    fn default() -> Self {
        Self {
            phase: SchedulerPhase::NotStarted,
            started_at: None,
            pending: Vec::new(),
            running: Vec::new(),
            history: Vec::new(),
            users: Vec::new(),
            gpus: DeviceStatus::default(),
            updated_at: Utc::now(),
        }
    }
}

/// Summary returned by the status query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub phase: SchedulerPhase,
    pub uptime_secs: Option<i64>,
    pub locked: bool,
    pub locked_since: Option<DateTime<Utc>>,
    pub pending_count: usize,
    pub running_count: usize,
    pub history_count: usize,
    pub users: Vec<UserStats>,
    pub gpus: DeviceStatus,
    pub ingest: IngestStatus,
}

/// Gate pausing all queue mutation of the scheduler
///
/// Has no timeout; a forgotten lock starves the queue and only shows up in
/// the status report.
#[derive(Debug, Clone, Default)]
pub struct LockGate {
    locked: Arc<AtomicBool>,
    since: Arc<Mutex<Option<DateTime<Utc>>>>,
}

impl LockGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Take the lock; false when it was already held
    pub fn lock(&self) -> bool {
        let mut since = self.since.lock().unwrap_or_else(|e| e.into_inner());
        if self.locked.swap(true, Ordering::SeqCst) {
            return false;
        }
        *since = Some(Utc::now());
        true
    }

    /// Release the lock; false when it was not held
    pub fn unlock(&self) -> bool {
        let mut since = self.since.lock().unwrap_or_else(|e| e.into_inner());
        if !self.locked.swap(false, Ordering::SeqCst) {
            return false;
        }
        *since = None;
        true
    }

    /// Instant the current lock was taken
    pub fn locked_since(&self) -> Option<DateTime<Utc>> {
        *self.since.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cloneable handle to a scheduler task
#[derive(Clone)]
pub struct ControlHandle {
    commands: mpsc::Sender<ControlCommand>,
    snapshots: watch::Receiver<SchedulerSnapshot>,
    lock: LockGate,
    shutdown: Arc<watch::Sender<bool>>,
    ingest: IngestTracker,
}

impl ControlHandle {
    pub(crate) fn new(
        commands: mpsc::Sender<ControlCommand>,
        snapshots: watch::Receiver<SchedulerSnapshot>,
        lock: LockGate,
        shutdown: Arc<watch::Sender<bool>>,
        ingest: IngestTracker,
    ) -> Self {
        Self {
            commands,
            snapshots,
            lock,
            shutdown,
            ingest,
        }
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> SchedulerSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Receiver notified whenever a new snapshot is published
    pub fn subscribe(&self) -> watch::Receiver<SchedulerSnapshot> {
        self.snapshots.clone()
    }

    pub fn status(&self) -> StatusReport {
        let snapshot = self.snapshots.borrow();
        let uptime_secs = match snapshot.phase {
            SchedulerPhase::Running => snapshot
                .started_at
                .map(|started| (Utc::now() - started).num_seconds()),
            _ => None,
        };

        StatusReport {
            phase: snapshot.phase,
            uptime_secs,
            locked: self.lock.is_locked(),
            locked_since: self.lock.locked_since(),
            pending_count: snapshot.pending.len(),
            running_count: snapshot.running.len(),
            history_count: snapshot.history.len(),
            users: snapshot.users.clone(),
            gpus: snapshot.gpus.clone(),
            ingest: self.ingest.status(),
        }
    }

    /// Record that the ingestion worker is up
    pub fn ingest_started(&self, mode: &str) {
        self.ingest.started(mode);
        info!(mode = mode, "Ingestion started");
    }

    pub fn ingest_stopped(&self) {
        self.ingest.stopped();
    }

    pub fn ingest_status(&self) -> IngestStatus {
        self.ingest.status()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn lock(&self) -> bool {
        let changed = self.lock.lock();
        if changed {
            info!("Queue locked");
        }
        changed
    }

    pub fn unlock(&self) -> bool {
        let changed = self.lock.unlock();
        if changed {
            info!("Queue unlocked");
        }
        changed
    }

    /// Delete pending jobs matching the predicate
    pub async fn delete_pending<F>(&self, predicate: F) -> FairqResult<usize>
    where
        F: Fn(&Job) -> bool + Send + Sync + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::DeletePending {
            predicate: Box::new(predicate),
            reply,
        })
        .await?;
        rx.await.map_err(|_| scheduler_gone())
    }

    /// Delete pending jobs by id
    pub async fn delete_pending_ids(&self, ids: Vec<Uuid>) -> FairqResult<usize> {
        self.delete_pending(move |job| ids.contains(&job.id)).await
    }

    /// Delete pending jobs by name
    pub async fn delete_pending_names(&self, names: Vec<String>) -> FairqResult<usize> {
        self.delete_pending(move |job| names.iter().any(|n| n == job.name()))
            .await
    }

    pub async fn clear_history(&self) -> FairqResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(ControlCommand::ClearHistory { reply }).await?;
        rx.await.map_err(|_| scheduler_gone())
    }

    /// Set the shared termination flag
    pub fn request_shutdown(&self) {
        if !self.shutdown.send_replace(true) {
            info!("Shutdown requested");
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Receiver of the shared termination flag
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    async fn send(&self, command: ControlCommand) -> FairqResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| scheduler_gone())
    }
}

fn scheduler_gone() -> FairqError {
    FairqError::Internal("scheduler is not running".to_string())
}
