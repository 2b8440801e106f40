//! Main scheduler logic
//!
//! The scheduler task is the only owner of the pending queue, the running
//! set and the history. Tickets arrive over the ingestion channel, control
//! commands over the command channel, and every other reader sees the
//! published snapshot.

use chrono::Utc;
use fairq_core::{
    DaemonConfig, DeviceVisibility, FairqError, FairqResult, Job, JobTicket, OutputCursor,
};
use fairq_runtime::ContainerRuntime;
use fairq_store::{QueueKind, QueueStore};
use std::collections::{BTreeSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::control::{
    ControlCommand, ControlHandle, IngestTracker, LockGate, SchedulerPhase, SchedulerSnapshot,
    UserStats,
};
use crate::fairness::{penalties, rounded, sort_pending};
use crate::gpu_allocator::{DeviceStatus, GpuAllocator};

/// Capacity of the control command channel
const COMMAND_BUFFER: usize = 32;

/// How long shutdown waits for ingestion to close the ticket channel
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Maximum number of jobs kept in history
    pub max_history: usize,
    /// Pause between cycles
    pub sleep_interval: Duration,
    /// Pause between checks while the queue is locked
    pub lock_poll_interval: Duration,
    /// Maximum number of jobs started per cycle
    pub dispatch_per_cycle: usize,
    /// Directory for collected container output; `None` disables collection
    pub log_dir: Option<PathBuf>,
    /// Minimum age of the last output collection before collecting again
    pub log_interval: Duration,
    /// Users always listed in the statistics
    pub executors: Vec<String>,
    /// Remove containers after their final output collection
    pub remove_exited: bool,
    /// Upper bound on waiting for the ticket channel to close at shutdown
    pub drain_timeout: Duration,
}

impl SchedulerSettings {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            max_history: config.queue.max_history,
            sleep_interval: config.queue.sleep_interval(),
            lock_poll_interval: config.queue.lock_poll_interval(),
            dispatch_per_cycle: config.queue.dispatch_per_cycle,
            log_dir: Some(config.paths.logs.clone()),
            log_interval: config.runtime.log_interval(),
            executors: config.ingest.executors.clone(),
            remove_exited: config.runtime.auto_remove,
            drain_timeout: SHUTDOWN_DRAIN_TIMEOUT,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&DaemonConfig::default())
    }
}

/// What a single cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    /// The lock was held and nothing was touched
    pub locked: bool,
    /// Tickets moved from the channel into the pending queue
    pub received: usize,
    /// Running jobs moved to history
    pub reaped: usize,
    /// Jobs started
    pub dispatched: usize,
    /// Jobs put back at the head of the queue
    pub requeued: usize,
    /// Jobs dropped after a runtime failure
    pub dropped: usize,
}

impl CycleOutcome {
    /// The cycle changed one of the three collections
    pub fn mutated(&self) -> bool {
        self.received + self.reaped + self.dispatched + self.dropped > 0
    }
}

enum Dispatch {
    Started,
    Requeued,
    Dropped,
    Empty,
}

/// Fair-share scheduler owning the three job collections
pub struct Scheduler {
    settings: SchedulerSettings,
    runtime: Arc<dyn ContainerRuntime>,
    allocator: GpuAllocator,
    store: Option<QueueStore>,
    tickets: mpsc::UnboundedReceiver<JobTicket>,
    tickets_open: bool,
    commands: mpsc::Receiver<ControlCommand>,
    lock: LockGate,
    ingest: IngestTracker,
    shutdown: Arc<watch::Sender<bool>>,
    snapshots: watch::Sender<SchedulerSnapshot>,
    pending: VecDeque<Job>,
    running: Vec<Job>,
    history: VecDeque<Job>,
    devices: DeviceStatus,
    phase: SchedulerPhase,
    started_at: Option<chrono::DateTime<Utc>>,
}

impl Scheduler {
    /// Create a new scheduler and the handle controlling it
    pub fn new(
        settings: SchedulerSettings,
        runtime: Arc<dyn ContainerRuntime>,
        allocator: GpuAllocator,
        tickets: mpsc::UnboundedReceiver<JobTicket>,
    ) -> (Self, ControlHandle) {
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (snapshots, snapshot_rx) = watch::channel(SchedulerSnapshot::default());
        let (shutdown, _) = watch::channel(false);
        let shutdown = Arc::new(shutdown);
        let lock = LockGate::new();
        let ingest = IngestTracker::new();

        info!(
            runtime = runtime.name(),
            gpus = allocator.total_count(),
            max_history = settings.max_history,
            "Scheduler initialized"
        );

        let handle = ControlHandle::new(
            command_tx,
            snapshot_rx,
            lock.clone(),
            shutdown.clone(),
            ingest.clone(),
        );
        let scheduler = Self {
            settings,
            runtime,
            allocator,
            store: None,
            tickets,
            tickets_open: true,
            commands,
            lock,
            ingest,
            shutdown,
            snapshots,
            pending: VecDeque::new(),
            running: Vec::new(),
            history: VecDeque::new(),
            devices: DeviceStatus::default(),
            phase: SchedulerPhase::NotStarted,
            started_at: None,
        };
        (scheduler, handle)
    }

    /// Persist the collections into the given store
    pub fn with_store(mut self, store: QueueStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn pending(&self) -> &VecDeque<Job> {
        &self.pending
    }

    pub fn running(&self) -> &[Job] {
        &self.running
    }

    /// Most recent first
    pub fn history(&self) -> &VecDeque<Job> {
        &self.history
    }

    /// Load the collections from the store and reconcile running jobs
    ///
    /// Running jobs the runtime no longer reports go straight to history.
    pub async fn restore(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshot = store.restore_all().await;

        self.history = snapshot.history.into();
        self.history.truncate(self.settings.max_history);
        self.pending = snapshot.pending.into();

        let mut reaped = 0;
        for mut job in snapshot.running {
            if self.is_alive(&job).await {
                self.running.push(job);
                continue;
            }
            if job.mark_exited().is_err() {
                job.finished_at = Some(Utc::now());
            }
            info!(job_id = %job.id, name = %job.name(), "Restored job is no longer running");
            self.remove_container(&job).await;
            self.push_history(job);
            reaped += 1;
        }

        let scores = penalties(&self.history);
        sort_pending(self.pending.make_contiguous(), &scores);

        info!(
            pending = self.pending.len(),
            running = self.running.len(),
            history = self.history.len(),
            reaped = reaped,
            "Restored queue state"
        );
        if reaped > 0 {
            self.persist().await;
        }
        self.refresh_devices().await;
        self.publish();
    }

    /// Run cycles until the termination flag is set
    ///
    /// On the way out every ticket still in flight is queued, even while
    /// locked, before the final snapshot is written. Ingestion must be stopped
    /// for the ticket channel to close.
    pub async fn run(mut self) {
        let mut shutdown = self.shutdown.subscribe();
        self.phase = SchedulerPhase::Running;
        self.started_at = Some(Utc::now());
        self.refresh_devices().await;
        self.publish();
        info!("Scheduler started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = if self.lock.is_locked() {
                self.publish();
                self.settings.lock_poll_interval
            } else {
                self.run_cycle().await;
                self.settings.sleep_interval
            };

            let deadline = tokio::time::Instant::now() + wait;
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    Some(command) = self.commands.recv() => {
                        self.handle_command(command).await;
                    }
                    _ = tokio::time::sleep_until(deadline) => break,
                }
            }
        }

        info!("Scheduler stopping");
        self.drain_on_shutdown().await;
        self.phase = SchedulerPhase::Terminated;
        self.persist().await;
        self.publish();
        info!(
            pending = self.pending.len(),
            running = self.running.len(),
            history = self.history.len(),
            "Scheduler stopped"
        );
    }

    /// One pass: drain, reconcile, dispatch, snapshot
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        if self.lock.is_locked() {
            debug!("Queue locked, skipping cycle");
            return CycleOutcome {
                locked: true,
                ..CycleOutcome::default()
            };
        }

        let mut outcome = CycleOutcome {
            received: self.drain_tickets(),
            ..CycleOutcome::default()
        };
        outcome.reaped = self.reconcile_running().await;

        let scores = penalties(&self.history);
        sort_pending(self.pending.make_contiguous(), &scores);

        self.collect_output(false).await;
        self.sample_stats().await;

        for _ in 0..self.settings.dispatch_per_cycle {
            match self.dispatch_next().await {
                Dispatch::Started => outcome.dispatched += 1,
                Dispatch::Dropped => outcome.dropped += 1,
                Dispatch::Requeued => {
                    outcome.requeued += 1;
                    break;
                }
                Dispatch::Empty => break,
            }
        }

        if outcome.mutated() {
            self.persist().await;
        }
        self.refresh_devices().await;
        self.publish();
        outcome
    }

    fn drain_tickets(&mut self) -> usize {
        let mut received = 0;
        while self.tickets_open {
            match self.tickets.try_recv() {
                Ok(ticket) => {
                    debug!(
                        job_id = %ticket.id,
                        name = %ticket.config.name,
                        executor = %ticket.config.executor,
                        "Received job"
                    );
                    self.pending.push_back(Job::from(ticket));
                    received += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!("Ingestion channel closed, no new jobs will arrive");
                    self.tickets_open = false;
                    self.ingest.stopped();
                }
            }
        }
        if received > 0 {
            info!(received = received, pending = self.pending.len(), "Enqueued jobs");
        }
        received
    }

    /// Wait for the ticket channel to close and queue everything left in it
    async fn drain_on_shutdown(&mut self) {
        let deadline = tokio::time::Instant::now() + self.settings.drain_timeout;
        let mut received = 0;
        while self.tickets_open {
            match tokio::time::timeout_at(deadline, self.tickets.recv()).await {
                Ok(Some(ticket)) => {
                    debug!(
                        job_id = %ticket.id,
                        name = %ticket.config.name,
                        "Received job at shutdown"
                    );
                    self.pending.push_back(Job::from(ticket));
                    received += 1;
                }
                Ok(None) => {
                    self.tickets_open = false;
                    self.ingest.stopped();
                }
                Err(_) => {
                    warn!(
                        timeout_secs = self.settings.drain_timeout.as_secs(),
                        "Ingestion channel still open at shutdown, later tickets are lost"
                    );
                    break;
                }
            }
        }

        if received > 0 {
            let scores = penalties(&self.history);
            sort_pending(self.pending.make_contiguous(), &scores);
            info!(
                received = received,
                pending = self.pending.len(),
                "Enqueued jobs at shutdown"
            );
        }
    }

    async fn is_alive(&self, job: &Job) -> bool {
        let Some(handle) = job.runtime_handle.as_deref() else {
            return false;
        };
        match self.runtime.status(handle).await {
            Ok(status) => !status.is_finished(),
            Err(FairqError::ContainerNotFound(_)) => false,
            Err(e) => {
                warn!(job_id = %job.id, container = handle, error = %e, "Status check failed");
                true
            }
        }
    }

    /// Move exited jobs from the running set into history
    async fn reconcile_running(&mut self) -> usize {
        let mut exited = Vec::new();
        let mut still_running = Vec::with_capacity(self.running.len());
        for job in std::mem::take(&mut self.running) {
            if self.is_alive(&job).await {
                still_running.push(job);
            } else {
                exited.push(job);
            }
        }
        self.running = still_running;

        let reaped = exited.len();
        for mut job in exited {
            self.collect_job_output(&mut job, true).await;
            self.remove_container(&job).await;
            if let Err(e) = job.mark_exited() {
                warn!(job_id = %job.id, error = %e, "Unexpected job state");
            }
            info!(
                job_id = %job.id,
                name = %job.name(),
                executor = %job.executor(),
                "Job exited"
            );
            self.push_history(job);
        }
        reaped
    }

    /// Drop the finished container once nothing more is read from it
    async fn remove_container(&self, job: &Job) {
        if !self.settings.remove_exited {
            return;
        }
        let Some(handle) = job.runtime_handle.as_deref() else {
            return;
        };
        match self.runtime.remove_container(handle).await {
            Ok(()) | Err(FairqError::ContainerNotFound(_)) => {}
            Err(e) => warn!(
                job_id = %job.id,
                container = handle,
                error = %e,
                "Failed to remove container"
            ),
        }
    }

    fn push_history(&mut self, job: Job) {
        self.history.push_front(job);
        self.history.truncate(self.settings.max_history);
    }

    async fn dispatch_next(&mut self) -> Dispatch {
        let Some(mut job) = self.pending.pop_front() else {
            return Dispatch::Empty;
        };

        let devices = match self.allocator.free_devices(self.runtime.as_ref()).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "Failed to query GPU devices");
                self.pending.push_front(job);
                return Dispatch::Requeued;
            }
        };
        self.devices = devices.clone();

        let gpus = match self.allocator.assign(&job.config, &devices.free) {
            Ok(gpus) => gpus,
            Err(e) => {
                debug!(job_id = %job.id, name = %job.name(), reason = %e, "Waiting for GPUs");
                self.pending.push_front(job);
                return Dispatch::Requeued;
            }
        };

        match self.start(&job, &gpus).await {
            Ok(handle) => {
                if let Err(e) = job.mark_running(handle, gpus) {
                    error!(job_id = %job.id, error = %e, "Started job in unexpected state");
                }
                info!(
                    job_id = %job.id,
                    name = %job.name(),
                    executor = %job.executor(),
                    gpus = ?job.assigned_gpus,
                    "Job started"
                );
                self.running.push(job);
                Dispatch::Started
            }
            Err(e) if e.is_transient() => {
                info!(job_id = %job.id, name = %job.name(), reason = %e, "Requeued job");
                self.pending.push_front(job);
                Dispatch::Requeued
            }
            Err(e) => {
                error!(
                    job_id = %job.id,
                    name = %job.name(),
                    executor = %job.executor(),
                    error = %e,
                    "Failed to start job, dropping it"
                );
                Dispatch::Dropped
            }
        }
    }

    async fn start(&self, job: &Job, gpus: &[u32]) -> FairqResult<String> {
        let image_ref = job.image_ref.as_deref().ok_or_else(|| {
            FairqError::Internal(format!("job {} has no image", job.id))
        })?;
        self.runtime
            .create_and_start(image_ref, &job.config, &DeviceVisibility::from_assignment(gpus))
            .await
    }

    async fn collect_output(&mut self, force: bool) {
        if self.settings.log_dir.is_none() {
            return;
        }
        let mut running = std::mem::take(&mut self.running);
        for job in running.iter_mut() {
            self.collect_job_output(job, force).await;
        }
        self.running = running;
    }

    /// Append the container's new output to the job's log file
    async fn collect_job_output(&self, job: &mut Job, force: bool) {
        let (Some(log_dir), Some(handle)) = (&self.settings.log_dir, job.runtime_handle.clone())
        else {
            return;
        };

        let now = Utc::now();
        let since = job.started_at.unwrap_or(now);
        let path = log_dir.join(format!("{}_{}.log", job.config.name, job.id));
        let cursor = job
            .output
            .get_or_insert_with(|| OutputCursor { since, path });
        let due = chrono::Duration::from_std(self.settings.log_interval)
            .map(|interval| now - cursor.since >= interval)
            .unwrap_or(true);
        if !force && !due {
            return;
        }

        let bytes = match self.runtime.logs(&handle, cursor.since).await {
            Ok(bytes) => bytes,
            Err(FairqError::ContainerNotFound(_)) => {
                if force {
                    warn!(
                        job_id = %job.id,
                        container = %handle,
                        "Container removed before its final output was collected"
                    );
                }
                return;
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to fetch container output");
                return;
            }
        };
        cursor.since = now;
        if bytes.is_empty() {
            return;
        }

        if let Err(e) = append(&cursor.path, &bytes).await {
            warn!(path = %cursor.path.display(), error = %e, "Failed to write container output");
        }
    }

    /// Refresh the resource sample of running jobs at the output interval
    async fn sample_stats(&mut self) {
        let now = Utc::now();
        let interval = chrono::Duration::from_std(self.settings.log_interval)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let mut running = std::mem::take(&mut self.running);
        for job in running.iter_mut() {
            let stale = job
                .stats
                .as_ref()
                .map_or(true, |stats| now - stats.collected_at >= interval);
            let Some(handle) = job.runtime_handle.as_deref().filter(|_| stale) else {
                continue;
            };
            match self.runtime.stats(handle).await {
                Ok(stats) => job.stats = Some(stats),
                Err(FairqError::ContainerNotFound(_)) => job.stats = None,
                Err(e) => debug!(job_id = %job.id, error = %e, "Failed to sample container stats"),
            }
        }
        self.running = running;
    }

    async fn handle_command(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::DeletePending { predicate, reply } => {
                let before = self.pending.len();
                self.pending.retain(|job| {
                    let delete = predicate(job);
                    if delete {
                        info!(job_id = %job.id, name = %job.name(), "Deleted pending job");
                    }
                    !delete
                });
                let removed = before - self.pending.len();
                if removed > 0 {
                    self.persist_one(QueueKind::Pending).await;
                }
                self.publish();
                let _ = reply.send(removed);
            }
            ControlCommand::ClearHistory { reply } => {
                let removed = self.history.len();
                self.history.clear();
                info!(removed = removed, "Cleared history");
                self.persist_one(QueueKind::History).await;
                self.publish();
                let _ = reply.send(removed);
            }
        }
    }

    async fn persist(&self) {
        for kind in QueueKind::ALL {
            self.persist_one(kind).await;
        }
    }

    async fn persist_one(&self, kind: QueueKind) {
        let Some(store) = &self.store else {
            return;
        };
        let result = match kind {
            QueueKind::History => store.save(kind, &self.history).await,
            QueueKind::Pending => store.save(kind, &self.pending).await,
            QueueKind::Running => store.save(kind, &self.running).await,
        };
        if let Err(e) = result {
            error!(queue = %kind, error = %e, "Failed to save queue snapshot");
        }
    }

    async fn refresh_devices(&mut self) {
        match self.allocator.free_devices(self.runtime.as_ref()).await {
            Ok(devices) => self.devices = devices,
            Err(e) => debug!(error = %e, "Failed to refresh GPU devices"),
        }
    }

    fn user_stats(&self) -> Vec<UserStats> {
        let scores = penalties(&self.history);
        let users: BTreeSet<&str> = self
            .settings
            .executors
            .iter()
            .map(String::as_str)
            .chain(self.history.iter().map(Job::executor))
            .chain(self.pending.iter().map(Job::executor))
            .chain(self.running.iter().map(Job::executor))
            .collect();

        users
            .into_iter()
            .map(|user| UserStats {
                user: user.to_string(),
                penalty: rounded(scores.get(user).copied().unwrap_or(0.0)),
                jobs_run: self.history.iter().filter(|j| j.executor() == user).count(),
                jobs_enqueued: self.pending.iter().filter(|j| j.executor() == user).count(),
            })
            .collect()
    }

    fn publish(&self) {
        let snapshot = SchedulerSnapshot {
            phase: self.phase,
            started_at: self.started_at,
            pending: self.pending.iter().cloned().collect(),
            running: self.running.clone(),
            history: self.history.iter().cloned().collect(),
            users: self.user_stats(),
            gpus: self.devices.clone(),
            updated_at: Utc::now(),
        };
        self.snapshots.send_replace(snapshot);
    }
}

async fn append(path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use fairq_core::{GpuInventory, JobConfig};
    use crate::control::IngestPhase;
    use fairq_runtime::{MockFailure, MockRuntime};

    struct Harness {
        scheduler: Scheduler,
        handle: ControlHandle,
        runtime: MockRuntime,
        tickets: mpsc::UnboundedSender<JobTicket>,
    }

    fn harness(gpus: u32, max_history: usize) -> Harness {
        let runtime = MockRuntime::new();
        let (tickets, rx) = mpsc::unbounded_channel();
        let settings = SchedulerSettings {
            max_history,
            log_dir: None,
            ..SchedulerSettings::default()
        };
        let (scheduler, handle) = Scheduler::new(
            settings,
            Arc::new(runtime.clone()),
            GpuAllocator::new(GpuInventory::from_minors(0..gpus)),
            rx,
        );
        Harness {
            scheduler,
            handle,
            runtime,
            tickets,
        }
    }

    fn ticket(name: &str, executor: &str, gpu_count: u32) -> JobTicket {
        let mut config = JobConfig::new(name, executor);
        config.gpu_count = gpu_count;
        JobTicket::new(config, format!("sha256:{}", name))
    }

    fn names(jobs: impl IntoIterator<Item = impl std::borrow::Borrow<Job>>) -> Vec<String> {
        jobs.into_iter()
            .map(|j| j.borrow().name().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_older_job_dispatched_first() {
        let mut h = harness(1, 500);
        h.tickets.send(ticket("job-a", "ilja", 1)).unwrap();
        h.tickets.send(ticket("job-b", "markus", 1)).unwrap();

        let outcome = h.scheduler.run_cycle().await;
        assert_eq!(outcome.received, 2);
        assert_eq!(outcome.dispatched, 1);
        assert_eq!(names(h.scheduler.running()), vec!["job-a"]);
        assert_eq!(names(h.scheduler.pending()), vec!["job-b"]);
        assert_eq!(h.runtime.starts()[0].devices, DeviceVisibility::Devices(vec![0]));
    }

    #[tokio::test]
    async fn test_gpu_job_blocks_head_when_short_of_devices() {
        let mut h = harness(2, 500);
        h.runtime.add_external(DeviceVisibility::Devices(vec![1]));
        h.tickets.send(ticket("big-job", "ilja", 2)).unwrap();
        h.tickets.send(ticket("small-job", "markus", 1)).unwrap();

        let outcome = h.scheduler.run_cycle().await;
        assert_eq!(outcome.requeued, 1);
        assert_eq!(outcome.dispatched, 0);
        assert_eq!(h.scheduler.pending().len(), 2);
        assert_eq!(h.scheduler.pending()[0].name(), "big-job");
        assert!(h.runtime.starts().is_empty());
    }

    #[tokio::test]
    async fn test_resource_exhausted_start_requeues_at_front() {
        let mut h = harness(1, 500);
        h.runtime.fail_next_start(MockFailure::ResourceExhausted);
        h.tickets.send(ticket("job-a", "ilja", 1)).unwrap();
        h.tickets.send(ticket("job-b", "ilja", 1)).unwrap();

        let outcome = h.scheduler.run_cycle().await;
        assert_eq!(outcome.requeued, 1);
        assert_eq!(names(h.scheduler.pending()), vec!["job-a", "job-b"]);

        h.scheduler.run_cycle().await;
        assert_eq!(names(h.scheduler.running()), vec!["job-a"]);
    }

    #[tokio::test]
    async fn test_runtime_failure_drops_job() {
        let mut h = harness(1, 500);
        h.runtime.fail_next_start(MockFailure::Runtime);
        h.tickets.send(ticket("job-a", "ilja", 1)).unwrap();

        let outcome = h.scheduler.run_cycle().await;
        assert_eq!(outcome.dropped, 1);
        assert!(h.scheduler.pending().is_empty());
        assert!(h.scheduler.running().is_empty());
        assert!(h.scheduler.history().is_empty());
    }

    #[tokio::test]
    async fn test_cpu_job_needs_no_devices() {
        let mut h = harness(0, 500);
        h.tickets.send(ticket("cpu-job", "ilja", 0)).unwrap();

        h.scheduler.run_cycle().await;
        assert_eq!(names(h.scheduler.running()), vec!["cpu-job"]);
        assert_eq!(h.runtime.starts()[0].devices, DeviceVisibility::None);
    }

    #[tokio::test]
    async fn test_exited_job_moves_to_history_front() {
        let mut h = harness(1, 500);
        h.tickets.send(ticket("job-a", "ilja", 1)).unwrap();
        h.scheduler.run_cycle().await;

        h.runtime.exit_job("job-a");
        let outcome = h.scheduler.run_cycle().await;
        assert_eq!(outcome.reaped, 1);
        assert!(h.scheduler.running().is_empty());
        assert_eq!(h.scheduler.history()[0].name(), "job-a");
        assert!(h.scheduler.history()[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn test_auto_removed_container_counts_as_exited() {
        let mut h = harness(1, 500);
        h.tickets.send(ticket("job-a", "ilja", 1)).unwrap();
        h.scheduler.run_cycle().await;

        let handle = h.runtime.starts()[0].handle.clone();
        h.runtime.remove(&handle);
        assert_eq!(h.scheduler.run_cycle().await.reaped, 1);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let mut h = harness(1, 3);
        for i in 0..5 {
            let name = format!("job-{}", i);
            h.tickets.send(ticket(&name, "ilja", 1)).unwrap();
            h.scheduler.run_cycle().await;
            h.runtime.exit_job(&name);
        }
        h.scheduler.run_cycle().await;

        assert_eq!(names(h.scheduler.history()), vec!["job-4", "job-3", "job-2"]);
    }

    #[tokio::test]
    async fn test_fairness_prefers_user_without_history() {
        let mut h = harness(1, 500);
        h.tickets.send(ticket("first", "ilja", 1)).unwrap();
        h.scheduler.run_cycle().await;
        h.runtime.exit_job("first");

        h.tickets.send(ticket("second", "ilja", 1)).unwrap();
        h.tickets.send(ticket("third", "markus", 1)).unwrap();
        h.scheduler.run_cycle().await;

        assert_eq!(names(h.scheduler.running()), vec!["third"]);
        assert_eq!(names(h.scheduler.pending()), vec!["second"]);
    }

    #[tokio::test]
    async fn test_same_penalty_dispatches_in_submission_order() {
        let mut h = harness(0, 500);
        h.tickets.send(ticket("one", "ilja", 0)).unwrap();
        h.tickets.send(ticket("two", "ilja", 0)).unwrap();
        h.tickets.send(ticket("three", "markus", 0)).unwrap();

        for _ in 0..3 {
            h.scheduler.run_cycle().await;
        }
        let started: Vec<_> = h.runtime.starts().into_iter().map(|s| s.job_name).collect();
        assert_eq!(started, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_lock_leaves_queue_untouched() {
        let mut h = harness(1, 500);
        h.runtime.add_external(DeviceVisibility::All);
        h.tickets.send(ticket("job-a", "ilja", 1)).unwrap();
        h.scheduler.run_cycle().await;
        let before: Vec<_> = h.scheduler.pending().iter().map(|j| j.id).collect();

        assert!(h.handle.lock());
        h.tickets.send(ticket("job-b", "markus", 1)).unwrap();
        for _ in 0..2 {
            assert!(h.scheduler.run_cycle().await.locked);
            let ids: Vec<_> = h.scheduler.pending().iter().map(|j| j.id).collect();
            assert_eq!(ids, before);
        }

        assert!(h.handle.unlock());
        assert_eq!(h.scheduler.run_cycle().await.received, 1);
        assert_eq!(h.scheduler.pending().len(), 2);
    }

    #[tokio::test]
    async fn test_user_stats() {
        let mut h = harness(1, 500);
        h.scheduler.settings.executors = vec!["anna".to_string()];
        h.tickets.send(ticket("job-a", "ilja", 1)).unwrap();
        h.scheduler.run_cycle().await;
        h.runtime.exit_job("job-a");
        h.tickets.send(ticket("job-b", "markus", 5)).unwrap();
        h.scheduler.run_cycle().await;

        let users = h.handle.snapshot().users;
        let by_name = |name: &str| users.iter().find(|u| u.user == name).unwrap().clone();
        assert_eq!(by_name("anna").penalty, 0.0);
        assert_eq!(by_name("ilja").penalty, 1.0);
        assert_eq!(by_name("ilja").jobs_run, 1);
        assert_eq!(by_name("markus").jobs_enqueued, 1);
    }

    #[tokio::test]
    async fn test_output_collection() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness(1, 500);
        h.scheduler.settings.log_dir = Some(dir.path().to_path_buf());
        h.tickets.send(ticket("job-a", "ilja", 1)).unwrap();
        h.scheduler.run_cycle().await;

        let handle = h.runtime.starts()[0].handle.clone();
        h.runtime.push_logs(&handle, b"epoch 1\n");
        h.runtime.exit_job("job-a");
        h.scheduler.run_cycle().await;

        let job = &h.scheduler.history()[0];
        let path = dir.path().join(format!("job-a_{}.log", job.id));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "epoch 1\n");
        assert!(job.output.is_none());
        // removed only after the last output was written
        assert_eq!(h.runtime.removals(), vec![handle]);
    }

    #[tokio::test]
    async fn test_exited_container_kept_when_removal_disabled() {
        let mut h = harness(1, 500);
        h.scheduler.settings.remove_exited = false;
        h.tickets.send(ticket("job-a", "ilja", 1)).unwrap();
        h.scheduler.run_cycle().await;
        h.runtime.exit_job("job-a");

        assert_eq!(h.scheduler.run_cycle().await.reaped, 1);
        assert!(h.runtime.removals().is_empty());
    }

    #[tokio::test]
    async fn test_running_jobs_carry_stats() {
        let mut h = harness(1, 500);
        h.tickets.send(ticket("job-a", "ilja", 1)).unwrap();
        h.scheduler.run_cycle().await;
        let handle = h.runtime.starts()[0].handle.clone();
        h.runtime.set_usage(&handle, 99.5, 25.0);

        h.scheduler.run_cycle().await;
        let running = h.handle.snapshot().running;
        let stats = running[0].stats.as_ref().unwrap();
        assert_eq!(stats.cpu_percent, 99.5);
        assert_eq!(stats.memory_percent, 25.0);

        h.runtime.exit_job("job-a");
        h.scheduler.run_cycle().await;
        assert!(h.scheduler.history()[0].stats.is_none());
    }

    #[tokio::test]
    async fn test_closed_ticket_channel_marks_ingest_stopped() {
        let Harness {
            mut scheduler,
            handle,
            tickets,
            ..
        } = harness(0, 500);
        handle.ingest_started("task");
        tickets.send(ticket("last", "ilja", 0)).unwrap();
        drop(tickets);

        assert_eq!(scheduler.run_cycle().await.received, 1);
        let ingest = handle.status().ingest;
        assert_eq!(ingest.phase, IngestPhase::Stopped);
        assert_eq!(ingest.mode.as_deref(), Some("task"));
    }
}
