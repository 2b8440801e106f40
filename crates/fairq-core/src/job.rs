//! Job, JobConfig and JobTicket type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::warn;
use uuid::Uuid;

use crate::{FairqError, FairqResult};

/// Opaque parameters merged into the runtime's container creation call
pub type RunParams = BTreeMap<String, serde_json::Value>;

/// Minimum length of job and executor names
pub const MIN_NAME_LEN: usize = 3;

/// File name of the job descriptor inside a bundle
pub const DESCRIPTOR_FILE: &str = "config.json";

fn default_gpu_count() -> u32 {
    1
}

fn default_slot_count() -> u32 {
    1
}

fn default_memory_limit() -> String {
    "20g".to_string()
}

fn default_build() -> bool {
    true
}

/// Immutable submission descriptor carried by a bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    /// Display name of the job
    pub name: String,
    /// User owning the job
    pub executor: String,
    /// Number of GPU devices the job needs
    #[serde(default = "default_gpu_count")]
    pub gpu_count: u32,
    /// Number of scheduling slots the job occupies
    #[serde(default = "default_slot_count")]
    pub slot_count: u32,
    /// Container memory limit (e.g. "32g")
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    /// Build the image from the bundle's build context
    #[serde(default = "default_build")]
    pub build: bool,
    /// Pass-through parameters for the runtime
    #[serde(default)]
    pub run_params: RunParams,
}

impl JobConfig {
    /// Create a config with default resource settings
    pub fn new(name: impl Into<String>, executor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executor: executor.into(),
            gpu_count: default_gpu_count(),
            slot_count: default_slot_count(),
            memory_limit: default_memory_limit(),
            build: default_build(),
            run_params: RunParams::new(),
        }
    }

    /// Parse and validate a JSON descriptor
    pub fn from_json(content: &str) -> FairqResult<Self> {
        let config: JobConfig = serde_json::from_str(content)
            .map_err(|e| FairqError::InvalidSubmission(format!("malformed descriptor: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FairqResult<()> {
        for (field, value) in [("name", &self.name), ("executor", &self.executor)] {
            if value.trim().chars().count() < MIN_NAME_LEN {
                return Err(FairqError::InvalidSubmission(format!(
                    "{} '{}' must be at least {} characters long",
                    field, value, MIN_NAME_LEN
                )));
            }
        }
        if self.slot_count == 0 {
            return Err(FairqError::InvalidSubmission(
                "slot_count must be at least 1".to_string(),
            ));
        }
        if self.memory_limit.trim().is_empty() {
            return Err(FairqError::InvalidSubmission(
                "memory_limit must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Memory limit with a unit; bare numbers are taken as gigabytes
    pub fn normalized_memory_limit(&self) -> String {
        let limit = self.memory_limit.trim();
        if limit.chars().all(|c| c.is_ascii_digit()) {
            warn!(
                job = %self.name,
                memory_limit = limit,
                "Memory limit has no unit, assuming gigabytes"
            );
            format!("{}g", limit)
        } else {
            limit.to_string()
        }
    }

    pub fn uses_gpu(&self) -> bool {
        self.gpu_count > 0
    }
}

/// Transfer object sent from the ingestion pipeline to the scheduler
///
/// Carries identity and config only; runtime handles are attached after
/// the scheduler receives it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTicket {
    pub id: Uuid,
    pub config: JobConfig,
    pub image_ref: String,
    pub created_at: DateTime<Utc>,
}

impl JobTicket {
    pub fn new(config: JobConfig, image_ref: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            image_ref: image_ref.into(),
            created_at: Utc::now(),
        }
    }
}

/// Lifecycle of a job; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Queued,
    Running,
    Exited,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Queued => write!(f, "Queued"),
            LifecycleState::Running => write!(f, "Running"),
            LifecycleState::Exited => write!(f, "Exited"),
        }
    }
}

/// Cursor of the container output collection for a running job
#[derive(Debug, Clone, PartialEq)]
pub struct OutputCursor {
    /// Output before this instant has been collected
    pub since: DateTime<Utc>,
    /// File the output is appended to
    pub path: PathBuf,
}

/// Resource usage sampled from a running container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStats {
    /// CPU usage, 100.0 per fully used core
    pub cpu_percent: f64,
    /// Memory usage relative to the container limit
    pub memory_percent: f64,
    /// Human readable usage as reported by the runtime, e.g. `1.2GiB / 20GiB`
    pub memory_usage: String,
    pub collected_at: DateTime<Utc>,
}

/// Runtime wrapper around a job config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier
    pub id: Uuid,
    /// Submission descriptor
    pub config: JobConfig,
    /// Image built for this job
    pub image_ref: Option<String>,
    /// Container handle, set once created
    pub runtime_handle: Option<String>,
    /// Device minors assigned at dispatch
    pub assigned_gpus: Vec<u32>,
    /// Submission timestamp
    pub created_at: DateTime<Utc>,
    /// Dispatch timestamp
    pub started_at: Option<DateTime<Utc>>,
    /// Timestamp the exit was observed
    pub finished_at: Option<DateTime<Utc>>,
    /// Current lifecycle state
    pub state: LifecycleState,
    /// Live output collection, never persisted
    #[serde(skip)]
    pub output: Option<OutputCursor>,
    /// Latest resource sample, never persisted
    #[serde(skip)]
    pub stats: Option<ContainerStats>,
}

impl Job {
    /// Create a queued job from a config
    pub fn new(config: JobConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            image_ref: None,
            runtime_handle: None,
            assigned_gpus: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            state: LifecycleState::Queued,
            output: None,
            stats: None,
        }
    }

    pub fn executor(&self) -> &str {
        &self.config.executor
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Queued -> Running
    pub fn mark_running(&mut self, handle: String, gpus: Vec<u32>) -> FairqResult<()> {
        if self.state != LifecycleState::Queued {
            return Err(FairqError::Internal(format!(
                "job {} cannot start from state {}",
                self.id, self.state
            )));
        }
        self.runtime_handle = Some(handle);
        self.assigned_gpus = gpus;
        self.started_at = Some(Utc::now());
        self.state = LifecycleState::Running;
        Ok(())
    }

    /// Running -> Exited
    pub fn mark_exited(&mut self) -> FairqResult<()> {
        if self.state != LifecycleState::Running {
            return Err(FairqError::Internal(format!(
                "job {} cannot exit from state {}",
                self.id, self.state
            )));
        }
        self.release_handles();
        self.finished_at = Some(Utc::now());
        self.state = LifecycleState::Exited;
        Ok(())
    }

    /// Drop live attachments so only identity and config remain
    pub fn release_handles(&mut self) {
        self.output = None;
        self.stats = None;
    }
}

impl From<JobTicket> for Job {
    fn from(ticket: JobTicket) -> Self {
        Self {
            id: ticket.id,
            config: ticket.config,
            image_ref: Some(ticket.image_ref),
            runtime_handle: None,
            assigned_gpus: Vec::new(),
            created_at: ticket.created_at,
            started_at: None,
            finished_at: None,
            state: LifecycleState::Queued,
            output: None,
            stats: None,
        }
    }
}
