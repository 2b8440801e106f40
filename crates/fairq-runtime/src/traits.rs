//! Runtime trait definitions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fairq_core::{ContainerStats, DeviceVisibility, FairqResult, JobConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Container status as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl ContainerStatus {
    /// Parse the runtime's status string
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "created" => ContainerStatus::Created,
            "running" => ContainerStatus::Running,
            "paused" => ContainerStatus::Paused,
            "restarting" => ContainerStatus::Restarting,
            "removing" => ContainerStatus::Removing,
            "exited" => ContainerStatus::Exited,
            "dead" => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        }
    }

    /// The container will not run again
    pub fn is_finished(&self) -> bool {
        matches!(self, ContainerStatus::Exited | ContainerStatus::Dead)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// A container the runtime reports as alive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveContainer {
    /// Runtime handle (container id)
    pub handle: String,
    /// Device-visibility declaration of the container
    pub devices: DeviceVisibility,
    /// Current status
    pub status: ContainerStatus,
}

/// Runtime trait for managing job containers
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Build an image from a build context, returning the image reference
    async fn build_image(&self, context: &Path, tag: &str) -> FairqResult<String>;

    /// Create and start a container for a job with the given device declaration
    ///
    /// Fails with `ResourceExhausted` when a declared device is already in use.
    async fn create_and_start(
        &self,
        image_ref: &str,
        config: &JobConfig,
        devices: &DeviceVisibility,
    ) -> FairqResult<String>;

    /// List containers that are currently alive
    async fn list_live_containers(&self) -> FairqResult<Vec<LiveContainer>>;

    /// Status of a container; `ContainerNotFound` when the runtime no longer knows it
    async fn status(&self, handle: &str) -> FairqResult<ContainerStatus>;

    /// Stop a running container
    async fn stop(&self, handle: &str) -> FairqResult<()>;

    /// Output produced by the container since the given instant
    async fn logs(&self, handle: &str, since: DateTime<Utc>) -> FairqResult<Vec<u8>>;

    /// One resource usage sample of a running container
    async fn stats(&self, handle: &str) -> FairqResult<ContainerStats>;

    /// Remove a finished container; `ContainerNotFound` when it is already gone
    async fn remove_container(&self, handle: &str) -> FairqResult<()>;

    /// Get the runtime name
    fn name(&self) -> &'static str;
}

/// Devices claimed by live containers that overlap the requested declaration
pub(crate) fn conflicting_devices(
    live: &[LiveContainer],
    requested: &DeviceVisibility,
) -> Vec<u32> {
    let wanted = match requested {
        DeviceVisibility::Devices(minors) => minors,
        _ => return Vec::new(),
    };

    let mut conflicts: Vec<u32> = live
        .iter()
        .flat_map(|c| match &c.devices {
            DeviceVisibility::All => wanted.clone(),
            DeviceVisibility::None => Vec::new(),
            DeviceVisibility::Devices(minors) => minors.clone(),
        })
        .filter(|m| wanted.contains(m))
        .collect();
    conflicts.sort_unstable();
    conflicts.dedup();
    conflicts
}
