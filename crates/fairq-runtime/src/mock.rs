//! In-memory runtime for tests
//!
//! Containers live in a shared table so clones of the runtime observe the
//! same state. Tests flip containers to exited, inject failures and add
//! containers the scheduler did not start.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fairq_core::{ContainerStats, DeviceVisibility, FairqError, FairqResult, JobConfig};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::traits::{conflicting_devices, ContainerRuntime, ContainerStatus, LiveContainer};

/// Failure injected into the next start call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    ResourceExhausted,
    Runtime,
}

/// A container start observed by the mock
#[derive(Debug, Clone, PartialEq)]
pub struct StartRecord {
    pub handle: String,
    pub image_ref: String,
    pub job_name: String,
    pub executor: String,
    pub devices: DeviceVisibility,
}

#[derive(Debug, Clone)]
struct MockContainer {
    devices: DeviceVisibility,
    status: ContainerStatus,
    job_name: Option<String>,
    output: Vec<(DateTime<Utc>, Vec<u8>)>,
    usage: (f64, f64),
}

#[derive(Debug, Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    starts: Vec<StartRecord>,
    builds: Vec<(PathBuf, String)>,
    stops: Vec<String>,
    removals: Vec<String>,
    next_start_failure: Option<MockFailure>,
    fail_builds: bool,
    counter: u64,
}

/// Runtime double backed by shared in-memory state
#[derive(Debug, Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        // A panicking test thread must not hide the state from the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `create_and_start` fail
    pub fn fail_next_start(&self, failure: MockFailure) {
        self.lock().next_start_failure = Some(failure);
    }

    /// Make every image build fail
    pub fn fail_builds(&self, fail: bool) {
        self.lock().fail_builds = fail;
    }

    /// Mark a container as exited
    pub fn set_exited(&self, handle: &str) {
        if let Some(container) = self.lock().containers.get_mut(handle) {
            container.status = ContainerStatus::Exited;
        }
    }

    /// Mark every container started for the named job as exited
    pub fn exit_job(&self, job_name: &str) {
        for container in self.lock().containers.values_mut() {
            if container.job_name.as_deref() == Some(job_name) {
                container.status = ContainerStatus::Exited;
            }
        }
    }

    /// Register a running container the scheduler did not start
    pub fn add_external(&self, devices: DeviceVisibility) -> String {
        let mut state = self.lock();
        state.counter += 1;
        let handle = format!("external-{}", state.counter);
        state.containers.insert(
            handle.clone(),
            MockContainer {
                devices,
                status: ContainerStatus::Running,
                job_name: None,
                output: Vec::new(),
                usage: (0.0, 0.0),
            },
        );
        handle
    }

    /// Forget a container entirely, as after auto-removal
    pub fn remove(&self, handle: &str) {
        self.lock().containers.remove(handle);
    }

    /// Set the cpu and memory percentages reported by `stats`
    pub fn set_usage(&self, handle: &str, cpu_percent: f64, memory_percent: f64) {
        if let Some(container) = self.lock().containers.get_mut(handle) {
            container.usage = (cpu_percent, memory_percent);
        }
    }

    /// Append output to a container, timestamped now
    pub fn push_logs(&self, handle: &str, bytes: &[u8]) {
        if let Some(container) = self.lock().containers.get_mut(handle) {
            container.output.push((Utc::now(), bytes.to_vec()));
        }
    }

    /// Starts observed so far, in order
    pub fn starts(&self) -> Vec<StartRecord> {
        self.lock().starts.clone()
    }

    /// Builds observed so far as (context, tag)
    pub fn builds(&self) -> Vec<(PathBuf, String)> {
        self.lock().builds.clone()
    }

    /// Handles passed to `stop`
    pub fn stops(&self) -> Vec<String> {
        self.lock().stops.clone()
    }

    /// Handles removed through `remove_container`
    pub fn removals(&self) -> Vec<String> {
        self.lock().removals.clone()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn build_image(&self, context: &Path, tag: &str) -> FairqResult<String> {
        let mut state = self.lock();
        state.builds.push((context.to_path_buf(), tag.to_string()));
        if state.fail_builds {
            return Err(FairqError::Build(format!("mock build failed for {}", tag)));
        }
        Ok(format!("sha256:{}", tag))
    }

    async fn create_and_start(
        &self,
        image_ref: &str,
        config: &JobConfig,
        devices: &DeviceVisibility,
    ) -> FairqResult<String> {
        let mut state = self.lock();

        match state.next_start_failure.take() {
            Some(MockFailure::ResourceExhausted) => {
                return Err(FairqError::ResourceExhausted(format!(
                    "mock refused devices for {}",
                    config.name
                )))
            }
            Some(MockFailure::Runtime) => {
                return Err(FairqError::Runtime(format!(
                    "mock failed to start {}",
                    config.name
                )))
            }
            None => {}
        }

        let live: Vec<LiveContainer> = state
            .containers
            .iter()
            .filter(|(_, c)| !c.status.is_finished())
            .map(|(handle, c)| LiveContainer {
                handle: handle.clone(),
                devices: c.devices.clone(),
                status: c.status,
            })
            .collect();
        let conflicts = conflicting_devices(&live, devices);
        if !conflicts.is_empty() {
            return Err(FairqError::ResourceExhausted(format!(
                "GPUs {:?} already in use",
                conflicts
            )));
        }

        state.counter += 1;
        let handle = format!("container-{}", state.counter);
        state.containers.insert(
            handle.clone(),
            MockContainer {
                devices: devices.clone(),
                status: ContainerStatus::Running,
                job_name: Some(config.name.clone()),
                output: Vec::new(),
                usage: (0.0, 0.0),
            },
        );
        state.starts.push(StartRecord {
            handle: handle.clone(),
            image_ref: image_ref.to_string(),
            job_name: config.name.clone(),
            executor: config.executor.clone(),
            devices: devices.clone(),
        });
        Ok(handle)
    }

    async fn list_live_containers(&self) -> FairqResult<Vec<LiveContainer>> {
        let state = self.lock();
        let mut live: Vec<LiveContainer> = state
            .containers
            .iter()
            .filter(|(_, c)| !c.status.is_finished())
            .map(|(handle, c)| LiveContainer {
                handle: handle.clone(),
                devices: c.devices.clone(),
                status: c.status,
            })
            .collect();
        live.sort_by(|a, b| a.handle.cmp(&b.handle));
        Ok(live)
    }

    async fn status(&self, handle: &str) -> FairqResult<ContainerStatus> {
        self.lock()
            .containers
            .get(handle)
            .map(|c| c.status)
            .ok_or_else(|| FairqError::ContainerNotFound(handle.to_string()))
    }

    async fn stop(&self, handle: &str) -> FairqResult<()> {
        let mut state = self.lock();
        state.stops.push(handle.to_string());
        match state.containers.get_mut(handle) {
            Some(container) => {
                container.status = ContainerStatus::Exited;
                Ok(())
            }
            None => Err(FairqError::ContainerNotFound(handle.to_string())),
        }
    }

    async fn logs(&self, handle: &str, since: DateTime<Utc>) -> FairqResult<Vec<u8>> {
        let state = self.lock();
        let container = state
            .containers
            .get(handle)
            .ok_or_else(|| FairqError::ContainerNotFound(handle.to_string()))?;
        Ok(container
            .output
            .iter()
            .filter(|(at, _)| *at >= since)
            .flat_map(|(_, bytes)| bytes.iter().copied())
            .collect())
    }

    async fn stats(&self, handle: &str) -> FairqResult<ContainerStats> {
        let state = self.lock();
        let container = state
            .containers
            .get(handle)
            .ok_or_else(|| FairqError::ContainerNotFound(handle.to_string()))?;
        let (cpu_percent, memory_percent) = container.usage;
        Ok(ContainerStats {
            cpu_percent,
            memory_percent,
            memory_usage: format!("{:.1}%", memory_percent),
            collected_at: Utc::now(),
        })
    }

    async fn remove_container(&self, handle: &str) -> FairqResult<()> {
        let mut state = self.lock();
        match state.containers.remove(handle) {
            Some(_) => {
                state.removals.push(handle.to_string());
                Ok(())
            }
            None => Err(FairqError::ContainerNotFound(handle.to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
