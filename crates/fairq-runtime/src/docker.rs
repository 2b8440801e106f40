//! Docker CLI runtime implementation
//!
//! Drives the `docker` client binary as child processes. Containers are
//! created detached and identified by their full container id.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use fairq_core::{
    ContainerStats, DeviceVisibility, FairqError, FairqResult, JobConfig, RuntimeConfig,
    VISIBLE_DEVICES_ENV,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::traits::{conflicting_devices, ContainerRuntime, ContainerStatus, LiveContainer};

/// Mount target that receives a per-executor subfolder
const OUTPUT_MOUNT_TARGET: &str = "/outdir";

/// Label carrying the job name on created containers
const JOB_LABEL: &str = "fairq.job";

/// Label carrying the executor on created containers
const EXECUTOR_LABEL: &str = "fairq.executor";

/// Docker-backed runtime
pub struct DockerRuntime {
    config: RuntimeConfig,
}

impl DockerRuntime {
    /// Create a new docker runtime
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    /// Verify the docker daemon answers
    pub async fn ping(&self) -> FairqResult<String> {
        let output = self
            .docker(&["version", "--format", "{{.Server.Version}}"])
            .await?;
        if !output.status.success() {
            return Err(FairqError::Runtime(format!(
                "docker daemon unreachable: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn docker<S: AsRef<std::ffi::OsStr>>(&self, args: &[S]) -> FairqResult<Output> {
        let mut cmd = Command::new(&self.config.docker_binary);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        cmd.output().await.map_err(|e| {
            error!(
                binary = %self.config.docker_binary.display(),
                error = %e,
                "Failed to spawn docker client"
            );
            FairqError::Runtime(format!("failed to run docker: {}", e))
        })
    }

    /// Bind mounts for a job, with the executor appended below `/outdir`
    fn mounts_for(&self, executor: &str) -> Vec<(PathBuf, String)> {
        self.config
            .mounts
            .iter()
            .filter_map(|mount| {
                let (source, target) = mount.split_once(':')?;
                let mut source = PathBuf::from(source);
                if target == OUTPUT_MOUNT_TARGET {
                    source = source.join(executor);
                }
                Some((source, target.to_string()))
            })
            .collect()
    }

    /// Build the argument list for `docker run`
    fn run_args(
        &self,
        image_ref: &str,
        config: &JobConfig,
        devices: &DeviceVisibility,
    ) -> FairqResult<Vec<String>> {
        let mut args = vec!["run".to_string(), "--detach".to_string()];
        let mut trailing = Vec::new();

        // User parameters first so the scheduler's own flags win
        for (key, value) in &config.run_params {
            match key.as_str() {
                "command" => trailing = string_list(key, value)?,
                "environment" => {
                    for entry in env_entries(value)? {
                        if entry.starts_with(VISIBLE_DEVICES_ENV) {
                            warn!(
                                job = %config.name,
                                "Ignoring device visibility from run parameters"
                            );
                            continue;
                        }
                        args.push("--env".to_string());
                        args.push(entry);
                    }
                }
                _ => args.extend(flag_args(key, value)?),
            }
        }

        args.push("--memory".to_string());
        args.push(config.normalized_memory_limit());
        args.push("--shm-size".to_string());
        args.push(self.config.shm_size.clone());
        if let Some(network) = &self.config.network_mode {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        for (source, target) in self.mounts_for(&config.executor) {
            args.push("--mount".to_string());
            args.push(format!(
                "type=bind,source={},target={}",
                source.display(),
                target
            ));
        }
        args.push("--env".to_string());
        args.push(devices.env_entry());
        args.push("--label".to_string());
        args.push(format!("{}={}", JOB_LABEL, config.name));
        args.push("--label".to_string());
        args.push(format!("{}={}", EXECUTOR_LABEL, config.executor));

        args.push(image_ref.to_string());
        args.extend(trailing);
        Ok(args)
    }
}

fn scalar(key: &str, value: &serde_json::Value) -> FairqResult<String> {
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        _ => Err(FairqError::Runtime(format!(
            "unsupported value for run parameter '{}'",
            key
        ))),
    }
}

/// Only the list form is accepted; a plain string would need shell-style
/// word splitting to become an argv.
fn string_list(key: &str, value: &serde_json::Value) -> FairqResult<Vec<String>> {
    match value {
        serde_json::Value::Array(items) => items.iter().map(|v| scalar(key, v)).collect(),
        _ => Err(FairqError::Runtime(format!(
            "run parameter '{}' must be a list",
            key
        ))),
    }
}

fn env_entries(value: &serde_json::Value) -> FairqResult<Vec<String>> {
    match value {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| Ok(format!("{}={}", k, scalar("environment", v)?)))
            .collect(),
        _ => string_list("environment", value),
    }
}

/// Translate a pass-through parameter into `--flag=value` arguments
fn flag_args(key: &str, value: &serde_json::Value) -> FairqResult<Vec<String>> {
    let flag = format!("--{}", key.replace('_', "-"));
    match value {
        serde_json::Value::Bool(true) => Ok(vec![flag]),
        serde_json::Value::Bool(false) | serde_json::Value::Null => Ok(Vec::new()),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|v| Ok(format!("{}={}", flag, scalar(key, v)?)))
            .collect(),
        other => Ok(vec![format!("{}={}", flag, scalar(key, other)?)]),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    id: String,
    state: InspectState,
    #[serde(default)]
    config: Option<InspectConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    #[serde(default)]
    env: Option<Vec<String>>,
}

/// Parse `docker inspect` output into live containers
fn parse_inspect(json: &str) -> FairqResult<Vec<LiveContainer>> {
    let entries: Vec<InspectEntry> = serde_json::from_str(json)?;
    Ok(entries
        .into_iter()
        .map(|entry| {
            let declaration = entry
                .config
                .and_then(|c| c.env)
                .unwrap_or_default()
                .into_iter()
                .find_map(|e| {
                    e.strip_prefix(VISIBLE_DEVICES_ENV)
                        .and_then(|rest| rest.strip_prefix('='))
                        .map(DeviceVisibility::parse)
                })
                .unwrap_or(DeviceVisibility::None);

            LiveContainer {
                handle: entry.id,
                devices: declaration,
                status: ContainerStatus::parse(&entry.state.status),
            }
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct StatsEntry {
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    #[serde(rename = "MemPerc")]
    mem_perc: String,
    #[serde(rename = "MemUsage")]
    mem_usage: String,
}

/// `12.34%`; docker prints `--` for containers it cannot sample
fn parse_percent(value: &str) -> f64 {
    value
        .trim()
        .trim_end_matches('%')
        .parse()
        .unwrap_or(0.0)
}

/// Parse one line of `docker stats --format '{{json .}}'`
fn parse_stats(line: &str) -> FairqResult<ContainerStats> {
    let entry: StatsEntry = serde_json::from_str(line.trim())?;
    Ok(ContainerStats {
        cpu_percent: parse_percent(&entry.cpu_perc),
        memory_percent: parse_percent(&entry.mem_perc),
        memory_usage: entry.mem_usage,
        collected_at: Utc::now(),
    })
}

/// `docker logs --since` value; whole seconds would repeat output
fn since_arg(since: DateTime<Utc>) -> String {
    since.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn is_not_found(stderr: &[u8]) -> bool {
    String::from_utf8_lossy(stderr).contains("No such")
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(&self, context: &Path, tag: &str) -> FairqResult<String> {
        info!(context = %context.display(), tag = tag, "Building image");

        let context_arg = context.as_os_str().to_owned();
        let output = self
            .docker(&[
                std::ffi::OsString::from("build"),
                "--quiet".into(),
                "--tag".into(),
                tag.into(),
                context_arg,
            ])
            .await?;

        if !output.status.success() {
            return Err(FairqError::Build(format!(
                "docker build failed for {}: {}",
                tag,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let image_ref = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if image_ref.is_empty() {
            return Err(FairqError::Build(format!(
                "docker build for {} produced no image id",
                tag
            )));
        }
        debug!(tag = tag, image = %image_ref, "Image built");
        Ok(image_ref)
    }

    async fn create_and_start(
        &self,
        image_ref: &str,
        config: &JobConfig,
        devices: &DeviceVisibility,
    ) -> FairqResult<String> {
        let conflicts = conflicting_devices(&self.list_live_containers().await?, devices);
        if !conflicts.is_empty() {
            return Err(FairqError::ResourceExhausted(format!(
                "GPUs {:?} were claimed before {} could start",
                conflicts, config.name
            )));
        }

        for (source, _) in self.mounts_for(&config.executor) {
            tokio::fs::create_dir_all(&source).await?;
        }

        let args = self.run_args(image_ref, config, devices)?;
        let output = self.docker(args.as_slice()).await?;
        if !output.status.success() {
            return Err(FairqError::Runtime(format!(
                "docker run failed for {}: {}",
                config.name,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let handle = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(
            job = %config.name,
            executor = %config.executor,
            container = %handle,
            devices = %devices,
            "Container started"
        );
        Ok(handle)
    }

    async fn list_live_containers(&self) -> FairqResult<Vec<LiveContainer>> {
        let output = self.docker(&["ps", "--quiet", "--no-trunc"]).await?;
        if !output.status.success() {
            return Err(FairqError::Runtime(format!(
                "docker ps failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let ids: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec!["inspect".to_string()];
        args.extend(ids);
        let output = self.docker(args.as_slice()).await?;

        // Containers that vanished between ps and inspect make inspect fail
        // while still printing the others.
        if output.stdout.is_empty() {
            return Err(FairqError::Runtime(format!(
                "docker inspect failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_inspect(&String::from_utf8_lossy(&output.stdout))
    }

    async fn status(&self, handle: &str) -> FairqResult<ContainerStatus> {
        let output = self
            .docker(&["inspect", "--format", "{{.State.Status}}", handle])
            .await?;
        if !output.status.success() {
            if is_not_found(&output.stderr) {
                return Err(FairqError::ContainerNotFound(handle.to_string()));
            }
            return Err(FairqError::Runtime(format!(
                "docker inspect failed for {}: {}",
                handle,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(ContainerStatus::parse(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    async fn stop(&self, handle: &str) -> FairqResult<()> {
        info!(container = handle, "Stopping container");
        let output = self.docker(&["stop", handle]).await?;
        if !output.status.success() {
            if is_not_found(&output.stderr) {
                return Err(FairqError::ContainerNotFound(handle.to_string()));
            }
            return Err(FairqError::Runtime(format!(
                "docker stop failed for {}: {}",
                handle,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn logs(&self, handle: &str, since: DateTime<Utc>) -> FairqResult<Vec<u8>> {
        let since = since_arg(since);
        let output = self.docker(&["logs", "--since", since.as_str(), handle]).await?;
        if !output.status.success() {
            if is_not_found(&output.stderr) {
                return Err(FairqError::ContainerNotFound(handle.to_string()));
            }
            return Err(FairqError::Runtime(format!(
                "docker logs failed for {}: {}",
                handle,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut bytes = output.stdout;
        bytes.extend_from_slice(&output.stderr);
        Ok(bytes)
    }

    async fn stats(&self, handle: &str) -> FairqResult<ContainerStats> {
        let output = self
            .docker(&["stats", "--no-stream", "--format", "{{json .}}", handle])
            .await?;
        if !output.status.success() {
            if is_not_found(&output.stderr) {
                return Err(FairqError::ContainerNotFound(handle.to_string()));
            }
            return Err(FairqError::Runtime(format!(
                "docker stats failed for {}: {}",
                handle,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_stats(&String::from_utf8_lossy(&output.stdout))
    }

    async fn remove_container(&self, handle: &str) -> FairqResult<()> {
        let output = self.docker(&["rm", "--force", handle]).await?;
        if !output.status.success() {
            if is_not_found(&output.stderr) {
                return Err(FairqError::ContainerNotFound(handle.to_string()));
            }
            return Err(FairqError::Runtime(format!(
                "docker rm failed for {}: {}",
                handle,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!(container = handle, "Container removed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime_with_mounts(mounts: Vec<&str>) -> DockerRuntime {
        DockerRuntime::new(RuntimeConfig {
            mounts: mounts.into_iter().map(str::to_string).collect(),
            ..RuntimeConfig::default()
        })
    }

    #[test]
    fn test_run_args_defaults() {
        let runtime = runtime_with_mounts(vec![]);
        let mut config = JobConfig::new("train-net", "ilja");
        config.memory_limit = "32".to_string();

        let args = runtime
            .run_args("sha256:abc", &config, &DeviceVisibility::Devices(vec![0, 1]))
            .unwrap();

        assert_eq!(&args[..2], &["run", "--detach"]);
        assert!(args.windows(2).any(|w| w == ["--memory", "32g"]));
        assert!(args.windows(2).any(|w| w == ["--network", "host"]));
        // removal happens after the final output collection, not by docker
        assert!(!args.contains(&"--rm".to_string()));
        assert!(args
            .windows(2)
            .any(|w| w == ["--env", "NVIDIA_VISIBLE_DEVICES=0,1"]));
        assert_eq!(args.last().unwrap(), "sha256:abc");
    }

    #[test]
    fn test_run_args_merges_run_params() {
        let runtime = runtime_with_mounts(vec![]);
        let mut config = JobConfig::new("train-net", "ilja");
        config.run_params.insert(
            "command".to_string(),
            serde_json::json!(["python", "train.py"]),
        );
        config.run_params.insert(
            "environment".to_string(),
            serde_json::json!({"EPOCHS": 10, "NVIDIA_VISIBLE_DEVICES": "all"}),
        );
        config
            .run_params
            .insert("ipc_mode".to_string(), serde_json::json!("host"));
        config
            .run_params
            .insert("privileged".to_string(), serde_json::json!(false));

        let args = runtime
            .run_args("img", &config, &DeviceVisibility::None)
            .unwrap();

        assert!(args.windows(2).any(|w| w == ["--env", "EPOCHS=10"]));
        assert!(!args.iter().any(|a| a == "NVIDIA_VISIBLE_DEVICES=all"));
        assert!(args.contains(&"--ipc-mode=host".to_string()));
        assert!(!args.iter().any(|a| a.starts_with("--privileged")));
        let image_pos = args.iter().position(|a| a == "img").unwrap();
        assert_eq!(&args[image_pos + 1..], &["python", "train.py"]);
    }

    #[test]
    fn test_run_args_rejects_nested_params() {
        let runtime = runtime_with_mounts(vec![]);
        let mut config = JobConfig::new("train-net", "ilja");
        config
            .run_params
            .insert("ulimits".to_string(), serde_json::json!({"nofile": 1024}));

        let err = runtime
            .run_args("img", &config, &DeviceVisibility::None)
            .unwrap_err();
        assert!(matches!(err, FairqError::Runtime(_)));
    }

    #[test]
    fn test_output_mount_gets_executor_folder() {
        let runtime = runtime_with_mounts(vec!["/data:/imgdir", "/results:/outdir"]);
        let mounts = runtime.mounts_for("markus");
        assert_eq!(mounts[0], (PathBuf::from("/data"), "/imgdir".to_string()));
        assert_eq!(
            mounts[1],
            (PathBuf::from("/results/markus"), "/outdir".to_string())
        );
    }

    #[test]
    fn test_parse_inspect() {
        let json = r#"[
            {"Id": "aaa", "State": {"Status": "running"},
             "Config": {"Env": ["PATH=/usr/bin", "NVIDIA_VISIBLE_DEVICES=0,2"]}},
            {"Id": "bbb", "State": {"Status": "paused"}, "Config": {"Env": null}},
            {"Id": "ccc", "State": {"Status": "running"},
             "Config": {"Env": ["NVIDIA_VISIBLE_DEVICES=all"]}}
        ]"#;

        let live = parse_inspect(json).unwrap();
        assert_eq!(live.len(), 3);
        assert_eq!(live[0].devices, DeviceVisibility::Devices(vec![0, 2]));
        assert_eq!(live[1].devices, DeviceVisibility::None);
        assert_eq!(live[1].status, ContainerStatus::Paused);
        assert_eq!(live[2].devices, DeviceVisibility::All);
    }

    #[test]
    fn test_run_args_rejects_string_command() {
        let runtime = runtime_with_mounts(vec![]);
        let mut config = JobConfig::new("train-net", "ilja");
        config.run_params.insert(
            "command".to_string(),
            serde_json::json!("python -c 'print(1)'"),
        );

        let err = runtime
            .run_args("img", &config, &DeviceVisibility::None)
            .unwrap_err();
        assert!(err.to_string().contains("must be a list"));
    }

    #[test]
    fn test_parse_stats() {
        let line = r#"{"BlockIO":"0B / 0B","CPUPerc":"197.45%","Container":"aaa","ID":"aaa","MemPerc":"12.50%","MemUsage":"2.5GiB / 20GiB","Name":"train","NetIO":"1kB / 0B","PIDs":"12"}"#;
        let stats = parse_stats(&format!("{}\n", line)).unwrap();
        assert_eq!(stats.cpu_percent, 197.45);
        assert_eq!(stats.memory_percent, 12.5);
        assert_eq!(stats.memory_usage, "2.5GiB / 20GiB");

        let idle = r#"{"CPUPerc":"--","MemPerc":"--","MemUsage":"-- / --"}"#;
        let stats = parse_stats(idle).unwrap();
        assert_eq!(stats.cpu_percent, 0.0);
        assert_eq!(stats.memory_percent, 0.0);
    }

    #[test]
    fn test_logs_since_keeps_subsecond_precision() {
        let since = DateTime::parse_from_rfc3339("2026-03-01T10:00:00.123456789Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(since_arg(since), "2026-03-01T10:00:00.123456789Z");
    }

    #[test]
    fn test_runtime_name() {
        assert_eq!(runtime_with_mounts(vec![]).name(), "docker");
    }
}
