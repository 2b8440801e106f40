//! CLI commands implementation

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// API client for communicating with the daemon
pub struct ApiClient {
    base_url: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// Job as listed by the API
#[derive(Debug, Deserialize)]
pub struct JobResponse {
    pub id: Uuid,
    pub name: String,
    pub executor: String,
    pub gpu_count: u32,
    pub assigned_gpus: Vec<u32>,
    pub state: String,
    pub created_at: DateTime<Utc>,
    #[allow(dead_code)]
    pub started_at: Option<DateTime<Utc>>,
    #[allow(dead_code)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stats: Option<ContainerStats>,
}

/// Resource sample of a running job
#[derive(Debug, Deserialize)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_usage: String,
}

/// Ingestion worker state embedded in the status
#[derive(Debug, Deserialize)]
pub struct IngestStatus {
    pub phase: String,
    pub mode: Option<String>,
    pub uptime_secs: Option<i64>,
}

/// Per-user statistics
#[derive(Debug, Deserialize)]
pub struct UserStats {
    pub user: String,
    pub penalty: f64,
    pub jobs_run: usize,
    pub jobs_enqueued: usize,
}

/// Device partition embedded in the status
#[derive(Debug, Deserialize)]
pub struct DeviceStatus {
    pub free: Vec<u32>,
    pub assigned: Vec<u32>,
}

/// GPU response
#[derive(Debug, Deserialize)]
pub struct GpuResponse {
    pub total: usize,
    pub free: Vec<u32>,
    pub assigned: Vec<u32>,
}

/// Status response
#[derive(Debug, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub phase: String,
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

#[derive(Debug, Deserialize)]
pub struct LockResponse {
    pub locked: bool,
    pub changed: bool,
}

#[derive(Debug, Deserialize)]
pub struct DeleteResponse {
    pub deleted: usize,
}

/// Show scheduler status
pub async fn status(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .get(client.url("/api/v1/status"))
        .send()
        .await?;

    if response.status().is_success() {
        let status: StatusResponse = response.json().await?;

        println!("fairq v{}", status.version);
        println!();
        println!(
            "Scheduler: {} (up {})",
            phase_label(&status.phase),
            status
                .uptime_secs
                .map(format_duration)
                .unwrap_or_else(|| "-".to_string())
        );
        println!(
            "Ingestion: {}{} (up {})",
            phase_label(&status.ingest.phase),
            status
                .ingest
                .mode
                .map(|mode| format!(", {}", mode))
                .unwrap_or_default(),
            status
                .ingest
                .uptime_secs
                .map(format_duration)
                .unwrap_or_else(|| "-".to_string())
        );
        match (status.locked, status.locked_since) {
            (true, Some(since)) => println!(
                "Queue: LOCKED since {} ({})",
                since.format("%Y-%m-%d %H:%M:%S"),
                format_duration((Utc::now() - since).num_seconds())
            ),
            (true, None) => println!("Queue: LOCKED"),
            (false, _) => println!("Queue: unlocked"),
        }
        println!(
            "Jobs: {} pending, {} running, {} in history",
            status.pending_count, status.running_count, status.history_count
        );
        println!(
            "GPUs: free {}, assigned {}",
            format_ids(&status.gpus.free),
            format_ids(&status.gpus.assigned)
        );
        println!("Users: {}", status.users.len());
    } else {
        let error = response.text().await?;
        eprintln!("Failed to get status: {}", error);
    }

    Ok(())
}

/// List pending jobs
pub async fn pending(client: &ApiClient) -> Result<()> {
    list_jobs(client, "/api/v1/pending", "No pending jobs", None).await
}

/// List running jobs
pub async fn running(client: &ApiClient) -> Result<()> {
    list_jobs(client, "/api/v1/running", "No running jobs", None).await
}

/// List finished jobs
pub async fn history(client: &ApiClient, limit: Option<usize>) -> Result<()> {
    list_jobs(client, "/api/v1/history", "History is empty", limit).await
}

async fn list_jobs(
    client: &ApiClient,
    path: &str,
    empty: &str,
    limit: Option<usize>,
) -> Result<()> {
    let response = client.client.get(client.url(path)).send().await?;

    if response.status().is_success() {
        let jobs: Vec<JobResponse> = response.json().await?;

        if jobs.is_empty() {
            println!("{}", empty);
        } else {
            println!(
                "{:<36} {:<24} {:<12} {:<8} {:<10} {:<20}",
                "ID", "NAME", "EXECUTOR", "GPUS", "STATE", "SUBMITTED"
            );
            println!("{}", "-".repeat(112));
            for job in jobs.iter().take(limit.unwrap_or(usize::MAX)) {
                let gpus = if job.assigned_gpus.is_empty() {
                    job.gpu_count.to_string()
                } else {
                    format_ids(&job.assigned_gpus)
                };
                println!(
                    "{:<36} {:<24} {:<12} {:<8} {:<10} {:<20}",
                    job.id,
                    job.name,
                    job.executor,
                    gpus,
                    job.state,
                    job.created_at.format("%Y-%m-%d %H:%M:%S")
                );
                if let Some(stats) = &job.stats {
                    println!("{:<36} {}", "", format_stats(stats));
                }
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to list jobs: {}", error);
    }

    Ok(())
}

/// Show per-user statistics
pub async fn users(client: &ApiClient) -> Result<()> {
    let response = client.client.get(client.url("/api/v1/users")).send().await?;

    if response.status().is_success() {
        let users: Vec<UserStats> = response.json().await?;

        if users.is_empty() {
            println!("No users");
        } else {
            println!("{:<16} {:>10} {:>10} {:>10}", "USER", "PENALTY", "RUN", "ENQUEUED");
            for u in users {
                println!(
                    "{:<16} {:>10.4} {:>10} {:>10}",
                    u.user, u.penalty, u.jobs_run, u.jobs_enqueued
                );
            }
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to get users: {}", error);
    }

    Ok(())
}

/// Show GPU partition
pub async fn gpus(client: &ApiClient) -> Result<()> {
    let response = client.client.get(client.url("/api/v1/gpus")).send().await?;

    if response.status().is_success() {
        let gpus: GpuResponse = response.json().await?;

        println!("GPUs: {} total, {} free", gpus.total, gpus.free.len());
        println!("  Free:     {}", format_ids(&gpus.free));
        println!("  Assigned: {}", format_ids(&gpus.assigned));
    } else {
        let error = response.text().await?;
        eprintln!("Failed to get GPU info: {}", error);
    }

    Ok(())
}

/// Lock or unlock the queue
pub async fn lock(client: &ApiClient, lock: bool) -> Result<()> {
    let path = if lock { "/api/v1/lock" } else { "/api/v1/unlock" };
    let response = client.client.post(client.url(path)).send().await?;

    if response.status().is_success() {
        let state: LockResponse = response.json().await?;
        let word = if state.locked { "locked" } else { "unlocked" };
        if state.changed {
            println!("Queue {}", word);
        } else {
            println!("Queue was already {}", word);
        }
    } else {
        let error = response.text().await?;
        eprintln!("Failed to change lock: {}", error);
    }

    Ok(())
}

/// Delete pending jobs
pub async fn delete(client: &ApiClient, ids: Vec<Uuid>, names: Vec<String>) -> Result<()> {
    if ids.is_empty() && names.is_empty() {
        anyhow::bail!("give at least one --id or --name");
    }

    #[derive(Serialize)]
    struct DeleteRequest {
        ids: Vec<Uuid>,
        names: Vec<String>,
    }

    let response = client
        .client
        .post(client.url("/api/v1/pending/delete"))
        .json(&DeleteRequest { ids, names })
        .send()
        .await?;

    if response.status().is_success() {
        let result: DeleteResponse = response.json().await?;
        println!("Deleted {} pending job(s)", result.deleted);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to delete jobs: {}", error);
    }

    Ok(())
}

/// Empty the history
pub async fn clear_history(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .delete(client.url("/api/v1/history"))
        .send()
        .await?;

    if response.status().is_success() {
        let result: DeleteResponse = response.json().await?;
        println!("Removed {} job(s) from history", result.deleted);
    } else {
        let error = response.text().await?;
        eprintln!("Failed to clear history: {}", error);
    }

    Ok(())
}

/// Stop the daemon
pub async fn shutdown(client: &ApiClient) -> Result<()> {
    let response = client
        .client
        .post(client.url("/api/v1/shutdown"))
        .send()
        .await?;

    if response.status().is_success() {
        println!("Shutdown requested");
    } else {
        let error = response.text().await?;
        eprintln!("Failed to request shutdown: {}", error);
    }

    Ok(())
}

fn phase_label(phase: &str) -> String {
    phase.replace('_', " ")
}

fn format_stats(stats: &ContainerStats) -> String {
    format!(
        "cpu {:.1}%  mem {:.1}% ({})",
        stats.cpu_percent, stats.memory_percent, stats.memory_usage
    )
}

fn format_ids(ids: &[u32]) -> String {
    if ids.is_empty() {
        return "-".to_string();
    }
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// `1d 2h 3m 4s`, leading zero units omitted
fn format_duration(secs: i64) -> String {
    let secs = secs.max(0);
    let (days, rest) = (secs / 86_400, secs % 86_400);
    let (hours, rest) = (rest / 3_600, rest % 3_600);
    let (minutes, seconds) = (rest / 60, rest % 60);

    let mut out = String::new();
    for (value, unit) in [(days, "d"), (hours, "h"), (minutes, "m")] {
        if value > 0 || !out.is_empty() {
            out.push_str(&format!("{}{} ", value, unit));
        }
    }
    out.push_str(&format!("{}s", seconds));
    out
}
