//! Ingestion pipeline
//!
//! Each pass lists the inbound bundles and runs every bundle through
//! validation, authorization, staging and the image build. Failures are
//! contained to the bundle that caused them.

use fairq_core::{FairqError, FairqResult, GpuInventory, IngestConfig, JobConfig, JobTicket};
use fairq_runtime::ContainerRuntime;
use fairq_store::BundleStore;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::codec::TicketSink;

/// Outcome counts of one pass over the inbound location
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Bundles turned into tickets
    pub accepted: usize,
    /// Bundles rejected for their descriptor or executor
    pub quarantined: usize,
    /// Bundles whose image could not be produced
    pub failed: usize,
    /// Bundles left alone after an unexpected error
    pub skipped: usize,
}

pub struct IngestionPipeline {
    bundles: BundleStore,
    runtime: Arc<dyn ContainerRuntime>,
    config: IngestConfig,
    inventory: GpuInventory,
}

impl IngestionPipeline {
    pub fn new(
        bundles: BundleStore,
        runtime: Arc<dyn ContainerRuntime>,
        config: IngestConfig,
        inventory: GpuInventory,
    ) -> Self {
        Self {
            bundles,
            runtime,
            config,
            inventory,
        }
    }

    /// Run passes until the termination flag is set, then close the sink
    pub async fn run<S: TicketSink>(&self, mut sink: S, mut shutdown: watch::Receiver<bool>) {
        info!(
            inbound = %self.bundles.inbound().display(),
            executors = self.config.executors.len(),
            "Ingestion started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_pass(&mut sink).await {
                Ok(report) if report != PassReport::default() => {
                    info!(
                        accepted = report.accepted,
                        quarantined = report.quarantined,
                        failed = report.failed,
                        skipped = report.skipped,
                        "Ingestion pass finished"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Ticket sink closed, stopping ingestion");
                    break;
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.sleep_interval()) => {}
            }
        }

        if let Err(e) = sink.close().await {
            warn!(error = %e, "Failed to close ticket sink");
        }
        info!("Ingestion stopped");
    }

    /// One pass over the inbound location
    ///
    /// Only a failing sink aborts the pass.
    pub async fn run_pass<S: TicketSink>(&self, sink: &mut S) -> FairqResult<PassReport> {
        let mut report = PassReport::default();
        let bundles = match self.bundles.list().await {
            Ok(bundles) => bundles,
            Err(e) => {
                warn!(error = %e, "Failed to list inbound bundles");
                return Ok(report);
            }
        };

        for bundle in bundles {
            match self.process_bundle(&bundle).await {
                Ok(ticket) => {
                    info!(
                        job_id = %ticket.id,
                        name = %ticket.config.name,
                        executor = %ticket.config.executor,
                        "Job submitted"
                    );
                    sink.send(ticket).await?;
                    report.accepted += 1;
                }
                Err(e) if e.is_submission_error() => report.quarantined += 1,
                Err(FairqError::Build(_)) | Err(FairqError::Unimplemented(_)) => report.failed += 1,
                Err(e) => {
                    error!(bundle = %bundle.display(), error = %e, "Skipping bundle");
                    report.skipped += 1;
                }
            }
        }
        Ok(report)
    }

    /// Turn one bundle into a ticket
    pub async fn process_bundle(&self, bundle: &Path) -> FairqResult<JobTicket> {
        let config = match self.admit(bundle).await {
            Ok(config) => config,
            Err(e) if e.is_submission_error() => {
                if let Err(move_err) = self.bundles.quarantine(bundle, &e.to_string()).await {
                    error!(bundle = %bundle.display(), error = %move_err, "Failed to quarantine bundle");
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let staged = self.bundles.stage(bundle).await?;
        let image_ref = match self.produce_image(&staged, &config).await {
            Ok(image_ref) => image_ref,
            Err(e) => {
                error!(job = %config.name, executor = %config.executor, error = %e, "Image build failed");
                if let Err(move_err) = self.bundles.fail(&staged, &e.to_string()).await {
                    error!(bundle = %staged.display(), error = %move_err, "Failed to set aside bundle");
                }
                return Err(e);
            }
        };

        if let Err(e) = self.bundles.discard(&staged).await {
            warn!(bundle = %staged.display(), error = %e, "Failed to remove staged bundle");
        }
        Ok(JobTicket::new(config, image_ref))
    }

    /// Parse, authorize and size-check the descriptor
    async fn admit(&self, bundle: &Path) -> FairqResult<JobConfig> {
        let config = self.bundles.parse_config(bundle).await?;

        if !self.config.is_authorized(&config.executor) {
            return Err(FairqError::Unauthorized(config.executor));
        }

        let available = self.inventory.total_count();
        if config.gpu_count as usize > available {
            return Err(FairqError::InvalidSubmission(format!(
                "{} requests {} GPUs but the host has {}",
                config.name, config.gpu_count, available
            )));
        }

        debug!(job = %config.name, executor = %config.executor, "Bundle admitted");
        Ok(config)
    }

    async fn produce_image(&self, staged: &Path, config: &JobConfig) -> FairqResult<String> {
        if !config.build {
            return Err(FairqError::Unimplemented(format!(
                "{} asks to load a pre-built image, which is not supported",
                config.name
            )));
        }
        self.runtime.build_image(staged, &image_tag(config)).await
    }
}

/// Image tag for a job: `fairq/<executor>-<name>`, reduced to valid characters
pub fn image_tag(config: &JobConfig) -> String {
    let sanitize = |s: &str| -> String {
        s.to_ascii_lowercase()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    };
    format!(
        "fairq/{}-{}",
        sanitize(&config.executor),
        sanitize(&config.name)
    )
}
