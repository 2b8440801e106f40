//! Child side of the subprocess ingestion mode

use fairq_core::{DaemonConfig, FairqResult, GpuInventory};
use fairq_ingest::{stop_on_stdin_close, IngestionPipeline, TicketWriter};
use fairq_runtime::DockerRuntime;
use fairq_store::BundleStore;
use std::sync::Arc;
use tracing::info;

/// Run the pipeline with stdout as the ticket stream until stdin closes
pub async fn run_worker(config: DaemonConfig) -> FairqResult<()> {
    let runtime = Arc::new(DockerRuntime::new(config.runtime.clone()));
    runtime.ping().await?;

    let pipeline = IngestionPipeline::new(
        BundleStore::new(&config.paths, config.ingest.remove_invalid),
        runtime,
        config.ingest.clone(),
        GpuInventory::from_config(&config.gpu),
    );

    info!(pid = std::process::id(), "Ingest worker started");
    pipeline
        .run(TicketWriter::new(tokio::io::stdout()), stop_on_stdin_close())
        .await;
    Ok(())
}
