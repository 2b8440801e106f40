//! fairq-ingest: Bundle ingestion for fairq
//!
//! This crate turns submitted bundles into job tickets:
//! - The ingestion pipeline (validate, authorize, stage, build, emit)
//! - The line-delimited JSON ticket stream crossing the process boundary
//! - The child-process bridge used by the daemon

pub mod codec;
pub mod pipeline;
pub mod process;

pub use codec::{forward_tickets, TicketSink, TicketWriter};
pub use pipeline::{IngestionPipeline, PassReport};
pub use process::{stop_on_stdin_close, IngestProcess};
