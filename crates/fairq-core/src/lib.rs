//! fairq-core: Core types for the fairq scheduler
//!
//! This crate provides the fundamental types used throughout fairq:
//! - Job descriptors, queued/running jobs and ingestion tickets
//! - GPU inventory and device-visibility declarations
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod gpu;
pub mod job;

pub use self::config::*;
pub use error::*;
pub use gpu::*;
pub use job::*;
