//! fairq-store: Storage for fairq
//!
//! This crate provides the on-disk pieces of fairq:
//! - Snapshots of the history, pending and running collections
//! - The inbound bundle source and its staging, invalid and failed areas

pub mod bundle;
pub mod snapshot;

pub use bundle::BundleStore;
pub use snapshot::{QueueKind, QueueSnapshot, QueueStore};
