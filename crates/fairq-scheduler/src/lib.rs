//! fairq-scheduler: Fair-share GPU scheduler for fairq
//!
//! This crate provides the scheduling side of fairq:
//! - Fairness penalties and pending-queue ordering
//! - GPU allocation derived from live runtime state
//! - The scheduler task and the control handle used to drive it

pub mod control;
pub mod fairness;
pub mod gpu_allocator;
pub mod placement;
pub mod scheduler;

pub use control::{
    ControlHandle, IngestPhase, IngestStatus, IngestTracker, LockGate, SchedulerPhase,
    SchedulerSnapshot, StatusReport, UserStats,
};
pub use gpu_allocator::{DeviceStatus, GpuAllocator};
pub use placement::{FirstFitPlacement, PlacementStrategy};
pub use scheduler::{CycleOutcome, Scheduler, SchedulerSettings};
