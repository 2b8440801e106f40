//! fairq-api: REST API server for fairq
//!
//! This crate provides the control surface of a running scheduler:
//! - Status, queue listings and per-user statistics
//! - Lock, unlock and pending-job deletion
//! - History clearing and shutdown

pub mod rest;

pub use rest::create_router;
