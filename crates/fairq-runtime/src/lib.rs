//! fairq-runtime: Container runtime abstraction layer
//!
//! This crate provides the runtimes fairq starts job containers with:
//! - Docker runtime driving the `docker` client binary
//! - In-memory mock runtime for tests

pub mod docker;
pub mod mock;
pub mod traits;

pub use docker::DockerRuntime;
pub use mock::{MockFailure, MockRuntime, StartRecord};
pub use traits::{ContainerRuntime, ContainerStatus, LiveContainer};
