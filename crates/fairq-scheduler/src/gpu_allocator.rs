//! GPU allocator deriving free devices from live runtime state

use fairq_core::{FairqError, FairqResult, GpuInventory, JobConfig};
use fairq_runtime::{ContainerRuntime, LiveContainer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

use crate::placement::{FirstFitPlacement, PlacementStrategy};

/// Partition of the host's devices
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Devices no live container declares
    pub free: Vec<u32>,
    /// Devices claimed by at least one live container
    pub assigned: Vec<u32>,
}

/// GPU allocator over a fixed host inventory
///
/// Holds no bookkeeping of its own: every query asks the runtime which
/// devices live containers declare.
#[derive(Clone)]
pub struct GpuAllocator {
    inventory: GpuInventory,
    placement: Arc<dyn PlacementStrategy>,
}

impl GpuAllocator {
    /// Create a new allocator with first-fit placement
    pub fn new(inventory: GpuInventory) -> Self {
        info!(gpus = ?inventory.minors, "GPU allocator initialized");
        Self {
            inventory,
            placement: Arc::new(FirstFitPlacement),
        }
    }

    /// Create an empty allocator (no GPUs)
    pub fn empty() -> Self {
        Self::new(GpuInventory::empty())
    }

    pub fn with_placement(mut self, placement: Arc<dyn PlacementStrategy>) -> Self {
        self.placement = placement;
        self
    }

    pub fn inventory(&self) -> &GpuInventory {
        &self.inventory
    }

    /// Get the total number of GPUs
    pub fn total_count(&self) -> usize {
        self.inventory.total_count()
    }

    /// Split the inventory by the declarations of the given containers
    pub fn partition(&self, live: &[LiveContainer]) -> DeviceStatus {
        let assigned: BTreeSet<u32> = live
            .iter()
            .flat_map(|c| c.devices.resolve(&self.inventory.minors))
            .collect();
        let free = self
            .inventory
            .minors
            .iter()
            .copied()
            .filter(|m| !assigned.contains(m))
            .collect();

        DeviceStatus {
            free,
            assigned: assigned.into_iter().collect(),
        }
    }

    /// Query the runtime and compute the free and assigned devices
    pub async fn free_devices(&self, runtime: &dyn ContainerRuntime) -> FairqResult<DeviceStatus> {
        let live = runtime.list_live_containers().await?;
        let status = self.partition(&live);
        debug!(
            free = ?status.free,
            assigned = ?status.assigned,
            containers = live.len(),
            "Queried GPU devices"
        );
        Ok(status)
    }

    /// Pick devices for a job out of the free set
    pub fn assign(&self, config: &JobConfig, free: &[u32]) -> FairqResult<Vec<u32>> {
        self.placement.place(config, free).ok_or_else(|| {
            FairqError::ResourceExhausted(format!(
                "Not enough GPUs available: requested {}, available {}",
                config.gpu_count,
                free.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fairq_core::DeviceVisibility;
    use fairq_runtime::{ContainerStatus, MockRuntime};

    fn live(devices: DeviceVisibility) -> LiveContainer {
        LiveContainer {
            handle: "c".to_string(),
            devices,
            status: ContainerStatus::Running,
        }
    }

    #[test]
    fn test_allocator_empty() {
        let allocator = GpuAllocator::empty();
        assert_eq!(allocator.total_count(), 0);
        assert_eq!(allocator.partition(&[]), DeviceStatus::default());
    }

    #[test]
    fn test_partition_unions_declarations() {
        let allocator = GpuAllocator::new(GpuInventory::from_minors(0..4));
        let status = allocator.partition(&[
            live(DeviceVisibility::Devices(vec![2])),
            live(DeviceVisibility::None),
            live(DeviceVisibility::Devices(vec![0, 2, 9])),
        ]);
        assert_eq!(status.assigned, vec![0, 2]);
        assert_eq!(status.free, vec![1, 3]);
    }

    #[test]
    fn test_partition_all_claims_everything() {
        let allocator = GpuAllocator::new(GpuInventory::from_minors(0..2));
        let status = allocator.partition(&[live(DeviceVisibility::All)]);
        assert!(status.free.is_empty());
        assert_eq!(status.assigned, vec![0, 1]);
    }

    #[test]
    fn test_assign_insufficient() {
        let allocator = GpuAllocator::new(GpuInventory::from_minors(0..2));
        let mut config = JobConfig::new("train-net", "ilja");
        config.gpu_count = 2;

        assert_eq!(allocator.assign(&config, &[0, 1]).unwrap(), vec![0, 1]);
        assert!(allocator.assign(&config, &[1]).unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn test_free_devices_from_runtime() {
        let runtime = MockRuntime::new();
        runtime.add_external(DeviceVisibility::Devices(vec![1]));
        let allocator = GpuAllocator::new(GpuInventory::from_minors(0..3));

        let status = allocator.free_devices(&runtime).await.unwrap();
        assert_eq!(status.free, vec![0, 2]);
        assert_eq!(status.assigned, vec![1]);
    }
}
