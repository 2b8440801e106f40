//! GPU inventory and device-visibility declarations

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, warn};

use crate::GpuConfig;

/// Environment variable the container runtime reads to expose GPU devices
pub const VISIBLE_DEVICES_ENV: &str = "NVIDIA_VISIBLE_DEVICES";

/// Prefix of the per-device nodes under the device directory
const DEVICE_NODE_PREFIX: &str = "nvidia";

/// Which GPU devices a container is allowed to see
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceVisibility {
    /// Every device on the host
    All,
    /// No device
    None,
    /// An explicit list of device minors
    Devices(Vec<u32>),
}

impl DeviceVisibility {
    /// Parse a declaration such as `0,2`, `all` or `none`
    ///
    /// Empty and `void` declarations are treated as `none`. Tokens that are not
    /// device numbers are skipped.
    pub fn parse(value: &str) -> Self {
        let trimmed = value.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "all" => return DeviceVisibility::All,
            "" | "none" | "void" => return DeviceVisibility::None,
            _ => {}
        }

        let mut devices = Vec::new();
        for token in trimmed.split(',') {
            match token.trim().parse::<u32>() {
                Ok(minor) => devices.push(minor),
                Err(_) => debug!(token = token, "Ignoring malformed device token"),
            }
        }

        if devices.is_empty() {
            DeviceVisibility::None
        } else {
            DeviceVisibility::Devices(devices)
        }
    }

    /// Declaration for an assignment made by the allocator
    pub fn from_assignment(minors: &[u32]) -> Self {
        if minors.is_empty() {
            DeviceVisibility::None
        } else {
            DeviceVisibility::Devices(minors.to_vec())
        }
    }

    /// Devices of the host claimed by this declaration
    pub fn resolve(&self, system: &[u32]) -> Vec<u32> {
        match self {
            DeviceVisibility::All => system.to_vec(),
            DeviceVisibility::None => Vec::new(),
            DeviceVisibility::Devices(minors) => minors
                .iter()
                .copied()
                .filter(|m| system.contains(m))
                .collect(),
        }
    }

    /// Render as an environment entry for the runtime
    pub fn env_entry(&self) -> String {
        format!("{}={}", VISIBLE_DEVICES_ENV, self)
    }
}

impl std::fmt::Display for DeviceVisibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceVisibility::All => write!(f, "all"),
            DeviceVisibility::None => write!(f, "none"),
            DeviceVisibility::Devices(minors) => {
                let joined = minors
                    .iter()
                    .map(|m| m.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                write!(f, "{}", joined)
            }
        }
    }
}

/// GPU devices physically present on the host
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct GpuInventory {
    /// Sorted device minors
    pub minors: Vec<u32>,
}

impl GpuInventory {
    /// Create empty inventory (no GPUs detected)
    pub fn empty() -> Self {
        Self { minors: Vec::new() }
    }

    /// Inventory from an explicit device list
    pub fn from_minors(minors: impl IntoIterator<Item = u32>) -> Self {
        let set: BTreeSet<u32> = minors.into_iter().collect();
        Self {
            minors: set.into_iter().collect(),
        }
    }

    /// Inventory from configuration, scanning the device directory unless overridden
    pub fn from_config(config: &GpuConfig) -> Self {
        match &config.devices {
            Some(devices) => Self::from_minors(devices.iter().copied()),
            None => detect_gpus(&config.dev_dir),
        }
    }

    pub fn total_count(&self) -> usize {
        self.minors.len()
    }
}

/// Detect GPUs by scanning `dev_dir` for `nvidia<N>` device nodes
pub fn detect_gpus(dev_dir: &Path) -> GpuInventory {
    let entries = match std::fs::read_dir(dev_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dev_dir.display(), error = %e, "Cannot scan for GPU devices");
            return GpuInventory::empty();
        }
    };

    let minors = entries.filter_map(|entry| {
        let name = entry.ok()?.file_name();
        let name = name.to_str()?;
        name.strip_prefix(DEVICE_NODE_PREFIX)?.parse::<u32>().ok()
    });

    let inventory = GpuInventory::from_minors(minors);
    debug!(gpus = ?inventory.minors, "Detected GPU devices");
    inventory
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sentinels() {
        assert_eq!(DeviceVisibility::parse("all"), DeviceVisibility::All);
        assert_eq!(DeviceVisibility::parse("ALL"), DeviceVisibility::All);
        assert_eq!(DeviceVisibility::parse("none"), DeviceVisibility::None);
        assert_eq!(DeviceVisibility::parse(""), DeviceVisibility::None);
        assert_eq!(DeviceVisibility::parse("void"), DeviceVisibility::None);
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(
            DeviceVisibility::parse("0, 2,x"),
            DeviceVisibility::Devices(vec![0, 2])
        );
    }

    #[test]
    fn test_resolve_against_system() {
        let system = vec![0, 1, 2, 3];
        assert_eq!(DeviceVisibility::All.resolve(&system), system);
        assert!(DeviceVisibility::None.resolve(&system).is_empty());
        assert_eq!(
            DeviceVisibility::Devices(vec![1, 7]).resolve(&system),
            vec![1]
        );
    }

    #[test]
    fn test_display_round_trip() {
        let decl = DeviceVisibility::from_assignment(&[0, 3]);
        assert_eq!(decl.to_string(), "0,3");
        assert_eq!(DeviceVisibility::parse(&decl.to_string()), decl);
        assert_eq!(
            DeviceVisibility::from_assignment(&[]).env_entry(),
            "NVIDIA_VISIBLE_DEVICES=none"
        );
    }

    #[test]
    fn test_detect_gpus_from_device_nodes() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["nvidia0", "nvidia1", "nvidiactl", "nvidia-uvm", "null"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }

        let inventory = detect_gpus(dir.path());
        assert_eq!(inventory.minors, vec![0, 1]);
    }

    #[test]
    fn test_detect_gpus_missing_dir() {
        let inventory = detect_gpus(Path::new("/nonexistent/fairq/dev"));
        assert_eq!(inventory, GpuInventory::empty());
    }

    #[test]
    fn test_inventory_override() {
        let config = GpuConfig {
            dev_dir: "/nonexistent".into(),
            devices: Some(vec![3, 1, 3]),
        };
        assert_eq!(GpuInventory::from_config(&config).minors, vec![1, 3]);
    }
}
