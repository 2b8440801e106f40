//! Device placement decisions

use fairq_core::JobConfig;

/// Strategy for choosing devices out of the free set
pub trait PlacementStrategy: Send + Sync {
    /// Pick devices for a job, `None` when the free set cannot satisfy it
    fn place(&self, config: &JobConfig, free: &[u32]) -> Option<Vec<u32>>;
}

/// Takes the first `gpu_count` free devices
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstFitPlacement;

impl PlacementStrategy for FirstFitPlacement {
    fn place(&self, config: &JobConfig, free: &[u32]) -> Option<Vec<u32>> {
        let gpu_count = config.gpu_count as usize;
        if free.len() < gpu_count {
            return None;
        }
        Some(free[..gpu_count].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(gpu_count: u32) -> JobConfig {
        let mut config = JobConfig::new("train-net", "ilja");
        config.gpu_count = gpu_count;
        config
    }

    #[test]
    fn test_first_fit_no_gpus() {
        let decision = FirstFitPlacement.place(&config(0), &[]);
        assert_eq!(decision, Some(Vec::new()));
    }

    #[test]
    fn test_first_fit_takes_lowest_free() {
        let decision = FirstFitPlacement.place(&config(2), &[1, 3, 4]);
        assert_eq!(decision, Some(vec![1, 3]));
    }

    #[test]
    fn test_first_fit_insufficient() {
        assert!(FirstFitPlacement.place(&config(4), &[0, 1]).is_none());
    }
}
