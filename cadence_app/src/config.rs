use std::path::Path;

use cadence_backend::{MonitorConfig, PoolConfig, ResourceTargets};
use cadence_core::{CoreResult, SyncConfig};
use serde::{Deserialize, Serialize};

/// Everything the process needs, loadable from one JSON file. Missing
/// sections and fields fall back to their defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    pub sync: SyncConfig,
    pub monitor: MonitorConfig,
    pub targets: ResourceTargets,
    pub pool: PoolConfig,
}

impl CadenceConfig {
    /// An out-of-range `pool.initial_workers` is not an error; the pool
    /// clamps it into the worker bounds.
    pub fn validate(&self) -> CoreResult<()> {
        self.sync.validate()?;
        self.monitor.validate()?;
        self.targets.validate()?;
        self.pool.validate()
    }

    pub fn from_json_str(json: &str) -> CoreResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> CoreResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::CoreError;

    #[test]
    fn test_empty_json_is_default() {
        let config = CadenceConfig::from_json_str("{}").unwrap();
        assert_eq!(config.sync, SyncConfig::default());
        assert_eq!(config.targets.cpu, 80.0);
        assert_eq!(config.pool.initial_batch_size, 32);
    }

    #[test]
    fn test_nested_overrides() {
        let json = r#"{
            "sync": { "window_size_secs": 3.0 },
            "targets": { "cpu": 60.0 },
            "pool": { "initial_workers": 2, "min_workers": 2, "max_workers": 6 }
        }"#;
        let config = CadenceConfig::from_json_str(json).unwrap();
        assert_eq!(config.sync.window_size_secs, 3.0);
        assert_eq!(config.sync.default_capacity, 1000);
        assert_eq!(config.targets.cpu, 60.0);
        assert_eq!(config.targets.memory, 80.0);
        assert_eq!(config.pool.max_workers, 6);
    }

    #[test]
    fn test_inverted_worker_bounds_rejected() {
        let json = r#"{ "pool": { "min_workers": 5, "max_workers": 4 } }"#;
        assert!(matches!(
            CadenceConfig::from_json_str(json),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_nested_validation_runs() {
        let json = r#"{ "monitor": { "interval_secs": 0 } }"#;
        assert!(CadenceConfig::from_json_str(json).is_err());
    }
}
