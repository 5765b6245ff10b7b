use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Settings for a [`SyncManager`](crate::sync::SyncManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Retention window applied to every source buffer, in seconds.
    pub window_size_secs: f64,
    /// Capacity used when a source registers without an explicit one.
    pub default_capacity: usize,
    /// Look-back used by snapshot pollers, in seconds.
    pub poll_duration_secs: f64,
}

impl SyncConfig {
    pub fn new() -> Self {
        Self {
            window_size_secs: 1.0,
            default_capacity: 1000,
            poll_duration_secs: 0.1,
        }
    }

    pub fn with_window_size(mut self, secs: f64) -> Self {
        self.window_size_secs = secs;
        self
    }

    pub fn with_default_capacity(mut self, capacity: usize) -> Self {
        self.default_capacity = capacity;
        self
    }

    pub fn with_poll_duration(mut self, secs: f64) -> Self {
        self.poll_duration_secs = secs;
        self
    }

    /// Short window and small buffers for interactive monitoring.
    pub fn low_latency() -> Self {
        Self::new()
            .with_window_size(0.5)
            .with_default_capacity(256)
            .with_poll_duration(0.05)
    }

    /// Longer look-back for analysis that wants more context per poll.
    pub fn analysis() -> Self {
        Self::new()
            .with_window_size(5.0)
            .with_default_capacity(5000)
            .with_poll_duration(1.0)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if !(self.window_size_secs.is_finite() && self.window_size_secs > 0.0) {
            return Err(CoreError::InvalidConfig(format!(
                "window_size_secs must be positive, got {}",
                self.window_size_secs
            )));
        }
        if self.default_capacity == 0 {
            return Err(CoreError::InvalidConfig(
                "default_capacity must be at least 1".to_string(),
            ));
        }
        if !(self.poll_duration_secs.is_finite() && self.poll_duration_secs > 0.0) {
            return Err(CoreError::InvalidConfig(format!(
                "poll_duration_secs must be positive, got {}",
                self.poll_duration_secs
            )));
        }
        Ok(())
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

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncConfig::default();
        assert_eq!(config.window_size_secs, 1.0);
        assert_eq!(config.default_capacity, 1000);
        assert!(config.validate().is_ok());
        assert!(SyncConfig::low_latency().validate().is_ok());
        assert!(SyncConfig::analysis().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = SyncConfig::from_json_str(r#"{ "window_size_secs": 2.5 }"#).unwrap();
        assert_eq!(config.window_size_secs, 2.5);
        assert_eq!(config.default_capacity, 1000);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            SyncConfig::new().with_window_size(0.0).validate(),
            Err(CoreError::InvalidConfig(_))
        ));
        assert!(SyncConfig::new().with_default_capacity(0).validate().is_err());
        assert!(SyncConfig::new().with_poll_duration(f64::NAN).validate().is_err());
        assert!(matches!(
            SyncConfig::from_json_str("{ not json"),
            Err(CoreError::ConfigParse(_))
        ));
    }
}
