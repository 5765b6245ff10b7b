use std::num::NonZeroUsize;
use std::time::Duration;

use cadence_core::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};

fn positive_secs(name: &str, secs: f64) -> CoreResult<()> {
    if secs.is_finite() && secs > 0.0 {
        Ok(())
    } else {
        Err(CoreError::InvalidConfig(format!(
            "{name} must be a positive number of seconds, got {secs}"
        )))
    }
}

/// Logical CPUs, or 4 if the platform won't say.
pub fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(4)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Samples kept in the rolling history.
    pub history_size: usize,
    /// Seconds between background samples.
    pub interval_secs: f64,
}

impl MonitorConfig {
    pub fn new() -> Self {
        Self {
            history_size: 100,
            interval_secs: 1.0,
        }
    }

    pub fn with_history_size(mut self, size: usize) -> Self {
        self.history_size = size;
        self
    }

    pub fn with_interval(mut self, secs: f64) -> Self {
        self.interval_secs = secs;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.history_size == 0 {
            return Err(CoreError::InvalidConfig(
                "history_size must be at least 1".to_string(),
            ));
        }
        positive_secs("interval_secs", self.interval_secs)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Utilization targets (percent) the resource manager steers towards.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceTargets {
    pub cpu: f64,
    pub memory: f64,
    pub gpu_memory: f64,
}

impl ResourceTargets {
    pub fn new() -> Self {
        Self {
            cpu: 80.0,
            memory: 80.0,
            gpu_memory: 80.0,
        }
    }

    pub fn with_cpu(mut self, percent: f64) -> Self {
        self.cpu = percent;
        self
    }

    pub fn with_memory(mut self, percent: f64) -> Self {
        self.memory = percent;
        self
    }

    pub fn with_gpu_memory(mut self, percent: f64) -> Self {
        self.gpu_memory = percent;
        self
    }

    /// Leaves headroom for other processes on a shared machine.
    pub fn conservative() -> Self {
        Self::new().with_cpu(60.0).with_memory(60.0).with_gpu_memory(60.0)
    }

    pub fn validate(&self) -> CoreResult<()> {
        for (name, value) in [
            ("cpu", self.cpu),
            ("memory", self.memory),
            ("gpu_memory", self.gpu_memory),
        ] {
            if !(value.is_finite() && value > 0.0 && value <= 100.0) {
                return Err(CoreError::InvalidConfig(format!(
                    "{name} target must be in (0, 100], got {value}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for ResourceTargets {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub initial_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Seconds between resize decisions.
    pub resize_interval_secs: f64,
    pub initial_batch_size: usize,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self {
            initial_workers: 4,
            min_workers: 1,
            max_workers: default_max_workers(),
            resize_interval_secs: 5.0,
            initial_batch_size: 32,
        }
    }

    pub fn with_initial_workers(mut self, workers: usize) -> Self {
        self.initial_workers = workers;
        self
    }

    pub fn with_worker_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    pub fn with_resize_interval(mut self, secs: f64) -> Self {
        self.resize_interval_secs = secs;
        self
    }

    pub fn with_initial_batch_size(mut self, size: usize) -> Self {
        self.initial_batch_size = size;
        self
    }

    pub fn resize_interval(&self) -> Duration {
        Duration::from_secs_f64(self.resize_interval_secs)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.min_workers == 0 {
            return Err(CoreError::InvalidConfig(
                "min_workers must be at least 1".to_string(),
            ));
        }
        if self.min_workers > self.max_workers {
            return Err(CoreError::InvalidConfig(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        positive_secs("resize_interval_secs", self.resize_interval_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}
