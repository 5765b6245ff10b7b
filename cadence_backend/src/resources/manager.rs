//! Sizing policy: turns recent load into worker-count, batch-size and GPU
//! decisions. Holds no background state of its own.

use std::sync::Arc;

use tracing::warn;

use crate::config::{ResourceTargets, default_max_workers};
use crate::resources::monitor::PerformanceMonitor;

/// Below `target * HEADROOM_FACTOR` the policy scales up; above `target` it
/// scales down. In between nothing changes.
pub const HEADROOM_FACTOR: f64 = 0.7;

pub const MIN_BATCH_SIZE: usize = 1;
pub const MAX_BATCH_SIZE: usize = 1024;

/// Samples averaged per decision.
pub const DECISION_WINDOW: usize = 10;

/// Worker count for an average CPU load.
pub fn recommend_workers(avg_cpu: f64, target_cpu: f64, current: usize, min: usize, max: usize) -> usize {
    if avg_cpu > target_cpu {
        min.max(current.saturating_sub(1))
    } else if avg_cpu < target_cpu * HEADROOM_FACTOR {
        max.min(current + 1)
    } else {
        current
    }
}

/// Batch size for an average memory load: halve under pressure, double with
/// headroom, always within `[MIN_BATCH_SIZE, MAX_BATCH_SIZE]`.
pub fn recommend_batch_size(avg_memory: f64, target_memory: f64, current: usize) -> usize {
    let current = current.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);
    if avg_memory > target_memory {
        (current / 2).max(MIN_BATCH_SIZE)
    } else if avg_memory < target_memory * HEADROOM_FACTOR {
        current.saturating_mul(2).min(MAX_BATCH_SIZE)
    } else {
        current
    }
}

pub struct ResourceManager {
    monitor: Arc<PerformanceMonitor>,
    targets: ResourceTargets,
    min_workers: usize,
    max_workers: usize,
}

impl ResourceManager {
    pub fn new(monitor: Arc<PerformanceMonitor>, targets: ResourceTargets) -> Self {
        Self {
            monitor,
            targets,
            min_workers: 1,
            max_workers: default_max_workers(),
        }
    }

    /// `min` is raised to 1 and `max` to `min`.
    pub fn with_worker_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min.max(1);
        self.max_workers = max.max(self.min_workers);
        self
    }

    pub fn targets(&self) -> ResourceTargets {
        self.targets
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    /// Recommended worker count given the last [`DECISION_WINDOW`] samples,
    /// within the manager's own worker bounds.
    ///
    /// Keeps `current_workers` when no metrics can be read.
    pub fn optimize_thread_pool(&self, current_workers: usize) -> usize {
        self.optimize_thread_pool_within(current_workers, self.min_workers, self.max_workers)
    }

    /// As [`optimize_thread_pool`](Self::optimize_thread_pool), but within
    /// `[min, max]` supplied by the caller. The pool sizes itself this way so
    /// its configured bounds are the only ones that apply.
    pub fn optimize_thread_pool_within(&self, current_workers: usize, min: usize, max: usize) -> usize {
        let min = min.max(1);
        let max = max.max(min);
        match self.monitor.get_average_metrics(Some(DECISION_WINDOW)) {
            Ok(metrics) => recommend_workers(metrics.cpu_usage, self.targets.cpu, current_workers, min, max),
            Err(e) => {
                warn!(error = %e, "no metrics for pool sizing, keeping current size");
                current_workers.clamp(min, max)
            }
        }
    }

    /// Recommended batch size given the last [`DECISION_WINDOW`] samples.
    pub fn optimize_batch_size(&self, current_batch_size: usize) -> usize {
        match self.monitor.get_average_metrics(Some(DECISION_WINDOW)) {
            Ok(metrics) => {
                recommend_batch_size(metrics.memory_usage, self.targets.memory, current_batch_size)
            }
            Err(e) => {
                warn!(error = %e, "no metrics for batch sizing, keeping current size");
                current_batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE)
            }
        }
    }

    /// False without a GPU, or when GPU memory use is above target.
    ///
    /// A GPU whose sensor fails is still considered usable.
    pub fn should_use_gpu(&self) -> bool {
        match self.monitor.current_gpu_usage() {
            None => false,
            Some(Ok(usage)) => usage.memory_used <= self.targets.gpu_memory,
            Some(Err(e)) => {
                warn!(error = %e, "GPU sensor failed, assuming GPU is usable");
                true
            }
        }
    }
}
