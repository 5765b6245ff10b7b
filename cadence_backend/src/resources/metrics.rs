//! Raw machine-load readings.
//!
//! [`MetricsSource`] and [`GpuSensor`] are the seams between the monitor and the
//! OS. The defaults read CPU and memory through `sysinfo` and report no GPU;
//! an embedding application with a GPU runtime plugs in its own sensor.

use std::time::Instant;

use sysinfo::{MINIMUM_CPU_UPDATE_INTERVAL, Pid, ProcessesToUpdate, System};

use crate::error::SampleError;

/// CPU and memory utilization, in percent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemLoad {
    pub cpu_usage: f64,
    pub memory_usage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuUsage {
    /// Allocated memory as a percentage of the device's capacity.
    pub memory_used: f64,
    pub utilization: Option<f64>,
}

pub trait MetricsSource: Send {
    fn sample(&mut self) -> Result<SystemLoad, SampleError>;
}

pub trait GpuSensor: Send + Sync {
    /// Device name, for logging.
    fn name(&self) -> String;

    fn sample(&self) -> Result<GpuUsage, SampleError>;
}

/// Global CPU usage plus this process's resident memory as a share of RAM.
pub struct SysinfoSource {
    system: System,
    pid: Option<Pid>,
    last_cpu_refresh: Option<Instant>,
}

impl SysinfoSource {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
            last_cpu_refresh: None,
        }
    }

    /// CPU usage is a delta between two refreshes; make sure the previous one
    /// is at least `MINIMUM_CPU_UPDATE_INTERVAL` old.
    fn refresh_cpu(&mut self) -> f64 {
        match self.last_cpu_refresh {
            Some(at) if at.elapsed() >= MINIMUM_CPU_UPDATE_INTERVAL => {}
            Some(at) => std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL.saturating_sub(at.elapsed())),
            None => {
                self.system.refresh_cpu_usage();
                std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
            }
        }
        self.system.refresh_cpu_usage();
        self.last_cpu_refresh = Some(Instant::now());
        f64::from(self.system.global_cpu_usage())
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SysinfoSource {
    fn sample(&mut self) -> Result<SystemLoad, SampleError> {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return Err(SampleError::Unavailable(
                "platform not supported by sysinfo".to_string(),
            ));
        }
        let pid = self
            .pid
            .ok_or_else(|| SampleError::Unavailable("current pid unknown".to_string()))?;

        let cpu_usage = self.refresh_cpu();

        self.system.refresh_memory();
        let total = self.system.total_memory();
        if total == 0 {
            return Err(SampleError::Unavailable("total memory reported as 0".to_string()));
        }
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let rss = self
            .system
            .process(pid)
            .map(|process| process.memory())
            .ok_or_else(|| SampleError::Unavailable(format!("process {pid} not found")))?;

        Ok(SystemLoad {
            cpu_usage,
            memory_usage: rss as f64 / total as f64 * 100.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysinfo_sample_in_range() {
        if !sysinfo::IS_SUPPORTED_SYSTEM {
            return;
        }
        let mut source = SysinfoSource::new();
        let load = source.sample().unwrap();
        assert!(load.cpu_usage >= 0.0);
        assert!(load.memory_usage > 0.0 && load.memory_usage <= 100.0);

        // Second sample reuses the previous refresh as its baseline
        assert!(source.sample().is_ok());
    }
}
