//! Periodic load sampling into a bounded rolling history.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::error::{MonitorError, SampleError};
use crate::pool::TaskStats;
use crate::resources::metrics::{GpuSensor, GpuUsage, MetricsSource, SysinfoSource};

/// One reading of machine and pool load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PerformanceSample {
    /// Percent of total CPU.
    pub cpu_usage: f64,
    /// Process resident memory as a percent of RAM.
    pub memory_usage: f64,
    /// Average task run time in seconds.
    pub processing_time: f64,
    pub queue_length: usize,
    pub gpu_memory_used: Option<f64>,
    pub gpu_utilization: Option<f64>,
}

impl PerformanceSample {
    pub fn new(cpu_usage: f64, memory_usage: f64) -> Self {
        Self {
            cpu_usage,
            memory_usage,
            processing_time: 0.0,
            queue_length: 0,
            gpu_memory_used: None,
            gpu_utilization: None,
        }
    }

    pub fn with_gpu(mut self, usage: GpuUsage) -> Self {
        self.gpu_memory_used = Some(usage.memory_used);
        self.gpu_utilization = usage.utilization;
        self
    }

    /// Arithmetic mean of `samples`. GPU fields average only over samples that
    /// carry them and stay `None` if none do.
    pub fn mean(samples: &[PerformanceSample]) -> Option<PerformanceSample> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let avg = |f: fn(&PerformanceSample) -> f64| samples.iter().map(f).sum::<f64>() / n;
        let avg_present = |f: fn(&PerformanceSample) -> Option<f64>| {
            let present: Vec<f64> = samples.iter().filter_map(f).collect();
            (!present.is_empty()).then(|| present.iter().sum::<f64>() / present.len() as f64)
        };

        Some(PerformanceSample {
            cpu_usage: avg(|s| s.cpu_usage),
            memory_usage: avg(|s| s.memory_usage),
            processing_time: avg(|s| s.processing_time),
            queue_length: avg(|s| s.queue_length as f64).round() as usize,
            gpu_memory_used: avg_present(|s| s.gpu_memory_used),
            gpu_utilization: avg_present(|s| s.gpu_utilization),
        })
    }
}

struct MonitorShared {
    history: Mutex<VecDeque<PerformanceSample>>,
    history_size: usize,
    source: Mutex<Box<dyn MetricsSource>>,
    gpu: Option<Box<dyn GpuSensor>>,
    task_stats: Option<Arc<TaskStats>>,
    collected: AtomicU64,
    failed: AtomicU64,
}

impl MonitorShared {
    fn sample(&self) -> Result<PerformanceSample, SampleError> {
        let load = self.source.lock().sample()?;
        let mut sample = PerformanceSample::new(load.cpu_usage, load.memory_usage);

        if let Some(stats) = &self.task_stats {
            sample.processing_time = stats.processing_time_secs();
            sample.queue_length = usize::try_from(stats.queue_length()).unwrap_or(usize::MAX);
        }

        if let Some(gpu) = &self.gpu {
            match gpu.sample() {
                Ok(usage) => sample = sample.with_gpu(usage),
                Err(e) => warn!(error = %e, "GPU sample failed"),
            }
        }
        Ok(sample)
    }

    fn push(&self, sample: PerformanceSample) {
        let mut history = self.history.lock();
        if history.len() >= self.history_size {
            history.pop_front();
        }
        history.push_back(sample);
    }

    fn run(&self, interval: Duration, stop_rx: channel::Receiver<()>) {
        loop {
            match self.sample() {
                Ok(sample) => {
                    self.push(sample);
                    self.collected.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    let failed = self.failed.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(error = %e, failed, "performance sample failed");
                }
            }

            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
}

struct MonitorWorker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Samples CPU, memory, optional GPU and pool load on a background thread.
///
/// The sampling thread lives between [`start_monitoring`](Self::start_monitoring)
/// and [`stop_monitoring`](Self::stop_monitoring); dropping the monitor stops it.
pub struct PerformanceMonitor {
    shared: Arc<MonitorShared>,
    worker: Mutex<Option<MonitorWorker>>,
}

pub struct MonitorBuilder {
    history_size: usize,
    source: Box<dyn MetricsSource>,
    gpu: Option<Box<dyn GpuSensor>>,
    task_stats: Option<Arc<TaskStats>>,
}

impl MonitorBuilder {
    pub fn with_source(mut self, source: Box<dyn MetricsSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_gpu_sensor(mut self, sensor: Box<dyn GpuSensor>) -> Self {
        self.gpu = Some(sensor);
        self
    }

    /// Fill `processing_time` and `queue_length` from pool statistics.
    pub fn with_task_stats(mut self, stats: Arc<TaskStats>) -> Self {
        self.task_stats = Some(stats);
        self
    }

    pub fn build(self) -> PerformanceMonitor {
        if let Some(gpu) = &self.gpu {
            info!(device = %gpu.name(), "GPU available");
        }
        let history_size = self.history_size.max(1);
        PerformanceMonitor {
            shared: Arc::new(MonitorShared {
                history: Mutex::new(VecDeque::with_capacity(history_size)),
                history_size,
                source: Mutex::new(self.source),
                gpu: self.gpu,
                task_stats: self.task_stats,
                collected: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }
}

impl PerformanceMonitor {
    /// Monitor backed by `sysinfo`, with no GPU sensor.
    pub fn new(history_size: usize) -> Self {
        Self::builder(history_size).build()
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self::new(config.history_size)
    }

    pub fn builder(history_size: usize) -> MonitorBuilder {
        MonitorBuilder {
            history_size,
            source: Box::new(SysinfoSource::new()),
            gpu: None,
            task_stats: None,
        }
    }

    /// Start sampling every `interval` on a background thread.
    pub fn start_monitoring(&self, interval: Duration) -> Result<(), MonitorError> {
        if interval.is_zero() {
            return Err(MonitorError::InvalidInterval);
        }
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }

        let (stop_tx, stop_rx) = channel::bounded(1);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("perf-monitor".to_string())
            .spawn(move || shared.run(interval, stop_rx))
            .map_err(MonitorError::Spawn)?;

        *worker = Some(MonitorWorker { stop_tx, handle });
        info!(interval_ms = interval.as_millis() as u64, "performance monitoring started");
        Ok(())
    }

    /// Signal the sampling thread and wait for it to exit. No-op if not running.
    pub fn stop_monitoring(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = worker.stop_tx.send(());
        if worker.handle.join().is_err() {
            warn!("performance monitor thread panicked");
        }
        info!("performance monitoring stopped");
    }

    pub fn is_monitoring(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Take one sample now, bypassing the history.
    pub fn get_current_metrics(&self) -> Result<PerformanceSample, SampleError> {
        self.shared.sample()
    }

    /// Mean over the last `window` samples (all history if `None`, zero, or
    /// larger than the history). Falls back to a live sample when the history
    /// is empty.
    pub fn get_average_metrics(&self, window: Option<usize>) -> Result<PerformanceSample, SampleError> {
        let averaged = {
            let history = self.shared.history.lock();
            let take = match window {
                Some(n) if n > 0 => n.min(history.len()),
                _ => history.len(),
            };
            let recent: Vec<PerformanceSample> =
                history.iter().skip(history.len() - take).cloned().collect();
            PerformanceSample::mean(&recent)
        };
        match averaged {
            Some(sample) => Ok(sample),
            None => {
                debug!("no performance history yet, sampling live");
                self.get_current_metrics()
            }
        }
    }

    /// Append a sample to the history, evicting the oldest when full.
    pub fn record(&self, sample: PerformanceSample) {
        self.shared.push(sample);
    }

    pub fn history(&self) -> Vec<PerformanceSample> {
        self.shared.history.lock().iter().cloned().collect()
    }

    pub fn history_size(&self) -> usize {
        self.shared.history_size
    }

    pub fn has_gpu(&self) -> bool {
        self.shared.gpu.is_some()
    }

    /// Live GPU reading, `None` without a sensor.
    pub fn current_gpu_usage(&self) -> Option<Result<GpuUsage, SampleError>> {
        self.shared.gpu.as_ref().map(|gpu| gpu.sample())
    }

    pub fn collected_samples(&self) -> u64 {
        self.shared.collected.load(Ordering::Relaxed)
    }

    pub fn failed_samples(&self) -> u64 {
        self.shared.failed.load(Ordering::Relaxed)
    }
}

impl Drop for PerformanceMonitor {
    fn drop(&mut self) {
        self.stop_monitoring();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::resources::metrics::SystemLoad;
    use std::time::Instant;

    /// Replays a fixed load; every `fail_every`-th sample fails.
    pub(crate) struct ScriptedSource {
        pub load: SystemLoad,
        pub fail_every: Option<u64>,
        pub calls: u64,
    }

    impl ScriptedSource {
        pub(crate) fn steady(cpu: f64, memory: f64) -> Self {
            Self {
                load: SystemLoad {
                    cpu_usage: cpu,
                    memory_usage: memory,
                },
                fail_every: None,
                calls: 0,
            }
        }
    }

    impl MetricsSource for ScriptedSource {
        fn sample(&mut self) -> Result<SystemLoad, SampleError> {
            self.calls += 1;
            match self.fail_every {
                Some(n) if self.calls % n == 0 => {
                    Err(SampleError::Unavailable("scripted failure".to_string()))
                }
                _ => Ok(self.load),
            }
        }
    }

    pub(crate) struct FakeGpu {
        pub memory_used: f64,
    }

    impl GpuSensor for FakeGpu {
        fn name(&self) -> String {
            "fake-gpu".to_string()
        }

        fn sample(&self) -> Result<GpuUsage, SampleError> {
            Ok(GpuUsage {
                memory_used: self.memory_used,
                utilization: Some(50.0),
            })
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_history_is_bounded() {
        let monitor = PerformanceMonitor::builder(3)
            .with_source(Box::new(ScriptedSource::steady(10.0, 10.0)))
            .build();
        for cpu in [1.0, 2.0, 3.0, 4.0, 5.0] {
            monitor.record(PerformanceSample::new(cpu, 0.0));
        }
        let cpus: Vec<f64> = monitor.history().iter().map(|s| s.cpu_usage).collect();
        assert_eq!(cpus, vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_average_window() {
        let monitor = PerformanceMonitor::builder(10)
            .with_source(Box::new(ScriptedSource::steady(0.0, 0.0)))
            .build();
        for cpu in [10.0, 20.0, 30.0, 40.0] {
            monitor.record(PerformanceSample::new(cpu, cpu / 2.0));
        }
        assert_eq!(monitor.get_average_metrics(Some(2)).unwrap().cpu_usage, 35.0);
        assert_eq!(monitor.get_average_metrics(None).unwrap().cpu_usage, 25.0);
        assert_eq!(monitor.get_average_metrics(Some(100)).unwrap().cpu_usage, 25.0);
        assert_eq!(monitor.get_average_metrics(Some(0)).unwrap().memory_usage, 12.5);
    }

    #[test]
    fn test_average_gpu_only_over_present() {
        let samples = vec![
            PerformanceSample::new(0.0, 0.0),
            PerformanceSample::new(0.0, 0.0).with_gpu(GpuUsage {
                memory_used: 40.0,
                utilization: None,
            }),
            PerformanceSample::new(0.0, 0.0).with_gpu(GpuUsage {
                memory_used: 60.0,
                utilization: Some(30.0),
            }),
        ];
        let mean = PerformanceSample::mean(&samples).unwrap();
        assert_eq!(mean.gpu_memory_used, Some(50.0));
        assert_eq!(mean.gpu_utilization, Some(30.0));

        let mean = PerformanceSample::mean(&samples[..1]).unwrap();
        assert_eq!(mean.gpu_memory_used, None);
        assert!(PerformanceSample::mean(&[]).is_none());
    }

    #[test]
    fn test_empty_history_samples_live() {
        let monitor = PerformanceMonitor::builder(10)
            .with_source(Box::new(ScriptedSource::steady(42.0, 7.0)))
            .build();
        let sample = monitor.get_average_metrics(Some(10)).unwrap();
        assert_eq!(sample.cpu_usage, 42.0);
        assert!(monitor.history().is_empty());
    }

    #[test]
    fn test_current_metrics_include_gpu_and_tasks() {
        let stats = Arc::new(TaskStats::default());
        stats.record_submitted();
        stats.record_submitted();
        let monitor = PerformanceMonitor::builder(10)
            .with_source(Box::new(ScriptedSource::steady(5.0, 6.0)))
            .with_gpu_sensor(Box::new(FakeGpu { memory_used: 12.0 }))
            .with_task_stats(stats)
            .build();

        let sample = monitor.get_current_metrics().unwrap();
        assert_eq!(sample.queue_length, 2);
        assert_eq!(sample.gpu_memory_used, Some(12.0));
        assert_eq!(sample.gpu_utilization, Some(50.0));
        assert!(monitor.has_gpu());
    }

    #[test]
    fn test_loop_survives_failures() {
        let source = ScriptedSource {
            fail_every: Some(2),
            ..ScriptedSource::steady(50.0, 20.0)
        };
        let monitor = PerformanceMonitor::builder(100)
            .with_source(Box::new(source))
            .build();
        monitor.start_monitoring(Duration::from_millis(2)).unwrap();
        assert!(monitor.is_monitoring());
        assert!(matches!(
            monitor.start_monitoring(Duration::from_millis(2)),
            Err(MonitorError::AlreadyRunning)
        ));

        assert!(wait_until(Duration::from_secs(5), || {
            monitor.failed_samples() >= 2 && monitor.collected_samples() >= 2
        }));
        monitor.stop_monitoring();
        assert!(!monitor.is_monitoring());

        let collected = monitor.history().len();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(monitor.history().len(), collected);

        // Restartable after a clean stop
        monitor.start_monitoring(Duration::from_millis(2)).unwrap();
        monitor.stop_monitoring();
    }

    #[test]
    fn test_zero_interval_rejected() {
        let monitor = PerformanceMonitor::builder(1)
            .with_source(Box::new(ScriptedSource::steady(0.0, 0.0)))
            .build();
        assert!(matches!(
            monitor.start_monitoring(Duration::ZERO),
            Err(MonitorError::InvalidInterval)
        ));
    }
}
