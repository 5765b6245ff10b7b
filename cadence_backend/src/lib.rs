//! Adaptive execution for the sync layer: load monitoring, resource policy,
//! a self-resizing worker pool, file replay and optional live input capture.

#[cfg(feature = "capture")]
pub mod audio_device;
pub mod config;
pub mod error;
pub mod extraction;
pub mod pool;
pub mod replay;
pub mod resources;

pub use config::{MonitorConfig, PoolConfig, ResourceTargets};
pub use error::{MonitorError, PoolError, PoolResult, SampleError};
pub use extraction::{
    BatchFeatures, ExecutionTarget, ExtractionDispatcher, FeatureExtractor, FeatureRecord, SourceKind,
};
pub use pool::{OptimizedThreadPool, TaskHandle, TaskStats, TaskStatsSnapshot};
pub use replay::{FileReplay, Pacing, ReplayError, ReplaySchedule};
pub use resources::{
    GpuSensor, GpuUsage, MetricsSource, PerformanceMonitor, PerformanceSample, ResourceManager,
    SysinfoSource, SystemLoad,
};
