pub mod manager;
pub mod metrics;
pub mod monitor;

pub use manager::{
    DECISION_WINDOW, HEADROOM_FACTOR, MAX_BATCH_SIZE, MIN_BATCH_SIZE, ResourceManager,
    recommend_batch_size, recommend_workers,
};
pub use metrics::{GpuSensor, GpuUsage, MetricsSource, SysinfoSource, SystemLoad};
pub use monitor::{MonitorBuilder, PerformanceMonitor, PerformanceSample};
