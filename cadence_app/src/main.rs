//! Runs the sync pipeline: sources feed a [`SyncManager`], the process polls
//! synchronized snapshots and prints each non-empty one as a JSON line while
//! the monitor and adaptive pool run alongside.

mod config;
mod demo;
mod error;
mod levels;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cadence_backend::{
    ExtractionDispatcher, FileReplay, OptimizedThreadPool, Pacing, PerformanceMonitor, ReplaySchedule,
    ResourceManager, TaskStats,
};
use cadence_core::SyncManager;
use clap::Parser;
use tracing::{error, info, warn};

use crate::config::CadenceConfig;
use crate::demo::DemoFeed;
use crate::error::{AppError, AppResult};
use crate::levels::LevelExtractor;

#[derive(Parser, Debug)]
#[clap(name = "cadence")]
#[clap(about = "Time-aligned audio and MIDI buffering with an adaptive worker pool")]
struct Args {
    /// JSON configuration file; defaults apply to anything it omits
    #[clap(long, value_name = "FILE", env = "CADENCE_CONFIG")]
    config: Option<PathBuf>,

    /// Seconds to run before shutting down
    #[clap(long, default_value = "10")]
    duration_secs: f64,

    /// Milliseconds between snapshot polls
    #[clap(long, default_value = "100")]
    poll_ms: u64,

    /// Feed a synthetic tone and arpeggio instead of (or alongside) devices
    #[clap(long)]
    demo: bool,

    /// Replay a WAV file in real time as the "wav" audio source
    #[clap(long, value_name = "FILE")]
    replay_wav: Option<PathBuf>,

    /// Replay a standard MIDI file in real time as the "midi-file" source
    #[clap(long, value_name = "FILE")]
    replay_midi: Option<PathBuf>,

    /// Frames per chunk when replaying a WAV file
    #[clap(long, default_value = "1024")]
    replay_chunk_frames: usize,

    /// Also run feature extraction on every poll and print its results
    #[clap(long)]
    extract: bool,

    /// List audio input devices and exit
    #[cfg(feature = "capture")]
    #[clap(long)]
    list_devices: bool,

    /// Capture from the input device whose name contains this string
    #[cfg(feature = "capture")]
    #[clap(long, value_name = "NAME")]
    device: Option<String>,

    /// Capture from the default input device
    #[cfg(feature = "capture")]
    #[clap(long)]
    capture: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> AppResult<()> {
    #[cfg(feature = "capture")]
    if args.list_devices {
        let enumerator = cadence_backend::audio_device::InputDeviceEnumerator::new()
            .map_err(cadence_backend::audio_device::CaptureError::from)?;
        enumerator.print_device_list();
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => CadenceConfig::from_json_file(path)?,
        None => CadenceConfig::default(),
    };
    config.validate()?;

    let services = Services::start(&config)?;

    let demo = if args.demo {
        Some(DemoFeed::start(Arc::clone(&services.sync))?)
    } else {
        None
    };

    let replays = match start_replays(&services, &args) {
        Ok(replays) => replays,
        Err(e) => {
            if let Some(feed) = demo {
                feed.stop();
            }
            services.stop();
            return Err(e);
        }
    };

    #[cfg(feature = "capture")]
    let capture = if args.capture || args.device.is_some() {
        let mut capture_config = cadence_backend::audio_device::CaptureConfig::new("input");
        if let Some(name) = &args.device {
            capture_config = capture_config.with_device(name.clone());
        }
        Some(cadence_backend::audio_device::InputCapture::start(
            Arc::clone(&services.sync),
            capture_config,
        )?)
    } else {
        None
    };

    let dispatcher = args.extract.then(|| {
        ExtractionDispatcher::new(
            Arc::clone(&services.sync),
            Arc::clone(&services.pool),
            LevelExtractor,
        )
    });

    let outcome = poll(&services, dispatcher.as_ref(), &config, &args);

    if let Some(feed) = demo {
        feed.stop();
    }
    for replay in replays {
        let source = replay.source_id().to_string();
        let emitted = replay.stop();
        info!(source = %source, emitted, "replay stopped");
    }
    #[cfg(feature = "capture")]
    if let Some(capture) = capture {
        capture.stop();
    }
    services.stop();
    outcome
}

/// Load every requested file before starting any replay, so a bad file
/// leaves nothing running.
fn start_replays(services: &Services, args: &Args) -> AppResult<Vec<FileReplay>> {
    let mut schedules = Vec::new();
    if let Some(path) = &args.replay_wav {
        schedules.push(("wav", ReplaySchedule::from_wav_file(path, args.replay_chunk_frames)?));
    }
    if let Some(path) = &args.replay_midi {
        schedules.push(("midi-file", ReplaySchedule::from_midi_file(path)?));
    }

    let mut replays = Vec::with_capacity(schedules.len());
    for (source_id, schedule) in schedules {
        match FileReplay::start(Arc::clone(&services.sync), source_id, schedule, Pacing::RealTime) {
            Ok(replay) => replays.push(replay),
            Err(e) => {
                for started in replays {
                    started.stop();
                }
                return Err(e.into());
            }
        }
    }
    Ok(replays)
}

fn poll(
    services: &Services,
    dispatcher: Option<&ExtractionDispatcher<LevelExtractor>>,
    config: &CadenceConfig,
    args: &Args,
) -> AppResult<()> {
    let look_back = config.sync.poll_duration_secs;
    let interval = Duration::from_millis(args.poll_ms.max(1));
    let deadline = Instant::now() + Duration::from_secs_f64(args.duration_secs.max(0.0));
    let mut emitted = 0u64;

    while Instant::now() < deadline {
        let snapshot = services.sync.get_synchronized_data(look_back);
        if !snapshot.is_empty() {
            let line = serde_json::to_string(&snapshot).map_err(AppError::Encode)?;
            println!("{line}");
            emitted += 1;
        }

        if let Some(dispatcher) = dispatcher {
            match dispatcher.dispatch(look_back) {
                Ok(batches) => {
                    for batch in batches {
                        let line = serde_json::to_string(&batch).map_err(AppError::Encode)?;
                        println!("{line}");
                    }
                }
                Err(e) => warn!(error = %e, "feature extraction skipped"),
            }
        }

        thread::sleep(interval);
    }

    info!(
        snapshots = emitted,
        dropped = services.sync.dropped_entries(),
        "polling finished"
    );
    Ok(())
}

/// Long-lived services, constructed once and torn down in reverse order.
struct Services {
    sync: Arc<SyncManager>,
    monitor: Arc<PerformanceMonitor>,
    pool: Arc<OptimizedThreadPool>,
}

impl Services {
    fn start(config: &CadenceConfig) -> AppResult<Self> {
        let sync = Arc::new(SyncManager::from_config(&config.sync)?);

        let stats = Arc::new(TaskStats::default());
        let monitor = Arc::new(
            PerformanceMonitor::builder(config.monitor.history_size)
                .with_task_stats(Arc::clone(&stats))
                .build(),
        );
        monitor.start_monitoring(config.monitor.interval())?;

        let resources = Arc::new(
            ResourceManager::new(Arc::clone(&monitor), config.targets)
                .with_worker_bounds(config.pool.min_workers, config.pool.max_workers),
        );
        let pool = match OptimizedThreadPool::with_stats(&config.pool, resources, stats) {
            Ok(pool) => Arc::new(pool),
            Err(e) => {
                monitor.stop_monitoring();
                return Err(e.into());
            }
        };

        info!(
            window_secs = sync.window_size(),
            workers = pool.current_workers(),
            "services started"
        );
        Ok(Self { sync, monitor, pool })
    }

    fn stop(self) {
        self.pool.shutdown();
        self.monitor.stop_monitoring();
        let stats = self.pool.stats().snapshot();
        info!(
            tasks = stats.completed,
            panicked = stats.panicked,
            resizes = self.pool.resize_count(),
            "services stopped"
        );
    }
}
