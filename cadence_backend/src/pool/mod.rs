//! Adaptive worker pool.
//!
//! Tasks run on a fixed-size [`Executor`] held in a hot-swappable slot. A
//! control thread periodically asks the [`ResourceManager`] for a worker count
//! and, when it changes, builds a replacement executor and swaps it in. The
//! retired executor is closed rather than joined: its workers finish the tasks
//! already queued on it and exit, so a resize never cancels or blocks work.

mod executor;
mod stats;

pub use stats::{TaskStats, TaskStatsSnapshot, TaskTimer};

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::resources::{MAX_BATCH_SIZE, MIN_BATCH_SIZE, ResourceManager};
use executor::{Executor, Job};

/// Result of one submitted task.
pub struct TaskHandle<T> {
    receiver: Receiver<Result<T, String>>,
}

impl<T> TaskHandle<T> {
    /// Block until the task finishes.
    pub fn join(self) -> PoolResult<T> {
        match self.receiver.recv() {
            Ok(outcome) => outcome.map_err(PoolError::TaskPanicked),
            Err(_) => Err(PoolError::TaskCancelled),
        }
    }

    /// `None` if the task is still running after `timeout`.
    pub fn join_timeout(&self, timeout: Duration) -> Option<PoolResult<T>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome.map_err(PoolError::TaskPanicked)),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(PoolError::TaskCancelled)),
        }
    }
}

struct PoolShared {
    active: spin::RwLock<Executor>,
    /// Closed executors still draining their queues.
    retired: Mutex<Vec<Executor>>,
    running: AtomicBool,

    current_workers: AtomicUsize,
    batch_size: AtomicUsize,
    min_workers: usize,
    max_workers: usize,

    next_executor_id: AtomicU64,
    resize_count: AtomicU64,
    resize_failures: AtomicU64,

    stats: Arc<TaskStats>,
    resource_manager: Arc<ResourceManager>,
}

struct ControlLoop {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct OptimizedThreadPool {
    shared: Arc<PoolShared>,
    control: Mutex<Option<ControlLoop>>,
}

impl OptimizedThreadPool {
    pub fn new(config: &PoolConfig, resource_manager: Arc<ResourceManager>) -> PoolResult<Self> {
        Self::with_stats(config, resource_manager, Arc::new(TaskStats::default()))
    }

    /// Pool recording into `stats`, typically the same instance the
    /// performance monitor reads queue length and task time from.
    ///
    /// Worker bounds are normalized to `1 <= min <= max` and the initial
    /// worker count is clamped into them.
    pub fn with_stats(
        config: &PoolConfig,
        resource_manager: Arc<ResourceManager>,
        stats: Arc<TaskStats>,
    ) -> PoolResult<Self> {
        let min_workers = config.min_workers.max(1);
        let max_workers = config.max_workers.max(min_workers);
        let initial = config.initial_workers.clamp(min_workers, max_workers);
        let batch_size = config.initial_batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);

        let executor = Executor::spawn(1, initial, Arc::clone(&stats))?;
        let shared = Arc::new(PoolShared {
            active: spin::RwLock::new(executor),
            retired: Mutex::new(Vec::new()),
            running: AtomicBool::new(true),
            current_workers: AtomicUsize::new(initial),
            batch_size: AtomicUsize::new(batch_size),
            min_workers,
            max_workers,
            next_executor_id: AtomicU64::new(2),
            resize_count: AtomicU64::new(0),
            resize_failures: AtomicU64::new(0),
            stats,
            resource_manager,
        });

        let interval = config.resize_interval();
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let loop_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name("pool-resizer".to_string())
            .spawn(move || loop_shared.control_loop(interval, stop_rx));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                shared.shutdown_executors();
                return Err(PoolError::Spawn(e));
            }
        };

        info!(
            workers = initial,
            min = min_workers,
            max = max_workers,
            batch_size,
            interval_secs = interval.as_secs_f64(),
            "thread pool started"
        );

        Ok(Self {
            shared,
            control: Mutex::new(Some(ControlLoop { stop_tx, handle })),
        })
    }

    /// Run `task` on the current executor.
    ///
    /// Fails with [`PoolError::Closed`] once [`shutdown`](Self::shutdown) has
    /// begun. A panicking task is reported through its handle and does not
    /// take its worker down.
    pub fn submit<F, T>(&self, task: F) -> PoolResult<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = channel::bounded(1);
        let stats = Arc::clone(&self.shared.stats);
        let job: Job = Box::new(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(task)).map_err(panic_message);
            if outcome.is_err() {
                stats.record_panicked();
            }
            // Receiver may have been dropped; the result is simply discarded
            let _ = result_tx.send(outcome);
        });

        // Checked under the read lock so shutdown cannot close the executor
        // between the check and the send
        let active = self.shared.active.read();
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        // Counted before the send so a worker never starts an uncounted task
        self.shared.stats.record_submitted();
        if active.send(job).is_err() {
            self.shared.stats.retract_submitted();
            return Err(PoolError::Closed);
        }
        drop(active);

        Ok(TaskHandle {
            receiver: result_rx,
        })
    }

    /// Stop resizing, drain every queued task and join all workers.
    ///
    /// Terminal and idempotent; later `submit` calls fail.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(control) = self.control.lock().take() {
            let _ = control.stop_tx.send(());
            if control.handle.join().is_err() {
                error!("pool resizer thread panicked");
            }
        }
        self.shared.shutdown_executors();
        info!(
            resizes = self.resize_count(),
            completed = self.shared.stats.snapshot().completed,
            "thread pool shut down"
        );
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn current_workers(&self) -> usize {
        self.shared.current_workers.load(Ordering::Acquire)
    }

    /// Latest batch size recommendation.
    pub fn batch_size(&self) -> usize {
        self.shared.batch_size.load(Ordering::Relaxed)
    }

    pub fn worker_bounds(&self) -> (usize, usize) {
        (self.shared.min_workers, self.shared.max_workers)
    }

    pub fn resize_count(&self) -> u64 {
        self.shared.resize_count.load(Ordering::Relaxed)
    }

    pub fn resize_failures(&self) -> u64 {
        self.shared.resize_failures.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &Arc<TaskStats> {
        &self.shared.stats
    }

    pub fn resource_manager(&self) -> &Arc<ResourceManager> {
        &self.shared.resource_manager
    }
}

impl Drop for OptimizedThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl PoolShared {
    fn control_loop(&self, interval: Duration, stop_rx: Receiver<()>) {
        loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if panic::catch_unwind(AssertUnwindSafe(|| self.tick())).is_err() {
                        self.resize_failures.fetch_add(1, Ordering::Relaxed);
                        error!("pool resize tick panicked, continuing");
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("pool resizer stopped");
    }

    fn tick(&self) {
        self.reap_retired();

        let current = self.current_workers.load(Ordering::Acquire);
        let target = self
            .resource_manager
            .optimize_thread_pool_within(current, self.min_workers, self.max_workers);
        if target != current {
            match self.resize(target) {
                Ok(true) => info!(from = current, to = target, "resized thread pool"),
                Ok(false) => {}
                Err(e) => {
                    self.resize_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, from = current, to = target, "pool resize failed, keeping current size");
                }
            }
        }

        let batch = self.batch_size.load(Ordering::Relaxed);
        let next_batch = self.resource_manager.optimize_batch_size(batch);
        if next_batch != batch {
            self.batch_size.store(next_batch, Ordering::Relaxed);
            debug!(from = batch, to = next_batch, "adjusted batch size");
        }
    }

    /// Swap in an executor of `size` workers. `Ok(false)` if the pool began
    /// shutting down meanwhile.
    fn resize(&self, size: usize) -> PoolResult<bool> {
        let id = self.next_executor_id.fetch_add(1, Ordering::Relaxed);
        // Spawn outside the lock; submitters only wait for the swap itself
        let replacement = Executor::spawn(id, size, Arc::clone(&self.stats))?;

        let mut active = self.active.write();
        if !self.running.load(Ordering::Acquire) {
            drop(active);
            replacement.join();
            return Ok(false);
        }
        let mut old = std::mem::replace(&mut *active, replacement);
        self.current_workers.store(size, Ordering::Release);
        drop(active);

        old.close();
        debug!(executor = old.id(), workers = old.size(), "retired executor");
        self.retired.lock().push(old);
        self.resize_count.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn reap_retired(&self) {
        let finished: Vec<Executor> = {
            let mut retired = self.retired.lock();
            let (done, pending): (Vec<Executor>, Vec<Executor>) =
                retired.drain(..).partition(Executor::is_finished);
            *retired = pending;
            done
        };
        for executor in finished {
            executor.join();
        }
    }

    fn shutdown_executors(&self) {
        self.running.store(false, Ordering::Release);
        let active = std::mem::replace(&mut *self.active.write(), Executor::closed());
        active.join();
        let retired: Vec<Executor> = self.retired.lock().drain(..).collect();
        for executor in retired {
            executor.join();
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceTargets;
    use crate::resources::PerformanceMonitor;
    use crate::resources::PerformanceSample;
    use crate::resources::monitor::tests::ScriptedSource;
    use std::time::Instant;

    fn manager(cpu: f64, memory: f64) -> Arc<ResourceManager> {
        let monitor = PerformanceMonitor::builder(20)
            .with_source(Box::new(ScriptedSource::steady(cpu, memory)))
            .build();
        for _ in 0..10 {
            monitor.record(PerformanceSample::new(cpu, memory));
        }
        Arc::new(ResourceManager::new(Arc::new(monitor), ResourceTargets::default()))
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

    fn quiet_config() -> PoolConfig {
        // Long interval: no resize during the test
        PoolConfig::new()
            .with_initial_workers(2)
            .with_worker_bounds(1, 4)
            .with_resize_interval(3600.0)
    }

    #[test]
    fn test_submit_and_join() {
        let pool = OptimizedThreadPool::new(&quiet_config(), manager(60.0, 60.0)).unwrap();
        let handles: Vec<_> = (0..20u64).map(|i| pool.submit(move || i * i).unwrap()).collect();
        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, (0..20u64).map(|i| i * i).sum::<u64>());
        assert_eq!(pool.stats().snapshot().submitted, 20);
    }

    #[test]
    fn test_panicking_task_reported() {
        let pool = OptimizedThreadPool::new(&quiet_config(), manager(60.0, 60.0)).unwrap();
        let handle = pool.submit(|| -> u32 { panic!("bad input") }).unwrap();
        match handle.join() {
            Err(PoolError::TaskPanicked(msg)) => assert!(msg.contains("bad input")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        // Worker survives the panic
        assert_eq!(pool.submit(|| 7).unwrap().join().unwrap(), 7);
        assert_eq!(pool.stats().snapshot().panicked, 1);
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let pool = OptimizedThreadPool::new(&quiet_config(), manager(60.0, 60.0)).unwrap();
        pool.shutdown();
        assert!(!pool.is_running());
        assert!(matches!(pool.submit(|| ()), Err(PoolError::Closed)));
        // Second shutdown is a no-op
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let pool = OptimizedThreadPool::new(&quiet_config(), manager(60.0, 60.0)).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                pool.submit(move || {
                    thread::sleep(Duration::from_millis(5));
                    i
                })
                .unwrap()
            })
            .collect();
        pool.shutdown();
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), i);
        }
    }

    #[test]
    fn test_shrinks_under_load_and_respects_min() {
        let config = PoolConfig::new()
            .with_initial_workers(4)
            .with_worker_bounds(2, 6)
            .with_resize_interval(0.01);
        let pool = OptimizedThreadPool::new(&config, manager(95.0, 50.0)).unwrap();

        assert!(wait_until(Duration::from_secs(5), || pool.current_workers() == 2));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(pool.current_workers(), 2);
        assert_eq!(pool.resize_count(), 2);
    }

    #[test]
    fn test_grows_with_headroom_and_respects_max() {
        let config = PoolConfig::new()
            .with_initial_workers(2)
            .with_worker_bounds(1, 4)
            .with_resize_interval(0.01);
        let pool = OptimizedThreadPool::new(&config, manager(10.0, 10.0)).unwrap();

        assert!(wait_until(Duration::from_secs(5), || pool.current_workers() == 4));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(pool.current_workers(), 4);
        // Memory headroom doubles the batch size up to the ceiling
        assert!(wait_until(Duration::from_secs(5), || pool.batch_size() == MAX_BATCH_SIZE));
    }

    #[test]
    fn test_grows_past_core_count_to_pool_max() {
        // The manager's own default ceiling is the core count; the pool's
        // configured bounds must win over it
        let max = crate::config::default_max_workers() + 3;
        let config = PoolConfig::new()
            .with_initial_workers(max - 2)
            .with_worker_bounds(1, max)
            .with_resize_interval(0.01);
        let pool = OptimizedThreadPool::new(&config, manager(10.0, 50.0)).unwrap();

        assert!(wait_until(Duration::from_secs(5), || pool.current_workers() == max));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(pool.current_workers(), max);
        assert_eq!(pool.resize_count(), 2);
    }

    #[test]
    fn test_queued_tasks_counted_before_start() {
        let config = quiet_config().with_initial_workers(1).with_worker_bounds(1, 1);
        let pool = OptimizedThreadPool::new(&config, manager(60.0, 60.0)).unwrap();
        let (release_tx, release_rx) = channel::bounded::<()>(0);

        let blocker = pool
            .submit(move || {
                let _ = release_rx.recv();
            })
            .unwrap();
        let queued: Vec<_> = (0..3).map(|i| pool.submit(move || i).unwrap()).collect();

        let stats = pool.stats();
        assert_eq!(stats.snapshot().submitted, 4);
        assert!(wait_until(Duration::from_secs(5), || stats.queue_length() == 3));

        release_tx.send(()).unwrap();
        blocker.join().unwrap();
        for handle in queued {
            handle.join().unwrap();
        }
        assert_eq!(stats.queue_length(), 0);
    }

    #[test]
    fn test_in_flight_tasks_survive_resize() {
        let config = PoolConfig::new()
            .with_initial_workers(3)
            .with_worker_bounds(1, 3)
            .with_resize_interval(0.01);
        let pool = OptimizedThreadPool::new(&config, manager(95.0, 50.0)).unwrap();

        let handles: Vec<_> = (0..30)
            .map(|i| {
                pool.submit(move || {
                    thread::sleep(Duration::from_millis(3));
                    i
                })
                .unwrap()
            })
            .collect();
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().unwrap(), i);
        }
        assert!(wait_until(Duration::from_secs(5), || pool.current_workers() == 1));
    }

    #[test]
    fn test_initial_size_clamped_into_bounds() {
        let config = PoolConfig::new()
            .with_initial_workers(50)
            .with_worker_bounds(0, 3)
            .with_resize_interval(3600.0);
        let pool = OptimizedThreadPool::new(&config, manager(60.0, 60.0)).unwrap();
        assert_eq!(pool.current_workers(), 3);
        assert_eq!(pool.worker_bounds(), (1, 3));
    }

    #[test]
    fn test_join_timeout() {
        let pool = OptimizedThreadPool::new(&quiet_config(), manager(60.0, 60.0)).unwrap();
        let handle = pool
            .submit(|| thread::sleep(Duration::from_millis(200)))
            .unwrap();
        assert!(handle.join_timeout(Duration::from_millis(1)).is_none());
        assert!(handle.join_timeout(Duration::from_secs(5)).unwrap().is_ok());
    }
}
