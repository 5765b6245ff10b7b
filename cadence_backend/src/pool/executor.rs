use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use tracing::{trace, warn};

use crate::error::{PoolError, PoolResult};
use crate::pool::stats::TaskStats;

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size set of worker threads draining one job channel.
///
/// Closing drops the sender: workers finish whatever is already queued and
/// then exit on their own, so closing never blocks.
pub(crate) struct Executor {
    id: u64,
    size: usize,
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl Executor {
    pub(crate) fn spawn(id: u64, size: usize, stats: Arc<TaskStats>) -> PoolResult<Self> {
        let (sender, receiver) = channel::unbounded::<Job>();
        let mut workers = Vec::with_capacity(size);

        for index in 0..size {
            let receiver = receiver.clone();
            let stats = Arc::clone(&stats);
            let spawned = thread::Builder::new()
                .name(format!("pool{id}-worker{index}"))
                .spawn(move || worker_loop(receiver, stats));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Unwind the partial executor before reporting
                    drop(sender);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(PoolError::Spawn(e));
                }
            }
        }

        Ok(Self {
            id,
            size,
            sender: Some(sender),
            workers,
        })
    }

    /// Executor with no workers that rejects every job.
    pub(crate) fn closed() -> Self {
        Self {
            id: 0,
            size: 0,
            sender: None,
            workers: Vec::new(),
        }
    }

    pub(crate) fn send(&self, job: Job) -> Result<(), Job> {
        match &self.sender {
            Some(sender) => sender.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        }
    }

    /// Stop accepting jobs; queued jobs still run.
    pub(crate) fn close(&mut self) {
        self.sender.take();
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.workers.iter().all(JoinHandle::is_finished)
    }

    /// Close and wait for every worker to drain and exit.
    pub(crate) fn join(mut self) {
        self.close();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!(executor = self.id, "pool worker exited abnormally");
            }
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }
}

fn worker_loop(receiver: Receiver<Job>, stats: Arc<TaskStats>) {
    loop {
        match receiver.recv_timeout(Duration::from_secs(1)) {
            Ok(job) => {
                let _timer = stats.start_task();
                job();
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    trace!("pool worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_close_drains_queued_jobs() {
        let stats = Arc::new(TaskStats::default());
        let mut executor = Executor::spawn(1, 2, Arc::clone(&stats)).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            assert!(executor
                .send(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
                .is_ok());
        }
        executor.close();
        assert!(executor.send(Box::new(|| {})).is_err());

        executor.join();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
        assert_eq!(stats.snapshot().completed, 50);
    }

    #[test]
    fn test_closed_executor_rejects() {
        let executor = Executor::closed();
        assert!(executor.send(Box::new(|| {})).is_err());
        assert!(executor.is_finished());
        assert_eq!(executor.size(), 0);
    }
}
