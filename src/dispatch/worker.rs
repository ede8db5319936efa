//! Bounded worker pool for offloaded instructions.

use crate::error::{Error, Result};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A unit of offloaded work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of threads fed through a bounded queue.
///
/// [`WorkerPool::submit`] never waits: a job that finds the queue full is
/// refused and handed back to the caller as an error. A panicking job is
/// logged and its worker moves on to the next one.
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Start `workers` threads sharing a queue of `queue_depth` jobs.
    pub fn new(workers: usize, queue_depth: usize) -> Result<Self> {
        let (sender, receiver) = bounded::<Job>(queue_depth);

        let workers = (0..workers.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("dispatch-worker-{}", i))
                    .spawn(move || {
                        for job in receiver.iter() {
                            if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
                                tracing::error!(worker = i, panic = panic_message(&*panic), "offloaded job panicked");
                            }
                        }
                        tracing::debug!(worker = i, "worker exiting");
                    })
                    .map_err(Error::from)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    /// Queue a job without waiting.
    ///
    /// # Errors
    ///
    /// [`Error::Overloaded`] if the queue is full and [`Error::ShuttingDown`]
    /// after [`WorkerPool::shutdown`]. The job is dropped in both cases.
    pub fn submit(&self, job: Job) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(Error::ShuttingDown)?;
        sender.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => Error::overloaded("dispatch queue is full"),
            TrySendError::Disconnected(_) => Error::ShuttingDown,
        })
    }

    /// Stop accepting jobs, finish the queued ones and join the workers.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("dispatch worker panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Text of a panic payload, when it carries one.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Targets with an instruction in progress.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    targets: Arc<Mutex<HashSet<String>>>,
}

impl InFlight {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `target` busy until the returned guard drops.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] if another instruction holds `target`.
    pub fn claim(&self, target: &str) -> Result<InFlightGuard> {
        if !self.targets.lock().insert(target.to_string()) {
            return Err(Error::validation(format!(
                "another operation is in progress for {}",
                target
            )));
        }
        Ok(InFlightGuard {
            targets: self.targets.clone(),
            target: target.to_string(),
        })
    }

    /// Whether `target` is busy.
    pub fn contains(&self, target: &str) -> bool {
        self.targets.lock().contains(target)
    }
}

/// Releases a target claimed through [`InFlight::claim`].
#[derive(Debug)]
pub struct InFlightGuard {
    targets: Arc<Mutex<HashSet<String>>>,
    target: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.targets.lock().remove(&self.target);
    }
}
