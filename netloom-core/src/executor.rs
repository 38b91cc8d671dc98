//! Worker pool for pipeline dispatch.
//!
//! Plain OS threads pulling boxed jobs from one shared flume queue. I/O
//! threads hand dispatch work here so a slow handler never delays socket
//! completions or accepts. A panicking job is caught and logged; the worker
//! keeps serving.

use crate::error::EngineError;

use flume::{Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send>;

enum Task {
    Run(Job),
    Stop,
}

/// Cloneable submission handle.
#[derive(Clone)]
pub struct Executor {
    tx: Sender<Task>,
}

impl Executor {
    /// Queue a job.
    ///
    /// # Errors
    ///
    /// `EngineError::Shutdown` once the pool stopped.
    pub fn execute<F>(&self, job: F) -> Result<(), EngineError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(Task::Run(Box::new(job)))
            .map_err(|_| EngineError::Shutdown)
    }

    /// Jobs waiting for a worker.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.tx.len()
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor").field("queued", &self.queued()).finish()
    }
}

pub struct WorkerPool {
    executor: Executor,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `threads` workers named `{name}-{i}`.
    ///
    /// # Errors
    ///
    /// `EngineError::Startup` if a thread cannot be spawned; workers already
    /// started are stopped and joined.
    pub fn start(name: &str, threads: usize) -> Result<Self, EngineError> {
        let (tx, rx) = flume::unbounded::<Task>();
        let executor = Executor { tx };
        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let rx = rx.clone();
            let spawned = thread::Builder::new()
                .name(format!("{name}-{i}"))
                .spawn(move || worker_loop(i, rx));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    for _ in 0..workers.len() {
                        let _ = executor.tx.send(Task::Stop);
                    }
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(EngineError::startup(format!(
                        "failed to spawn worker {i}: {e}"
                    )));
                }
            }
        }
        debug!(threads, "worker pool started");
        Ok(Self {
            executor,
            workers: Mutex::new(workers),
        })
    }

    #[must_use]
    pub fn executor(&self) -> Executor {
        self.executor.clone()
    }

    pub fn execute<F>(&self, job: F) -> Result<(), EngineError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.executor.execute(job)
    }

    #[must_use]
    pub fn threads(&self) -> usize {
        self.workers.lock().len()
    }

    /// Let queued jobs finish, then stop and join every worker.
    ///
    /// Jobs submitted after this call are not run.
    pub fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        for _ in 0..workers.len() {
            let _ = self.executor.tx.send(Task::Stop);
        }
        for handle in workers {
            // A job may drop the last engine handle from inside a worker.
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            let _ = handle.join();
        }
        debug!("worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(index: usize, rx: Receiver<Task>) {
    while let Ok(task) = rx.recv() {
        let job = match task {
            Task::Run(job) => job,
            Task::Stop => break,
        };
        if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());
            error!(worker = index, reason = %reason, "job panicked");
        }
    }
    debug!(worker = index, "worker exiting");
}
