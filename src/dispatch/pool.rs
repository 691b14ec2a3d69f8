//! Bounded pool of OS threads for blocking hooks
//!
//! Jobs go through a bounded async-channel queue; submitters wait for queue
//! space, then for the job's result on a oneshot.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;

use async_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{RelayError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker threads running blocking `project`/`collect` calls
pub struct WorkerPool {
    sender: Sender<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawn `size` workers sharing a queue of `capacity` pending jobs
    pub fn new(size: usize, capacity: usize) -> Result<Self> {
        if size == 0 {
            return Err(RelayError::Config(
                "worker pool needs at least one thread".to_string(),
            ));
        }
        let (sender, receiver) = bounded::<Job>(capacity.max(1));

        let mut workers = Vec::with_capacity(size);
        for idx in 0..size {
            let receiver: Receiver<Job> = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("fsrelay-hook-{}", idx))
                .spawn(move || {
                    while let Ok(job) = receiver.recv_blocking() {
                        job();
                    }
                })?;
            workers.push(handle);
        }
        tracing::debug!(size, capacity, "started hook worker pool");

        Ok(Self {
            sender,
            workers: Mutex::new(workers),
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs waiting for a free worker
    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    /// Run `f` on a worker thread and wait for its result
    pub async fn submit<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            let _ = tx.send(catch_unwind(AssertUnwindSafe(f)));
        });
        self.sender
            .send(job)
            .await
            .map_err(|_| RelayError::Internal("worker pool is closed".to_string()))?;

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(RelayError::Internal("blocking hook panicked".to_string())),
            Err(_) => Err(RelayError::Internal(
                "worker dropped the job without a result".to_string(),
            )),
        }
    }

    /// Stop accepting jobs; workers exit once the queue is drained
    pub fn close(&self) {
        self.sender.close();
    }

    /// Close and wait for every worker thread to exit
    pub fn join(&self) {
        self.close();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if worker.join().is_err() {
                tracing::warn!("hook worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.close();
    }
}
