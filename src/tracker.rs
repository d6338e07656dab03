//! # Job Tracker
//!
//! Delivers jobs to worker nodes and counts the ones still outstanding. The
//! scheduler blocks on [`JobTracker::wait_idle`] instead of polling.
//!
//! [`LocalJobTracker`] runs one thread per worker node. Each node has its own
//! inbox so a job always reaches the worker named in it.

use crate::model::{Job, JobResult};
use crate::worker::JobHandler;
use anyhow::{anyhow, Result};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A finished job and what it produced.
#[derive(Debug)]
pub struct JobOutcome {
    pub job: Job,
    pub result: Result<JobResult>,
}

pub trait JobTracker: Send + Sync {
    /// Hand `jobs` to their workers.
    fn add(&self, jobs: Vec<Job>) -> Result<()>;

    /// Jobs added but not yet finished.
    fn num_remaining(&self) -> usize;

    /// Block until no job is outstanding. Returns `false` if `timeout`
    /// elapsed first; `None` waits without bound.
    fn wait_idle(&self, timeout: Option<Duration>) -> bool;

    /// Take every outcome recorded since the last call.
    fn take_results(&self) -> Vec<JobOutcome>;
}

#[derive(Default)]
struct Progress {
    remaining: usize,
    results: Vec<JobOutcome>,
}

#[derive(Default)]
struct Shared {
    progress: Mutex<Progress>,
    idle: Condvar,
}

impl Shared {
    fn finish(&self, outcome: JobOutcome) {
        let mut progress = self.progress.lock();
        progress.remaining = progress.remaining.saturating_sub(1);
        progress.results.push(outcome);
        if progress.remaining == 0 {
            self.idle.notify_all();
        }
    }
}

pub struct LocalJobTracker {
    inboxes: Mutex<Vec<Sender<Job>>>,
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalJobTracker {
    /// Start one thread per handler; handler `i` serves worker rank `i`.
    pub fn start(handlers: Vec<Box<dyn JobHandler>>) -> std::io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let mut inboxes = Vec::with_capacity(handlers.len());
        let mut handles = Vec::with_capacity(handlers.len());

        for (rank, mut handler) in handlers.into_iter().enumerate() {
            let (tx, rx) = unbounded::<Job>();
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("sparsebcd-worker-{rank}"))
                .spawn(move || {
                    for job in rx {
                        let result = catch_unwind(AssertUnwindSafe(|| handler.process(&job)))
                            .unwrap_or_else(|_| Err(anyhow!("worker panicked on {} job", job.kind)));
                        if let Err(err) = &result {
                            warn!(worker = %job.worker, kind = %job.kind, error = %err, "job failed");
                        }
                        shared.finish(JobOutcome { job, result });
                    }
                    debug!(rank, "worker thread exiting");
                })?;
            inboxes.push(tx);
            handles.push(handle);
        }

        Ok(Self {
            inboxes: Mutex::new(inboxes),
            shared,
            handles: Mutex::new(handles),
        })
    }

    pub fn num_workers(&self) -> usize {
        self.inboxes.lock().len()
    }

    /// Close every inbox and join the worker threads. Jobs already queued
    /// still run.
    pub fn shutdown(&self) {
        self.inboxes.lock().clear();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}

impl JobTracker for LocalJobTracker {
    fn add(&self, jobs: Vec<Job>) -> Result<()> {
        let inboxes = self.inboxes.lock();
        if let Some(job) = jobs.iter().find(|j| j.worker.rank() >= inboxes.len()) {
            return Err(anyhow!("no worker {} for {} job", job.worker, job.kind));
        }
        self.shared.progress.lock().remaining += jobs.len();
        for job in jobs {
            let rank = job.worker.rank();
            if let Err(err) = inboxes[rank].send(job) {
                let job = err.into_inner();
                let kind = job.kind;
                self.shared.finish(JobOutcome {
                    job,
                    result: Err(anyhow!("worker {rank} is gone, {kind} job not run")),
                });
            }
        }
        Ok(())
    }

    fn num_remaining(&self) -> usize {
        self.shared.progress.lock().remaining
    }

    fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let mut progress = self.shared.progress.lock();
        match timeout {
            None => {
                while progress.remaining > 0 {
                    self.shared.idle.wait(&mut progress);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while progress.remaining > 0 {
                    if self.shared.idle.wait_until(&mut progress, deadline).timed_out() {
                        return progress.remaining == 0;
                    }
                }
                true
            }
        }
    }

    fn take_results(&self) -> Vec<JobOutcome> {
        std::mem::take(&mut self.shared.progress.lock().results)
    }
}

impl Drop for LocalJobTracker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
