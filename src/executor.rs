//! # Executor
//!
//! A single dedicated thread that owns a piece of state and runs submitted
//! tasks against it one at a time, in submission order. Callers block until
//! their task has run, which turns the executor into a serialization point
//! for state shared by many transport threads without exposing any lock.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::debug;

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;

enum Block<S> {
    Run(Task<S>),
    /// Sentinel; acknowledged once every earlier task has run
    Stop(Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorError {
    /// The executor was stopped before the task could run
    Stopped,
    /// The task was submitted from the executor thread itself
    Reentrant,
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorError::Stopped => write!(f, "executor is stopped"),
            ExecutorError::Reentrant => write!(f, "task submitted from the executor thread"),
        }
    }
}

impl std::error::Error for ExecutorError {}

pub struct Executor<S> {
    tx: Sender<Block<S>>,
    thread_id: ThreadId,
    stopped: AtomicBool,
    handle: Mutex<Option<JoinHandle<S>>>,
}

impl<S: Send + 'static> Executor<S> {
    /// Start the executor thread, moving `state` onto it.
    pub fn spawn(name: &str, state: S) -> std::io::Result<Self> {
        let (tx, rx) = unbounded::<Block<S>>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run(rx, state))?;
        Ok(Self {
            tx,
            thread_id: handle.thread().id(),
            stopped: AtomicBool::new(false),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Run `task` on the executor thread and wait for its result.
    pub fn exec<R, F>(&self, task: F) -> Result<R, ExecutorError>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        if thread::current().id() == self.thread_id {
            return Err(ExecutorError::Reentrant);
        }
        if self.stopped.load(Ordering::Acquire) {
            return Err(ExecutorError::Stopped);
        }
        let (done_tx, done_rx) = bounded(1);
        let block = Block::Run(Box::new(move |state: &mut S| {
            let _ = done_tx.send(task(state));
        }));
        self.tx.send(block).map_err(|_| ExecutorError::Stopped)?;
        done_rx.recv().map_err(|_| ExecutorError::Stopped)
    }

    /// Enqueue the stop sentinel and wait until it is processed. Tasks
    /// submitted before it still run; stopping twice is a no-op.
    pub fn stop(&self) -> Result<(), ExecutorError> {
        if thread::current().id() == self.thread_id {
            return Err(ExecutorError::Reentrant);
        }
        if self.stopped.load(Ordering::Acquire) {
            return Ok(());
        }
        let (ack_tx, ack_rx) = bounded(1);
        if self.tx.send(Block::Stop(ack_tx)).is_ok() {
            // A disconnect means a concurrent sentinel already ended the loop.
            let _ = ack_rx.recv();
        }
        self.stopped.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Wait for the executor thread to exit and take back the state.
    ///
    /// Returns `None` if the state was already taken or the thread panicked.
    pub fn join(&self) -> Option<S> {
        let handle = self.handle.lock().take()?;
        handle.join().ok()
    }
}

fn run<S>(rx: Receiver<Block<S>>, mut state: S) -> S {
    debug!("executor started");
    while let Ok(block) = rx.recv() {
        match block {
            Block::Run(task) => task(&mut state),
            Block::Stop(ack) => {
                let _ = ack.send(());
                break;
            }
        }
    }
    debug!("executor stopped");
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_exec_returns_task_value() {
        let exec = Executor::spawn("test-exec", 40u32).unwrap();
        let value = exec
            .exec(|s| {
                *s += 2;
                *s
            })
            .unwrap();
        assert_eq!(value, 42);
        exec.stop().unwrap();
        assert_eq!(exec.join(), Some(42));
    }

    #[test]
    fn test_tasks_are_serialized_across_threads() {
        let exec = Arc::new(Executor::spawn("test-exec", Vec::<(usize, usize)>::new()).unwrap());
        let mut workers = Vec::new();
        for t in 0..8 {
            let exec = Arc::clone(&exec);
            workers.push(thread::spawn(move || {
                for i in 0..100 {
                    exec.exec(move |log| {
                        // A non-atomic read-modify-write that would tear if
                        // two tasks overlapped.
                        let len = log.len();
                        log.push((t, i));
                        assert_eq!(log.len(), len + 1);
                    })
                    .unwrap();
                }
            }));
        }
        for w in workers {
            w.join().unwrap();
        }
        exec.stop().unwrap();
        let log = exec.join().unwrap();
        assert_eq!(log.len(), 800);
        // FIFO per submitting thread
        for t in 0..8 {
            let seq: Vec<usize> = log.iter().filter(|(o, _)| *o == t).map(|(_, i)| *i).collect();
            assert_eq!(seq, (0..100).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_stop_drains_then_rejects() {
        let exec = Executor::spawn("test-exec", 0u32).unwrap();
        exec.exec(|s| *s += 1).unwrap();
        exec.stop().unwrap();
        assert_eq!(exec.exec(|s| *s += 1), Err(ExecutorError::Stopped));
        assert!(exec.stop().is_ok());
        assert_eq!(exec.join(), Some(1));
    }

    #[test]
    fn test_reentrant_exec_is_rejected() {
        let exec = Arc::new(Executor::spawn("test-exec", ()).unwrap());
        let inner = Arc::clone(&exec);
        let nested = exec.exec(move |_| inner.exec(|_| ())).unwrap();
        assert_eq!(nested, Err(ExecutorError::Reentrant));
        exec.stop().unwrap();
    }
}
