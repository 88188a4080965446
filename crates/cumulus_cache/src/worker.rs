//! The per-cache worker thread.
//!
//! Every cache instance owns one dedicated OS thread that runs all database
//! and download-orchestration work. Callers enqueue jobs and get a
//! completion receiver back; nothing ever blocks the caller's thread unless
//! it chooses to wait. The worker thread hosts a current-thread tokio
//! runtime inside a `LocalSet`, so jobs can `spawn_local` async work (the
//! download manager's transfers) that multiplexes cooperatively between
//! jobs.

use crate::error::{CacheError, CacheResult};
use std::io;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

/// One-shot reply handle a job uses to deliver its result.
///
/// Cheap to move into a `spawn_local` task, which is how download
/// completions reply long after the enqueuing job returned.
pub struct Reply<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Reply<T> {
    /// Delivers the result. Dropped receivers are ignored.
    pub fn send(self, value: T) {
        let _ = self.tx.send(value);
    }
}

/// Receives a job's eventual result.
pub struct Completion<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> Completion<T> {
    /// Blocks until the result arrives.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::WorkerClosed`] if the worker shut down (or the
    /// job's reply handle was dropped) before a result was produced.
    pub fn wait(self) -> CacheResult<T> {
        self.rx.recv().map_err(|_| CacheError::WorkerClosed)
    }

    /// Blocks until the result arrives or the timeout passes.
    pub fn wait_timeout(self, timeout: Duration) -> CacheResult<T> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            mpsc::RecvTimeoutError::Timeout => CacheError::Timeout,
            mpsc::RecvTimeoutError::Disconnected => CacheError::WorkerClosed,
        })
    }

    /// Returns the result if it is already available.
    pub fn try_take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// A task queue consumed by one dedicated background thread.
///
/// `S` is the worker-local state (databases, download manager); it is built
/// by the `init` closure *on the worker thread*, so it may hold thread-bound
/// values (`Rc`, `RefCell`, SQLite connections).
pub struct TaskRunner<S: 'static> {
    tx: Option<tokio::sync::mpsc::UnboundedSender<Job<S>>>,
    handle: Option<JoinHandle<()>>,
}

impl<S: 'static> TaskRunner<S> {
    /// Spawns the worker thread and builds its state.
    pub fn spawn<F>(name: &str, init: F) -> io::Result<Self>
    where
        F: FnOnce() -> S + Send + 'static,
    {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Job<S>>();
        let thread_name = name.to_string();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    // Jobs will observe WorkerClosed through their replies.
                    tracing::error!(worker = %thread_name, error = %e, "worker runtime failed");
                    return;
                }
            };
            let local = tokio::task::LocalSet::new();
            local.block_on(&runtime, async move {
                let mut state = init();
                while let Some(job) = rx.recv().await {
                    job(&mut state);
                }
                debug!(worker = %thread_name, "worker queue closed");
            });
        })?;

        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    /// Enqueues a job whose return value is the result.
    pub fn dispatch<T, F>(&self, f: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> T + Send + 'static,
    {
        self.dispatch_deferred(move |state, reply| reply.send(f(state)))
    }

    /// Enqueues a job that replies on its own schedule.
    ///
    /// The job receives a [`Reply`] it can move into async tasks; the
    /// completion resolves whenever (and wherever) the reply is sent.
    pub fn dispatch_deferred<T, F>(&self, f: F) -> Completion<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut S, Reply<T>) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let job: Job<S> = Box::new(move |state| f(state, Reply { tx }));
        if let Some(sender) = &self.tx {
            // A send failure means the worker is gone; the dropped reply
            // sender surfaces that as WorkerClosed on the receiver side.
            let _ = sender.send(job);
        }
        Completion { rx }
    }
}

impl<S: 'static> Drop for TaskRunner<S> {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain remaining jobs and exit.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
