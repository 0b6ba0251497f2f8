//! Worker Threads
//!
//! Every long-running loop in the dashcam is a plain OS thread that polls a
//! shared running flag plus a stop signal once per iteration. Shutdown is
//! best-effort: callers wait a bounded time for each thread and carry on with
//! cleanup whether or not it actually exited.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Default bounded join timeout
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Poll interval while waiting for a thread to finish
const JOIN_POLL: Duration = Duration::from_millis(10);

/// Worker error types
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to spawn thread '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Read side of a stop request, cloned into every thread
#[derive(Clone)]
pub struct StopToken {
    running: Arc<AtomicBool>,
    signal: Receiver<()>,
}

impl StopToken {
    /// Check the running flag
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless a stop is requested first.
    ///
    /// Returns `true` if the caller should keep going.
    pub fn sleep(&self, duration: Duration) -> bool {
        if !self.is_running() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }
        match self.signal.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => self.is_running(),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

/// Owner side of a stop request
pub struct StopSource {
    running: Arc<AtomicBool>,
    sender: Option<Sender<()>>,
    token: StopToken,
}

impl StopSource {
    /// Create a source in the running state
    pub fn new() -> Self {
        let (sender, signal) = bounded(0);
        let running = Arc::new(AtomicBool::new(true));
        Self {
            token: StopToken {
                running: running.clone(),
                signal,
            },
            running,
            sender: Some(sender),
        }
    }

    /// Hand out a token for a new thread
    pub fn token(&self) -> StopToken {
        self.token.clone()
    }

    /// Clear the running flag and wake every sleeping token. Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        // Disconnecting the only sender wakes all receivers at once.
        self.sender.take();
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }
}

impl Default for StopSource {
    fn default() -> Self {
        Self::new()
    }
}

/// A named thread with a bounded join
pub struct Worker {
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn `body` on a named thread
    pub fn spawn<F>(name: &str, token: StopToken, body: F) -> Result<Self, WorkerError>
    where
        F: FnOnce(StopToken) + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(token))
            .map_err(|source| WorkerError::Spawn {
                name: name.to_string(),
                source,
            })?;

        debug!("Spawned worker thread '{}'", name);
        Ok(Self {
            name: name.to_string(),
            handle: Some(handle),
        })
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the thread body has returned
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Wait up to `timeout` for the thread to exit.
    ///
    /// Returns `true` if the thread finished in time. A thread that misses the
    /// deadline is detached.
    pub fn join(mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    "Worker '{}' did not stop within {:.1}s, detaching",
                    self.name,
                    timeout.as_secs_f64()
                );
                return false;
            }
            thread::sleep(JOIN_POLL);
        }

        if handle.join().is_err() {
            error!("Worker '{}' panicked", self.name);
        } else {
            debug!("Worker '{}' stopped", self.name);
        }
        true
    }
}

/// Threads of one subsystem sharing a single stop source
pub struct WorkerSet {
    source: StopSource,
    workers: Vec<Worker>,
}

impl WorkerSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self {
            source: StopSource::new(),
            workers: Vec::new(),
        }
    }

    /// Token for the shared stop source
    pub fn token(&self) -> StopToken {
        self.source.token()
    }

    /// Spawn a thread into the set
    pub fn spawn<F>(&mut self, name: &str, body: F) -> Result<(), WorkerError>
    where
        F: FnOnce(StopToken) + Send + 'static,
    {
        let worker = Worker::spawn(name, self.source.token(), body)?;
        self.workers.push(worker);
        Ok(())
    }

    /// Number of threads still owned by the set
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the set owns no threads
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Signal stop and join every thread with `timeout` each.
    ///
    /// Returns the number of threads that missed their deadline.
    pub fn shutdown(&mut self, timeout: Duration) -> usize {
        self.source.stop();
        let workers = std::mem::take(&mut self.workers);
        let total = workers.len();
        let stuck = workers
            .into_iter()
            .map(|w| w.join(timeout))
            .filter(|joined| !joined)
            .count();

        if total > 0 {
            info!("Stopped {}/{} worker threads", total - stuck, total);
        }
        stuck
    }
}

impl Default for WorkerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WorkerSet {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.shutdown(DEFAULT_JOIN_TIMEOUT);
        }
    }
}
