//! Persistent execution streams.
//!
//! Each `ExecStream` models one asynchronous hardware queue as a
//! dedicated worker thread consuming submitted tasks in FIFO order. The
//! engine drives three of them (host-to-device fill, device compute,
//! device-to-host drain) and performs a full barrier at the end of every
//! chunk step via `synchronize`. Tasks return `Result`; the first error
//! on a stream latches and is surfaced at the next barrier, which aborts
//! the reconstruction at the following step boundary.

use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::error::{lock_mutex, LamError};

/// Work item executed on a stream worker.
type StreamTask = Box<dyn FnOnce() -> Result<(), LamError> + Send + 'static>;

/// State shared between a stream handle and its worker thread.
struct StreamShared {
    /// Tasks submitted but not yet completed.
    pending: Mutex<usize>,
    /// Signalled each time a task completes.
    completed: Condvar,
    /// First task error on this stream since the last synchronize.
    first_error: Mutex<Option<LamError>>,
}

/// One persistent asynchronous execution queue.
///
/// Submissions are executed in order on a single worker thread. Dropping
/// the stream closes the queue and joins the worker.
pub struct ExecStream {
    /// Queue name, used in fault messages ("fill", "compute", "drain").
    label: &'static str,
    /// Sending half of the task queue; `None` once shut down.
    sender: Option<Sender<StreamTask>>,
    /// Handle to the worker thread.
    worker: Option<JoinHandle<()>>,
    shared: Arc<StreamShared>,
}

impl ExecStream {
    /// Spawn a stream worker.
    pub fn spawn(label: &'static str) -> Result<Self, LamError> {
        let (sender, receiver) = channel::<StreamTask>();
        let shared = Arc::new(StreamShared {
            pending: Mutex::new(0),
            completed: Condvar::new(),
            first_error: Mutex::new(None),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("lam-{label}"))
            .spawn(move || {
                while let Ok(task) = receiver.recv() {
                    if let Err(err) = task() {
                        if let Ok(mut slot) = worker_shared.first_error.lock() {
                            slot.get_or_insert(err);
                        }
                    }
                    if let Ok(mut pending) = worker_shared.pending.lock() {
                        *pending = pending.saturating_sub(1);
                        worker_shared.completed.notify_all();
                    }
                }
            })
            .map_err(|e| LamError::Stream(format!("failed to spawn {label} worker: {e}")))?;
        Ok(Self {
            label,
            sender: Some(sender),
            worker: Some(worker),
            shared,
        })
    }

    /// Queue a task for asynchronous execution on this stream.
    pub fn submit<T>(&self, task: T) -> Result<(), LamError>
    where
        T: FnOnce() -> Result<(), LamError> + Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| LamError::Stream(format!("{} stream already shut down", self.label)))?;
        {
            let mut pending = lock_mutex(&self.shared.pending, "stream pending count")?;
            *pending += 1;
        }
        sender.send(Box::new(task)).map_err(|_| {
            if let Ok(mut pending) = self.shared.pending.lock() {
                *pending = pending.saturating_sub(1);
            }
            LamError::Stream(format!("{} worker queue closed", self.label))
        })
    }

    /// Block until every submitted task has run, then surface the first
    /// latched error (taking it, so a later synchronize starts clean).
    pub fn synchronize(&self) -> Result<(), LamError> {
        let mut pending = lock_mutex(&self.shared.pending, "stream pending count")?;
        while *pending > 0 {
            pending = self
                .shared
                .completed
                .wait(pending)
                .map_err(|_| LamError::Stream(format!("{} barrier poisoned", self.label)))?;
        }
        drop(pending);
        let mut slot = lock_mutex(&self.shared.first_error, "stream error latch")?;
        match slot.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for ExecStream {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// The three queues of the chunk pipeline, in dependency order.
pub struct StreamTrio {
    /// Host-to-device copies (chunk fill).
    pub fill: ExecStream,
    /// Transform kernel execution.
    pub compute: ExecStream,
    /// Device-to-host copies (chunk drain).
    pub drain: ExecStream,
}

impl StreamTrio {
    pub fn spawn() -> Result<Self, LamError> {
        Ok(Self {
            fill: ExecStream::spawn("fill")?,
            compute: ExecStream::spawn("compute")?,
            drain: ExecStream::spawn("drain")?,
        })
    }

    /// The per-step barrier: join all three queues. Every stream is
    /// synchronized even when an earlier one reports an error; the first
    /// error in fill/compute/drain order wins.
    pub fn synchronize_all(&self) -> Result<(), LamError> {
        let fill = self.fill.synchronize();
        let compute = self.compute.synchronize();
        let drain = self.drain.synchronize();
        fill.and(compute).and(drain)
    }
}
