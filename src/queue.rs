//! Execution contexts that redirected handlers run on.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{error, warn};

use crate::{lock, panic_message, Result};

/// A unit of work handed to a [`Queue`].
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// An execution context.
///
/// Work items dispatched to the same queue run in dispatch order. Nothing is
/// promised about ordering across different queues.
pub trait Queue: Send + Sync {
    fn dispatch(&self, work: Work);
}

/// Runs work on one dedicated thread.
///
/// A panicking work item is logged and the worker moves on to the next one.
pub struct SerialQueue {
    name: String,
    sender: Option<Sender<Work>>,
    worker: Option<JoinHandle<()>>,
    thread_id: ThreadId,
}

impl SerialQueue {
    /// Starts a queue whose worker thread is called `name`.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (sender, receiver) = channel::<Work>();
        let label = name.clone();
        let worker = thread::Builder::new().name(name.clone()).spawn(move || {
            for work in receiver {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(work)) {
                    error!(queue = %label, panic = panic_message(&*panic), "work item panicked");
                }
            }
        })?;
        Ok(Self {
            name,
            thread_id: worker.thread().id(),
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The worker thread's id.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }
}

impl Queue for SerialQueue {
    fn dispatch(&self, work: Work) {
        let sent = self
            .sender
            .as_ref()
            .is_some_and(|sender| sender.send(work).is_ok());
        if !sent {
            warn!(queue = %self.name, "work dispatched to a stopped queue was dropped");
        }
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is queued and exit.
        self.sender.take();
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(worker) = self.worker.take() {
            if let Err(panic) = worker.join() {
                warn!(queue = %self.name, panic = panic_message(&*panic), "queue worker exited with a panic");
            }
        }
    }
}

impl fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialQueue")
            .field("name", &self.name)
            .field("thread_id", &self.thread_id)
            .finish()
    }
}

/// A queue drained explicitly by whichever thread calls
/// [`run_pending`](Self::run_pending).
///
/// The process-wide instance returned by [`main_queue`] is the one
/// `on_main_queue` redirects to; the host pumps it from its main loop.
#[derive(Default)]
pub struct PumpedQueue {
    pending: Mutex<VecDeque<Work>>,
}

impl PumpedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the items that were queued when the call started, in order.
    /// Items queued while running wait for the next call.
    ///
    /// A panicking item propagates to the caller; items behind it stay queued.
    pub fn run_pending(&self) -> usize {
        let due = lock(&self.pending).len();
        let mut ran = 0;
        while ran < due {
            let Some(work) = lock(&self.pending).pop_front() else {
                break;
            };
            ran += 1;
            work();
        }
        ran
    }

    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl Queue for PumpedQueue {
    fn dispatch(&self, work: Work) {
        lock(&self.pending).push_back(work);
    }
}

impl fmt::Debug for PumpedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PumpedQueue")
            .field("pending", &self.pending())
            .finish()
    }
}

/// The process-wide main queue.
pub fn main_queue() -> Arc<PumpedQueue> {
    static MAIN: OnceLock<Arc<PumpedQueue>> = OnceLock::new();
    Arc::clone(MAIN.get_or_init(|| Arc::new(PumpedQueue::new())))
}
