use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use tokio::{runtime::Handle, task::JoinHandle};
use tracing::debug;

/// Where connection tasks run.
///
/// Built once at startup and handed to the connection handler. Clones share
/// the same running flag; once stopped, nothing new is spawned.
#[derive(Clone)]
pub struct Scheduler {
    handle: Handle,
    running: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Scheduler on the runtime of the calling task.
    ///
    /// Panics when called outside a tokio runtime, like
    /// [`Handle::current`].
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Returns `None` once the scheduler has been stopped.
    pub fn spawn<F>(&self, task: F) -> Option<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if !self.is_running() {
            debug!("scheduler stopped; task dropped");
            return None;
        }
        Some(self.handle.spawn(task))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }
}
