//! End-of-unit-of-work callbacks.
//!
//! The host calls `finish` once the current unit of work (an HTTP response, a
//! CLI command, a test step) has been finalized. Callbacks run in the order
//! they were registered, including callbacks registered by other callbacks
//! while `finish` is running.

use std::fmt;
use std::sync::Mutex;

use tracing::debug;

type Deferred = Box<dyn FnOnce() + Send>;

#[derive(Default)]
pub struct RequestLifecycle {
    callbacks: Mutex<Vec<Deferred>>,
}

impl fmt::Debug for RequestLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestLifecycle")
            .field("pending", &self.pending())
            .finish()
    }
}

impl RequestLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_finish<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.callbacks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Box::new(callback));
    }

    pub fn pending(&self) -> usize {
        self.callbacks.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Run every registered callback. Returns how many ran.
    pub fn finish(&self) -> usize {
        let mut ran = 0;
        loop {
            // Callbacks may register more, so the lock is not held while they run.
            let batch = std::mem::take(&mut *self.callbacks.lock().unwrap_or_else(|p| p.into_inner()));
            if batch.is_empty() {
                break;
            }
            for callback in batch {
                callback();
                ran += 1;
            }
        }

        if ran > 0 {
            debug!(callbacks = ran, "request lifecycle finished");
        }
        ran
    }
}
