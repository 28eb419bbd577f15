/*!
 * Background Threads
 * Named worker threads with a live counter so shutdown can wait for them
 */

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::error;

/// Tracks background threads started by the pool
#[derive(Debug, Default)]
pub struct BackgroundThreads {
    active: AtomicUsize,
    started: AtomicUsize,
}

struct ActiveGuard(Arc<BackgroundThreads>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl BackgroundThreads {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of threads still running
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Number of threads ever started
    pub fn started(&self) -> usize {
        self.started.load(Ordering::Relaxed)
    }

    /// Start a detached, named thread
    pub fn spawn<F>(self: &Arc<Self>, name: &str, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.active.fetch_add(1, Ordering::AcqRel);
        let guard = ActiveGuard(self.clone());
        let result = thread::Builder::new().name(name.to_string()).spawn(move || {
            let _guard = guard;
            f();
        });

        match result {
            Ok(_) => {
                self.started.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                // the closure (and its guard) was dropped by the failed spawn
                error!(thread = name, error = %err, "Failed to start background thread");
                Err(err)
            }
        }
    }
}
