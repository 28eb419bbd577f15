/*!
 * Spawner Traits
 *
 * Boundary to the collaborator that actually starts worker processes.
 * Every method may block; the pool only calls them from background threads
 * or after its lock has been released.
 */

use crate::core::errors::SpawnError;
use crate::core::types::Pid;
use crate::pool::Options;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Control over one running worker process
pub trait WorkerHandle: Send + Sync + fmt::Debug {
    /// Ask the worker to exit gracefully
    fn trigger_shutdown(&self);

    /// Whether the OS process is gone
    fn has_exited(&self) -> bool;

    /// Kill the worker after its shutdown timeout expired
    fn force_kill(&self);

    /// Run out-of-band work on the worker; only called while it is disabled
    fn perform_out_of_band_work(&self, _timeout: Duration) -> io::Result<()> {
        Ok(())
    }
}

/// A started worker, ready to be attached to a group
#[derive(Debug, Clone)]
pub struct SpawnedProcess {
    pub pid: Pid,
    /// Maximum concurrent sessions, 0 = unlimited
    pub concurrency: u32,
    pub handle: Arc<dyn WorkerHandle>,
}

/// Starts workers for one application
#[cfg_attr(test, mockall::automock)]
pub trait Spawner: Send + Sync {
    fn spawn(&self, options: &Options) -> Result<SpawnedProcess, SpawnError>;

    /// Release resources such as preloaders once the owning group is gone
    fn cleanup(&self) {}
}

/// Creates a spawner per application; this is where configuration is
/// loaded and validated before a SuperGroup becomes ready
pub trait SpawnerFactory: Send + Sync {
    fn create(&self, options: &Options) -> Result<Arc<dyn Spawner>, SpawnError>;
}
