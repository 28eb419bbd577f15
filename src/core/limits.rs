/*!
 * Pool Limits and Constants
 *
 * Centralized location for default limits, intervals and timeouts used by
 * the pool, its groups and their background threads.
 *
 * Values marked [PERF] trade latency for lock traffic, values marked
 * [SAFETY] bound how long a misbehaving worker can hold resources.
 */

use std::time::Duration;

// =============================================================================
// CAPACITY
// =============================================================================

/// Default maximum number of worker processes across all applications
pub const DEFAULT_MAX_POOL_SIZE: usize = 6;

/// Default minimum number of processes a group keeps alive
pub const DEFAULT_MIN_PROCESSES: usize = 1;

/// Default per-group bound on queued get requests (0 = unbounded)
pub const DEFAULT_MAX_REQUEST_QUEUE_SIZE: usize = 100;

/// Default number of processes allowed to run out-of-band work at once
pub const DEFAULT_MAX_OOBW_INSTANCES: usize = 1;

/// Capacity held back for a SuperGroup that is still initializing
pub const INITIALIZING_SUPER_GROUP_RESERVATION: usize = 1;

// =============================================================================
// GARBAGE COLLECTION
// =============================================================================

/// Idle time after which a process (and eventually its application) is retired
pub const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(300);

/// Lower bound between two garbage collector sweeps
/// [PERF] Prevents a burst of wake-ups from turning into a busy loop
pub const MIN_GC_INTERVAL: Duration = Duration::from_millis(50);

// =============================================================================
// BACKGROUND THREADS
// =============================================================================

/// How often the detached processes checker re-examines its group
pub const DEFAULT_DETACHED_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// How long a detached process gets to exit before it is force killed
/// [SAFETY]
pub const DEFAULT_PROCESS_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll interval of a SuperGroup destroyer waiting for its groups to exit
pub const DEFAULT_DESTROY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on a single out-of-band work run
/// [SAFETY]
pub const DEFAULT_OOBW_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll interval used while waiting for the pool to drain during shutdown
pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(10);
