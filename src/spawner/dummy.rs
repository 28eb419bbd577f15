/*!
 * Dummy Spawner
 *
 * In-memory workers for tests, benchmarks and the demo binary. A shared
 * `DummyController` lets callers pause spawning, inject failures and look
 * at every worker that was ever started.
 */

use super::traits::{SpawnedProcess, Spawner, SpawnerFactory, WorkerHandle};
use crate::core::errors::SpawnError;
use crate::core::types::Pid;
use crate::pool::Options;
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

const FIRST_DUMMY_PID: Pid = 10_000;

/// Worker that only lives in memory
#[derive(Debug)]
pub struct DummyWorker {
    pid: Pid,
    exit_on_shutdown: bool,
    shutdown_triggered: AtomicBool,
    exited: AtomicBool,
    killed: AtomicBool,
    oobw_runs: AtomicUsize,
}

impl DummyWorker {
    fn new(pid: Pid, exit_on_shutdown: bool) -> Self {
        Self {
            pid,
            exit_on_shutdown,
            shutdown_triggered: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            oobw_runs: AtomicUsize::new(0),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn shutdown_triggered(&self) -> bool {
        self.shutdown_triggered.load(Ordering::Acquire)
    }

    pub fn is_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub fn was_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub fn oobw_runs(&self) -> usize {
        self.oobw_runs.load(Ordering::Acquire)
    }

    /// Simulate the process exiting on its own
    pub fn exit(&self) {
        self.exited.store(true, Ordering::Release);
    }
}

impl WorkerHandle for DummyWorker {
    fn trigger_shutdown(&self) {
        self.shutdown_triggered.store(true, Ordering::Release);
        if self.exit_on_shutdown {
            self.exit();
        }
    }

    fn has_exited(&self) -> bool {
        self.is_exited()
    }

    fn force_kill(&self) {
        self.killed.store(true, Ordering::Release);
        self.exit();
    }

    fn perform_out_of_band_work(&self, _timeout: Duration) -> io::Result<()> {
        self.oobw_runs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Gates {
    spawns_paused: bool,
    creates_paused: bool,
}

#[derive(Debug, Clone)]
struct DummySettings {
    concurrency: u32,
    spawn_delay: Duration,
    exit_on_shutdown: bool,
}

/// Shared knobs and bookkeeping of all dummy spawners from one factory
#[derive(Debug)]
pub struct DummyController {
    settings: Mutex<DummySettings>,
    gates: Mutex<Gates>,
    resumed: Condvar,
    failing_spawns: AtomicUsize,
    failing_creates: AtomicUsize,
    spawn_count: AtomicUsize,
    create_count: AtomicUsize,
    next_pid: AtomicU32,
    workers: Mutex<Vec<Arc<DummyWorker>>>,
}

impl DummyController {
    fn new() -> Self {
        Self {
            settings: Mutex::new(DummySettings {
                concurrency: 1,
                spawn_delay: Duration::ZERO,
                exit_on_shutdown: true,
            }),
            gates: Mutex::new(Gates::default()),
            resumed: Condvar::new(),
            failing_spawns: AtomicUsize::new(0),
            failing_creates: AtomicUsize::new(0),
            spawn_count: AtomicUsize::new(0),
            create_count: AtomicUsize::new(0),
            next_pid: AtomicU32::new(FIRST_DUMMY_PID),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Block every spawn until `resume` is called
    pub fn pause(&self) {
        self.gates.lock().spawns_paused = true;
    }

    pub fn resume(&self) {
        self.gates.lock().spawns_paused = false;
        self.resumed.notify_all();
    }

    /// Block spawner creation (application initialization) until
    /// `resume_creates` is called
    pub fn pause_creates(&self) {
        self.gates.lock().creates_paused = true;
    }

    pub fn resume_creates(&self) {
        self.gates.lock().creates_paused = false;
        self.resumed.notify_all();
    }

    pub fn set_concurrency(&self, concurrency: u32) {
        self.settings.lock().concurrency = concurrency;
    }

    pub fn set_spawn_delay(&self, delay: Duration) {
        self.settings.lock().spawn_delay = delay;
    }

    /// Workers ignore graceful shutdown requests and must be force killed
    pub fn set_exit_on_shutdown(&self, exit: bool) {
        self.settings.lock().exit_on_shutdown = exit;
    }

    /// Make the next `count` spawns fail
    pub fn fail_next_spawns(&self, count: usize) {
        self.failing_spawns.store(count, Ordering::Release);
    }

    /// Make the next `count` spawner creations fail
    pub fn fail_next_creates(&self, count: usize) {
        self.failing_creates.store(count, Ordering::Release);
    }

    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::Acquire)
    }

    pub fn create_count(&self) -> usize {
        self.create_count.load(Ordering::Acquire)
    }

    pub fn workers(&self) -> Vec<Arc<DummyWorker>> {
        self.workers.lock().clone()
    }

    pub fn worker(&self, pid: Pid) -> Option<Arc<DummyWorker>> {
        self.workers.lock().iter().find(|w| w.pid == pid).cloned()
    }

    pub fn running_workers(&self) -> usize {
        self.workers.lock().iter().filter(|w| !w.is_exited()).count()
    }

    fn wait_for_gate(&self, closed: impl Fn(&Gates) -> bool) {
        let mut gates = self.gates.lock();
        while closed(&gates) {
            self.resumed.wait(&mut gates);
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Factory handing out dummy spawners that share one controller
#[derive(Debug, Clone)]
pub struct DummySpawnerFactory {
    controller: Arc<DummyController>,
}

impl Default for DummySpawnerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl DummySpawnerFactory {
    pub fn new() -> Self {
        Self {
            controller: Arc::new(DummyController::new()),
        }
    }

    pub fn with_concurrency(self, concurrency: u32) -> Self {
        self.controller.set_concurrency(concurrency);
        self
    }

    pub fn with_spawn_delay(self, delay: Duration) -> Self {
        self.controller.set_spawn_delay(delay);
        self
    }

    pub fn controller(&self) -> Arc<DummyController> {
        self.controller.clone()
    }
}

impl SpawnerFactory for DummySpawnerFactory {
    fn create(&self, options: &Options) -> Result<Arc<dyn Spawner>, SpawnError> {
        self.controller.wait_for_gate(|g| g.creates_paused);
        self.controller.create_count.fetch_add(1, Ordering::AcqRel);
        if DummyController::take_failure(&self.controller.failing_creates) {
            return Err(SpawnError::Internal(format!(
                "invalid configuration for {}",
                options.app_group_name()
            )));
        }
        Ok(Arc::new(DummySpawner {
            controller: self.controller.clone(),
        }))
    }
}

/// Spawner producing `DummyWorker`s
#[derive(Debug)]
pub struct DummySpawner {
    controller: Arc<DummyController>,
}

impl Spawner for DummySpawner {
    fn spawn(&self, options: &Options) -> Result<SpawnedProcess, SpawnError> {
        self.controller.wait_for_gate(|g| g.spawns_paused);

        let settings = self.controller.settings.lock().clone();
        if !settings.spawn_delay.is_zero() {
            thread::sleep(settings.spawn_delay);
        }

        self.controller.spawn_count.fetch_add(1, Ordering::AcqRel);
        if DummyController::take_failure(&self.controller.failing_spawns) {
            return Err(SpawnError::Handshake(format!(
                "{} did not report readiness",
                options.app_group_name()
            )));
        }

        let pid = self.controller.next_pid.fetch_add(1, Ordering::AcqRel);
        let worker = Arc::new(DummyWorker::new(pid, settings.exit_on_shutdown));
        self.controller.workers.lock().push(worker.clone());
        debug!(pid, app = options.app_group_name(), "Dummy worker spawned");

        Ok(SpawnedProcess {
            pid,
            concurrency: settings.concurrency,
            handle: worker,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_spawned_workers_get_distinct_pids() {
        let factory = DummySpawnerFactory::new().with_concurrency(4);
        let spawner = factory.create(&Options::new("/srv/app")).unwrap();

        let a = spawner.spawn(&Options::new("/srv/app")).unwrap();
        let b = spawner.spawn(&Options::new("/srv/app")).unwrap();

        assert_ne!(a.pid, b.pid);
        assert_eq!(a.concurrency, 4);
        assert_eq!(factory.controller().spawn_count(), 2);
        assert_eq!(factory.controller().running_workers(), 2);
    }

    #[test]
    fn test_failure_injection_is_consumed() {
        let factory = DummySpawnerFactory::new();
        let controller = factory.controller();
        controller.fail_next_creates(1);
        assert!(factory.create(&Options::new("/srv/app")).is_err());

        let spawner = factory.create(&Options::new("/srv/app")).unwrap();
        controller.fail_next_spawns(1);
        assert!(matches!(
            spawner.spawn(&Options::new("/srv/app")),
            Err(SpawnError::Handshake(_))
        ));
        assert!(spawner.spawn(&Options::new("/srv/app")).is_ok());
    }

    #[test]
    fn test_worker_shutdown_and_kill() {
        let factory = DummySpawnerFactory::new();
        let controller = factory.controller();
        controller.set_exit_on_shutdown(false);
        let spawner = factory.create(&Options::new("/srv/app")).unwrap();
        let spawned = spawner.spawn(&Options::new("/srv/app")).unwrap();

        spawned.handle.trigger_shutdown();
        assert!(!spawned.handle.has_exited());
        spawned.handle.force_kill();
        assert!(spawned.handle.has_exited());
        assert!(controller.worker(spawned.pid).unwrap().was_killed());
    }
}
