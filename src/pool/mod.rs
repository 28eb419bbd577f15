/*!
 * Pool
 *
 * Application process pool: decides which worker process serves each
 * request, when to spawn or retire processes, and keeps every application
 * inside its limits and the pool inside its capacity.
 *
 * Pool → SuperGroup (one per application) → Group → Process. All state sits
 * behind one mutex; callbacks and worker handle calls run only after it has
 * been released, and blocking work runs on named background threads.
 */

mod builder;
mod gc;
mod group;
mod inspect;
mod options;
mod process;
mod session;
mod state;
mod super_group;
mod waiter;

pub use builder::PoolBuilder;
pub use gc::GcReport;
pub use group::GroupLifeStatus;
pub use inspect::{GroupSnapshot, PoolSnapshot, ProcessSnapshot, SuperGroupSnapshot};
pub use options::Options;
pub use process::{EnabledStatus, OobwStatus, ProcessLifeStatus};
pub use session::Session;
pub use state::PoolLifeStatus;
pub use super_group::SuperGroupState;
pub use waiter::{DisableCallback, GetCallback, ShutdownCallback};

use crate::core::config::PoolConfig;
use crate::core::errors::{ConfigResult, GetError, GetResult};
use crate::core::limits::SHUTDOWN_POLL_INTERVAL;
use crate::core::types::{DisableResult, Pid, ProcessId, RestartMethod, ShutdownResult};
use crate::monitoring::span_operation;
use crate::spawner::SpawnerFactory;
use state::Shared;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{info, warn};
use waiter::Ticket;

/// Handle to a running pool
pub struct Pool {
    shared: Arc<Shared>,
}

impl Pool {
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Pool with `config` over `factory`, garbage collector included
    pub fn new(config: PoolConfig, factory: Arc<dyn SpawnerFactory>) -> ConfigResult<Self> {
        PoolBuilder::new()
            .with_config(config)
            .with_shared_spawner_factory(factory)
            .build()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    // ------------------------------------------------------------------
    // Getting sessions
    // ------------------------------------------------------------------

    /// Ask for a session. `callback` runs exactly once, possibly on another
    /// thread, and never while the pool lock is held.
    pub fn async_get<F>(&self, options: Options, callback: F)
    where
        F: FnOnce(GetResult<Session>) + Send + 'static,
    {
        self.shared
            .with_state(|state, actions| state.async_get(options, Box::new(callback), actions));
    }

    /// Blocking get. A session that arrives after `timeout` is closed again.
    pub fn get(&self, options: Options, timeout: Duration) -> GetResult<Session> {
        let ticket = Ticket::new();
        let slot = ticket.clone();
        self.async_get(options, move |result| slot.complete(result));
        ticket.wait(timeout).unwrap_or(Err(GetError::Timeout))
    }

    /// Async get for callers running on a tokio runtime
    pub async fn checkout(&self, options: Options) -> GetResult<Session> {
        let (tx, rx) = oneshot::channel();
        self.async_get(options, move |result| {
            // the receiver may be gone; the session then closes on drop
            let _ = tx.send(result);
        });
        rx.await
            .unwrap_or_else(|_| Err(GetError::Aborted("the request was dropped".into())))
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    /// Restart an application. Rolling restarts swap in a fresh group while
    /// the old one drains; blocking restarts detach every process of the
    /// current group and respawn in place.
    pub fn restart_group_by_name(&self, name: &str, method: RestartMethod) -> bool {
        let _span = span_operation("restart", name).entered();
        self.shared.with_state(|state, actions| match method {
            RestartMethod::Rolling => state.restart_super_group(name),
            RestartMethod::Blocking => {
                let group = state
                    .super_groups
                    .get(name)
                    .filter(|sg| sg.state == SuperGroupState::Ready)
                    .and_then(|sg| sg.default_group);
                match group {
                    Some(group) => state.restart_group_in_place(group, actions),
                    None => false,
                }
            }
        })
    }

    pub fn detach_process(&self, process: ProcessId) -> bool {
        self.shared
            .with_state(|state, actions| state.detach_process(process, actions))
    }

    pub fn detach_process_by_pid(&self, pid: Pid) -> bool {
        self.shared.with_state(|state, actions| {
            match state.table.find_process_by_pid(pid) {
                Some((group, process)) => state.detach_process_in(group, process, actions),
                None => false,
            }
        })
    }

    /// Take a process out of rotation. `callback` only fires when the
    /// result is `Deferred`.
    pub fn disable_process<F>(&self, process: ProcessId, callback: F) -> DisableResult
    where
        F: FnOnce(ProcessId, DisableResult) + Send + 'static,
    {
        let callback: DisableCallback = Box::new(callback);
        self.shared.with_state(|state, actions| {
            let Some(group) = state.table.find_process(process) else {
                actions.release(callback);
                return DisableResult::Noop;
            };
            let view = state.table.view_for(group);
            match state.table.groups.get_mut(&group) {
                Some(target) => target.disable(process, callback, &view, actions),
                None => {
                    actions.release(callback);
                    DisableResult::Noop
                }
            }
        })
    }

    /// Disable and wait for deferred completion; `Deferred` on timeout
    pub fn disable_process_blocking(&self, process: ProcessId, timeout: Duration) -> DisableResult {
        let ticket = Ticket::new();
        let slot = ticket.clone();
        match self.disable_process(process, move |_, result| slot.complete(result)) {
            DisableResult::Deferred => ticket.wait(timeout).unwrap_or(DisableResult::Deferred),
            other => other,
        }
    }

    pub fn enable_process(&self, process: ProcessId) -> bool {
        self.shared.with_state(|state, actions| {
            match state.table.find_process(process) {
                Some(group) => state
                    .table
                    .groups
                    .get_mut(&group)
                    .map(|target| target.enable(process, actions))
                    .unwrap_or(false),
                None => false,
            }
        })
    }

    /// Destroy an application. Returns false when it is unknown.
    pub fn destroy_super_group(
        &self,
        name: &str,
        allow_reinit: bool,
        callback: Option<ShutdownCallback>,
    ) -> bool {
        let _span = span_operation("destroy", name).entered();
        self.shared.with_state(|state, actions| {
            state.destroy_super_group(name, allow_reinit, callback, actions)
        })
    }

    /// Destroy an application, wait for its processes to exit and forget it
    pub fn detach_super_group_by_name(&self, name: &str) -> bool {
        let ticket = Ticket::new();
        let slot = ticket.clone();
        let existed = self.destroy_super_group(
            name,
            false,
            Some(Box::new(move |result| slot.complete(result))),
        );
        if !existed {
            return false;
        }

        match ticket.wait(self.shared.config.process_shutdown_timeout) {
            Some(ShutdownResult::Success) => {
                self.shared.with_state(|state, _| {
                    let forget = state
                        .super_groups
                        .get(name)
                        .map(|sg| {
                            sg.state == SuperGroupState::Destroyed && sg.get_waitlist.is_empty()
                        })
                        .unwrap_or(false);
                    if forget {
                        state.super_groups.remove(name);
                    }
                });
                info!(app = name, "SuperGroup detached");
            }
            other => {
                warn!(app = name, result = ?other, "SuperGroup detach did not complete");
            }
        }
        true
    }

    /// Change the capacity; growing it serves waiting requests
    pub fn set_max(&self, max: usize) {
        self.shared
            .with_state(|state, actions| state.set_max(max, actions));
    }

    /// Run one garbage collection sweep now
    pub fn garbage_collect(&self) -> GcReport {
        self.shared
            .with_state(|state, actions| state.garbage_collect(Instant::now(), actions))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn find_process_by_pid(&self, pid: Pid) -> Option<ProcessSnapshot> {
        let state = self.shared.state.lock();
        let (group, process) = state.table.find_process_by_pid(pid)?;
        let group = state.table.groups.get(&group)?;
        let location = group.locate(process)?;
        Some(ProcessSnapshot::from(group.process_at(location)))
    }

    pub fn max(&self) -> usize {
        self.shared.state.lock().table.max
    }

    pub fn capacity_used(&self) -> usize {
        self.shared.state.lock().table.capacity_used()
    }

    pub fn at_full_capacity(&self) -> bool {
        self.shared.state.lock().table.at_full_capacity()
    }

    /// Processes counting against capacity
    pub fn process_count(&self) -> usize {
        self.shared.state.lock().table.process_count()
    }

    pub fn super_group_count(&self) -> usize {
        self.shared.state.lock().super_groups.len()
    }

    pub fn life_status(&self) -> PoolLifeStatus {
        self.shared.state.lock().life_status
    }

    /// Background threads that have not finished yet
    pub fn active_background_threads(&self) -> usize {
        self.shared.threads.active()
    }

    pub fn inspect(&self) -> PoolSnapshot {
        PoolSnapshot::capture(&self.shared.state.lock())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        self.inspect().to_json()
    }

    /// Check the internal bookkeeping; panics on inconsistency
    pub fn verify_invariants(&self) {
        self.shared.state.lock().verify_invariants();
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Reject new requests, destroy every application and wait for their
    /// processes and the background threads to finish
    pub fn shutdown(&self, timeout: Duration) -> ShutdownResult {
        let _span = span_operation("shutdown", "*").entered();
        let started = self.shared.with_state(|state, actions| {
            if !state.is_alive() {
                return false;
            }
            info!(super_groups = state.super_groups.len(), "Shutting down pool");
            state.life_status = PoolLifeStatus::ShuttingDown;
            state.gc_running = false;
            for waiter in state.get_waitlist.drain(..) {
                waiter.fail(GetError::PoolShuttingDown, actions);
            }
            let names: Vec<String> = state.super_groups.keys().cloned().collect();
            for name in names {
                state.destroy_super_group(&name, false, None, actions);
            }
            true
        });
        self.shared.gc_wakeup.notify_all();
        if !started {
            return match self.life_status() {
                PoolLifeStatus::ShutDown => ShutdownResult::Success,
                _ => ShutdownResult::Canceled,
            };
        }

        let deadline = Instant::now() + timeout;
        loop {
            let drained = {
                let state = self.shared.state.lock();
                state.table.groups.is_empty()
                    && state
                        .super_groups
                        .values()
                        .all(|sg| sg.state == SuperGroupState::Destroyed)
            };
            if drained && self.shared.threads.active() == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    threads = self.shared.threads.active(),
                    "Pool shutdown timed out"
                );
                return ShutdownResult::Canceled;
            }
            thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }

        self.shared.with_state(|state, _| {
            state.super_groups.clear();
            state.life_status = PoolLifeStatus::ShutDown;
        });
        info!("Pool shut down");
        ShutdownResult::Success
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shared.with_state(|state, actions| state.abort(actions));
        self.shared.gc_wakeup.notify_all();
        self.shared.detached_wakeup.notify_all();
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Pool")
            .field("life_status", &state.life_status)
            .field("max", &state.table.max)
            .field("capacity_used", &state.table.capacity_used())
            .field("super_groups", &state.super_groups.len())
            .finish()
    }
}
