/*!
 * Process List Management
 *
 * The only code that moves processes between lists, and therefore the only
 * writer of `Process::enabled`.
 */

use super::{Group, GroupLifeStatus, PoolView};
use crate::core::actions::PostLockActions;
use crate::core::errors::GetError;
use crate::core::types::{AttachResult, DisableResult, ProcessId, ShutdownResult};
use crate::pool::process::{EnabledStatus, Process, ProcessLifeStatus};
use crate::pool::waiter::{DisableCallback, DisableWaiter, ShutdownCallback};
use rand::Rng;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Where a process currently lives inside its group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProcessLocation {
    pub(crate) list: EnabledStatus,
    pub(crate) index: usize,
}

impl Group {
    pub(crate) fn list(&self, status: EnabledStatus) -> &Vec<Process> {
        match status {
            EnabledStatus::Enabled => &self.enabled,
            EnabledStatus::Disabling => &self.disabling,
            EnabledStatus::Disabled => &self.disabled,
            EnabledStatus::Detached => &self.detached,
        }
    }

    fn list_mut(&mut self, status: EnabledStatus) -> &mut Vec<Process> {
        match status {
            EnabledStatus::Enabled => &mut self.enabled,
            EnabledStatus::Disabling => &mut self.disabling,
            EnabledStatus::Disabled => &mut self.disabled,
            EnabledStatus::Detached => &mut self.detached,
        }
    }

    pub(crate) fn locate(&self, process: ProcessId) -> Option<ProcessLocation> {
        [
            EnabledStatus::Enabled,
            EnabledStatus::Disabling,
            EnabledStatus::Disabled,
            EnabledStatus::Detached,
        ]
        .into_iter()
        .find_map(|list| {
            self.list(list)
                .iter()
                .position(|p| p.id == process)
                .map(|index| ProcessLocation { list, index })
        })
    }

    pub(crate) fn process_at(&self, location: ProcessLocation) -> &Process {
        &self.list(location.list)[location.index]
    }

    pub(crate) fn process_at_mut(&mut self, location: ProcessLocation) -> &mut Process {
        &mut self.list_mut(location.list)[location.index]
    }

    /// Refresh the cached busyness after a session count change
    pub(crate) fn update_busyness(&mut self, location: ProcessLocation) {
        if location.list == EnabledStatus::Enabled {
            self.enabled_busyness[location.index] = self.enabled[location.index].busyness();
        }
    }

    pub(crate) fn add_process_to_list(&mut self, mut process: Process, list: EnabledStatus) {
        process.enabled = list;
        if list == EnabledStatus::Enabled {
            self.enabled_busyness.push(process.busyness());
        }
        self.list_mut(list).push(process);
    }

    pub(crate) fn remove_process_from_list(&mut self, location: ProcessLocation) -> Process {
        if location.list == EnabledStatus::Enabled {
            self.enabled_busyness.remove(location.index);
        }
        self.list_mut(location.list).remove(location.index)
    }

    fn move_process(&mut self, location: ProcessLocation, to: EnabledStatus) -> ProcessLocation {
        let process = self.remove_process_from_list(location);
        self.add_process_to_list(process, to);
        ProcessLocation {
            list: to,
            index: self.list(to).len() - 1,
        }
    }

    // ------------------------------------------------------------------
    // Disable wait list
    // ------------------------------------------------------------------

    /// Resolve every disable waiter of `process` with `result`
    pub(crate) fn resolve_disable_waiters(
        &mut self,
        process: ProcessId,
        result: DisableResult,
        actions: &mut PostLockActions,
    ) {
        let (matching, rest): (Vec<_>, Vec<_>) = self
            .disable_waitlist
            .drain(..)
            .partition(|waiter| waiter.process == process);
        self.disable_waitlist = rest.into();
        for waiter in matching {
            waiter.resolve(result, actions);
        }
    }

    fn clear_disable_waitlist(&mut self, result: DisableResult, actions: &mut PostLockActions) {
        for waiter in self.disable_waitlist.drain(..) {
            waiter.resolve(result, actions);
        }
    }

    /// Disabling processes that no longer serve anyone become disabled
    fn finish_idle_disables(&mut self, actions: &mut PostLockActions) {
        let idle: Vec<ProcessId> = self
            .disabling
            .iter()
            .filter(|p| p.sessions == 0)
            .map(|p| p.id)
            .collect();
        for process in idle {
            if let Some(location) = self.locate(process) {
                self.finish_disable(location, actions);
            }
        }
    }

    /// A drained disabling process becomes disabled
    pub(crate) fn finish_disable(
        &mut self,
        location: ProcessLocation,
        actions: &mut PostLockActions,
    ) {
        debug_assert_eq!(location.list, EnabledStatus::Disabling);
        let process = self.process_at(location).id;
        self.move_process(location, EnabledStatus::Disabled);
        self.resolve_disable_waiters(process, DisableResult::Success, actions);
        debug!(group = %self.name, process = %process, "Process disabled");
    }

    /// Last resort after a failed replacement spawn: put draining processes
    /// back into rotation so the group keeps serving
    pub(crate) fn enable_all_disabling_processes(&mut self, actions: &mut PostLockActions) {
        while !self.disabling.is_empty() {
            let location = ProcessLocation {
                list: EnabledStatus::Disabling,
                index: 0,
            };
            let process = self.process_at(location).id;
            self.move_process(location, EnabledStatus::Enabled);
            self.resolve_disable_waiters(process, DisableResult::Error, actions);
        }
    }

    // ------------------------------------------------------------------
    // Attach / detach
    // ------------------------------------------------------------------

    fn generate_sticky_session_id(&self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let id: u32 = rng.gen_range(1..=i32::MAX as u32);
            if !self.all_processes().any(|p| p.sticky_session_id == id) {
                return id;
            }
        }
    }

    /// Take ownership of a freshly spawned process. A rejected process is
    /// shut down after the lock is released.
    pub(crate) fn attach(
        &mut self,
        mut process: Process,
        view: &PoolView,
        actions: &mut PostLockActions,
    ) -> AttachResult {
        debug_assert!(self.is_alive(), "attach to a group that is not alive");

        let result = if self.process_upper_limits_reached() {
            AttachResult::GroupUpperLimitsReached
        } else if self.pool_at_full_capacity(view) {
            AttachResult::PoolAtFullCapacity
        } else if !self.is_waiting_for_capacity() && view.another_group_waiting_for_capacity {
            AttachResult::AnotherGroupIsWaitingForCapacity
        } else {
            AttachResult::Ok
        };

        if result != AttachResult::Ok {
            debug!(group = %self.name, pid = process.pid, reason = ?result, "Attach rejected");
            let handle = process.handle.clone();
            actions.push(move || handle.trigger_shutdown());
            return result;
        }

        let now = Instant::now();
        process.sticky_session_id = self.generate_sticky_session_id();
        process.last_used = now;
        self.last_activity = now;
        debug!(
            group = %self.name,
            process = %process.id,
            pid = process.pid,
            sticky_session_id = process.sticky_session_id,
            "Process attached"
        );
        self.add_process_to_list(process, EnabledStatus::Enabled);

        // a new enabled process lets idle disabling processes finish
        self.finish_idle_disables(actions);
        AttachResult::Ok
    }

    /// Move a process to the detached list. Detached processes stay
    /// reachable for their sessions until they exit.
    pub(crate) fn detach(&mut self, process: ProcessId, actions: &mut PostLockActions) -> bool {
        let Some(location) = self.locate(process) else {
            return false;
        };
        if location.list == EnabledStatus::Detached {
            return false;
        }

        self.move_process(location, EnabledStatus::Detached);
        if location.list == EnabledStatus::Disabling {
            self.resolve_disable_waiters(process, DisableResult::Noop, actions);
        }
        debug!(group = %self.name, process = %process, "Process detached");
        self.start_checking_detached_processes(true);
        true
    }

    pub(crate) fn detach_all(&mut self, actions: &mut PostLockActions) {
        for list in [
            EnabledStatus::Enabled,
            EnabledStatus::Disabling,
            EnabledStatus::Disabled,
        ] {
            while !self.list(list).is_empty() {
                self.move_process(ProcessLocation { list, index: 0 }, EnabledStatus::Detached);
            }
        }
        self.clear_disable_waitlist(DisableResult::Noop, actions);
        if !self.detached.is_empty() {
            self.start_checking_detached_processes(true);
        }
    }

    // ------------------------------------------------------------------
    // Enable / disable
    // ------------------------------------------------------------------

    /// Put a disabling or disabled process back into rotation. Returns false
    /// when the process is unknown or detached.
    pub(crate) fn enable(&mut self, process: ProcessId, actions: &mut PostLockActions) -> bool {
        let Some(location) = self.locate(process) else {
            return false;
        };

        match location.list {
            EnabledStatus::Enabled => true,
            EnabledStatus::Disabling | EnabledStatus::Disabled => {
                self.move_process(location, EnabledStatus::Enabled);
                if location.list == EnabledStatus::Disabling {
                    self.resolve_disable_waiters(process, DisableResult::Canceled, actions);
                }
                debug!(group = %self.name, process = %process, "Process enabled");
                self.assign_sessions_to_get_waiters(actions);
                true
            }
            EnabledStatus::Detached => false,
        }
    }

    /// Take a process out of rotation, draining its sessions first.
    /// `callback` only fires when the result is `Deferred`.
    pub(crate) fn disable(
        &mut self,
        process: ProcessId,
        callback: DisableCallback,
        view: &PoolView,
        actions: &mut PostLockActions,
    ) -> DisableResult {
        let Some(location) = self.locate(process) else {
            actions.release(callback);
            return DisableResult::Noop;
        };

        let result = match location.list {
            EnabledStatus::Enabled => {
                let sessions = self.process_at(location).sessions;
                if self.enabled.len() == 1 && !self.allow_spawn(view) {
                    warn!(
                        group = %self.name,
                        process = %process,
                        "Refusing to disable the last enabled process: no replacement can be spawned"
                    );
                    DisableResult::Error
                } else if self.enabled.len() == 1 || sessions > 0 {
                    let was_last = self.enabled.len() == 1;
                    self.move_process(location, EnabledStatus::Disabling);
                    self.disable_waitlist
                        .push_back(DisableWaiter::new(process, callback));
                    if was_last {
                        debug!(
                            group = %self.name,
                            "Spawning a replacement for the last enabled process"
                        );
                        self.spawn(view);
                    }
                    return DisableResult::Deferred;
                } else {
                    self.move_process(location, EnabledStatus::Disabled);
                    DisableResult::Success
                }
            }
            EnabledStatus::Disabling => {
                self.disable_waitlist
                    .push_back(DisableWaiter::new(process, callback));
                return DisableResult::Deferred;
            }
            EnabledStatus::Disabled | EnabledStatus::Detached => DisableResult::Noop,
        };

        actions.release(callback);
        result
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Detach everything and finish once the detached processes are gone
    pub(crate) fn shutdown(
        &mut self,
        callback: Option<ShutdownCallback>,
        actions: &mut PostLockActions,
    ) {
        debug_assert!(self.is_alive());
        info!(group = %self.name, uuid = %self.uuid, "Shutting down group");

        self.life_status = GroupLifeStatus::ShuttingDown;
        self.spawning = false;
        self.restarting = false;
        self.processes_being_spawned = 0;
        self.detach_all(actions);
        for waiter in self.get_waitlist.drain(..) {
            waiter.fail(
                GetError::Aborted("the application group was shut down".into()),
                actions,
            );
        }
        self.shutdown_callback = callback;

        if self.detached.is_empty() {
            self.finish_shutdown(actions);
        }
    }

    pub(crate) fn finish_shutdown(&mut self, actions: &mut PostLockActions) {
        debug_assert_eq!(self.life_status, GroupLifeStatus::ShuttingDown);
        self.life_status = GroupLifeStatus::ShutDown;
        self.detached_checker_active = false;

        let spawner = self.spawner.clone();
        actions.push(move || spawner.cleanup());
        if let Some(callback) = self.shutdown_callback.take() {
            actions.push(move || callback(ShutdownResult::Success));
        }
        info!(group = %self.name, "Group shut down");
    }

    /// The pool went away without shutting down: answer everything queued
    /// and tell every live worker to exit
    pub(crate) fn abort(&mut self, actions: &mut PostLockActions) {
        self.life_status = GroupLifeStatus::ShutDown;
        self.spawning = false;
        self.restarting = false;
        self.processes_being_spawned = 0;
        self.detached_checker_active = false;
        for waiter in self.get_waitlist.drain(..) {
            waiter.fail(GetError::PoolShuttingDown, actions);
        }
        self.clear_disable_waitlist(DisableResult::Noop, actions);
        for process in self.all_processes() {
            if process.life_status == ProcessLifeStatus::Alive {
                let handle = process.handle.clone();
                actions.push(move || handle.trigger_shutdown());
            }
        }
        let spawner = self.spawner.clone();
        actions.push(move || spawner.cleanup());
        if let Some(callback) = self.shutdown_callback.take() {
            actions.push(move || callback(ShutdownResult::Canceled));
        }
    }

    /// Remove detached processes that have exited. Returns how many were removed.
    pub(crate) fn remove_exited_processes(&mut self, exited: &[ProcessId]) -> usize {
        let mut removed = 0;
        for process in exited {
            let index = self.detached.iter().position(|p| p.id == *process);
            if let Some(index) = index {
                let mut dead = self.remove_process_from_list(ProcessLocation {
                    list: EnabledStatus::Detached,
                    index,
                });
                dead.life_status = ProcessLifeStatus::Dead;
                debug!(
                    group = %self.name,
                    process = %dead.id,
                    pid = dead.pid,
                    "Detached process exited"
                );
                removed += 1;
            }
        }
        removed
    }
}
