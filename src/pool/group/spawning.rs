/*!
 * Spawning
 *
 * One spawn loop thread per group. The loop calls the spawner without the
 * lock and commits each result under it; a commit is discarded when the
 * group was restarted or shut down in the meantime.
 */

use super::Group;
use super::PoolView;
use crate::core::actions::PostLockActions;
use crate::core::errors::{GetError, SpawnError, SpawnOutcome};
use crate::core::types::{AttachResult, GroupId, SpawnResult};
use crate::pool::options::Options;
use crate::pool::process::Process;
use crate::pool::state::{PoolState, Shared};
use crate::spawner::{SpawnedProcess, Spawner};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

impl Group {
    /// Start the spawn loop unless something prevents it
    pub(crate) fn spawn(&mut self, view: &PoolView) -> SpawnResult {
        if self.spawning {
            return SpawnResult::InProgress;
        }
        // a group that is shutting down never spawns again
        if self.restarting || !self.is_alive() {
            return SpawnResult::ErrRestarting;
        }
        if self.process_upper_limits_reached() {
            return SpawnResult::ErrGroupUpperLimitsReached;
        }
        if self.pool_at_full_capacity(view) {
            return SpawnResult::ErrPoolAtFullCapacity;
        }
        let Some(shared) = self.pool.upgrade() else {
            return SpawnResult::ErrThreadCreation;
        };

        let pool = self.pool.clone();
        let group = self.id;
        let spawner = self.spawner.clone();
        let options = self.options.clone();
        let restarts = self.restarts_initiated;
        let started = shared.threads.spawn("Group process spawner", move || {
            spawn_loop(pool, group, spawner, options, restarts)
        });
        if started.is_err() {
            return SpawnResult::ErrThreadCreation;
        }

        debug!(group = %self.name, restarts, "Spawn loop started");
        self.spawning = true;
        self.processes_being_spawned += 1;
        SpawnResult::Ok
    }

    /// No replacement is coming for the last enabled process: put the
    /// disabling ones back into rotation and fail their disable waiters
    fn restore_disabling_processes(&mut self, actions: &mut PostLockActions) -> bool {
        if !self.enabled.is_empty() || self.disabling.is_empty() {
            return false;
        }
        warn!(
            group = %self.name,
            disabling = self.disabling.len(),
            "No replacement process, putting disabling processes back into rotation"
        );
        self.enable_all_disabling_processes(actions);
        true
    }

    /// The spawner gave up: requests queued now cannot be served
    fn handle_spawn_failure(&mut self, err: SpawnError, actions: &mut PostLockActions) {
        self.restore_disabling_processes(actions);
        for waiter in self.get_waitlist.drain(..) {
            waiter.fail(GetError::SpawnFailed(err.clone()), actions);
        }
    }

    /// Restart in place: new spawner, new generation, old processes drained
    pub(crate) fn restart(&mut self, options: &Options, actions: &mut PostLockActions) -> bool {
        if self.restarting || !self.is_alive() {
            return false;
        }
        let Some(shared) = self.pool.upgrade() else {
            return false;
        };

        // the restarter commits under the pool lock, held by the caller
        // until the state below is in place
        let pool = self.pool.clone();
        let group = self.id;
        let restarts = self.restarts_initiated + 1;
        let factory = shared.factory.clone();
        let persistent = options.persistent();
        let for_factory = persistent.clone();
        let started = shared.threads.spawn("Group restarter", move || {
            let result = factory.create(&for_factory);
            match pool.upgrade() {
                Some(shared) => shared.with_state(|state, actions| {
                    state.commit_group_restart(group, restarts, result, actions)
                }),
                None => {
                    if let Ok(spawner) = result {
                        spawner.cleanup();
                    }
                }
            }
        });
        if let Err(err) = started {
            warn!(
                group = %self.name,
                error = %err,
                "Restarter thread not started, keeping the current processes"
            );
            return false;
        }

        self.restarts_initiated = restarts;
        self.uuid = Uuid::new_v4();
        self.options = persistent;
        self.spawning = false;
        self.processes_being_spawned = 0;
        self.restarting = true;
        self.detach_all(actions);
        info!(
            group = %self.name,
            uuid = %self.uuid,
            restarts = self.restarts_initiated,
            "Restarting group"
        );
        true
    }
}

fn spawn_loop(
    pool: Weak<Shared>,
    group: GroupId,
    spawner: Arc<dyn Spawner>,
    mut options: Options,
    restarts: u32,
) {
    loop {
        let result = spawner.spawn(&options);
        let Some(shared) = pool.upgrade() else {
            if let Ok(spawned) = result {
                spawned.handle.trigger_shutdown();
            }
            return;
        };
        let next = shared.with_state(|state, actions| {
            state.commit_spawn(group, restarts, result, actions)
        });
        match next {
            Some(latest) => options = latest,
            None => break,
        }
    }
    debug!(group = %group, "Spawn loop finished");
}

/// Capacity handed back by a commit that did not attach
enum Freed {
    Nothing,
    Failed,
    Rejected,
}

fn discard(result: SpawnOutcome<SpawnedProcess>, actions: &mut PostLockActions) {
    if let Ok(spawned) = result {
        debug!(pid = spawned.pid, "Discarding process spawned for a previous generation");
        let handle = spawned.handle;
        actions.push(move || handle.trigger_shutdown());
    }
}

impl PoolState {
    /// Apply one spawn result. Returns the options for the next spawn, or
    /// `None` when the loop should stop.
    pub(crate) fn commit_spawn(
        &mut self,
        group: GroupId,
        restarts: u32,
        result: SpawnOutcome<SpawnedProcess>,
        actions: &mut PostLockActions,
    ) -> Option<Options> {
        let view = self.table.view_for(group);
        let process_id = self.table.allocate_process_id();
        let Some(target) = self.table.groups.get_mut(&group) else {
            discard(result, actions);
            return None;
        };
        if !target.is_alive() || target.restarts_initiated != restarts {
            discard(result, actions);
            return None;
        }

        target.processes_being_spawned = target.processes_being_spawned.saturating_sub(1);
        let mut freed = Freed::Nothing;
        let mut done = match result {
            Ok(spawned) => {
                let process = Process::new(
                    process_id,
                    group,
                    restarts,
                    spawned,
                    target.options.force_max_concurrent_requests_per_process,
                );
                match target.attach(process, &view, actions) {
                    AttachResult::Ok => {
                        target.assign_sessions_to_get_waiters(actions);
                        if let Some(shared) = self.shared.upgrade() {
                            shared.gc_wakeup.notify_all();
                        }
                        false
                    }
                    rejected => {
                        debug!(group = %target.name, reason = ?rejected, "Stopping spawn loop");
                        if target.restore_disabling_processes(actions) {
                            target.assign_sessions_to_get_waiters(actions);
                        }
                        freed = Freed::Rejected;
                        true
                    }
                }
            }
            Err(err) => {
                error!(group = %target.name, error = %err, "Could not spawn process");
                target.handle_spawn_failure(err, actions);
                freed = Freed::Failed;
                true
            }
        };

        done = done
            || (target.process_lower_limits_satisfied() && target.get_waitlist.is_empty())
            || !target.allow_spawn(&view);
        let next = if done {
            target.spawning = false;
            None
        } else {
            target.processes_being_spawned += 1;
            Some(target.options.clone())
        };

        match freed {
            // the failed group is not retried; only pool waiters move on
            Freed::Failed => self.assign_pool_get_waiters(actions),
            Freed::Rejected => self.on_capacity_freed(actions),
            Freed::Nothing => {}
        }
        next
    }

    /// Commit the spawner built by an in-place restart
    pub(crate) fn commit_group_restart(
        &mut self,
        group: GroupId,
        restarts: u32,
        result: SpawnOutcome<Arc<dyn Spawner>>,
        actions: &mut PostLockActions,
    ) {
        let current = self
            .table
            .groups
            .get(&group)
            .map(|g| g.is_alive() && g.restarts_initiated == restarts)
            .unwrap_or(false);
        if !current {
            if let Ok(spawner) = result {
                actions.push(move || spawner.cleanup());
            }
            return;
        }

        if let Some(target) = self.table.groups.get_mut(&group) {
            target.restarting = false;
            match result {
                Ok(spawner) => {
                    let old = std::mem::replace(&mut target.spawner, spawner);
                    actions.push(move || old.cleanup());
                    info!(group = %target.name, uuid = %target.uuid, "Group restarted");
                }
                Err(err) => {
                    warn!(
                        group = %target.name,
                        error = %err,
                        "Restart could not build a new spawner, keeping the old one"
                    );
                }
            }
        }
        self.table.spawn_if_needed(group);
        self.on_capacity_freed(actions);
    }

    /// In-place restart of one group
    pub(crate) fn restart_group_in_place(
        &mut self,
        group: GroupId,
        actions: &mut PostLockActions,
    ) -> bool {
        let restarted = match self.table.groups.get_mut(&group) {
            Some(target) => {
                let options = target.options.clone();
                target.restart(&options, actions)
            }
            None => false,
        };
        if restarted {
            self.on_capacity_freed(actions);
        }
        restarted
    }
}
