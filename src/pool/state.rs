/*!
 * Pool State
 *
 * Everything behind the single pool mutex: the SuperGroup registry, the
 * group table with its capacity accounting and the pool-level wait list.
 * Cross-group operations (capacity views, forced freeing, spawning for
 * starving groups) live on `GroupTable` so SuperGroup code can use them
 * while the registry itself is borrowed.
 */

use super::group::{Group, GroupLifeStatus, PoolView};
use super::options::Options;
use super::super_group::{SuperGroup, SuperGroupState};
use super::waiter::{self, GetCallback, GetWaiter};
use crate::core::actions::PostLockActions;
use crate::core::config::PoolConfig;
use crate::core::errors::GetError;
use crate::core::limits::INITIALIZING_SUPER_GROUP_RESERVATION;
use crate::core::threads::BackgroundThreads;
use crate::core::types::{GroupId, Pid, ProcessId, SpawnResult};
use crate::spawner::SpawnerFactory;
use ahash::AHashMap;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolLifeStatus {
    Alive,
    ShuttingDown,
    ShutDown,
}

/// State shared by the pool handle, sessions and background threads
pub(crate) struct Shared {
    pub(crate) config: PoolConfig,
    pub(crate) state: Mutex<PoolState>,
    pub(crate) factory: Arc<dyn SpawnerFactory>,
    pub(crate) threads: Arc<BackgroundThreads>,
    /// Wakes detached process checkers early
    pub(crate) detached_wakeup: Condvar,
    /// Wakes the garbage collector early
    pub(crate) gc_wakeup: Condvar,
}

impl Shared {
    pub(crate) fn new(config: PoolConfig, factory: Arc<dyn SpawnerFactory>) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Shared>| Shared {
            state: Mutex::new(PoolState::new(&config, me.clone())),
            config,
            factory,
            threads: BackgroundThreads::new(),
            detached_wakeup: Condvar::new(),
            gc_wakeup: Condvar::new(),
        })
    }

    /// Lock, mutate, unlock, then run whatever the mutation queued
    pub(crate) fn with_state<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&mut PoolState, &mut PostLockActions) -> R,
    {
        let mut actions = PostLockActions::new();
        let result = {
            let mut state = self.state.lock();
            let result = f(&mut state, &mut actions);
            if state.self_checking {
                state.verify_invariants();
            }
            result
        };
        actions.run();
        result
    }
}

/// Groups plus the counters needed to account for pool capacity
pub(crate) struct GroupTable {
    pub(crate) groups: AHashMap<GroupId, Group>,
    pub(crate) max: usize,
    /// SuperGroups in the Initializing state, each holding a reservation
    pub(crate) initializing_super_groups: usize,
    next_group_id: u64,
    next_process_id: u64,
}

impl GroupTable {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            groups: AHashMap::new(),
            max,
            initializing_super_groups: 0,
            next_group_id: 1,
            next_process_id: 1,
        }
    }

    pub(crate) fn allocate_group_id(&mut self) -> GroupId {
        let id = GroupId(self.next_group_id);
        self.next_group_id += 1;
        id
    }

    pub(crate) fn allocate_process_id(&mut self) -> ProcessId {
        let id = ProcessId(self.next_process_id);
        self.next_process_id += 1;
        id
    }

    pub(crate) fn insert(&mut self, group: Group) {
        self.groups.insert(group.id, group);
    }

    pub(crate) fn contains(&self, id: GroupId) -> bool {
        self.groups.contains_key(&id)
    }

    pub(crate) fn capacity_used(&self) -> usize {
        self.groups.values().map(Group::capacity_used).sum::<usize>()
            + self.initializing_super_groups * INITIALIZING_SUPER_GROUP_RESERVATION
    }

    pub(crate) fn at_full_capacity(&self) -> bool {
        self.capacity_used() >= self.max
    }

    pub(crate) fn process_count(&self) -> usize {
        self.groups.values().map(Group::process_count).sum()
    }

    /// What `group` needs to know about the rest of the pool
    pub(crate) fn view_for(&self, group: GroupId) -> PoolView {
        let mut used_elsewhere =
            self.initializing_super_groups * INITIALIZING_SUPER_GROUP_RESERVATION;
        let mut another_group_waiting = false;
        for (id, other) in &self.groups {
            if *id == group {
                continue;
            }
            used_elsewhere += other.capacity_used();
            another_group_waiting |= other.is_waiting_for_capacity();
        }
        PoolView {
            max: self.max,
            used_elsewhere,
            another_group_waiting_for_capacity: another_group_waiting,
        }
    }

    fn sorted_ids(&self) -> Vec<GroupId> {
        let mut ids: Vec<GroupId> = self.groups.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Route a request into `group`, spawning and freeing capacity as needed
    pub(crate) fn get_from_group(
        &mut self,
        group: GroupId,
        options: &Options,
        callback: GetCallback,
        actions: &mut PostLockActions,
    ) {
        let view = self.view_for(group);
        let Some(target) = self.groups.get_mut(&group) else {
            waiter::fail(
                callback,
                GetError::Aborted("the application group no longer exists".into()),
                actions,
            );
            return;
        };
        if !target.is_alive() {
            waiter::fail(
                callback,
                GetError::Aborted("the application group is shutting down".into()),
                actions,
            );
            return;
        }

        let outcome = target.get(options, callback, &view, actions);
        if outcome.needs_capacity {
            self.spawn_after_freeing_capacity(group, actions);
        }
    }

    /// Spawn `group`'s first process by evicting an idle process elsewhere
    pub(crate) fn spawn_after_freeing_capacity(
        &mut self,
        group: GroupId,
        actions: &mut PostLockActions,
    ) -> bool {
        if self.force_free_capacity(Some(group), actions).is_none() {
            return false;
        }
        let view = self.view_for(group);
        match self.groups.get_mut(&group) {
            Some(target) => target.spawn(&view) == SpawnResult::Ok,
            None => false,
        }
    }

    /// Spawn `group`'s missing processes if nothing prevents it
    pub(crate) fn spawn_if_needed(&mut self, group: GroupId) {
        let view = self.view_for(group);
        if let Some(target) = self.groups.get_mut(&group) {
            if target.should_spawn(&view) {
                target.spawn(&view);
            }
        }
    }

    /// Detach the longest idle process outside `exclude` whose group has no
    /// waiters. Returns the detached process.
    pub(crate) fn force_free_capacity(
        &mut self,
        exclude: Option<GroupId>,
        actions: &mut PostLockActions,
    ) -> Option<ProcessId> {
        let (group, process) = self
            .groups
            .values()
            .filter(|g| Some(g.id) != exclude && g.is_alive() && g.get_waitlist.is_empty())
            .flat_map(|g| {
                g.enabled
                    .iter()
                    .filter(|p| p.sessions == 0)
                    .map(move |p| (g.id, p.id, p.last_used))
            })
            .min_by_key(|(_, _, last_used)| *last_used)
            .map(|(g, p, _)| (g, p))?;

        let target = self.groups.get_mut(&group)?;
        if target.detach(process, actions) {
            info!(
                group = %target.name,
                process = %process,
                "Detached idle process to free capacity"
            );
            Some(process)
        } else {
            None
        }
    }

    /// Let groups that lost out on capacity catch up
    pub(crate) fn possibly_spawn_more_processes(&mut self) {
        let ids = self.sorted_ids();

        for id in &ids {
            let view = self.view_for(*id);
            if let Some(group) = self.groups.get_mut(id) {
                if group.is_alive() && group.is_waiting_for_capacity() {
                    debug!(group = %group.name, "Spawning for group waiting for capacity");
                    group.spawn(&view);
                }
            }
        }

        for id in &ids {
            let view = self.view_for(*id);
            if let Some(group) = self.groups.get_mut(id) {
                if group.should_spawn(&view) {
                    group.spawn(&view);
                }
            }
        }
    }

    /// Shut `group` down and forget it once nothing is left to drain
    pub(crate) fn shutdown_group(
        &mut self,
        group: GroupId,
        callback: Option<super::waiter::ShutdownCallback>,
        actions: &mut PostLockActions,
    ) {
        if let Some(target) = self.groups.get_mut(&group) {
            if target.is_alive() {
                target.shutdown(callback, actions);
            } else if let Some(callback) = callback {
                actions.release(callback);
            }
        }
        self.reap(group);
    }

    /// Drop a group whose shutdown has finished
    pub(crate) fn reap(&mut self, group: GroupId) -> bool {
        let finished = self
            .groups
            .get(&group)
            .map(|g| g.life_status == GroupLifeStatus::ShutDown)
            .unwrap_or(false);
        if finished {
            self.groups.remove(&group);
            debug!(group = %group, "Group removed");
        }
        finished
    }

    pub(crate) fn find_process(&self, process: ProcessId) -> Option<GroupId> {
        self.groups
            .values()
            .find(|g| g.locate(process).is_some())
            .map(|g| g.id)
    }

    pub(crate) fn find_process_by_pid(&self, pid: Pid) -> Option<(GroupId, ProcessId)> {
        self.groups.values().find_map(|g| {
            g.all_processes()
                .find(|p| p.pid == pid)
                .map(|p| (g.id, p.id))
        })
    }
}

/// Data protected by the pool lock
pub(crate) struct PoolState {
    pub(crate) shared: Weak<Shared>,
    pub(crate) life_status: PoolLifeStatus,
    pub(crate) super_groups: AHashMap<String, SuperGroup>,
    pub(crate) table: GroupTable,
    /// Requests for unknown applications while the pool is at full capacity
    pub(crate) get_waitlist: VecDeque<GetWaiter>,
    pub(crate) max_idle_time: Duration,
    pub(crate) self_checking: bool,
    pub(crate) gc_running: bool,
    next_super_group_id: u64,
}

impl PoolState {
    fn new(config: &PoolConfig, shared: Weak<Shared>) -> Self {
        Self {
            shared,
            life_status: PoolLifeStatus::Alive,
            super_groups: AHashMap::new(),
            table: GroupTable::new(config.max_pool_size),
            get_waitlist: VecDeque::new(),
            max_idle_time: config.max_idle_time,
            self_checking: config.self_checking,
            gc_running: false,
            next_super_group_id: 1,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.life_status == PoolLifeStatus::Alive
    }

    /// Tear down a pool whose handle was dropped before `shutdown`
    /// completed. Every queued callback still runs exactly once.
    pub(crate) fn abort(&mut self, actions: &mut PostLockActions) {
        self.gc_running = false;
        if self.life_status == PoolLifeStatus::ShutDown {
            return;
        }
        warn!(
            super_groups = self.super_groups.len(),
            groups = self.table.groups.len(),
            "Pool dropped without a completed shutdown, aborting"
        );
        self.life_status = PoolLifeStatus::ShutDown;
        for waiter in self.get_waitlist.drain(..) {
            waiter.fail(GetError::PoolShuttingDown, actions);
        }
        for super_group in self.super_groups.values_mut() {
            super_group.abort(actions);
        }
        for group in self.table.groups.values_mut() {
            group.abort(actions);
        }
        self.super_groups.clear();
        self.table.groups.clear();
        self.table.initializing_super_groups = 0;
    }

    /// Entry point for every get request
    pub(crate) fn async_get(
        &mut self,
        options: Options,
        callback: GetCallback,
        actions: &mut PostLockActions,
    ) {
        if !self.is_alive() {
            waiter::fail(callback, GetError::PoolShuttingDown, actions);
            return;
        }

        let name = options.app_group_name().to_string();
        let PoolState {
            super_groups,
            table,
            ..
        } = self;
        if let Some(super_group) = super_groups.get_mut(&name) {
            super_group.get(&options, callback, table, actions);
            return;
        }

        if !self.table.at_full_capacity() || self.table.force_free_capacity(None, actions).is_some()
        {
            self.create_super_group_and_get(options, callback, actions);
        } else {
            debug!(app = %name, "Pool at full capacity, queueing request on the pool");
            self.get_waitlist.push_back(GetWaiter::new(options, callback));
        }
    }

    fn create_super_group_and_get(
        &mut self,
        options: Options,
        callback: GetCallback,
        actions: &mut PostLockActions,
    ) {
        let id = self.next_super_group_id;
        self.next_super_group_id += 1;
        let name = options.app_group_name().to_string();

        let mut super_group =
            SuperGroup::create(id, options.persistent(), self.shared.clone(), &mut self.table);
        super_group.get(&options, callback, &mut self.table, actions);
        info!(app = %name, "SuperGroup created");
        self.super_groups.insert(name, super_group);
    }

    /// Hand pool-level waiters to their (possibly new) SuperGroups
    pub(crate) fn assign_pool_get_waiters(&mut self, actions: &mut PostLockActions) {
        if self.get_waitlist.is_empty() {
            return;
        }
        let waiters = std::mem::take(&mut self.get_waitlist);
        for waiter in waiters {
            let name = waiter.options.app_group_name().to_string();
            let PoolState {
                super_groups,
                table,
                ..
            } = self;
            if let Some(super_group) = super_groups.get_mut(&name) {
                let (options, callback) = waiter.into_parts();
                super_group.get(&options, callback, table, actions);
            } else if !self.table.at_full_capacity() {
                let (options, callback) = waiter.into_parts();
                self.create_super_group_and_get(options, callback, actions);
            } else {
                self.get_waitlist.push_back(waiter);
            }
        }
    }

    /// Capacity went down: give it to pool waiters, then to starving groups
    pub(crate) fn on_capacity_freed(&mut self, actions: &mut PostLockActions) {
        self.assign_pool_get_waiters(actions);
        self.table.possibly_spawn_more_processes();
    }

    /// Detach one process and let others use the freed capacity
    pub(crate) fn detach_process_in(
        &mut self,
        group: GroupId,
        process: ProcessId,
        actions: &mut PostLockActions,
    ) -> bool {
        let detached = match self.table.groups.get_mut(&group) {
            Some(target) => target.detach(process, actions),
            None => false,
        };
        if detached {
            self.on_capacity_freed(actions);
        }
        detached
    }

    pub(crate) fn detach_process(
        &mut self,
        process: ProcessId,
        actions: &mut PostLockActions,
    ) -> bool {
        match self.table.find_process(process) {
            Some(group) => self.detach_process_in(group, process, actions),
            None => false,
        }
    }

    pub(crate) fn set_max(&mut self, max: usize, actions: &mut PostLockActions) {
        let max = max.max(1);
        let grew = max > self.table.max;
        self.table.max = max;
        info!(max, "Pool capacity changed");
        if grew {
            self.on_capacity_freed(actions);
        }
    }

    /// Structural checks, plus the expensive progress check when self checking
    pub(crate) fn verify_invariants(&self) {
        let mut initializing = 0;
        for super_group in self.super_groups.values() {
            super_group.verify_invariants(&self.table);
            if super_group.state == SuperGroupState::Initializing {
                initializing += 1;
            }
        }
        assert_eq!(
            initializing, self.table.initializing_super_groups,
            "initializing SuperGroup count out of sync"
        );
        for group in self.table.groups.values() {
            group.verify_invariants(&self.table.view_for(group.id));
        }
        if !self.get_waitlist.is_empty() {
            assert!(
                self.table.at_full_capacity() || !self.is_alive(),
                "pool waiters queued while capacity is available"
            );
        }
    }
}
