/*!
 * SuperGroup
 *
 * Lifecycle of one application: initialization (loading and validating its
 * configuration through the spawner factory), rolling restarts and
 * destruction. Every transition goes through `set_state`, which bumps the
 * generation; background threads capture the generation and the SuperGroup
 * id, and their commits are ignored once either has moved on.
 *
 * State table:
 *
 * | state        | get                 | restart        | destroy                  |
 * |--------------|---------------------|----------------|--------------------------|
 * | Initializing | queue               | refused        | Destroying (or reinit)   |
 * | Ready        | default group       | → Restarting   | Destroying (or reinit)   |
 * | Restarting   | default group       | coalesced      | Destroying (or reinit)   |
 * | Destroying   | queue, reinitialize | refused        | callback joins           |
 * | Destroyed    | queue, reinitialize | refused        | Success                  |
 */

use super::group::Group;
use super::options::Options;
use super::state::{GroupTable, PoolState, Shared};
use super::waiter::{self, GetCallback, GetWaiter, ShutdownCallback};
use crate::core::actions::PostLockActions;
use crate::core::errors::{GetError, SpawnOutcome};
use crate::core::types::{GroupId, ShutdownResult};
use crate::spawner::Spawner;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuperGroupState {
    Initializing,
    Ready,
    Restarting,
    Destroying,
    Destroyed,
}

impl SuperGroupState {
    /// States in which the SuperGroup owns no groups
    pub fn is_groupless(self) -> bool {
        matches!(
            self,
            SuperGroupState::Initializing | SuperGroupState::Destroying | SuperGroupState::Destroyed
        )
    }
}

pub(crate) struct SuperGroup {
    /// Pool-unique, tells a re-created SuperGroup from a retired one
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) options: Options,
    pub(crate) state: SuperGroupState,
    pub(crate) generation: u64,
    pub(crate) groups: Vec<GroupId>,
    pub(crate) default_group: Option<GroupId>,
    pub(crate) get_waitlist: VecDeque<GetWaiter>,
    /// Groups that were shut down and may still be draining
    pub(crate) detached_groups: Vec<GroupId>,
    destroy_callbacks: Vec<(u64, ShutdownCallback)>,
    pool: Weak<Shared>,
}

impl SuperGroup {
    /// A new SuperGroup in the Initializing state with its initializer running
    pub(crate) fn create(
        id: u64,
        options: Options,
        pool: Weak<Shared>,
        table: &mut GroupTable,
    ) -> Self {
        // constructed Initializing, so the reservation is taken by hand
        table.initializing_super_groups += 1;
        let mut super_group = Self {
            id,
            name: options.app_group_name().to_string(),
            options,
            state: SuperGroupState::Initializing,
            generation: 0,
            groups: Vec::new(),
            default_group: None,
            get_waitlist: VecDeque::new(),
            detached_groups: Vec::new(),
            destroy_callbacks: Vec::new(),
            pool,
        };
        let mut actions = PostLockActions::new();
        super_group.initialize(table, &mut actions);
        // nothing is queued yet, so there is nothing to resolve
        debug_assert!(actions.is_empty());
        actions.run();
        super_group
    }

    pub(crate) fn set_state(&mut self, state: SuperGroupState, table: &mut GroupTable) {
        if self.state == SuperGroupState::Initializing {
            table.initializing_super_groups -= 1;
        }
        if state == SuperGroupState::Initializing {
            table.initializing_super_groups += 1;
        }
        debug!(
            app = %self.name,
            from = ?self.state,
            to = ?state,
            generation = self.generation + 1,
            "SuperGroup state change"
        );
        self.state = state;
        self.generation += 1;
    }

    fn initialize(&mut self, table: &mut GroupTable, actions: &mut PostLockActions) {
        debug_assert_eq!(self.state, SuperGroupState::Initializing);
        // the pool is being dropped; nothing could commit anyway
        let Some(shared) = self.pool.upgrade() else {
            return;
        };

        let pool = self.pool.clone();
        let name = self.name.clone();
        let id = self.id;
        let generation = self.generation;
        let options = self.options.clone();
        let factory = shared.factory.clone();
        let started = shared.threads.spawn("SuperGroup initializer", move || {
            let result = factory.create(&options);
            match pool.upgrade() {
                Some(shared) => shared.with_state(|state, actions| {
                    state.commit_super_group_init(&name, id, generation, result, actions)
                }),
                None => {
                    if let Ok(spawner) = result {
                        spawner.cleanup();
                    }
                }
            }
        });

        if let Err(err) = started {
            error!(app = %self.name, error = %err, "Could not start SuperGroup initializer");
            self.set_state(SuperGroupState::Destroyed, table);
            for waiter in self.get_waitlist.drain(..) {
                waiter.fail(
                    GetError::Aborted("the application could not be initialized".into()),
                    actions,
                );
            }
        }
    }

    pub(crate) fn get(
        &mut self,
        options: &Options,
        callback: GetCallback,
        table: &mut GroupTable,
        actions: &mut PostLockActions,
    ) {
        match self.state {
            SuperGroupState::Initializing => {
                self.get_waitlist
                    .push_back(GetWaiter::new(options.clone(), callback));
            }
            SuperGroupState::Ready | SuperGroupState::Restarting => match self.default_group {
                Some(group) => table.get_from_group(group, options, callback, actions),
                None => waiter::fail(
                    callback,
                    GetError::Aborted("the application has no group".into()),
                    actions,
                ),
            },
            SuperGroupState::Destroying | SuperGroupState::Destroyed => {
                info!(app = %self.name, "Reinitializing SuperGroup for a new request");
                self.get_waitlist
                    .push_back(GetWaiter::new(options.clone(), callback));
                self.set_state(SuperGroupState::Initializing, table);
                self.initialize(table, actions);
            }
        }
    }

    /// Hand the init wait list to the default group
    pub(crate) fn assign_get_waitlist_to_groups(
        &mut self,
        table: &mut GroupTable,
        actions: &mut PostLockActions,
    ) {
        let Some(group) = self.default_group else {
            return;
        };
        for waiter in self.get_waitlist.drain(..) {
            let (options, callback) = waiter.into_parts();
            table.get_from_group(group, &options, callback, actions);
        }
    }

    /// Rolling restart. Returns false unless the SuperGroup was Ready or
    /// already restarting.
    pub(crate) fn restart(&mut self, options: &Options, table: &mut GroupTable) -> bool {
        match self.state {
            SuperGroupState::Restarting => {
                debug!(app = %self.name, "Restart already in progress, coalescing");
                return true;
            }
            SuperGroupState::Ready => {}
            _ => return false,
        }
        let Some(shared) = self.pool.upgrade() else {
            return false;
        };

        self.options = options.persistent();
        self.set_state(SuperGroupState::Restarting, table);
        info!(app = %self.name, generation = self.generation, "Restarting SuperGroup");

        let pool = self.pool.clone();
        let name = self.name.clone();
        let id = self.id;
        let generation = self.generation;
        let options = self.options.clone();
        let factory = shared.factory.clone();
        let started = shared.threads.spawn("SuperGroup restarter", move || {
            let result = factory.create(&options);
            match pool.upgrade() {
                Some(shared) => shared.with_state(|state, actions| {
                    state.commit_super_group_restart(&name, id, generation, result, actions)
                }),
                None => {
                    if let Ok(spawner) = result {
                        spawner.cleanup();
                    }
                }
            }
        });

        if started.is_err() {
            self.set_state(SuperGroupState::Ready, table);
            return false;
        }
        true
    }

    /// Shut down all groups. `callback` receives `Success` once they are gone,
    /// or `Canceled` when a reinitialization overtakes the destroy.
    pub(crate) fn destroy(
        &mut self,
        allow_reinit: bool,
        callback: Option<ShutdownCallback>,
        table: &mut GroupTable,
        actions: &mut PostLockActions,
    ) {
        match self.state {
            SuperGroupState::Destroyed => {
                if let Some(callback) = callback {
                    actions.push(move || callback(ShutdownResult::Success));
                }
                return;
            }
            SuperGroupState::Destroying => {
                if let Some(callback) = callback {
                    self.destroy_callbacks.push((self.generation, callback));
                }
                return;
            }
            _ => {}
        }

        info!(app = %self.name, allow_reinit, "Destroying SuperGroup");
        for group in std::mem::take(&mut self.groups) {
            table.shutdown_group(group, None, actions);
            if table.contains(group) {
                self.detached_groups.push(group);
            }
        }
        self.default_group = None;

        if !allow_reinit {
            for waiter in self.get_waitlist.drain(..) {
                waiter.fail(GetError::Aborted("the application was destroyed".into()), actions);
            }
        }

        self.set_state(SuperGroupState::Destroying, table);
        if let Some(callback) = callback {
            self.destroy_callbacks.push((self.generation, callback));
        }
        self.start_destroyer(table, actions);

        if allow_reinit && !self.get_waitlist.is_empty() {
            debug!(
                app = %self.name,
                waiters = self.get_waitlist.len(),
                "Reinitializing right after destroy"
            );
            self.set_state(SuperGroupState::Initializing, table);
            self.initialize(table, actions);
        }
    }

    fn start_destroyer(&mut self, table: &mut GroupTable, actions: &mut PostLockActions) {
        let Some(shared) = self.pool.upgrade() else {
            return;
        };
        let pool = self.pool.clone();
        let name = self.name.clone();
        let id = self.id;
        let generation = self.generation;
        let groups = self.detached_groups.clone();
        let interval = shared.config.destroy_poll_interval;
        let started = shared.threads.spawn("SuperGroup destroyer", move || {
            wait_for_destroy(pool, name, id, generation, groups, interval)
        });

        if let Err(err) = started {
            warn!(
                app = %self.name,
                error = %err,
                "Could not start SuperGroup destroyer, finishing now"
            );
            self.finish_destroy(generation, table, actions);
        }
    }

    /// Resolve destroy callbacks registered at `generation`
    fn finish_destroy(
        &mut self,
        generation: u64,
        table: &mut GroupTable,
        actions: &mut PostLockActions,
    ) {
        let current = self.state == SuperGroupState::Destroying && self.generation == generation;
        let result = if current {
            self.set_state(SuperGroupState::Destroyed, table);
            self.detached_groups.clear();
            info!(app = %self.name, "SuperGroup destroyed");
            ShutdownResult::Success
        } else {
            debug!(app = %self.name, "Destroy overtaken by reinitialization");
            self.detached_groups.retain(|g| table.contains(*g));
            ShutdownResult::Canceled
        };

        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.destroy_callbacks)
            .into_iter()
            .partition(|(at, _)| *at == generation);
        self.destroy_callbacks = rest;
        for (_, callback) in matching {
            actions.push(move || callback(result));
        }
    }

    pub(crate) fn garbage_collectable(
        &self,
        now: Instant,
        max_idle_time: Duration,
        table: &GroupTable,
    ) -> bool {
        self.state == SuperGroupState::Ready
            && self.get_waitlist.is_empty()
            && self.groups.iter().all(|g| {
                table
                    .groups
                    .get(g)
                    .map(|group| group.garbage_collectable(now, max_idle_time))
                    .unwrap_or(true)
            })
    }

    /// Answer queued requests and pending destroys of an abandoned pool
    pub(crate) fn abort(&mut self, actions: &mut PostLockActions) {
        for waiter in self.get_waitlist.drain(..) {
            waiter.fail(GetError::PoolShuttingDown, actions);
        }
        for (_, callback) in self.destroy_callbacks.drain(..) {
            actions.push(move || callback(ShutdownResult::Canceled));
        }
    }

    pub(crate) fn verify_invariants(&self, table: &GroupTable) {
        assert_eq!(
            self.groups.is_empty(),
            self.state.is_groupless(),
            "SuperGroup {} has groups {:?} in state {:?}",
            self.name,
            self.groups,
            self.state
        );
        if !self.get_waitlist.is_empty() {
            assert_eq!(
                self.state,
                SuperGroupState::Initializing,
                "SuperGroup {} queues requests while {:?}",
                self.name,
                self.state
            );
        }
        if let Some(group) = self.default_group {
            assert!(self.groups.contains(&group));
        }
        for group in &self.groups {
            assert!(table.contains(*group), "SuperGroup {} lost group {}", self.name, group);
        }
    }
}

impl fmt::Debug for SuperGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuperGroup")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("groups", &self.groups)
            .field("get_waitlist", &self.get_waitlist.len())
            .finish()
    }
}

fn wait_for_destroy(
    pool: Weak<Shared>,
    name: String,
    id: u64,
    generation: u64,
    groups: Vec<GroupId>,
    interval: Duration,
) {
    loop {
        let Some(shared) = pool.upgrade() else {
            return;
        };
        let done = shared.with_state(|state, actions| {
            state.commit_super_group_destroy(&name, id, generation, &groups, actions)
        });
        if done {
            return;
        }
        drop(shared);
        thread::sleep(interval);
    }
}

impl PoolState {
    fn commit_super_group_init(
        &mut self,
        name: &str,
        id: u64,
        generation: u64,
        result: SpawnOutcome<Arc<dyn Spawner>>,
        actions: &mut PostLockActions,
    ) {
        let PoolState {
            super_groups,
            table,
            ..
        } = self;
        let super_group = super_groups
            .get_mut(name)
            .filter(|sg| sg.id == id && sg.generation == generation)
            .filter(|sg| sg.state == SuperGroupState::Initializing);
        let Some(super_group) = super_group else {
            debug!(app = name, "Discarding stale SuperGroup initialization");
            if let Ok(spawner) = result {
                actions.push(move || spawner.cleanup());
            }
            return;
        };

        match result {
            Ok(spawner) => {
                let group_id = table.allocate_group_id();
                table.insert(Group::new(
                    group_id,
                    &super_group.name,
                    super_group.options.clone(),
                    spawner,
                    super_group.pool.clone(),
                ));
                super_group.groups.push(group_id);
                super_group.default_group = Some(group_id);
                super_group.set_state(SuperGroupState::Ready, table);
                info!(app = name, group = %group_id, "SuperGroup ready");

                super_group.assign_get_waitlist_to_groups(table, actions);
                table.spawn_if_needed(group_id);
            }
            Err(err) => {
                error!(app = name, error = %err, "SuperGroup initialization failed");
                super_group.set_state(SuperGroupState::Destroyed, table);
                for waiter in super_group.get_waitlist.drain(..) {
                    waiter.fail(GetError::SpawnFailed(err.clone()), actions);
                }
            }
        }
        self.on_capacity_freed(actions);
    }

    fn commit_super_group_restart(
        &mut self,
        name: &str,
        id: u64,
        generation: u64,
        result: SpawnOutcome<Arc<dyn Spawner>>,
        actions: &mut PostLockActions,
    ) {
        let PoolState {
            super_groups,
            table,
            ..
        } = self;
        let super_group = super_groups
            .get_mut(name)
            .filter(|sg| sg.id == id && sg.generation == generation)
            .filter(|sg| sg.state == SuperGroupState::Restarting);
        let Some(super_group) = super_group else {
            debug!(app = name, "Discarding stale SuperGroup restart");
            if let Ok(spawner) = result {
                actions.push(move || spawner.cleanup());
            }
            return;
        };

        let spawner = match result {
            Ok(spawner) => spawner,
            Err(err) => {
                warn!(app = name, error = %err, "Restart failed, the current group keeps serving");
                super_group.set_state(SuperGroupState::Ready, table);
                return;
            }
        };

        let group_id = table.allocate_group_id();
        table.insert(Group::new(
            group_id,
            &super_group.name,
            super_group.options.clone(),
            spawner,
            super_group.pool.clone(),
        ));

        let old_groups = std::mem::replace(&mut super_group.groups, vec![group_id]);
        super_group.default_group = Some(group_id);
        super_group.set_state(SuperGroupState::Ready, table);

        let mut moved = Vec::new();
        for old in old_groups {
            if let Some(group) = table.groups.get_mut(&old) {
                moved.extend(group.get_waitlist.drain(..));
            }
            table.shutdown_group(old, None, actions);
            if table.contains(old) {
                super_group.detached_groups.push(old);
            }
        }
        info!(app = name, group = %group_id, moved = moved.len(), "SuperGroup restarted");

        for waiter in moved {
            let (options, callback) = waiter.into_parts();
            table.get_from_group(group_id, &options, callback, actions);
        }
        table.spawn_if_needed(group_id);
        self.on_capacity_freed(actions);
    }

    /// Returns true once the destroy has been resolved
    fn commit_super_group_destroy(
        &mut self,
        name: &str,
        id: u64,
        generation: u64,
        groups: &[GroupId],
        actions: &mut PostLockActions,
    ) -> bool {
        if groups.iter().any(|g| self.table.contains(*g)) {
            return false;
        }
        let PoolState {
            super_groups,
            table,
            ..
        } = self;
        if let Some(super_group) = super_groups.get_mut(name).filter(|sg| sg.id == id) {
            super_group.finish_destroy(generation, table, actions);
        }
        true
    }

    /// Destroy the named SuperGroup. Returns false if it does not exist.
    pub(crate) fn destroy_super_group(
        &mut self,
        name: &str,
        allow_reinit: bool,
        callback: Option<ShutdownCallback>,
        actions: &mut PostLockActions,
    ) -> bool {
        let PoolState {
            super_groups,
            table,
            ..
        } = self;
        let Some(super_group) = super_groups.get_mut(name) else {
            if let Some(callback) = callback {
                actions.release(callback);
            }
            return false;
        };
        super_group.destroy(allow_reinit, callback, table, actions);
        self.on_capacity_freed(actions);
        true
    }

    /// Rolling restart of the named SuperGroup
    pub(crate) fn restart_super_group(&mut self, name: &str) -> bool {
        let PoolState {
            super_groups,
            table,
            ..
        } = self;
        match super_groups.get_mut(name) {
            Some(super_group) => {
                let options = super_group.options.clone();
                super_group.restart(&options, table)
            }
            None => false,
        }
    }
}
