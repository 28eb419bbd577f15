/*!
 * Group
 *
 * All processes backing one deployable unit of an application. The group
 * partitions its processes into four lists, routes requests among them,
 * decides when to spawn, and drains processes for disabling, restarts and
 * shutdown.
 *
 * Methods here run with the pool lock held. Anything that must happen
 * outside the lock is pushed onto the caller's `PostLockActions`; work that
 * blocks runs on background threads that re-lock only to commit.
 *
 * Layout:
 * - `process_list`: list transitions, attach/detach, enable/disable, shutdown
 * - `routing`: route, get, waiter assignment, session close
 * - `spawning`: spawn loop and in-place restart
 * - `detached`: the detached processes checker
 * - `oobw`: out-of-band work
 */

mod detached;
mod oobw;
mod process_list;
mod routing;
mod spawning;

pub(crate) use process_list::ProcessLocation;

use super::options::Options;
use super::process::{EnabledStatus, Process};
use super::state::Shared;
use super::waiter::{DisableWaiter, GetWaiter, ShutdownCallback};
use crate::core::types::GroupId;
use crate::spawner::Spawner;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupLifeStatus {
    Alive,
    ShuttingDown,
    ShutDown,
}

/// The rest of the pool, as seen from one group
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PoolView {
    pub(crate) max: usize,
    /// Capacity used by all other groups and initializing SuperGroups
    pub(crate) used_elsewhere: usize,
    pub(crate) another_group_waiting_for_capacity: bool,
}

pub(crate) struct Group {
    pub(crate) id: GroupId,
    pub(crate) name: String,
    pub(crate) super_group: String,
    pub(crate) options: Options,
    /// Rotated on every restart
    pub(crate) uuid: Uuid,
    pub(crate) pool: Weak<Shared>,
    pub(crate) spawner: Arc<dyn Spawner>,

    pub(crate) life_status: GroupLifeStatus,
    pub(crate) restarts_initiated: u32,
    pub(crate) processes_being_spawned: u32,
    pub(crate) spawning: bool,
    pub(crate) restarting: bool,
    pub(crate) detached_checker_active: bool,
    pub(crate) shutdown_callback: Option<ShutdownCallback>,

    pub(crate) enabled: Vec<Process>,
    /// `enabled[i].busyness()` for every i, kept in lock-step
    pub(crate) enabled_busyness: Vec<i32>,
    pub(crate) disabling: Vec<Process>,
    pub(crate) disabled: Vec<Process>,
    pub(crate) detached: Vec<Process>,

    pub(crate) get_waitlist: VecDeque<GetWaiter>,
    pub(crate) disable_waitlist: VecDeque<DisableWaiter>,
    pub(crate) last_activity: Instant,
}

impl Group {
    pub(crate) fn new(
        id: GroupId,
        super_group: &str,
        options: Options,
        spawner: Arc<dyn Spawner>,
        pool: Weak<Shared>,
    ) -> Self {
        Self {
            id,
            name: options.app_group_name().to_string(),
            super_group: super_group.to_string(),
            options: options.persistent(),
            uuid: Uuid::new_v4(),
            pool,
            spawner,
            life_status: GroupLifeStatus::Alive,
            restarts_initiated: 0,
            processes_being_spawned: 0,
            spawning: false,
            restarting: false,
            detached_checker_active: false,
            shutdown_callback: None,
            enabled: Vec::new(),
            enabled_busyness: Vec::new(),
            disabling: Vec::new(),
            disabled: Vec::new(),
            detached: Vec::new(),
            get_waitlist: VecDeque::new(),
            disable_waitlist: VecDeque::new(),
            last_activity: Instant::now(),
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.life_status == GroupLifeStatus::Alive
    }

    pub(crate) fn enabled_count(&self) -> usize {
        self.enabled.len()
    }

    pub(crate) fn disabling_count(&self) -> usize {
        self.disabling.len()
    }

    pub(crate) fn disabled_count(&self) -> usize {
        self.disabled.len()
    }

    /// Processes that count against capacity (everything but detached)
    pub(crate) fn process_count(&self) -> usize {
        self.enabled.len() + self.disabling.len() + self.disabled.len()
    }

    pub(crate) fn capacity_used(&self) -> usize {
        self.process_count() + self.processes_being_spawned as usize
    }

    pub(crate) fn all_processes(&self) -> impl Iterator<Item = &Process> {
        self.enabled
            .iter()
            .chain(self.disabling.iter())
            .chain(self.disabled.iter())
            .chain(self.detached.iter())
    }

    // ------------------------------------------------------------------
    // Capacity predicates
    // ------------------------------------------------------------------

    pub(crate) fn process_upper_limits_reached(&self) -> bool {
        self.options.max_processes != 0 && self.capacity_used() >= self.options.max_processes
    }

    pub(crate) fn process_lower_limits_satisfied(&self) -> bool {
        self.capacity_used() >= self.options.min_processes
    }

    pub(crate) fn pool_at_full_capacity(&self, view: &PoolView) -> bool {
        view.used_elsewhere + self.capacity_used() >= view.max
    }

    /// Requests are queued and nothing can serve them until capacity frees up
    pub(crate) fn is_waiting_for_capacity(&self) -> bool {
        self.enabled.is_empty()
            && self.processes_being_spawned == 0
            && !self.restarting
            && !self.get_waitlist.is_empty()
    }

    pub(crate) fn all_enabled_processes_are_totally_busy(&self) -> bool {
        !self.enabled.is_empty() && self.enabled.iter().all(Process::is_totally_busy)
    }

    pub(crate) fn allow_spawn(&self, view: &PoolView) -> bool {
        self.is_alive() && !self.process_upper_limits_reached() && !self.pool_at_full_capacity(view)
    }

    pub(crate) fn should_spawn(&self, view: &PoolView) -> bool {
        self.allow_spawn(view)
            && (!self.process_lower_limits_satisfied()
                || self.all_enabled_processes_are_totally_busy()
                || !self.get_waitlist.is_empty())
    }

    pub(crate) fn should_spawn_for_get_action(&self, view: &PoolView) -> bool {
        self.enabled.is_empty() || self.should_spawn(view)
    }

    /// Nothing left to serve and idle for longer than `max_idle_time`
    pub(crate) fn garbage_collectable(&self, now: Instant, max_idle_time: Duration) -> bool {
        self.is_alive()
            && !max_idle_time.is_zero()
            && self.process_count() == 0
            && !self.spawning
            && !self.restarting
            && self.get_waitlist.is_empty()
            && now.saturating_duration_since(self.last_activity) >= max_idle_time
    }

    // ------------------------------------------------------------------
    // Invariants
    // ------------------------------------------------------------------

    pub(crate) fn verify_invariants(&self, view: &PoolView) {
        assert_eq!(
            self.enabled.len(),
            self.enabled_busyness.len(),
            "busyness levels out of step in {}",
            self.name
        );
        for (process, busyness) in self.enabled.iter().zip(&self.enabled_busyness) {
            assert_eq!(process.busyness(), *busyness, "stale busyness for {}", process.id);
        }
        for (list, status) in [
            (&self.enabled, EnabledStatus::Enabled),
            (&self.disabling, EnabledStatus::Disabling),
            (&self.disabled, EnabledStatus::Disabled),
            (&self.detached, EnabledStatus::Detached),
        ] {
            for process in list.iter() {
                assert_eq!(process.enabled, status, "{} is in the wrong list", process.id);
                assert_eq!(process.group, self.id);
            }
        }
        assert!(
            self.disable_waitlist.len() >= self.disabling.len(),
            "disabling process without a disable waiter in {}",
            self.name
        );

        if !self.is_alive() {
            assert_eq!(self.process_count(), 0);
            assert!(self.get_waitlist.is_empty());
        }

        if let Some(head) = self.get_waitlist.front() {
            let routable = self.route(&head.options).location.is_some();
            assert!(
                !routable
                    || self.spawning
                    || self.restarting
                    || self.pool_at_full_capacity(view),
                "group {} has queued requests and a routable process",
                self.name
            );
        }
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("life_status", &self.life_status)
            .field("enabled", &self.enabled.len())
            .field("disabling", &self.disabling.len())
            .field("disabled", &self.disabled.len())
            .field("detached", &self.detached.len())
            .field("get_waitlist", &self.get_waitlist.len())
            .finish()
    }
}
