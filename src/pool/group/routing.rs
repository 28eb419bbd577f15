/*!
 * Routing and Session Management
 *
 * Stickiness first, then least busy. The busyness array is scanned instead
 * of the process structs because this runs on every request.
 */

use super::{Group, PoolView, ProcessLocation};
use crate::core::actions::PostLockActions;
use crate::core::errors::GetError;
use crate::core::types::{GroupId, ProcessId, SpawnResult};
use crate::pool::options::Options;
use crate::pool::process::{EnabledStatus, Process};
use crate::pool::session::Session;
use crate::pool::state::PoolState;
use crate::pool::waiter::{GetCallback, GetWaiter};
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RouteResult {
    pub(crate) location: Option<ProcessLocation>,
    /// No other queued request can be routed either
    pub(crate) finished: bool,
}

impl RouteResult {
    fn found(list: EnabledStatus, index: usize) -> Self {
        Self {
            location: Some(ProcessLocation { list, index }),
            finished: false,
        }
    }

    fn wait(finished: bool) -> Self {
        Self {
            location: None,
            finished,
        }
    }
}

/// What the pool still has to do after `Group::get`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct GetOutcome {
    /// The group has nothing to serve with and the pool is full
    pub(crate) needs_capacity: bool,
}

impl Group {
    fn find_best_enabled_process(&self) -> Option<usize> {
        self.enabled_busyness
            .iter()
            .enumerate()
            .min_by_key(|(_, busyness)| **busyness)
            .map(|(index, _)| index)
    }

    fn find_least_busy(list: &[Process]) -> Option<usize> {
        list.iter()
            .enumerate()
            .min_by_key(|(_, p)| p.busyness())
            .map(|(index, _)| index)
    }

    fn find_process_with_sticky_session_id(&self, id: u32) -> Option<ProcessLocation> {
        [EnabledStatus::Enabled, EnabledStatus::Disabling]
            .into_iter()
            .find_map(|list| {
                self.list(list)
                    .iter()
                    .position(|p| p.sticky_session_id == id)
                    .map(|index| ProcessLocation { list, index })
            })
    }

    pub(crate) fn route(&self, options: &Options) -> RouteResult {
        if options.sticky_session_id != 0 {
            if let Some(location) =
                self.find_process_with_sticky_session_id(options.sticky_session_id)
            {
                return if self.process_at(location).can_be_routed_to() {
                    RouteResult {
                        location: Some(location),
                        finished: false,
                    }
                } else {
                    RouteResult::wait(false)
                };
            }
        }

        if !self.enabled.is_empty() {
            match self.find_best_enabled_process() {
                Some(index) if self.enabled[index].can_be_routed_to() => {
                    RouteResult::found(EnabledStatus::Enabled, index)
                }
                _ => RouteResult::wait(true),
            }
        } else {
            // draining processes keep serving until a replacement attaches
            match Self::find_least_busy(&self.disabling) {
                Some(index) if self.disabling[index].can_be_routed_to() => {
                    RouteResult::found(EnabledStatus::Disabling, index)
                }
                _ => RouteResult::wait(true),
            }
        }
    }

    fn new_session(&mut self, location: ProcessLocation, now: Instant) -> Session {
        let process = self.process_at_mut(location);
        process.open_session(now);
        let (id, pid, sticky) = (process.id, process.pid, process.sticky_session_id);
        self.update_busyness(location);
        self.last_activity = now;
        Session::new(self.pool.clone(), self.id, id, pid, sticky)
    }

    /// Queue a request; fails it when the queue is at its bound
    pub(crate) fn push_get_waiter(
        &mut self,
        waiter: GetWaiter,
        actions: &mut PostLockActions,
    ) -> bool {
        let max = self.options.max_request_queue_size;
        if max == 0 || self.get_waitlist.len() < max {
            self.get_waitlist.push_back(waiter);
            true
        } else {
            warn!(group = %self.name, max, "Request queue full, rejecting request");
            waiter.fail(GetError::RequestQueueFull { max }, actions);
            false
        }
    }

    /// Hand sessions to queued requests in FIFO order while processes are routable
    pub(crate) fn assign_sessions_to_get_waiters(&mut self, actions: &mut PostLockActions) {
        let now = Instant::now();
        let mut index = 0;
        while index < self.get_waitlist.len() {
            let route = self.route(&self.get_waitlist[index].options);
            match route.location {
                Some(location) => {
                    if let Some(waiter) = self.get_waitlist.remove(index) {
                        let session = self.new_session(location, now);
                        waiter.succeed(session, actions);
                    }
                }
                None if route.finished => break,
                None => index += 1,
            }
        }
    }

    /// Serve or queue one request. The session, if any, is delivered
    /// through `callback` after the lock is released.
    pub(crate) fn get(
        &mut self,
        options: &Options,
        callback: GetCallback,
        view: &PoolView,
        actions: &mut PostLockActions,
    ) -> GetOutcome {
        debug_assert!(self.is_alive());
        let mut outcome = GetOutcome::default();

        if !self.restarting {
            self.options.merge_from(options);
            if self.should_spawn_for_get_action(view)
                && self.spawn(view) == SpawnResult::ErrPoolAtFullCapacity
                && self.enabled.is_empty()
            {
                outcome.needs_capacity = true;
            }
        }

        let waiter = GetWaiter::new(options.clone(), callback);
        let route = self.route(options);
        match route.location {
            Some(location) => {
                let session = self.new_session(location, Instant::now());
                waiter.succeed(session, actions);
            }
            None => {
                debug!(
                    group = %self.name,
                    queued = self.get_waitlist.len() + 1,
                    "No routable process, queueing request"
                );
                self.push_get_waiter(waiter, actions);
            }
        }
        outcome
    }
}

impl PoolState {
    /// Bookkeeping when a session ends
    pub(crate) fn close_session(
        &mut self,
        group: GroupId,
        process: ProcessId,
        success: bool,
        actions: &mut PostLockActions,
    ) {
        let pool_has_waiters = !self.get_waitlist.is_empty();
        let view = self.table.view_for(group);
        let Some(target) = self.table.groups.get_mut(&group) else {
            return;
        };
        let Some(location) = target.locate(process) else {
            return;
        };

        let now = Instant::now();
        target.process_at_mut(location).close_session(now);
        target.update_busyness(location);
        target.last_activity = now;

        if location.list == EnabledStatus::Detached {
            if target.process_at(location).sessions == 0 {
                if let Some(shared) = self.shared.upgrade() {
                    shared.detached_wakeup.notify_all();
                }
            }
            return;
        }

        if !success {
            warn!(
                group = %target.name,
                process = %process,
                "Session could not be initiated, detaching process"
            );
            self.detach_process_in(group, process, actions);
            return;
        }

        let closed = target.process_at(location);
        let should_detach = closed.reached_max_requests(target.options.max_requests)
            || (closed.sessions == 0
                && target.get_waitlist.is_empty()
                && (pool_has_waiters || view.another_group_waiting_for_capacity));
        let should_disable = location.list == EnabledStatus::Disabling
            && closed.sessions == 0
            && target.enabled_count() > 0;

        if should_detach {
            debug!(group = %target.name, process = %process, "Recycling process");
            self.detach_process_in(group, process, actions);
        } else if should_disable {
            target.finish_disable(location, actions);
            target.maybe_initiate_oobw(process, &view, actions);
        } else {
            target.maybe_initiate_oobw(process, &view, actions);
            if !target.get_waitlist.is_empty() {
                target.assign_sessions_to_get_waiters(actions);
            }
        }
    }
}
