/*!
 * Out-of-Band Work
 *
 * A process that asked for OOBW is disabled once its sessions drain, runs
 * the work on a background thread, and is then put back into rotation.
 */

use super::{Group, PoolView};
use crate::core::actions::PostLockActions;
use crate::core::types::{DisableResult, GroupId, ProcessId};
use crate::pool::process::{EnabledStatus, OobwStatus};
use crate::pool::state::PoolState;
use crate::pool::waiter::DisableCallback;
use tracing::{debug, warn};

impl Group {
    fn oobw_in_progress(&self) -> usize {
        self.all_processes()
            .filter(|p| p.oobw_status == OobwStatus::InProgress)
            .count()
    }

    fn oobw_allowed(&self) -> bool {
        self.oobw_in_progress() < self.options.max_out_of_band_work_instances
    }

    /// Start OOBW for `process` if it asked for it and is idle
    pub(crate) fn maybe_initiate_oobw(
        &mut self,
        process: ProcessId,
        view: &PoolView,
        actions: &mut PostLockActions,
    ) {
        let Some(location) = self.locate(process) else {
            return;
        };
        let candidate = self.process_at(location);
        if candidate.oobw_status != OobwStatus::Requested
            || candidate.sessions > 0
            || location.list != EnabledStatus::Enabled
            || !self.oobw_allowed()
        {
            return;
        }

        debug!(group = %self.name, process = %process, "Initiating out-of-band work");
        self.process_at_mut(location).oobw_status = OobwStatus::InProgress;

        let pool = self.pool.clone();
        let group = self.id;
        let callback: DisableCallback = Box::new(move |process, result| {
            if let Some(shared) = pool.upgrade() {
                shared.with_state(|state, actions| {
                    state.oobw_disable_done(group, process, result, actions)
                });
            }
        });

        match self.disable(process, callback, view, actions) {
            DisableResult::Success => self.start_oobw_thread(process, actions),
            DisableResult::Deferred => {}
            other => {
                debug!(
                    group = %self.name,
                    process = %process,
                    result = ?other,
                    "Out-of-band work not possible now"
                );
                self.reset_oobw(process);
            }
        }
    }

    fn reset_oobw(&mut self, process: ProcessId) {
        if let Some(location) = self.locate(process) {
            self.process_at_mut(location).oobw_status = OobwStatus::NotActive;
        }
    }

    fn start_oobw_thread(&mut self, process: ProcessId, actions: &mut PostLockActions) {
        let Some(location) = self.locate(process) else {
            return;
        };
        let handle = self.process_at(location).handle.clone();
        let Some(shared) = self.pool.upgrade() else {
            self.finish_oobw(process, actions);
            return;
        };

        let pool = self.pool.clone();
        let group = self.id;
        let timeout = shared.config.oobw_timeout;
        let started = shared.threads.spawn("OOBW request thread", move || {
            if let Err(err) = handle.perform_out_of_band_work(timeout) {
                warn!(process = %process, error = %err, "Out-of-band work failed");
            }
            if let Some(shared) = pool.upgrade() {
                shared.with_state(|state, actions| state.commit_oobw(group, process, actions));
            }
        });
        if started.is_err() {
            self.finish_oobw(process, actions);
        }
    }

    /// Back into rotation, then serve the next process that asked
    fn finish_oobw(&mut self, process: ProcessId, actions: &mut PostLockActions) {
        self.reset_oobw(process);
        self.enable(process, actions);
        debug!(group = %self.name, process = %process, "Out-of-band work finished");
    }

    fn next_oobw_candidate(&self) -> Option<ProcessId> {
        self.enabled
            .iter()
            .find(|p| p.oobw_status == OobwStatus::Requested && p.sessions == 0)
            .map(|p| p.id)
    }
}

impl PoolState {
    /// Mark a process as wanting OOBW; false when it can no longer do any
    pub(crate) fn request_oobw(&mut self, group: GroupId, process: ProcessId) -> bool {
        let Some(target) = self.table.groups.get_mut(&group) else {
            return false;
        };
        let Some(location) = target.locate(process) else {
            return false;
        };
        if location.list == EnabledStatus::Detached || !target.is_alive() {
            return false;
        }
        let candidate = target.process_at_mut(location);
        if candidate.oobw_status == OobwStatus::NotActive {
            candidate.oobw_status = OobwStatus::Requested;
        }
        true
    }

    fn oobw_disable_done(
        &mut self,
        group: GroupId,
        process: ProcessId,
        result: DisableResult,
        actions: &mut PostLockActions,
    ) {
        if let Some(target) = self.table.groups.get_mut(&group) {
            if result == DisableResult::Success {
                target.start_oobw_thread(process, actions);
            } else {
                target.reset_oobw(process);
            }
        }
    }

    fn commit_oobw(&mut self, group: GroupId, process: ProcessId, actions: &mut PostLockActions) {
        let view = self.table.view_for(group);
        if let Some(target) = self.table.groups.get_mut(&group) {
            target.finish_oobw(process, actions);
            if let Some(next) = target.next_oobw_candidate() {
                target.maybe_initiate_oobw(next, &view, actions);
            }
        }
    }
}
