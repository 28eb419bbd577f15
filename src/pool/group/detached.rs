/*!
 * Detached Processes Checker
 *
 * Detached processes leave capacity accounting immediately but stay in the
 * group until the OS confirms they exited. One checker thread per group asks
 * idle detached processes to shut down, probes them, and force-kills the
 * ones that outlive the shutdown timeout. Handle calls never hold the lock.
 */

use super::{Group, GroupLifeStatus};
use crate::core::actions::PostLockActions;
use crate::core::types::{GroupId, ProcessId};
use crate::pool::process::ProcessLifeStatus;
use crate::pool::state::{PoolState, Shared};
use crate::spawner::WorkerHandle;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, warn};

/// Work collected under the lock for one checker round
#[derive(Default)]
struct Round {
    trigger: Vec<Arc<dyn WorkerHandle>>,
    probe: Vec<(ProcessId, Arc<dyn WorkerHandle>, bool)>,
}

impl Group {
    /// Start the checker, or wake it when it is already running
    pub(crate) fn start_checking_detached_processes(&mut self, immediately: bool) {
        let Some(shared) = self.pool.upgrade() else {
            return;
        };
        if self.detached_checker_active {
            if immediately {
                shared.detached_wakeup.notify_all();
            }
            return;
        }

        let pool = self.pool.clone();
        let group = self.id;
        match shared
            .threads
            .spawn("Detached processes checker", move || check_detached_processes(pool, group))
        {
            Ok(()) => self.detached_checker_active = true,
            Err(err) => {
                warn!(
                    group = %self.name,
                    error = %err,
                    "Could not start the detached processes checker"
                );
            }
        }
    }

    fn collect_detached_round(&mut self, now: Instant, shared: &Shared) -> Round {
        let timeout = shared.config.process_shutdown_timeout;
        let mut round = Round::default();
        for process in self.detached.iter_mut() {
            if process.can_trigger_shutdown() {
                debug!(
                    group = %self.name,
                    process = %process.id,
                    pid = process.pid,
                    "Shutting down detached process"
                );
                process.life_status = ProcessLifeStatus::ShutdownTriggered;
                process.shutdown_started_at = Some(now);
                round.trigger.push(process.handle.clone());
            }
            if process.life_status == ProcessLifeStatus::ShutdownTriggered {
                let expired = process.shutdown_timeout_expired(now, timeout);
                round.probe.push((process.id, process.handle.clone(), expired));
            }
        }
        round
    }
}

fn probe(round: Round) -> Vec<ProcessId> {
    for handle in round.trigger {
        handle.trigger_shutdown();
    }
    round
        .probe
        .into_iter()
        .filter_map(|(id, handle, expired)| {
            if handle.has_exited() {
                return Some(id);
            }
            if expired {
                warn!(process = %id, "Detached process did not exit in time, killing it");
                handle.force_kill();
                if handle.has_exited() {
                    return Some(id);
                }
            }
            None
        })
        .collect()
}

fn check_detached_processes(pool: Weak<Shared>, group: GroupId) {
    debug!(group = %group, "Detached processes checker started");
    loop {
        let Some(shared) = pool.upgrade() else {
            return;
        };

        let round = shared.with_state(|state, _| {
            let now = Instant::now();
            state
                .table
                .groups
                .get_mut(&group)
                .map(|target| target.collect_detached_round(now, &shared))
        });
        let exited = match round {
            Some(round) => probe(round),
            None => return,
        };

        let keep_going = shared.with_state(|state, actions| {
            state.commit_detached_check(group, &exited, actions)
        });
        if !keep_going {
            break;
        }

        let interval = shared.config.detached_check_interval;
        let mut guard = shared.state.lock();
        shared.detached_wakeup.wait_for(&mut guard, interval);
    }
    debug!(group = %group, "Detached processes checker finished");
}

impl PoolState {
    /// Forget exited processes. Returns whether the checker should keep running.
    fn commit_detached_check(
        &mut self,
        group: GroupId,
        exited: &[ProcessId],
        actions: &mut PostLockActions,
    ) -> bool {
        let Some(target) = self.table.groups.get_mut(&group) else {
            return false;
        };
        target.remove_exited_processes(exited);
        if !target.detached.is_empty() {
            return true;
        }

        target.detached_checker_active = false;
        if target.life_status == GroupLifeStatus::ShuttingDown {
            target.finish_shutdown(actions);
            self.table.reap(group);
        }
        false
    }
}
