/*!
 * Garbage Collector
 *
 * Periodic sweep that retires idle processes above each group's minimum,
 * destroys SuperGroups whose groups are all idle and empty, and forgets
 * SuperGroups that finished destroying. Woken early whenever a process
 * attaches so the next deadline is recomputed.
 */

use super::state::{PoolState, Shared};
use super::super_group::SuperGroupState;
use crate::core::actions::PostLockActions;
use crate::core::limits::MIN_GC_INTERVAL;
use crate::core::types::{GroupId, ProcessId};
use serde::{Deserialize, Serialize};
use std::sync::Weak;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    pub detached_processes: usize,
    pub destroyed_super_groups: Vec<String>,
    pub forgotten_super_groups: Vec<String>,
    /// When the next process becomes collectable, if any
    #[serde(with = "crate::core::serde::optional_duration_millis")]
    pub next_sweep_in: Option<Duration>,
}

impl GcReport {
    pub fn is_empty(&self) -> bool {
        self.detached_processes == 0
            && self.destroyed_super_groups.is_empty()
            && self.forgotten_super_groups.is_empty()
    }
}

impl PoolState {
    pub(crate) fn garbage_collect(
        &mut self,
        now: Instant,
        actions: &mut PostLockActions,
    ) -> GcReport {
        let mut report = GcReport::default();
        let max_idle = self.max_idle_time;
        if max_idle.is_zero() {
            return report;
        }

        let mut expired: Vec<(GroupId, ProcessId)> = Vec::new();
        for group in self.table.groups.values() {
            if !group.is_alive() {
                continue;
            }
            let mut remaining = group.process_count();
            let mut idle: Vec<_> = group
                .enabled
                .iter()
                .filter(|p| p.sessions == 0)
                .collect();
            idle.sort_by_key(|p| p.last_used);
            for process in idle {
                let idle_for = process.idle_for(now);
                if idle_for >= max_idle && remaining > group.options.min_processes {
                    expired.push((group.id, process.id));
                    remaining -= 1;
                } else if idle_for < max_idle {
                    let due = max_idle - idle_for;
                    report.next_sweep_in = Some(report.next_sweep_in.map_or(due, |d| d.min(due)));
                }
            }
        }

        for (group, process) in expired {
            if let Some(target) = self.table.groups.get_mut(&group) {
                if target.detach(process, actions) {
                    debug!(group = %target.name, process = %process, "Detached idle process");
                    report.detached_processes += 1;
                }
            }
        }

        let collectable: Vec<String> = self
            .super_groups
            .values()
            .filter(|sg| sg.garbage_collectable(now, max_idle, &self.table))
            .map(|sg| sg.name.clone())
            .collect();
        for name in collectable {
            info!(app = %name, "Garbage collecting idle SuperGroup");
            self.destroy_super_group(&name, false, None, actions);
            report.destroyed_super_groups.push(name);
        }

        let forgettable: Vec<String> = self
            .super_groups
            .values()
            .filter(|sg| sg.state == SuperGroupState::Destroyed && sg.get_waitlist.is_empty())
            .map(|sg| sg.name.clone())
            .collect();
        for name in forgettable {
            self.super_groups.remove(&name);
            debug!(app = %name, "Forgot destroyed SuperGroup");
            report.forgotten_super_groups.push(name);
        }

        if report.detached_processes > 0 {
            self.on_capacity_freed(actions);
        }
        report
    }
}

/// Body of the "Pool garbage collector" thread
pub(crate) fn run_garbage_collector(pool: Weak<Shared>) {
    debug!("Garbage collector started");
    let mut wait = MIN_GC_INTERVAL;
    loop {
        let Some(shared) = pool.upgrade() else {
            return;
        };
        {
            let mut state = shared.state.lock();
            if !state.gc_running {
                break;
            }
            shared.gc_wakeup.wait_for(&mut state, wait);
            if !state.gc_running {
                break;
            }
        }

        let report =
            shared.with_state(|state, actions| state.garbage_collect(Instant::now(), actions));
        if !report.is_empty() {
            info!(
                detached = report.detached_processes,
                destroyed = report.destroyed_super_groups.len(),
                forgotten = report.forgotten_super_groups.len(),
                "Garbage collection sweep"
            );
        }
        wait = report
            .next_sweep_in
            .unwrap_or(shared.config.max_idle_time)
            .max(MIN_GC_INTERVAL);
    }
    debug!("Garbage collector stopped");
}
