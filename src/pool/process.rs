/*!
 * Process
 *
 * One running worker as seen by its group. The `enabled` tag always names
 * the group list the process currently sits in; only the group's list
 * transition functions write it.
 */

use crate::core::types::{GroupId, Pid, ProcessId};
use crate::spawner::{SpawnedProcess, WorkerHandle};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Which group list a process belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnabledStatus {
    Enabled,
    Disabling,
    Disabled,
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessLifeStatus {
    Alive,
    ShutdownTriggered,
    Dead,
}

/// Out-of-band work progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OobwStatus {
    NotActive,
    Requested,
    InProgress,
}

#[derive(Debug)]
pub struct Process {
    pub(crate) id: ProcessId,
    pub(crate) pid: Pid,
    pub(crate) group: GroupId,
    pub(crate) handle: Arc<dyn WorkerHandle>,
    pub(crate) concurrency: u32,
    pub(crate) sessions: u32,
    pub(crate) processed: u64,
    pub(crate) sticky_session_id: u32,
    pub(crate) enabled: EnabledStatus,
    pub(crate) life_status: ProcessLifeStatus,
    pub(crate) oobw_status: OobwStatus,
    /// `restarts_initiated` of the group when this process was spawned
    pub(crate) generation: u32,
    pub(crate) spawned_at: Instant,
    pub(crate) last_used: Instant,
    pub(crate) shutdown_started_at: Option<Instant>,
}

impl Process {
    pub(crate) fn new(
        id: ProcessId,
        group: GroupId,
        generation: u32,
        spawned: SpawnedProcess,
        forced_concurrency: Option<u32>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            pid: spawned.pid,
            group,
            handle: spawned.handle,
            concurrency: forced_concurrency.unwrap_or(spawned.concurrency),
            sessions: 0,
            processed: 0,
            sticky_session_id: 0,
            enabled: EnabledStatus::Enabled,
            life_status: ProcessLifeStatus::Alive,
            oobw_status: OobwStatus::NotActive,
            generation,
            spawned_at: now,
            last_used: now,
            shutdown_started_at: None,
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn sessions(&self) -> u32 {
        self.sessions
    }

    /// Load score used for least-busy routing.
    ///
    /// With unlimited concurrency this is the session count; otherwise the
    /// session count scaled so a full process scores `i32::MAX`.
    pub fn busyness(&self) -> i32 {
        if self.concurrency == 0 {
            self.sessions.min(i32::MAX as u32) as i32
        } else {
            let scaled = self.sessions as i64 * i32::MAX as i64 / self.concurrency as i64;
            scaled.min(i32::MAX as i64) as i32
        }
    }

    pub fn is_totally_busy(&self) -> bool {
        self.concurrency > 0 && self.sessions >= self.concurrency
    }

    pub fn can_be_routed_to(&self) -> bool {
        !self.is_totally_busy()
    }

    pub fn is_alive(&self) -> bool {
        self.life_status == ProcessLifeStatus::Alive
    }

    /// A detached process may be asked to exit once it serves nobody
    pub(crate) fn can_trigger_shutdown(&self) -> bool {
        self.life_status == ProcessLifeStatus::Alive && self.sessions == 0
    }

    pub(crate) fn shutdown_timeout_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.shutdown_started_at
            .map(|started| now.saturating_duration_since(started) >= timeout)
            .unwrap_or(false)
    }

    pub(crate) fn open_session(&mut self, now: Instant) {
        self.sessions += 1;
        self.last_used = now;
    }

    pub(crate) fn close_session(&mut self, now: Instant) {
        debug_assert!(self.sessions > 0, "session count underflow on {}", self.id);
        self.sessions = self.sessions.saturating_sub(1);
        self.processed += 1;
        self.last_used = now;
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }

    pub(crate) fn reached_max_requests(&self, max_requests: u64) -> bool {
        max_requests > 0 && self.processed >= max_requests
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::spawner::DummySpawnerFactory;
    use crate::spawner::SpawnerFactory;
    use crate::pool::Options;

    /// A process backed by a dummy worker, not yet in any list
    pub(crate) fn dummy_process(id: u64, group: GroupId, concurrency: u32) -> Process {
        let factory = DummySpawnerFactory::new().with_concurrency(concurrency);
        let spawner = factory.create(&Options::new("/srv/test")).unwrap();
        let spawned = spawner.spawn(&Options::new("/srv/test")).unwrap();
        Process::new(ProcessId(id), group, 0, spawned, None)
    }
}
