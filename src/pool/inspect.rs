/*!
 * Inspection
 * Serializable point-in-time snapshots of the pool, taken under the lock
 */

use super::group::{Group, GroupLifeStatus};
use super::process::{EnabledStatus, OobwStatus, Process, ProcessLifeStatus};
use super::state::{PoolLifeStatus, PoolState};
use super::super_group::{SuperGroup, SuperGroupState};
use crate::core::serde::{is_empty_vec, is_none, is_zero_u32};
use crate::core::types::{GroupId, Pid, ProcessId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub id: ProcessId,
    pub pid: Pid,
    pub sticky_session_id: u32,
    pub enabled: EnabledStatus,
    pub life_status: ProcessLifeStatus,
    pub oobw_status: OobwStatus,
    pub sessions: u32,
    pub processed: u64,
    pub concurrency: u32,
    pub busyness: i32,
    /// Time since the process was spawned
    #[serde(with = "crate::core::serde::duration_millis")]
    pub uptime: Duration,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub generation: u32,
}

impl From<&Process> for ProcessSnapshot {
    fn from(process: &Process) -> Self {
        Self {
            id: process.id,
            pid: process.pid,
            sticky_session_id: process.sticky_session_id,
            enabled: process.enabled,
            life_status: process.life_status,
            oobw_status: process.oobw_status,
            sessions: process.sessions,
            processed: process.processed,
            concurrency: process.concurrency,
            busyness: process.busyness(),
            uptime: process.spawned_at.elapsed(),
            generation: process.generation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub id: GroupId,
    pub name: String,
    pub super_group: String,
    pub uuid: String,
    pub life_status: GroupLifeStatus,
    pub restarts_initiated: u32,
    pub processes_being_spawned: u32,
    pub spawning: bool,
    pub restarting: bool,
    pub capacity_used: usize,
    pub enabled_count: usize,
    pub disabling_count: usize,
    pub disabled_count: usize,
    pub detached_count: usize,
    pub get_waitlist: usize,
    pub disable_waitlist: usize,
    #[serde(default, skip_serializing_if = "is_empty_vec")]
    pub processes: Vec<ProcessSnapshot>,
}

impl From<&Group> for GroupSnapshot {
    fn from(group: &Group) -> Self {
        Self {
            id: group.id,
            name: group.name.clone(),
            super_group: group.super_group.clone(),
            uuid: group.uuid.to_string(),
            life_status: group.life_status,
            restarts_initiated: group.restarts_initiated,
            processes_being_spawned: group.processes_being_spawned,
            spawning: group.spawning,
            restarting: group.restarting,
            capacity_used: group.capacity_used(),
            enabled_count: group.enabled_count(),
            disabling_count: group.disabling_count(),
            disabled_count: group.disabled_count(),
            detached_count: group.detached.len(),
            get_waitlist: group.get_waitlist.len(),
            disable_waitlist: group.disable_waitlist.len(),
            processes: group.all_processes().map(ProcessSnapshot::from).collect(),
        }
    }
}

impl GroupSnapshot {
    pub fn process_count(&self) -> usize {
        self.enabled_count + self.disabling_count + self.disabled_count
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperGroupSnapshot {
    pub name: String,
    pub state: SuperGroupState,
    pub generation: u64,
    pub get_waitlist: usize,
    #[serde(default, skip_serializing_if = "is_none")]
    pub default_group: Option<GroupId>,
    pub groups: Vec<GroupSnapshot>,
    /// Groups shut down by a restart or destroy that are still draining
    #[serde(default, skip_serializing_if = "is_empty_vec")]
    pub detached_groups: Vec<GroupSnapshot>,
}

impl SuperGroupSnapshot {
    fn new(super_group: &SuperGroup, state: &PoolState) -> Self {
        let snapshot = |ids: &[GroupId]| -> Vec<GroupSnapshot> {
            ids.iter()
                .filter_map(|id| state.table.groups.get(id))
                .map(GroupSnapshot::from)
                .collect()
        };
        Self {
            name: super_group.name.clone(),
            state: super_group.state,
            generation: super_group.generation,
            get_waitlist: super_group.get_waitlist.len(),
            default_group: super_group.default_group,
            groups: snapshot(&super_group.groups),
            detached_groups: snapshot(&super_group.detached_groups),
        }
    }

    pub fn default_group(&self) -> Option<&GroupSnapshot> {
        let id = self.default_group?;
        self.groups.iter().find(|g| g.id == id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub life_status: PoolLifeStatus,
    pub max: usize,
    pub capacity_used: usize,
    pub process_count: usize,
    pub get_waitlist: usize,
    pub super_groups: Vec<SuperGroupSnapshot>,
}

impl PoolSnapshot {
    pub(crate) fn capture(state: &PoolState) -> Self {
        let mut super_groups: Vec<SuperGroupSnapshot> = state
            .super_groups
            .values()
            .map(|sg| SuperGroupSnapshot::new(sg, state))
            .collect();
        super_groups.sort_by(|a, b| a.name.cmp(&b.name));
        Self {
            life_status: state.life_status,
            max: state.table.max,
            capacity_used: state.table.capacity_used(),
            process_count: state.table.process_count(),
            get_waitlist: state.get_waitlist.len(),
            super_groups,
        }
    }

    pub fn super_group(&self, name: &str) -> Option<&SuperGroupSnapshot> {
        self.super_groups.iter().find(|sg| sg.name == name)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
