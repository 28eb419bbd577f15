/*!
 * Core Types
 * Identifiers and admission outcome enums shared across the pool
 */

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Identifiers
// ============================================================================

/// OS process id reported by the spawner
pub type Pid = u32;

/// Pool-unique process identity, never reused within one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub u64);

/// Pool-unique group identity, never reused within one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

// ============================================================================
// Admission Outcomes
// ============================================================================

/// Outcome of attaching a freshly spawned process to a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachResult {
    Ok,
    GroupUpperLimitsReached,
    PoolAtFullCapacity,
    AnotherGroupIsWaitingForCapacity,
}

/// Outcome of disabling a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableResult {
    /// The process is now disabled
    Success,
    /// The process is draining; the callback fires later
    Deferred,
    /// Nothing to do, the process was already disabled or detached
    Noop,
    /// Refused, or the replacement spawn failed
    Error,
    /// The process was re-enabled before the disable completed
    Canceled,
}

/// Outcome reported to destroy/shutdown callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownResult {
    Success,
    Canceled,
}

/// Outcome of asking a group to spawn a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnResult {
    Ok,
    InProgress,
    ErrRestarting,
    ErrGroupUpperLimitsReached,
    ErrPoolAtFullCapacity,
    ErrThreadCreation,
}

/// How a group restart is carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartMethod {
    /// The SuperGroup builds a fresh group while the old one keeps serving
    #[default]
    Rolling,
    /// The group detaches all of its processes and respawns in place
    Blocking,
}
