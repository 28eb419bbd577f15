/*!
 * Core Module
 * Shared types, errors, limits, configuration and the post-lock action list
 */

pub mod actions;
pub mod config;
pub mod errors;
pub mod limits;
pub mod serde;
pub mod threads;
pub mod types;

pub use actions::PostLockActions;
pub use config::PoolConfig;
pub use errors::{ConfigError, ConfigResult, GetError, GetResult, SpawnError, SpawnOutcome};
pub use threads::BackgroundThreads;
pub use types::{
    AttachResult, DisableResult, GroupId, Pid, ProcessId, RestartMethod, ShutdownResult,
    SpawnResult,
};
