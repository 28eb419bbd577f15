/*!
 * App Pool Library
 * Application process pool: routing, admission control and lifecycle of
 * worker processes behind a front-end server
 */

pub mod core;
pub mod monitoring;
pub mod pool;
pub mod spawner;

// Re-exports
pub use crate::core::{
    AttachResult, ConfigError, ConfigResult, DisableResult, GetError, GetResult, GroupId, Pid,
    PoolConfig, ProcessId, RestartMethod, ShutdownResult, SpawnError, SpawnResult,
};
pub use monitoring::init_tracing;
pub use pool::{
    EnabledStatus, GcReport, GroupLifeStatus, GroupSnapshot, OobwStatus, Options, Pool,
    PoolBuilder, PoolLifeStatus, PoolSnapshot, ProcessLifeStatus, ProcessSnapshot, Session,
    SuperGroupSnapshot, SuperGroupState,
};
pub use spawner::{
    DummyController, DummySpawnerFactory, SpawnedProcess, Spawner, SpawnerFactory, WorkerHandle,
};
