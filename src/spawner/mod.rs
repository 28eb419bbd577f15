/*!
 * Spawner Module
 * Boundary to the process-starting collaborator plus an in-memory implementation
 */

pub mod dummy;
pub mod traits;

pub use dummy::{DummyController, DummySpawner, DummySpawnerFactory, DummyWorker};
pub use traits::{SpawnedProcess, Spawner, SpawnerFactory, WorkerHandle};

#[cfg(test)]
pub use traits::MockSpawner;
