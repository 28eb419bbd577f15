/*!
 * Pool Builder
 * Builder pattern for Pool construction
 */

use super::gc::run_garbage_collector;
use super::state::Shared;
use super::Pool;
use crate::core::config::PoolConfig;
use crate::core::errors::{ConfigError, ConfigResult};
use crate::spawner::SpawnerFactory;
use std::sync::Arc;
use tracing::{info, warn};

/// Builder for Pool
pub struct PoolBuilder {
    config: PoolConfig,
    factory: Option<Arc<dyn SpawnerFactory>>,
    garbage_collector: bool,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolBuilder {
    /// Create a new Pool builder with default configuration
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
            factory: None,
            garbage_collector: true,
        }
    }

    /// Replace the whole configuration
    pub fn with_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the spawner factory (required)
    pub fn with_spawner_factory<F>(mut self, factory: F) -> Self
    where
        F: SpawnerFactory + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Set a spawner factory that is shared with other owners
    pub fn with_shared_spawner_factory(mut self, factory: Arc<dyn SpawnerFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Do not start the garbage collector thread; `Pool::garbage_collect`
    /// still works
    pub fn without_garbage_collector(mut self) -> Self {
        self.garbage_collector = false;
        self
    }

    /// Build the Pool
    pub fn build(self) -> ConfigResult<Pool> {
        self.config.validate()?;
        let factory = self
            .factory
            .ok_or_else(|| ConfigError::Invalid("a spawner factory is required".into()))?;

        let shared = Shared::new(self.config, factory);
        if self.garbage_collector && !shared.config.max_idle_time.is_zero() {
            shared.state.lock().gc_running = true;
            let pool = Arc::downgrade(&shared);
            if let Err(err) = shared
                .threads
                .spawn("Pool garbage collector", move || run_garbage_collector(pool))
            {
                warn!(error = %err, "Garbage collector disabled");
                shared.state.lock().gc_running = false;
            }
        }

        info!(
            max_pool_size = shared.config.max_pool_size,
            max_idle_secs = shared.config.max_idle_time.as_secs(),
            self_checking = shared.config.self_checking,
            "Pool started"
        );
        Ok(Pool { shared })
    }
}
