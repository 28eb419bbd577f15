/*!
 * Pool Configuration
 *
 * Pool-wide settings, loaded from defaults, from environment variables or
 * deserialized by an embedding application. Per-application settings live in
 * `pool::Options`.
 */

use super::errors::{ConfigError, ConfigResult};
use super::limits::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable names understood by `PoolConfig::from_env`
pub mod env {
    pub const MAX_SIZE: &str = "APP_POOL_MAX_SIZE";
    pub const MAX_IDLE_SECS: &str = "APP_POOL_MAX_IDLE_SECS";
    pub const DETACHED_CHECK_MS: &str = "APP_POOL_DETACHED_CHECK_MS";
    pub const SHUTDOWN_TIMEOUT_SECS: &str = "APP_POOL_SHUTDOWN_TIMEOUT_SECS";
    pub const SELF_CHECKING: &str = "APP_POOL_SELF_CHECKING";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of processes across all applications
    pub max_pool_size: usize,
    /// Idle processes and applications are retired after this long; zero disables the collector
    #[serde(with = "crate::core::serde::duration_millis")]
    pub max_idle_time: Duration,
    #[serde(with = "crate::core::serde::duration_millis")]
    pub detached_check_interval: Duration,
    #[serde(with = "crate::core::serde::duration_millis")]
    pub process_shutdown_timeout: Duration,
    #[serde(with = "crate::core::serde::duration_millis")]
    pub destroy_poll_interval: Duration,
    #[serde(with = "crate::core::serde::duration_millis")]
    pub oobw_timeout: Duration,
    /// Run the expensive invariant checks on every commit
    pub self_checking: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            max_idle_time: DEFAULT_MAX_IDLE_TIME,
            detached_check_interval: DEFAULT_DETACHED_CHECK_INTERVAL,
            process_shutdown_timeout: DEFAULT_PROCESS_SHUTDOWN_TIMEOUT,
            destroy_poll_interval: DEFAULT_DESTROY_POLL_INTERVAL,
            oobw_timeout: DEFAULT_OOBW_TIMEOUT,
            self_checking: false,
        }
    }
}

impl PoolConfig {
    /// Short intervals and self checking, for tests and local experiments
    pub fn testing() -> Self {
        Self {
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            max_idle_time: Duration::ZERO,
            detached_check_interval: Duration::from_millis(5),
            process_shutdown_timeout: Duration::from_secs(2),
            destroy_poll_interval: Duration::from_millis(2),
            oobw_timeout: Duration::from_secs(2),
            self_checking: true,
        }
    }

    pub fn with_max_pool_size(mut self, max: usize) -> Self {
        self.max_pool_size = max;
        self
    }

    pub fn with_max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = idle;
        self
    }

    pub fn with_self_checking(mut self, enabled: bool) -> Self {
        self.self_checking = enabled;
        self
    }

    /// Defaults overridden by any `APP_POOL_*` variables that are set
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an injectable variable source
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(env::MAX_SIZE) {
            config.max_pool_size = parse_number(env::MAX_SIZE, &value)? as usize;
        }
        if let Some(value) = lookup(env::MAX_IDLE_SECS) {
            config.max_idle_time = Duration::from_secs(parse_number(env::MAX_IDLE_SECS, &value)?);
        }
        if let Some(value) = lookup(env::DETACHED_CHECK_MS) {
            config.detached_check_interval =
                Duration::from_millis(parse_number(env::DETACHED_CHECK_MS, &value)?);
        }
        if let Some(value) = lookup(env::SHUTDOWN_TIMEOUT_SECS) {
            config.process_shutdown_timeout =
                Duration::from_secs(parse_number(env::SHUTDOWN_TIMEOUT_SECS, &value)?);
        }
        if let Some(value) = lookup(env::SELF_CHECKING) {
            config.self_checking = parse_bool(env::SELF_CHECKING, &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_pool_size == 0 {
            return Err(ConfigError::Invalid("max_pool_size must be at least 1".into()));
        }
        if self.detached_check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "detached_check_interval must be non-zero".into(),
            ));
        }
        if self.destroy_poll_interval.is_zero() {
            return Err(ConfigError::Invalid("destroy_poll_interval must be non-zero".into()));
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> ConfigResult<u64> {
    value.trim().parse::<u64>().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> ConfigResult<bool> {
    match value.trim() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
