/*!
 * Application Options
 *
 * Routing and spawning configuration carried by every get request. The
 * first request for an application seeds the group's persistent copy;
 * later requests can only adjust the fields that are merged below.
 */

use crate::core::limits::{
    DEFAULT_MAX_OOBW_INSTANCES, DEFAULT_MAX_REQUEST_QUEUE_SIZE, DEFAULT_MIN_PROCESSES,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Application root directory; identifies the application when no group name is set
    pub app_root: String,
    #[serde(skip_serializing_if = "crate::core::serde::is_none")]
    pub app_group_name: Option<String>,
    pub app_type: String,
    pub environment: String,

    /// Processes the group keeps alive even when idle
    pub min_processes: usize,
    /// Upper bound on processes for this group, 0 = only the pool limit applies
    pub max_processes: usize,
    /// Sessions a process serves before it is recycled, 0 = unlimited
    pub max_requests: u64,
    /// Bound on queued get requests, 0 = unbounded
    pub max_request_queue_size: usize,
    pub max_out_of_band_work_instances: usize,
    /// Overrides the concurrency reported by the spawner
    #[serde(skip_serializing_if = "crate::core::serde::is_none")]
    pub force_max_concurrent_requests_per_process: Option<u32>,

    /// Per-request: route to the process owning this sticky session id (0 = none)
    #[serde(skip_serializing_if = "crate::core::serde::is_zero_u32")]
    pub sticky_session_id: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            app_root: String::new(),
            app_group_name: None,
            app_type: "generic".to_string(),
            environment: "production".to_string(),
            min_processes: DEFAULT_MIN_PROCESSES,
            max_processes: 0,
            max_requests: 0,
            max_request_queue_size: DEFAULT_MAX_REQUEST_QUEUE_SIZE,
            max_out_of_band_work_instances: DEFAULT_MAX_OOBW_INSTANCES,
            force_max_concurrent_requests_per_process: None,
            sticky_session_id: 0,
        }
    }
}

impl Options {
    pub fn new(app_root: impl Into<String>) -> Self {
        Self {
            app_root: app_root.into(),
            ..Self::default()
        }
    }

    /// Name of the application group this request belongs to
    pub fn app_group_name(&self) -> &str {
        match &self.app_group_name {
            Some(name) if !name.is_empty() => name,
            _ => &self.app_root,
        }
    }

    pub fn with_app_group_name(mut self, name: impl Into<String>) -> Self {
        self.app_group_name = Some(name.into());
        self
    }

    pub fn with_app_type(mut self, app_type: impl Into<String>) -> Self {
        self.app_type = app_type.into();
        self
    }

    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    pub fn with_min_processes(mut self, min: usize) -> Self {
        self.min_processes = min;
        self
    }

    pub fn with_max_processes(mut self, max: usize) -> Self {
        self.max_processes = max;
        self
    }

    pub fn with_max_requests(mut self, max: u64) -> Self {
        self.max_requests = max;
        self
    }

    pub fn with_max_request_queue_size(mut self, max: usize) -> Self {
        self.max_request_queue_size = max;
        self
    }

    pub fn with_max_out_of_band_work_instances(mut self, max: usize) -> Self {
        self.max_out_of_band_work_instances = max;
        self
    }

    pub fn with_forced_concurrency(mut self, concurrency: u32) -> Self {
        self.force_max_concurrent_requests_per_process = Some(concurrency);
        self
    }

    pub fn with_sticky_session_id(mut self, id: u32) -> Self {
        self.sticky_session_id = id;
        self
    }

    /// Copy suitable for storing in a group: per-request fields cleared
    pub fn persistent(&self) -> Self {
        let mut copy = self.clone();
        copy.clear_per_request_fields();
        copy
    }

    pub fn clear_per_request_fields(&mut self) {
        self.sticky_session_id = 0;
    }

    /// Fold the tunables of a later request into the persistent options.
    /// Returns whether anything changed.
    pub(crate) fn merge_from(&mut self, other: &Options) -> bool {
        let changed = self.min_processes != other.min_processes
            || self.max_requests != other.max_requests;
        self.min_processes = other.min_processes;
        self.max_requests = other.max_requests;
        changed
    }
}
