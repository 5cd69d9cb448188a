use crate::error::PulseError;
use crate::telemetry::{noop_alarm_hook, noop_event_listener, AlarmTransitionHook, CoreEventListener};
use config::{Config, Environment, File};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Configuration options for the pulse core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Number of sampling periods covered by one chunk.
    pub chunk_point_count: usize,
    /// Fixed number of chunk-write worker threads.
    pub write_workers: usize,
    /// Maximum number of write tasks waiting for a worker before submissions are rejected.
    pub write_queue_capacity: usize,
    /// Minimum delay between two "write queue above half capacity" warnings.
    pub queue_warn_interval: Duration,
    /// Maximum number of paths read by one range query.
    pub query_batch_size: usize,
    /// Threads of the per-request read pool. `0` lets rayon pick (one per core).
    pub query_threads: usize,
    /// Size of the measure-transform pool.
    pub transform_workers: usize,
    /// Capacity of the rolling log buffer handed to script evaluations.
    pub script_log_capacity: usize,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn CoreEventListener>,
    /// Alarm transition extension point (no-op by default).
    pub alarm_hook: Arc<dyn AlarmTransitionHook>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            chunk_point_count: 1024,
            write_workers: 4,
            write_queue_capacity: 1024,
            queue_warn_interval: Duration::from_secs(30),
            query_batch_size: 16,
            query_threads: 0,
            transform_workers: 16,
            script_log_capacity: 1000,
            event_listener: noop_event_listener(),
            alarm_hook: noop_alarm_hook(),
        }
    }
}

impl CoreConfig {
    /// Rejects settings the pools and bucketing cannot work with.
    pub fn validate(&self) -> Result<(), PulseError> {
        let sizes = [
            ("chunk_point_count", self.chunk_point_count),
            ("write_workers", self.write_workers),
            ("write_queue_capacity", self.write_queue_capacity),
            ("query_batch_size", self.query_batch_size),
            ("transform_workers", self.transform_workers),
            ("script_log_capacity", self.script_log_capacity),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(PulseError::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }
}

/// Core settings as read from file + env. Every field optional for layering.
#[derive(Debug, Default, serde::Deserialize)]
pub struct CoreFileConfig {
    pub chunk_point_count: Option<usize>,
    pub write_workers: Option<usize>,
    pub write_queue_capacity: Option<usize>,
    pub queue_warn_interval_secs: Option<u64>,
    pub query_batch_size: Option<usize>,
    pub query_threads: Option<usize>,
    pub transform_workers: Option<usize>,
    pub script_log_capacity: Option<usize>,
}

/// Loads the merged configuration. A missing `path` means defaults + env only.
pub fn load_config(path: Option<&Path>) -> Result<CoreConfig, PulseError> {
    let mut builder = Config::builder();
    if let Some(path) = path {
        if !path.exists() {
            return Err(PulseError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(File::from(path));
    }
    builder = builder.add_source(
        Environment::with_prefix("PULSE")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let partial: CoreFileConfig = builder.build()?.try_deserialize()?;
    let mut config = CoreConfig::default();
    merge_into_config(&mut config, &partial);
    config.validate()?;
    Ok(config)
}

/// Merge file/env partial config onto `CoreConfig`. Only overwrites fields that are `Some`.
fn merge_into_config(base: &mut CoreConfig, partial: &CoreFileConfig) {
    if let Some(n) = partial.chunk_point_count {
        base.chunk_point_count = n;
    }
    if let Some(n) = partial.write_workers {
        base.write_workers = n;
    }
    if let Some(n) = partial.write_queue_capacity {
        base.write_queue_capacity = n;
    }
    if let Some(secs) = partial.queue_warn_interval_secs {
        base.queue_warn_interval = Duration::from_secs(secs);
    }
    if let Some(n) = partial.query_batch_size {
        base.query_batch_size = n;
    }
    if let Some(n) = partial.query_threads {
        base.query_threads = n;
    }
    if let Some(n) = partial.transform_workers {
        base.transform_workers = n;
    }
    if let Some(n) = partial.script_log_capacity {
        base.script_log_capacity = n;
    }
}
