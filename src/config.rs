//! Layered configuration for the kernel, following the same
//! file-then-environment overlay the rest of the platform uses.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_PATH: &str = "configs/kernel.toml";

/// Root configuration for a [`crate::kernel::Kernel`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Task Queue worker pool and persistence settings.
    pub queue: QueueSettings,
    /// Parallel Executor concurrency settings.
    pub executor: ExecutorSettings,
    /// Task Scheduler polling settings.
    pub scheduler: SchedulerSettings,
    /// Default circuit breaker parameters for newly registered breakers.
    pub breakers: BreakerSettings,
    /// Logging configuration.
    pub observability: ObservabilitySettings,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            queue: QueueSettings::default(),
            executor: ExecutorSettings::default(),
            scheduler: SchedulerSettings::default(),
            breakers: BreakerSettings::default(),
            observability: ObservabilitySettings::default(),
        }
    }
}

impl KernelConfig {
    /// Load configuration from the default path, if present, overlaid with
    /// `KERNEL__`-prefixed environment variables.
    pub fn load() -> Result<Self> {
        Self::load_from_path(None::<PathBuf>)
    }

    /// Load configuration from an explicit path in addition to the default
    /// search path and environment overrides.
    pub fn load_from_path<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = Config::builder().add_source(
            File::from(PathBuf::from(DEFAULT_CONFIG_PATH))
                .format(FileFormat::Toml)
                .required(false),
        );

        if let Some(path) = path {
            builder = builder.add_source(
                File::from(path.as_ref())
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        builder = builder.add_source(Environment::with_prefix("KERNEL").separator("__"));

        let config = builder.build()?;
        config.try_deserialize().context("invalid kernel configuration")
    }
}

/// Task Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Number of worker loops to spawn.
    pub worker_count: usize,
    /// Maximum number of pending (not yet dispatched) tasks.
    pub max_queue_size: usize,
    /// Back-off applied when a task's prerequisites are not yet met.
    pub requeue_backoff_ms: u64,
    /// Whether periodic and shutdown snapshots are written to disk.
    pub persistence_enabled: bool,
    /// Directory snapshots are written to, when persistence is enabled.
    pub persistence_dir: String,
    /// Interval between periodic snapshots, in seconds.
    pub snapshot_interval_secs: u64,
    /// Number of newest snapshot files retained on disk.
    pub max_history_files: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_queue_size: 10_000,
            requeue_backoff_ms: 100,
            persistence_enabled: false,
            persistence_dir: "data/tasks".to_string(),
            snapshot_interval_secs: 60,
            max_history_files: 5,
        }
    }
}

/// Parallel Executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Maximum number of tasks launched concurrently within a batch.
    pub max_concurrency: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self { max_concurrency: 8 }
    }
}

/// Task Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// How often the dispatch loop wakes to check the min-heap, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { poll_interval_ms: 1_000 }
    }
}

/// Default parameters applied to a breaker the first time it is referenced
/// by name, unless the caller registers one explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures before a breaker opens.
    pub failure_threshold: u32,
    /// Seconds after the last failure before an open breaker half-opens.
    pub recovery_timeout_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 30,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// `tracing_subscriber` env-filter directive, e.g. `"info"` or `"forge_kernel=debug"`.
    pub log_level: String,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self { log_level: "info".to_string() }
    }
}
