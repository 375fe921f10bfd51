//! forge-kernel: a concurrent task dispatch and scheduling substrate for an
//! agent runtime. It owns no model, tool, or agent concepts itself — it
//! accepts arbitrary async callables as tasks, orders and gates their
//! execution through priority, dependency, resource, and circuit-breaker
//! policy, and reports progress and outcomes back to the caller.

pub mod breaker;
pub mod config;
pub mod dependency_graph;
pub mod error;
pub mod executor;
pub mod kernel;
pub mod persistence;
pub mod progress;
pub mod queue;
pub mod resource_pool;
pub mod scheduler;
pub mod task;

pub use breaker::{BreakerCallbacks, BreakerConfig, BreakerState, CircuitBreaker, CircuitBreakerRegistry};
pub use config::{BreakerSettings, ExecutorSettings, KernelConfig, ObservabilitySettings, QueueSettings, SchedulerSettings};
pub use dependency_graph::DependencyGraph;
pub use error::{KernelError, KernelResult};
pub use executor::{ExecutorMetrics, ParallelExecutor};
pub use kernel::Kernel;
pub use progress::{ProgressEvent, ProgressRegistry, ProgressState, ProgressTracker, ProgressTrackerHandle};
pub use queue::{QueueStats, TaskQueue};
pub use resource_pool::{ClassUtilization, ResourcePool};
pub use scheduler::{ScheduledTaskInfo, SpecFactory, TaskScheduler};
pub use task::{ResourceRequirement, Task, TaskContext, TaskHandle, TaskId, TaskResult, TaskSpec, TaskStatus};

/// Generates a fresh, globally-unique task identifier.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
