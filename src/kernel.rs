//! The Kernel façade: the single entry point a host application embeds,
//! wiring the Task Queue, Parallel Executor, Task Scheduler, circuit breaker
//! registry, and progress registry together under one configuration and one
//! shutdown signal. Grounded on the teacher's `platform::service` /
//! `platform::runtime` pairing, which plays the same "own the subsystems,
//! expose one start/shutdown pair" role for the rest of the platform.

use std::sync::Arc;

use tracing::info;

use crate::breaker::{BreakerConfig, CircuitBreakerRegistry};
use crate::config::KernelConfig;
use crate::executor::ParallelExecutor;
use crate::progress::ProgressRegistry;
use crate::queue::TaskQueue;
use crate::scheduler::TaskScheduler;

/// Owns one instance of every kernel subsystem for the lifetime of a
/// process. Construct with [`Kernel::start`]; release resources with
/// [`Kernel::shutdown`].
pub struct Kernel {
    config: KernelConfig,
    queue: Arc<TaskQueue>,
    scheduler: Arc<TaskScheduler>,
    breakers: Arc<CircuitBreakerRegistry>,
    progress: Arc<ProgressRegistry>,
}

impl Kernel {
    /// Builds every subsystem from `config` and starts the Task Queue's
    /// worker pool and the Task Scheduler's dispatch loop. The Parallel
    /// Executor is stateless between batches and is constructed fresh by
    /// callers via [`Kernel::new_executor`] rather than held here.
    pub async fn start(config: KernelConfig) -> Arc<Self> {
        let progress = Arc::new(ProgressRegistry::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerConfig {
            failure_threshold: config.breakers.failure_threshold,
            recovery_timeout: std::time::Duration::from_secs(config.breakers.recovery_timeout_secs),
        }));
        let queue = TaskQueue::new(config.queue.clone(), Arc::clone(&progress));
        queue.start().await;

        let scheduler = TaskScheduler::new(config.scheduler.clone(), Arc::clone(&queue));
        scheduler.start().await;

        info!("kernel started");
        Arc::new(Self { config, queue, scheduler, breakers, progress })
    }

    /// Builds a new Parallel Executor sharing this kernel's breaker
    /// registry, scoped to a single batch of related tasks.
    pub fn new_executor(&self) -> ParallelExecutor {
        ParallelExecutor::new(self.config.executor.clone(), Arc::clone(&self.breakers))
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn progress(&self) -> &Arc<ProgressRegistry> {
        &self.progress
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Stops the scheduler's dispatch loop and the queue's worker pool,
    /// writing a final snapshot if persistence is enabled.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.queue.stop().await;
        info!("kernel shut down");
    }
}

/// Initializes the process-wide tracing subscriber from
/// `KernelConfig::observability`. The library itself never calls this on a
/// caller's behalf; embedding applications that want the kernel's structured
/// logs opt in explicitly, typically from `main`.
pub fn init_logging(settings: &crate::config::ObservabilitySettings) {
    let filter = tracing_subscriber::EnvFilter::try_new(&settings.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;
    use std::time::Duration;

    #[tokio::test]
    async fn start_submit_await_shutdown_round_trip() {
        let kernel = Kernel::start(KernelConfig::default()).await;

        let handle = kernel
            .queue()
            .submit(TaskSpec::new("k1", |_ctx| Box::pin(async { Ok(serde_json::json!("done")) })))
            .await
            .unwrap();

        let result = kernel.queue().await_task(&handle.id, Some(Duration::from_secs(1))).await;
        assert_eq!(result, Some(serde_json::json!("done")));

        kernel.shutdown().await;
    }
}
