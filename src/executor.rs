//! The Parallel Executor: runs a one-shot batch respecting the dependency
//! graph, per-class resource budgets, and named circuit breakers, under a
//! global concurrency cap distinct from the Task Queue's worker count.
//! Grounded on `dukat/core/parallel_executor.py`'s `ParallelTaskExecutor`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::breaker::{BreakerState, CircuitBreakerRegistry};
use crate::config::ExecutorSettings;
use crate::dependency_graph::DependencyGraph;
use crate::error::{KernelError, KernelResult};
use crate::resource_pool::{ClassUtilization, ResourcePool};
use crate::task::{Task, TaskContext, TaskId, TaskResult, TaskSpec, TaskStatus};

struct Registered {
    task: Arc<Task>,
}

/// Per-status counts, per-resource utilisation, and per-breaker state
/// returned by [`ParallelExecutor::metrics`].
#[derive(Debug, Clone, Default)]
pub struct ExecutorMetrics {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub resources: Vec<ClassUtilization>,
    pub breakers: HashMap<String, BreakerState>,
}

/// A one-shot batch execution engine.
pub struct ParallelExecutor {
    settings: ExecutorSettings,
    breakers: Arc<CircuitBreakerRegistry>,
    graph: Mutex<DependencyGraph>,
    tasks: Mutex<HashMap<TaskId, Registered>>,
    pool: Arc<ResourcePool>,
}

impl ParallelExecutor {
    pub fn new(settings: ExecutorSettings, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self {
            settings,
            breakers,
            graph: Mutex::new(DependencyGraph::new()),
            tasks: Mutex::new(HashMap::new()),
            pool: Arc::new(ResourcePool::new()),
        }
    }

    /// Registers `spec` along with its prerequisites; prerequisites need not
    /// already be registered (they must be by the time `execute_all` runs).
    pub async fn add(&self, spec: TaskSpec, prereqs: impl IntoIterator<Item = TaskId>) {
        let id = spec.id.clone();
        let task = Arc::new(Task::from_spec(spec));

        let mut graph = self.graph.lock().await;
        graph.add_node(&id);
        for prereq in prereqs {
            graph.add_edge(&id, &prereq);
        }
        drop(graph);

        self.tasks.lock().await.insert(id, Registered { task });
    }

    /// Drives the registered graph to completion. Refuses `CYCLE_DETECTED`
    /// up front; never partially launches a cyclic graph.
    pub async fn execute_all(&self) -> KernelResult<HashMap<TaskId, Option<TaskResult>>> {
        {
            let graph = self.graph.lock().await;
            if let Some(culprit) = graph.find_cycle() {
                return Err(KernelError::CycleDetected(culprit));
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let mut completed: HashSet<TaskId> = HashSet::new();

        loop {
            let ready_ids = self.ready_cohort(&completed).await;
            if ready_ids.is_empty() {
                break;
            }

            let mut handles = Vec::new();
            for id in ready_ids {
                let Some(task) = self.tasks.lock().await.get(&id).map(|r| Arc::clone(&r.task)) else { continue };
                if task.status().is_terminal() {
                    continue;
                }

                let permit = Arc::clone(&semaphore).acquire_owned().await.expect("semaphore not closed");
                let breakers = Arc::clone(&self.breakers);
                let pool = Arc::clone(&self.pool);
                let pool_task_id = id.clone();
                handles.push(tokio::spawn(Self::launch(task, permit, breakers, pool_task_id, pool)));
            }

            for handle in handles {
                let _ = handle.await;
            }

            let newly_completed: Vec<TaskId> = {
                let tasks = self.tasks.lock().await;
                tasks
                    .iter()
                    .filter(|(id, r)| !completed.contains(*id) && r.task.status() == TaskStatus::Completed)
                    .map(|(id, _)| id.clone())
                    .collect()
            };

            if newly_completed.is_empty() {
                // Nothing new completed this cohort (everything failed,
                // was cancelled, or is still running elsewhere) — avoid
                // spinning forever on an unreachable ready set.
                break;
            }
            completed.extend(newly_completed);
        }

        let tasks = self.tasks.lock().await;
        Ok(tasks
            .iter()
            .map(|(id, r)| {
                let result = if r.task.status() == TaskStatus::Completed { r.task.result() } else { None };
                (id.clone(), result)
            })
            .collect())
    }

    /// Cancels `id`; if `cascade`, recursively cancels every transitive
    /// dependent too. Releases any resources the task held.
    pub async fn cancel(&self, id: &TaskId, cascade: bool) {
        let targets: Vec<TaskId> = if cascade {
            let graph = self.graph.lock().await;
            let mut all = graph.transitive_dependents(id);
            all.insert(id.clone());
            all.into_iter().collect()
        } else {
            vec![id.clone()]
        };

        let tasks = self.tasks.lock().await;
        for target in targets {
            if let Some(registered) = tasks.get(&target) {
                registered.task.cancel();
                self.pool.release(&target);
            }
        }
    }

    /// Per-status counts, per-class utilisation, and per-breaker state.
    pub async fn metrics(&self) -> ExecutorMetrics {
        let tasks = self.tasks.lock().await;
        let mut metrics = ExecutorMetrics { resources: self.pool.metrics(), breakers: self.breakers.states(), ..Default::default() };
        for registered in tasks.values() {
            match registered.task.status() {
                TaskStatus::Pending => metrics.pending += 1,
                TaskStatus::Running => metrics.running += 1,
                TaskStatus::Completed => metrics.completed += 1,
                TaskStatus::Failed => metrics.failed += 1,
                TaskStatus::Cancelled => metrics.cancelled += 1,
            }
        }
        metrics
    }

    /// Tasks not yet terminal whose prerequisites are all COMPLETED,
    /// ordered by priority then lexicographic id for launch order. If the
    /// registered graph has no edges at all, every non-terminal task is
    /// ready at once — the shortcut the design requires for the common case.
    async fn ready_cohort(&self, completed: &HashSet<TaskId>) -> Vec<TaskId> {
        let graph = self.graph.lock().await;
        let tasks = self.tasks.lock().await;

        let mut ready: Vec<TaskId> = if graph_has_no_edges(&graph) {
            tasks
                .iter()
                .filter(|(id, r)| !completed.contains(*id) && !r.task.status().is_terminal())
                .map(|(id, _)| id.clone())
                .collect()
        } else {
            graph
                .ready(completed)
                .into_iter()
                .filter(|id| tasks.get(id).map(|r| !r.task.status().is_terminal()).unwrap_or(false))
                .collect()
        };

        ready.sort_by(|a, b| {
            let pa = tasks.get(a).map(|r| r.task.priority).unwrap_or(0);
            let pb = tasks.get(b).map(|r| r.task.priority).unwrap_or(0);
            pb.cmp(&pa).then_with(|| a.cmp(b))
        });
        ready
    }

    async fn launch(
        task: Arc<Task>,
        permit: tokio::sync::OwnedSemaphorePermit,
        breakers: Arc<CircuitBreakerRegistry>,
        id: TaskId,
        pool: Arc<ResourcePool>,
    ) {
        let _permit = permit;

        let breaker = task.breaker_name.as_ref().map(|name| breakers.get_or_create(name));
        if let Some(breaker) = &breaker {
            if breaker.is_open() {
                task.mark_failed("circuit is open");
                debug!(task_id = %id, breaker = breaker.name(), "refused: circuit open");
                return;
            }
        }

        if !pool.try_allocate(&id, &task.resources) {
            task.mark_failed("resource unavailable");
            warn!(task_id = %id, "failed: resource allocation could not be satisfied");
            return;
        }

        if !task.mark_running() {
            pool.release(&id);
            debug!(task_id = %id, "skipped: task reached a terminal state before dispatch");
            return;
        }
        let context = TaskContext::new(task.progress(), task.cancel.clone());
        let invocation = (task.callable)(context);

        let outcome = match task.timeout {
            Some(d) => match tokio::time::timeout(d, invocation).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("timed out")),
            },
            None => invocation.await,
        };

        pool.release(&id);

        match outcome {
            Ok(value) => {
                task.mark_completed(value);
                if let Some(breaker) = &breaker {
                    breaker.record_success();
                }
            }
            Err(err) => {
                task.mark_failed(err.to_string());
                if let Some(breaker) = &breaker {
                    breaker.record_failure(false);
                }
            }
        }
    }
}

fn graph_has_no_edges(graph: &DependencyGraph) -> bool {
    graph.nodes().all(|id| graph.prereqs_of(id).is_empty())
}
