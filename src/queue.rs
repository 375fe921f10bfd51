//! The Task Queue: a priority queue of ready work dispatched to a bounded
//! worker pool, with retry, timeout, cooperative cancellation, and optional
//! snapshotting. Grounded on `dukat/core/task_queue.py`'s `TaskQueue` and
//! rendered over the worker/channel shape of `layer4/src/executor.rs`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueSettings;
use crate::error::{KernelError, KernelResult};
use crate::persistence::{epoch_secs_now, TaskPersistence};
use crate::progress::{ProgressRegistry, ProgressTracker};
use crate::task::{QueueSnapshot, Task, TaskContext, TaskHandle, TaskId, TaskSpec, TaskStatus};

/// Per-status counts plus queue size and worker count, for [`TaskQueue::stats`].
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub worker_count: usize,
    pub queue_size: usize,
}

struct ReadyEntry {
    id: TaskId,
    priority: i64,
    sequence: u64,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for ReadyEntry {}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first; among equals, earlier insertion (lower
        // sequence) first. BinaryHeap is a max-heap, so FIFO requires
        // reversing the sequence comparison.
        self.priority.cmp(&other.priority).then_with(|| other.sequence.cmp(&self.sequence))
    }
}
impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueInner {
    tasks: std::collections::HashMap<TaskId, Arc<Task>>,
    ready: BinaryHeap<ReadyEntry>,
    sequence: u64,
}

impl QueueInner {
    fn pending_count(&self) -> usize {
        self.tasks.values().filter(|t| t.status() == TaskStatus::Pending).count()
    }
}

/// The queue's public façade: priority queue plus worker pool.
pub struct TaskQueue {
    settings: QueueSettings,
    inner: Mutex<QueueInner>,
    wake: Notify,
    progress: Arc<ProgressRegistry>,
    running: AtomicUsize,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    persistence: Option<TaskPersistence>,
    persistence_loop: Mutex<Option<JoinHandle<()>>>,
    started: AtomicUsize,
    submitted: AtomicU64,
}

impl TaskQueue {
    /// Constructs a stopped queue; call [`TaskQueue::start`] to spawn workers.
    pub fn new(settings: QueueSettings, progress: Arc<ProgressRegistry>) -> Arc<Self> {
        let persistence = settings
            .persistence_enabled
            .then(|| TaskPersistence::new(settings.persistence_dir.clone(), settings.max_history_files));

        Arc::new(Self {
            settings,
            inner: Mutex::new(QueueInner {
                tasks: std::collections::HashMap::new(),
                ready: BinaryHeap::new(),
                sequence: 0,
            }),
            wake: Notify::new(),
            progress,
            running: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
            persistence,
            persistence_loop: Mutex::new(None),
            started: AtomicUsize::new(0),
            submitted: AtomicU64::new(0),
        })
    }

    /// Registers `spec`'s task as PENDING. Rejects `QUEUE_FULL` at capacity
    /// and `DUPLICATE_ID` if the id is already tracked.
    pub async fn submit(self: &Arc<Self>, spec: TaskSpec) -> KernelResult<TaskHandle> {
        let id = spec.id.clone();
        let total_steps = spec.total_steps;
        let priority = spec.priority;

        let mut inner = self.inner.lock().await;
        if inner.tasks.contains_key(&id) {
            return Err(KernelError::DuplicateId(id));
        }
        if inner.pending_count() >= self.settings.max_queue_size {
            return Err(KernelError::QueueFull { capacity: self.settings.max_queue_size });
        }

        let task = Arc::new(Task::from_spec(spec));
        if let Some(total_steps) = total_steps {
            let tracker = ProgressTracker::new_steps(id.clone(), total_steps);
            tracker.start();
            self.progress.register(Arc::clone(&tracker));
            task.attach_progress(tracker);
        }

        inner.tasks.insert(id.clone(), task);
        let sequence = inner.sequence;
        inner.sequence += 1;
        inner.ready.push(ReadyEntry { id: id.clone(), priority, sequence });
        drop(inner);

        self.submitted.fetch_add(1, AtomicOrdering::Relaxed);
        self.wake.notify_one();
        Ok(TaskHandle { id })
    }

    /// Read-only lookup by id.
    pub async fn get(&self, id: &TaskId) -> Option<Arc<Task>> {
        self.inner.lock().await.tasks.get(id).cloned()
    }

    /// Transitions a PENDING or RUNNING task to CANCELLED.
    pub async fn cancel(&self, id: &TaskId) -> bool {
        let task = { self.inner.lock().await.tasks.get(id).cloned() };
        match task {
            Some(task) => {
                let changed = task.cancel();
                if changed {
                    self.progress.remove_if_terminal(id);
                }
                changed
            }
            None => false,
        }
    }

    /// Blocks until `id` reaches a terminal state or `timeout` elapses.
    /// Returns the stored result only for COMPLETED.
    pub async fn await_task(&self, id: &TaskId, timeout: Option<Duration>) -> Option<serde_json::Value> {
        let task = { self.inner.lock().await.tasks.get(id).cloned()? };
        let mut rx = task.watch_status();

        let wait = async {
            loop {
                if rx.borrow().is_terminal() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };

        match timeout {
            Some(d) => {
                if tokio::time::timeout(d, wait).await.is_err() {
                    return None;
                }
            }
            None => wait.await,
        }

        if task.status() == TaskStatus::Completed {
            task.result()
        } else {
            None
        }
    }

    /// Queue size, worker count, and per-status counts.
    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        let mut stats = QueueStats {
            worker_count: self.settings.worker_count,
            queue_size: inner.tasks.len(),
            ..Default::default()
        };
        for task in inner.tasks.values() {
            match task.status() {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }

    /// Idempotent: spawns `worker_count` workers and, if persistence is
    /// enabled, the periodic snapshot loop.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(1, AtomicOrdering::SeqCst) == 1 {
            return;
        }

        let mut workers = self.workers.lock().await;
        for index in 0..self.settings.worker_count {
            let queue = Arc::clone(self);
            let token = self.shutdown.clone();
            workers.push(tokio::spawn(async move {
                queue.worker_loop(index, token).await;
            }));
        }
        drop(workers);

        if self.persistence.is_some() {
            let queue = Arc::clone(self);
            let token = self.shutdown.clone();
            let interval = Duration::from_secs(self.settings.snapshot_interval_secs.max(1));
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = ticker.tick() => {
                            queue.snapshot().await;
                        }
                    }
                }
            });
            *self.persistence_loop.lock().await = Some(handle);
        }

        info!(workers = self.settings.worker_count, "task queue started");
    }

    /// Idempotent: signals shutdown, waits for in-flight tasks to finish
    /// their current run, then takes a final snapshot.
    pub async fn stop(self: &Arc<Self>) {
        if self.started.swap(0, AtomicOrdering::SeqCst) == 0 {
            return;
        }

        self.shutdown.cancel();
        self.wake.notify_waiters();

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        if let Some(handle) = self.persistence_loop.lock().await.take() {
            let _ = handle.await;
        }

        if self.persistence.is_some() {
            self.snapshot().await;
        }

        info!("task queue stopped");
    }

    async fn snapshot(&self) {
        let Some(persistence) = &self.persistence else { return };
        let inner = self.inner.lock().await;
        let tasks = inner
            .tasks
            .values()
            .filter(|t| !t.status().is_terminal())
            .map(|t| (t.id.clone(), t.to_snapshot_entry()))
            .collect();
        let snapshot = QueueSnapshot {
            timestamp: epoch_secs_now() as f64,
            max_workers: self.settings.worker_count,
            max_queue_size: self.settings.max_queue_size,
            tasks,
        };
        drop(inner);
        persistence.save(&snapshot).await;
    }

    /// Loads the latest snapshot (if persistence is enabled) purely for
    /// introspection; per the design this never re-creates executable tasks.
    pub async fn restore_latest_snapshot(&self) -> Option<QueueSnapshot> {
        match &self.persistence {
            Some(p) => p.load_latest().await,
            None => None,
        }
    }

    async fn worker_loop(self: Arc<Self>, index: usize, token: CancellationToken) {
        debug!(worker = index, "worker started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = self.next_ready() => {
                    match next {
                        Some(task) => self.run_task(task).await,
                        None => {
                            tokio::select! {
                                _ = token.cancelled() => break,
                                _ = self.wake.notified() => {},
                                _ = tokio::time::sleep(Duration::from_millis(self.settings.requeue_backoff_ms)) => {},
                            }
                        }
                    }
                }
            }
        }
        debug!(worker = index, "worker stopped");
    }

    /// Pops the highest-priority ready task: CANCELLED entries are skipped;
    /// tasks whose prerequisites are not all COMPLETED are re-queued with a
    /// minimal back-off instead of blocking the worker.
    async fn next_ready(&self) -> Option<Arc<Task>> {
        let mut inner = self.inner.lock().await;
        let mut deferred = Vec::new();

        let result = loop {
            let Some(entry) = inner.ready.pop() else { break None };
            let Some(task) = inner.tasks.get(&entry.id).cloned() else { continue };

            match task.status() {
                TaskStatus::Cancelled => continue,
                TaskStatus::Pending => {}
                _ => continue,
            }

            if self.prereqs_met(&inner, &task) {
                break Some(task);
            } else {
                deferred.push(entry);
            }
        };

        for entry in deferred {
            inner.ready.push(entry);
        }

        result
    }

    fn prereqs_met(&self, inner: &QueueInner, task: &Task) -> bool {
        task.prereqs.iter().all(|id| inner.tasks.get(id).map(|t| t.status() == TaskStatus::Completed).unwrap_or(false))
    }

    async fn run_task(self: &Arc<Self>, task: Arc<Task>) {
        if !task.mark_running() {
            debug!(task_id = %task.id, "skipped: task reached a terminal state before dispatch");
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

        match outcome {
            Ok(value) => {
                task.mark_completed(value);
                if let Some(progress) = task.progress() {
                    progress.complete();
                }
                self.progress.remove_if_terminal(&task.id);
                self.requeue_ready_dependents(&task.id).await;
            }
            Err(err) => self.handle_failure(task, err.to_string()).await,
        }
    }

    async fn handle_failure(self: &Arc<Self>, task: Arc<Task>, message: String) {
        if task.retries_left() > 0 {
            task.consume_retry();
            task.mark_pending_for_requeue();
            let delay = task.retry_delay;
            let queue = Arc::clone(self);
            let id = task.id.clone();
            let priority = task.priority;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let mut inner = queue.inner.lock().await;
                if inner.tasks.get(&id).map(|t| t.status() == TaskStatus::Pending).unwrap_or(false) {
                    let sequence = inner.sequence;
                    inner.sequence += 1;
                    inner.ready.push(ReadyEntry { id, priority, sequence });
                    drop(inner);
                    queue.wake.notify_one();
                }
            });
            return;
        }

        warn!(task_id = %task.id, error = %message, "task failed with no retries remaining");
        task.mark_failed(message);
        if let Some(progress) = task.progress() {
            progress.fail("task failed");
        }
        self.progress.remove_if_terminal(&task.id);
    }

    /// Dependents of a just-completed task already sit in `ready`; waking
    /// every worker is enough to re-evaluate them now that a prerequisite
    /// completed, avoiding the need to track dependents explicitly here
    /// (the Dependency Graph does that for the Parallel Executor instead).
    async fn requeue_ready_dependents(&self, _completed_id: &TaskId) {
        self.wake.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering as Ord2};
    use std::time::Duration;

    fn settings(worker_count: usize) -> QueueSettings {
        QueueSettings { worker_count, max_queue_size: 16, requeue_backoff_ms: 10, ..QueueSettings::default() }
    }

    fn ok(value: serde_json::Value) -> crate::task::TaskFuture {
        Box::pin(async move { Ok(value) })
    }

    #[tokio::test]
    async fn priority_then_fifo_ordering_s1() {
        let queue = TaskQueue::new(settings(1), Arc::new(ProgressRegistry::new()));
        queue.start().await;

        let order = Arc::new(Mutex::new(Vec::new()));

        for (id, priority) in [("a", 0i64), ("b", 5), ("c", 5)] {
            let order = Arc::clone(&order);
            let id_owned = id.to_string();
            let spec = TaskSpec::new(id, move |_ctx| {
                let order = Arc::clone(&order);
                let id_owned = id_owned.clone();
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    order.lock().await.push(id_owned.clone());
                    Ok(serde_json::json!(id_owned))
                })
            })
            .priority(priority);
            queue.submit(spec).await.unwrap();
        }

        queue.await_task(&"a".to_string(), None).await;
        queue.await_task(&"b".to_string(), None).await;
        queue.await_task(&"c".to_string(), None).await;
        queue.stop().await;

        let observed = order.lock().await.clone();
        assert_eq!(observed, vec!["b".to_string(), "c".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn retry_then_succeed_s2() {
        let queue = TaskQueue::new(settings(1), Arc::new(ProgressRegistry::new()));
        queue.start().await;

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let spec = TaskSpec::new("r", move |_ctx| {
            let calls = Arc::clone(&calls_clone);
            Box::pin(async move {
                if calls.fetch_add(1, Ord2::SeqCst) == 0 {
                    anyhow::bail!("transient failure");
                }
                Ok(serde_json::json!("ok"))
            })
        })
        .retries(1, Duration::from_millis(10));

        queue.submit(spec).await.unwrap();
        let result = queue.await_task(&"r".to_string(), Some(Duration::from_secs(2))).await;
        queue.stop().await;

        assert_eq!(result, Some(serde_json::json!("ok")));
        assert_eq!(calls.load(Ord2::SeqCst), 2);
    }

    #[tokio::test]
    async fn submit_rejects_duplicate_id() {
        let queue = TaskQueue::new(settings(0), Arc::new(ProgressRegistry::new()));

        let spec = TaskSpec::new("dup", |_ctx| ok(serde_json::json!(null)));
        queue.submit(spec).await.unwrap();

        let dup = TaskSpec::new("dup", |_ctx| ok(serde_json::json!(null)));
        assert!(matches!(queue.submit(dup).await, Err(KernelError::DuplicateId(_))));
    }

    #[tokio::test]
    async fn submit_rejects_when_pending_backlog_is_at_capacity() {
        let queue = TaskQueue::new(
            QueueSettings { worker_count: 0, max_queue_size: 1, ..QueueSettings::default() },
            Arc::new(ProgressRegistry::new()),
        );

        queue.submit(TaskSpec::new("first", |_ctx| ok(serde_json::json!(null)))).await.unwrap();
        let result = queue.submit(TaskSpec::new("second", |_ctx| ok(serde_json::json!(null)))).await;
        assert!(matches!(result, Err(KernelError::QueueFull { capacity: 1 })));
    }

    #[tokio::test]
    async fn cancel_already_terminal_task_is_a_no_op() {
        let queue = TaskQueue::new(settings(1), Arc::new(ProgressRegistry::new()));
        queue.start().await;
        queue.submit(TaskSpec::new("done", |_ctx| ok(serde_json::json!(1)))).await.unwrap();
        queue.await_task(&"done".to_string(), Some(Duration::from_secs(2))).await;

        assert!(!queue.cancel(&"done".to_string()).await);
        queue.stop().await;
    }
}
