//! The `Task` type: identity, policy, mutable lifecycle state, and the
//! callable contract a submitter hands to the queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::progress::ProgressTrackerHandle;

/// Stable identifier for a task. Caller-supplied or generated with
/// [`crate::generate_id`].
pub type TaskId = String;

/// Value stored in a task's result slot on success.
pub type TaskResult = serde_json::Value;

/// Future returned by a task callable.
pub type TaskFuture = BoxFuture<'static, anyhow::Result<TaskResult>>;

/// A task's callable. Consumed exactly once by the worker that dispatches it;
/// on retry a fresh clone of the originating spec is not required because the
/// callable is reinvoked in place (it must be idempotent-safe to call again).
pub type TaskCallable = Box<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>;

/// Context handed to a callable at invocation time: the injected progress
/// handle (when the task declared `total_steps`/`description`) and the
/// cooperative cancellation signal.
#[derive(Clone)]
pub struct TaskContext {
    progress: Option<ProgressTrackerHandle>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(progress: Option<ProgressTrackerHandle>, cancel: CancellationToken) -> Self {
        Self { progress, cancel }
    }

    /// The progress handle for this task's run, if one was attached.
    pub fn progress(&self) -> Option<&ProgressTrackerHandle> {
        self.progress.as_ref()
    }

    /// True once the queue has requested cancellation of this task.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation has been requested; callables that run in
    /// a loop should `select!` against this.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Lifecycle status of a task. [`TaskStatus::Completed`], [`TaskStatus::Failed`],
/// and [`TaskStatus::Cancelled`] are terminal: no further transition is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Queued, not yet picked up by a worker.
    Pending,
    /// Picked up and currently executing.
    Running,
    /// Finished successfully; a result is stored.
    Completed,
    /// Finished unsuccessfully; an error is stored.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// A fractional, optionally-exclusive claim on a named resource class.
/// See [`crate::resource_pool::ResourcePool`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRequirement {
    /// Resource class name (`"cpu"`, `"memory"`, `"gpu"`, or any caller-chosen name).
    pub class: String,
    /// Fraction of the class's budget required, in `[0, 1]`.
    pub amount: f64,
    /// If true, no other holder (shared or exclusive) may hold this class concurrently.
    pub exclusive: bool,
}

impl ResourceRequirement {
    /// Convenience constructor for a shared (non-exclusive) requirement.
    pub fn shared(class: impl Into<String>, amount: f64) -> Self {
        Self { class: class.into(), amount, exclusive: false }
    }

    /// Convenience constructor for an exclusive requirement.
    pub fn exclusive(class: impl Into<String>, amount: f64) -> Self {
        Self { class: class.into(), amount, exclusive: true }
    }
}

/// The caller-facing description of a unit of work to submit.
pub struct TaskSpec {
    pub(crate) id: TaskId,
    pub(crate) priority: i64,
    pub(crate) timeout: Option<Duration>,
    pub(crate) retry_count: u32,
    pub(crate) retry_delay: Duration,
    pub(crate) prereqs: Vec<TaskId>,
    pub(crate) resources: Vec<ResourceRequirement>,
    pub(crate) breaker_name: Option<String>,
    pub(crate) total_steps: Option<u64>,
    pub(crate) description: Option<String>,
    pub(crate) callable: TaskCallable,
}

impl TaskSpec {
    /// Start building a spec around `id` and a callable.
    pub fn new<F>(id: impl Into<TaskId>, callable: F) -> Self
    where
        F: Fn(TaskContext) -> TaskFuture + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            priority: 0,
            timeout: None,
            retry_count: 0,
            retry_delay: Duration::from_millis(0),
            prereqs: Vec::new(),
            resources: Vec::new(),
            breaker_name: None,
            total_steps: None,
            description: None,
            callable: Box::new(callable),
        }
    }

    /// Larger values are dispatched earlier.
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Bound execution to `timeout`; expiry is treated as a failure subject
    /// to the same retry budget as any other callable error.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Non-negative retry budget consumed on failure (including timeout).
    pub fn retries(mut self, count: u32, delay: Duration) -> Self {
        self.retry_count = count;
        self.retry_delay = delay;
        self
    }

    /// Ids that must reach [`TaskStatus::Completed`] before this task is ready.
    pub fn depends_on(mut self, prereqs: impl IntoIterator<Item = TaskId>) -> Self {
        self.prereqs = prereqs.into_iter().collect();
        self
    }

    /// Resource classes this task must atomically hold while running.
    pub fn requires(mut self, resources: impl IntoIterator<Item = ResourceRequirement>) -> Self {
        self.resources = resources.into_iter().collect();
        self
    }

    /// Name of the circuit breaker guarding this task's execution.
    pub fn breaker(mut self, name: impl Into<String>) -> Self {
        self.breaker_name = Some(name.into());
        self
    }

    /// Attaches a step-based progress tracker with `total_steps` steps.
    pub fn with_progress(mut self, total_steps: u64, description: impl Into<String>) -> Self {
        self.total_steps = Some(total_steps);
        self.description = Some(description.into());
        self
    }

    /// The id this spec will be registered under.
    pub fn id(&self) -> &TaskId {
        &self.id
    }
}

/// A lightweight reference returned from `submit`; carries just enough to
/// look the task back up or await it.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub id: TaskId,
}

/// Mutable lifecycle state guarded by a single lock per task, matching the
/// "a worker holds no locks during callable execution" discipline: this lock
/// is only ever held for the duration of a field read/write, never across an
/// `.await` on the callable itself.
struct TaskState {
    status: TaskStatus,
    started_at: Option<SystemTime>,
    completed_at: Option<SystemTime>,
    result: Option<TaskResult>,
    error: Option<String>,
    progress: Option<ProgressTrackerHandle>,
}

/// A registered task: identity, policy, and current lifecycle state.
pub struct Task {
    pub id: TaskId,
    pub priority: i64,
    pub timeout: Option<Duration>,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub prereqs: Vec<TaskId>,
    pub resources: Vec<ResourceRequirement>,
    pub breaker_name: Option<String>,
    pub total_steps: Option<u64>,
    pub description: Option<String>,
    pub created_at: SystemTime,

    pub(crate) callable: TaskCallable,
    pub(crate) cancel: CancellationToken,
    retries_left: AtomicU32,
    state: Mutex<TaskState>,
    status_tx: watch::Sender<TaskStatus>,
}

impl Task {
    pub(crate) fn from_spec(spec: TaskSpec) -> Self {
        let (status_tx, _rx) = watch::channel(TaskStatus::Pending);
        Self {
            id: spec.id,
            priority: spec.priority,
            timeout: spec.timeout,
            retry_count: spec.retry_count,
            retry_delay: spec.retry_delay,
            prereqs: spec.prereqs,
            resources: spec.resources,
            breaker_name: spec.breaker_name,
            total_steps: spec.total_steps,
            description: spec.description,
            created_at: SystemTime::now(),
            callable: spec.callable,
            cancel: CancellationToken::new(),
            retries_left: AtomicU32::new(spec.retry_count),
            state: Mutex::new(TaskState {
                status: TaskStatus::Pending,
                started_at: None,
                completed_at: None,
                result: None,
                error: None,
                progress: None,
            }),
            status_tx,
        }
    }

    /// Current lifecycle status.
    pub fn status(&self) -> TaskStatus {
        self.state.lock().unwrap().status
    }

    pub(crate) fn watch_status(&self) -> watch::Receiver<TaskStatus> {
        self.status_tx.subscribe()
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        self.state.lock().unwrap().started_at
    }

    pub fn completed_at(&self) -> Option<SystemTime> {
        self.state.lock().unwrap().completed_at
    }

    /// The stored result, present only for [`TaskStatus::Completed`] tasks.
    pub fn result(&self) -> Option<TaskResult> {
        self.state.lock().unwrap().result.clone()
    }

    /// The stored error message, present for [`TaskStatus::Failed`] tasks.
    pub fn error(&self) -> Option<String> {
        self.state.lock().unwrap().error.clone()
    }

    pub(crate) fn attach_progress(&self, progress: ProgressTrackerHandle) {
        self.state.lock().unwrap().progress = Some(progress);
    }

    pub(crate) fn progress(&self) -> Option<ProgressTrackerHandle> {
        self.state.lock().unwrap().progress.clone()
    }

    pub(crate) fn retries_left(&self) -> u32 {
        self.retries_left.load(Ordering::SeqCst)
    }

    pub(crate) fn consume_retry(&self) -> u32 {
        self.retries_left.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// A PENDING or RUNNING task transitions to CANCELLED; returns whether
    /// the transition happened.
    pub(crate) fn cancel(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status.is_terminal() {
            return false;
        }
        state.status = TaskStatus::Cancelled;
        state.completed_at = Some(SystemTime::now());
        self.cancel.cancel();
        let _ = self.status_tx.send(TaskStatus::Cancelled);
        true
    }

    /// A PENDING task transitions to RUNNING; returns false without
    /// changing anything if the task already reached a terminal state (e.g.
    /// cancelled between being popped off the ready set and dispatched).
    pub(crate) fn mark_running(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.status.is_terminal() {
            return false;
        }
        state.status = TaskStatus::Running;
        state.started_at = Some(SystemTime::now());
        let _ = self.status_tx.send(TaskStatus::Running);
        true
    }

    pub(crate) fn mark_pending_for_requeue(&self) {
        let mut state = self.state.lock().unwrap();
        if !state.status.is_terminal() {
            state.status = TaskStatus::Pending;
            let _ = self.status_tx.send(TaskStatus::Pending);
        }
    }

    pub(crate) fn mark_completed(&self, result: TaskResult) {
        let mut state = self.state.lock().unwrap();
        if state.status.is_terminal() {
            return;
        }
        state.status = TaskStatus::Completed;
        state.completed_at = Some(SystemTime::now());
        state.result = Some(result);
        let _ = self.status_tx.send(TaskStatus::Completed);
    }

    pub(crate) fn mark_failed(&self, error: impl Into<String>) {
        let mut state = self.state.lock().unwrap();
        if state.status.is_terminal() {
            return;
        }
        state.status = TaskStatus::Failed;
        state.completed_at = Some(SystemTime::now());
        state.error = Some(error.into());
        let _ = self.status_tx.send(TaskStatus::Failed);
    }

    /// Serialises this task's fields for the snapshot format of §6; only
    /// meaningful for non-terminal tasks, which is all the persistence layer
    /// ever calls this on.
    pub(crate) fn to_snapshot_entry(&self) -> SnapshotTaskEntry {
        let state = self.state.lock().unwrap();
        SnapshotTaskEntry {
            task_id: self.id.clone(),
            status: match state.status {
                TaskStatus::Pending => "pending",
                TaskStatus::Running => "running",
                TaskStatus::Completed => "completed",
                TaskStatus::Failed => "failed",
                TaskStatus::Cancelled => "cancelled",
            }
            .to_string(),
            created_at: epoch_secs(self.created_at),
            started_at: state.started_at.map(epoch_secs),
            completed_at: state.completed_at.map(epoch_secs),
            result: state.result.clone(),
            error: state.error.clone(),
            priority: self.priority,
            timeout: self.timeout.map(|d| d.as_secs_f64()),
            retry_count: self.retry_count,
            retries_left: self.retries_left(),
            dependencies: self.prereqs.clone(),
            func_name: self.description.clone().unwrap_or_else(|| "unnamed".to_string()),
            func_module: None,
        }
    }
}

fn epoch_secs(t: SystemTime) -> f64 {
    t.duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// One task's serialised entry in a queue snapshot file (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotTaskEntry {
    pub task_id: String,
    pub status: String,
    pub created_at: f64,
    pub started_at: Option<f64>,
    pub completed_at: Option<f64>,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
    pub priority: i64,
    pub timeout: Option<f64>,
    pub retry_count: u32,
    pub retries_left: u32,
    pub dependencies: Vec<TaskId>,
    pub func_name: String,
    pub func_module: Option<String>,
}

/// Top-level object written to `tasks_<epoch-seconds>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub timestamp: f64,
    pub max_workers: usize,
    pub max_queue_size: usize,
    pub tasks: HashMap<TaskId, SnapshotTaskEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_running_refuses_a_task_cancelled_first() {
        let task = Task::from_spec(TaskSpec::new("t", |_ctx| Box::pin(async { Ok(serde_json::json!(1)) })));
        assert!(task.cancel());
        assert!(!task.mark_running());
        assert_eq!(task.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn mark_running_succeeds_on_a_pending_task() {
        let task = Task::from_spec(TaskSpec::new("t", |_ctx| Box::pin(async { Ok(serde_json::json!(1)) })));
        assert!(task.mark_running());
        assert_eq!(task.status(), TaskStatus::Running);
    }
}
