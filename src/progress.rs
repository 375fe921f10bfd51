//! Hierarchical progress tracking: step- or percentage-based leaves, with
//! parent trackers re-deriving their percentage from children on every
//! update. Grounded on `dukat/core/progress.py`'s `ProgressTracker` /
//! `ProgressState`, rendered over `tokio::sync::RwLock`-guarded state in the
//! style of `layer2/src/progress_tracker.rs`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::error::{KernelError, KernelResult};
use crate::task::TaskId;

/// Lifecycle state of a progress tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    NotStarted,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl ProgressState {
    fn is_terminal(self) -> bool {
        matches!(self, ProgressState::Completed | ProgressState::Failed | ProgressState::Cancelled)
    }
}

enum ProgressMode {
    Step { total_steps: u64, current_step: u64 },
    Percentage,
}

struct TrackerState {
    progress_state: ProgressState,
    mode: ProgressMode,
    current_percentage: f64,
    total_percentage: f64,
    start_time: Option<SystemTime>,
    end_time: Option<SystemTime>,
    message: Option<String>,
    details: HashMap<String, Value>,
}

type Callback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// A single node in the progress hierarchy.
pub struct ProgressTracker {
    task_id: TaskId,
    weight: f64,
    parent: Option<Weak<ProgressTracker>>,
    children: RwLock<HashMap<TaskId, Arc<ProgressTracker>>>,
    callbacks: Mutex<Vec<Callback>>,
    state: Mutex<TrackerState>,
}

/// Shared handle to a tracker; cheap to clone, injected into [`crate::task::TaskContext`].
pub type ProgressTrackerHandle = Arc<ProgressTracker>;

impl ProgressTracker {
    /// Creates a root, step-based tracker.
    pub fn new_steps(task_id: impl Into<TaskId>, total_steps: u64) -> Arc<Self> {
        Self::build(task_id.into(), None, 1.0, ProgressMode::Step { total_steps, current_step: 0 })
    }

    /// Creates a root, percentage-based tracker (`total_percentage` defaults to 100).
    pub fn new_percentage(task_id: impl Into<TaskId>, total_percentage: f64) -> Arc<Self> {
        let tracker = Self::build(task_id.into(), None, 1.0, ProgressMode::Percentage);
        tracker.state.lock().unwrap().total_percentage = total_percentage;
        tracker
    }

    fn build(task_id: TaskId, parent: Option<Weak<ProgressTracker>>, weight: f64, mode: ProgressMode) -> Arc<Self> {
        Arc::new(Self {
            task_id,
            weight,
            parent,
            children: RwLock::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            state: Mutex::new(TrackerState {
                progress_state: ProgressState::NotStarted,
                mode,
                current_percentage: 0.0,
                total_percentage: 100.0,
                start_time: None,
                end_time: None,
                message: None,
                details: HashMap::new(),
            }),
        })
    }

    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Registers a step-based child tracker with the given aggregation weight.
    pub fn add_child(self: &Arc<Self>, child_id: impl Into<TaskId>, weight: f64, total_steps: u64) -> KernelResult<Arc<Self>> {
        if weight <= 0.0 {
            return Err(KernelError::Validation("child weight must be > 0".to_string()));
        }
        let child = Self::build(
            child_id.into(),
            Some(Arc::downgrade(self)),
            weight,
            ProgressMode::Step { total_steps, current_step: 0 },
        );
        self.children.write().unwrap().insert(child.task_id.clone(), Arc::clone(&child));
        Ok(child)
    }

    /// Registers `callback` to be invoked on every state change and update.
    pub fn subscribe(&self, callback: Callback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    /// NOT_STARTED → IN_PROGRESS; stamps `start_time`.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap();
        if state.progress_state == ProgressState::NotStarted {
            state.progress_state = ProgressState::InProgress;
            state.start_time = Some(SystemTime::now());
        }
        drop(state);
        self.notify();
    }

    /// Advances step-based progress. Refuses outside IN_PROGRESS and when
    /// `current_step` exceeds `total_steps`.
    pub fn update_step(&self, current_step: u64) -> KernelResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.progress_state != ProgressState::InProgress {
                return Err(KernelError::Validation("tracker is not in progress".to_string()));
            }
            let ProgressMode::Step { total_steps, current_step: ref mut slot } = state.mode else {
                return Err(KernelError::Validation("tracker is not step-based".to_string()));
            };
            if current_step > total_steps {
                return Err(KernelError::Validation(format!(
                    "current_step {current_step} exceeds total_steps {total_steps}"
                )));
            }
            *slot = current_step;
            let pct = (current_step as f64 / total_steps as f64) * state.total_percentage;
            state.current_percentage = state.current_percentage.max(pct);
        }
        self.notify();
        self.propagate_to_parent();
        Ok(())
    }

    /// Advances percentage-based progress directly. Refuses outside
    /// IN_PROGRESS; percentage never decreases within a run.
    pub fn update_percentage(&self, current_percentage: f64) -> KernelResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.progress_state != ProgressState::InProgress {
                return Err(KernelError::Validation("tracker is not in progress".to_string()));
            }
            if current_percentage < 0.0 || current_percentage > state.total_percentage {
                return Err(KernelError::Validation(format!(
                    "current_percentage {current_percentage} out of range [0, {}]",
                    state.total_percentage
                )));
            }
            state.current_percentage = state.current_percentage.max(current_percentage);
        }
        self.notify();
        self.propagate_to_parent();
        Ok(())
    }

    /// Sets a free-form status message, surfaced in the next progress event.
    pub fn set_message(&self, message: impl Into<String>) {
        self.state.lock().unwrap().message = Some(message.into());
        self.notify();
    }

    /// Merges `details` into the tracker's details map.
    pub fn set_detail(&self, key: impl Into<String>, value: Value) {
        self.state.lock().unwrap().details.insert(key.into(), value);
        self.notify();
    }

    /// Forces percentage to `total_percentage` and marks COMPLETED.
    pub fn complete(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.progress_state.is_terminal() {
                return;
            }
            state.progress_state = ProgressState::Completed;
            state.current_percentage = state.total_percentage;
            state.end_time = Some(SystemTime::now());
        }
        self.notify();
        self.propagate_to_parent();
    }

    /// Marks FAILED, preserving the last observed percentage.
    pub fn fail(&self, message: impl Into<String>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.progress_state.is_terminal() {
                return;
            }
            state.progress_state = ProgressState::Failed;
            state.message = Some(message.into());
            state.end_time = Some(SystemTime::now());
        }
        self.notify();
        self.propagate_to_parent();
    }

    /// Marks CANCELLED, preserving the last observed percentage.
    pub fn cancel(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.progress_state.is_terminal() {
                return;
            }
            state.progress_state = ProgressState::Cancelled;
            state.end_time = Some(SystemTime::now());
        }
        self.notify();
        self.propagate_to_parent();
    }

    pub fn state(&self) -> ProgressState {
        self.state.lock().unwrap().progress_state
    }

    pub fn current_percentage(&self) -> f64 {
        self.state.lock().unwrap().current_percentage
    }

    /// `(end_time or now) − start_time`.
    pub fn elapsed(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        let start = state.start_time?;
        let end = state.end_time.unwrap_or_else(SystemTime::now);
        end.duration_since(start).ok()
    }

    /// `elapsed × (total − current) / current`, undefined (`None`) at `current == 0`.
    pub fn estimated_remaining(&self) -> Option<Duration> {
        let elapsed = self.elapsed()?;
        let state = self.state.lock().unwrap();
        if state.current_percentage <= 0.0 {
            return None;
        }
        let remaining_fraction = (state.total_percentage - state.current_percentage) / state.current_percentage;
        Some(elapsed.mul_f64(remaining_fraction.max(0.0)))
    }

    /// Recomputes this tracker's percentage from its children:
    /// `Σ(child% × weight) / Σ(weight)`, then propagates upward.
    fn propagate_to_parent(&self) {
        if let Some(parent_weak) = &self.parent {
            if let Some(parent) = parent_weak.upgrade() {
                parent.recompute_from_children();
            }
        }
    }

    fn recompute_from_children(self: &Arc<Self>) {
        let children: Vec<Arc<ProgressTracker>> = self.children.read().unwrap().values().cloned().collect();
        if children.is_empty() {
            return;
        }

        let total_weight: f64 = children.iter().map(|c| c.weight).sum();
        if total_weight <= 0.0 {
            warn!(task_id = %self.task_id, "all child weights are non-positive; skipping aggregation");
            return;
        }

        let weighted: f64 = children.iter().map(|c| c.current_percentage() * c.weight).sum();
        let aggregated = weighted / total_weight;

        {
            let mut state = self.state.lock().unwrap();
            if state.progress_state == ProgressState::NotStarted {
                state.progress_state = ProgressState::InProgress;
                state.start_time.get_or_insert_with(SystemTime::now);
            }
            state.current_percentage = aggregated;
        }
        self.notify();
        self.propagate_to_parent();
    }

    /// Renders the §6 progress event shape, recursing into children.
    pub fn to_event(&self) -> ProgressEvent {
        let state = self.state.lock().unwrap();
        let (current_step, total_steps) = match state.mode {
            ProgressMode::Step { total_steps, current_step } => (Some(current_step), Some(total_steps)),
            ProgressMode::Percentage => (None, None),
        };

        let children = self
            .children
            .read()
            .unwrap()
            .values()
            .map(|c| (c.task_id.clone(), c.to_event()))
            .collect::<HashMap<_, _>>();

        ProgressEvent {
            task_id: self.task_id.clone(),
            state: format!("{:?}", state.progress_state).to_lowercase(),
            description: None,
            current_step,
            total_steps,
            current_percentage: state.current_percentage,
            total_percentage: state.total_percentage,
            message: state.message.clone(),
            details: state.details.clone(),
            start_time: state.start_time.map(|t| t.duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs_f64()),
            end_time: state.end_time.map(|t| t.duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs_f64()),
            elapsed_time: self.elapsed().map(|d| d.as_secs_f64()),
            children: if children.is_empty() { None } else { Some(children) },
        }
    }

    fn notify(&self) {
        let event = self.to_event();
        for callback in self.callbacks.lock().unwrap().iter() {
            let callback = Arc::clone(callback);
            let event_ref = &event;
            if std::panic::catch_unwind(AssertUnwindSafe(|| callback(event_ref))).is_err() {
                warn!(task_id = %self.task_id, "progress callback panicked; discarding");
            }
        }
    }
}

/// The §6 progress event shape emitted to subscribed callbacks.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub state: String,
    pub description: Option<String>,
    pub current_step: Option<u64>,
    pub total_steps: Option<u64>,
    pub current_percentage: f64,
    pub total_percentage: f64,
    pub message: Option<String>,
    pub details: HashMap<String, Value>,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub elapsed_time: Option<f64>,
    pub children: Option<HashMap<TaskId, ProgressEvent>>,
}

/// Process-wide (embedder-owned) table of live trackers, keyed by task id.
/// Entries are removed on every terminal transition per the design's
/// resolved open question — not only on success.
#[derive(Default)]
pub struct ProgressRegistry {
    trackers: RwLock<HashMap<TaskId, Arc<ProgressTracker>>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tracker: Arc<ProgressTracker>) {
        self.trackers.write().unwrap().insert(tracker.task_id.clone(), tracker);
    }

    pub fn get(&self, task_id: &TaskId) -> Option<Arc<ProgressTracker>> {
        self.trackers.read().unwrap().get(task_id).cloned()
    }

    /// Removes the tracker for `task_id` if its state has reached a terminal
    /// one; called by the queue on every task terminal transition.
    pub fn remove_if_terminal(&self, task_id: &TaskId) {
        let terminal = self.trackers.read().unwrap().get(task_id).map(|t| t.state().is_terminal()).unwrap_or(false);
        if terminal {
            self.trackers.write().unwrap().remove(task_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_update_rejects_out_of_range() {
        let tracker = ProgressTracker::new_steps("t1", 5);
        tracker.start();
        assert!(tracker.update_step(5).is_ok());
        assert!(tracker.update_step(6).is_err());
    }

    #[test]
    fn update_requires_in_progress() {
        let tracker = ProgressTracker::new_steps("t1", 5);
        assert!(tracker.update_step(1).is_err());
    }

    #[test]
    fn percentage_never_decreases() {
        let tracker = ProgressTracker::new_percentage("t1", 100.0);
        tracker.start();
        tracker.update_percentage(50.0).unwrap();
        tracker.update_percentage(20.0).unwrap();
        assert_eq!(tracker.current_percentage(), 50.0);
    }

    #[test]
    fn parent_percentage_is_weighted_average_of_children() {
        let parent = ProgressTracker::new_percentage("parent", 100.0);
        parent.start();
        let child_a = parent.add_child("a", 1.0, 10).unwrap();
        let child_b = parent.add_child("b", 3.0, 10).unwrap();

        child_a.start();
        child_b.start();
        child_a.update_step(10).unwrap(); // 100%
        child_b.update_step(0).unwrap(); // 0%

        // weighted: (100*1 + 0*3) / 4 == 25
        assert!((parent.current_percentage() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn completion_forces_full_percentage_failure_preserves_it() {
        let tracker = ProgressTracker::new_percentage("t1", 100.0);
        tracker.start();
        tracker.update_percentage(40.0).unwrap();
        tracker.complete();
        assert_eq!(tracker.current_percentage(), 100.0);

        let tracker = ProgressTracker::new_percentage("t2", 100.0);
        tracker.start();
        tracker.update_percentage(40.0).unwrap();
        tracker.fail("boom");
        assert_eq!(tracker.current_percentage(), 40.0);
    }

    #[test]
    fn registry_drops_trackers_on_any_terminal_transition() {
        let registry = ProgressRegistry::new();
        let tracker = ProgressTracker::new_percentage("t1", 100.0);
        registry.register(Arc::clone(&tracker));
        tracker.start();
        tracker.fail("boom");
        registry.remove_if_terminal(&"t1".to_string());
        assert!(registry.get(&"t1".to_string()).is_none());
    }
}
