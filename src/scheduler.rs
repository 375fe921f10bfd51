//! The Task Scheduler: fires tasks at an absolute time or periodically,
//! forwarding each firing into the Task Queue via a min-heap keyed by
//! `next_run_time`. Grounded on `augment_adam/core/task_scheduler.py`'s
//! `TaskScheduler`, rendered over the same cooperative-loop shape as the
//! Task Queue's worker loop.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::SchedulerSettings;
use crate::queue::TaskQueue;
use crate::task::{TaskId, TaskSpec};

/// Function the caller provides to build a fresh [`TaskSpec`] for each
/// firing, given the unique per-firing queue id the scheduler derives.
pub type SpecFactory = Box<dyn Fn(TaskId) -> TaskSpec + Send + Sync>;

struct ScheduledEntry {
    scheduled_id: TaskId,
    schedule_time: f64,
    interval: Option<Duration>,
    max_runs: Option<u64>,
    runs: u64,
    last_run_time: Option<f64>,
    next_run_time: f64,
    active: bool,
    factory: SpecFactory,
}

struct HeapEntry {
    scheduled_id: TaskId,
    next_run_time: f64,
    sequence: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.next_run_time == other.next_run_time && self.sequence == other.sequence
    }
}
impl Eq for HeapEntry {}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Min-heap by next_run_time: reverse the natural ordering, and break
        // ties by insertion order (sequence), also reversed so the earlier
        // entry sorts first.
        other
            .next_run_time
            .partial_cmp(&self.next_run_time)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A read-only snapshot of one scheduled entry, for [`TaskScheduler::lookup`]
/// and [`TaskScheduler::list_all`].
#[derive(Debug, Clone)]
pub struct ScheduledTaskInfo {
    pub scheduled_id: TaskId,
    pub next_run_time: f64,
    pub runs: u64,
    pub max_runs: Option<u64>,
    pub active: bool,
}

struct SchedulerInner {
    entries: HashMap<TaskId, ScheduledEntry>,
    heap: BinaryHeap<HeapEntry>,
    sequence: u64,
}

/// Periodic / time-triggered submission into a [`TaskQueue`].
pub struct TaskScheduler {
    settings: SchedulerSettings,
    queue: Arc<TaskQueue>,
    inner: Mutex<SchedulerInner>,
    wake: Notify,
    shutdown: CancellationToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    started: AtomicUsize,
    run_counter: AtomicU64,
}

impl TaskScheduler {
    pub fn new(settings: SchedulerSettings, queue: Arc<TaskQueue>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            queue,
            inner: Mutex::new(SchedulerInner { entries: HashMap::new(), heap: BinaryHeap::new(), sequence: 0 }),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            loop_handle: Mutex::new(None),
            started: AtomicUsize::new(0),
            run_counter: AtomicU64::new(0),
        })
    }

    /// Registers a scheduled entry. `when` defaults to now; setting
    /// `interval` makes the entry periodic, running indefinitely unless
    /// `max_runs` is also set.
    pub async fn schedule(
        self: &Arc<Self>,
        scheduled_id: impl Into<TaskId>,
        when: Option<f64>,
        interval: Option<Duration>,
        max_runs: Option<u64>,
        factory: SpecFactory,
    ) -> TaskId {
        let scheduled_id = scheduled_id.into();
        let next_run_time = when.unwrap_or_else(now_epoch_secs);

        let mut inner = self.inner.lock().await;
        let sequence = inner.sequence;
        inner.sequence += 1;

        inner.entries.insert(
            scheduled_id.clone(),
            ScheduledEntry {
                scheduled_id: scheduled_id.clone(),
                schedule_time: next_run_time,
                interval,
                max_runs,
                runs: 0,
                last_run_time: None,
                next_run_time,
                active: true,
                factory,
            },
        );
        inner.heap.push(HeapEntry { scheduled_id: scheduled_id.clone(), next_run_time, sequence });
        drop(inner);

        self.wake.notify_one();
        scheduled_id
    }

    /// Marks the entry inactive; already-submitted queue tasks are unaffected.
    pub async fn cancel(&self, scheduled_id: &TaskId) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.entries.get_mut(scheduled_id) {
            Some(entry) if entry.active => {
                entry.active = false;
                true
            }
            _ => false,
        }
    }

    pub async fn lookup(&self, scheduled_id: &TaskId) -> Option<ScheduledTaskInfo> {
        let inner = self.inner.lock().await;
        inner.entries.get(scheduled_id).map(to_info)
    }

    pub async fn list_all(&self) -> Vec<ScheduledTaskInfo> {
        let inner = self.inner.lock().await;
        inner.entries.values().map(to_info).collect()
    }

    /// Idempotent: spawns the single dispatch loop.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(1, AtomicOrdering::SeqCst) == 1 {
            return;
        }
        let scheduler = Arc::clone(self);
        let token = self.shutdown.clone();
        let poll = Duration::from_millis(self.settings.poll_interval_ms.max(1));
        *self.loop_handle.lock().await = Some(tokio::spawn(async move {
            scheduler.dispatch_loop(token, poll).await;
        }));
        info!("task scheduler started");
    }

    /// Idempotent: signals shutdown and joins the dispatch loop.
    pub async fn stop(self: &Arc<Self>) {
        if self.started.swap(0, AtomicOrdering::SeqCst) == 0 {
            return;
        }
        self.shutdown.cancel();
        self.wake.notify_waiters();
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
        info!("task scheduler stopped");
    }

    async fn dispatch_loop(self: Arc<Self>, token: CancellationToken, poll: Duration) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(poll) => {},
                _ = self.wake.notified() => {},
            }
            self.dispatch_due().await;
        }
    }

    /// Pops every entry whose `next_run_time` has arrived, forwards a fresh
    /// task to the queue for each, and reinserts periodic entries with
    /// `next_run_time` computed from *now* rather than the nominal schedule
    /// (drift-tolerant by design).
    async fn dispatch_due(self: &Arc<Self>) {
        let now = now_epoch_secs();
        let mut due = Vec::new();

        {
            let mut inner = self.inner.lock().await;
            while let Some(top) = inner.heap.peek() {
                if top.next_run_time > now {
                    break;
                }
                let popped = inner.heap.pop().unwrap();
                due.push(popped.scheduled_id);
            }
        }

        for scheduled_id in due {
            self.fire(&scheduled_id, now).await;
        }
    }

    async fn fire(self: &Arc<Self>, scheduled_id: &TaskId, now: f64) {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.entries.get_mut(scheduled_id) else { return };

        if !entry.active {
            return;
        }

        entry.runs += 1;
        entry.last_run_time = Some(now);
        let run = entry.runs;
        let queue_task_id = format!("{scheduled_id}#{run}");
        let spec = (entry.factory)(queue_task_id);

        let reschedule = match entry.interval {
            Some(interval) if entry.max_runs.map(|max| entry.runs < max).unwrap_or(true) => {
                entry.next_run_time = now + interval.as_secs_f64();
                true
            }
            _ => {
                entry.active = false;
                false
            }
        };
        let next_run_time = entry.next_run_time;
        drop(inner);

        self.run_counter.fetch_add(1, AtomicOrdering::Relaxed);
        if let Err(err) = self.queue.submit(spec).await {
            debug!(scheduled_id = %scheduled_id, error = %err, "scheduled firing could not be submitted; logged and skipped");
        }

        if reschedule {
            let mut inner = self.inner.lock().await;
            let sequence = inner.sequence;
            inner.sequence += 1;
            inner.heap.push(HeapEntry { scheduled_id: scheduled_id.clone(), next_run_time, sequence });
        }
    }
}

fn to_info(entry: &ScheduledEntry) -> ScheduledTaskInfo {
    ScheduledTaskInfo {
        scheduled_id: entry.scheduled_id.clone(),
        next_run_time: entry.next_run_time,
        runs: entry.runs,
        max_runs: entry.max_runs,
        active: entry.active,
    }
}

fn now_epoch_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressRegistry;
    use crate::config::QueueSettings;

    fn queue() -> Arc<TaskQueue> {
        TaskQueue::new(QueueSettings { worker_count: 1, ..QueueSettings::default() }, Arc::new(ProgressRegistry::new()))
    }

    #[tokio::test]
    async fn single_firing_for_when_now_no_interval() {
        let queue = queue();
        queue.start().await;
        let scheduler = TaskScheduler::new(SchedulerSettings { poll_interval_ms: 5 }, Arc::clone(&queue));
        scheduler.start().await;

        scheduler
            .schedule(
                "once",
                None,
                None,
                None,
                Box::new(|id: TaskId| TaskSpec::new(id, |_ctx| Box::pin(async { Ok(serde_json::json!(1)) }))),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(60)).await;
        let info = scheduler.lookup(&"once".to_string()).await.unwrap();
        assert_eq!(info.runs, 1);
        assert!(!info.active);

        scheduler.stop().await;
        queue.stop().await;
    }

    #[tokio::test]
    async fn periodic_scheduling_s6() {
        let queue = queue();
        queue.start().await;
        let scheduler = TaskScheduler::new(SchedulerSettings { poll_interval_ms: 5 }, Arc::clone(&queue));
        scheduler.start().await;

        scheduler
            .schedule(
                "p",
                None,
                Some(Duration::from_millis(20)),
                Some(3),
                Box::new(|id: TaskId| TaskSpec::new(id, |_ctx| Box::pin(async { Ok(serde_json::json!("tick")) }))),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(150)).await;

        let info = scheduler.lookup(&"p".to_string()).await.unwrap();
        assert_eq!(info.runs, 3);
        assert!(!info.active);

        scheduler.stop().await;
        queue.stop().await;
    }

    #[tokio::test]
    async fn cancel_prevents_future_firings() {
        let queue = queue();
        queue.start().await;
        let scheduler = TaskScheduler::new(SchedulerSettings { poll_interval_ms: 5 }, Arc::clone(&queue));
        scheduler.start().await;

        scheduler
            .schedule(
                "q",
                None,
                Some(Duration::from_millis(20)),
                None,
                Box::new(|id: TaskId| TaskSpec::new(id, |_ctx| Box::pin(async { Ok(serde_json::json!(1)) }))),
            )
            .await;

        assert!(scheduler.cancel(&"q".to_string()).await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        let info = scheduler.lookup(&"q".to_string()).await.unwrap();
        assert!(!info.active);

        scheduler.stop().await;
        queue.stop().await;
    }
}
