//! Pending-task queue.
//!
//! This module provides the priority queue the scheduler dispatches from:
//! higher priority first, FIFO within a priority, and tasks held back by a
//! retry backoff are skipped until their delay has elapsed.

use chrono::{DateTime, Utc};
use quill_abstraction::Parameters;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::template::Priority;

/// Dispatch status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Waiting in the queue.
    Pending,
    /// Picked by the scheduler and executing.
    Running,
}

/// The scheduling record for one attempt at running a workflow step.
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique task id.
    pub id: String,
    /// Owning workflow instance.
    pub workflow_id: String,
    /// Template step the task executes.
    pub step_id: String,
    /// Capability that performs the step.
    pub capability: String,
    /// Dispatch priority.
    pub priority: Priority,
    /// Current dispatch status.
    pub status: TaskStatus,
    /// Number of times the task has been requeued after a failure.
    pub retry_count: u32,
    /// Parameters handed to the capability.
    pub parameters: Parameters,
    /// When the task was first created.
    pub created_at: DateTime<Utc>,
    /// Earliest time the task may be dispatched (retry backoff).
    pub not_before: Option<Instant>,
}

impl Task {
    /// Creates a new pending task.
    #[must_use]
    pub fn new(
        workflow_id: impl Into<String>,
        step_id: impl Into<String>,
        capability: impl Into<String>,
        priority: Priority,
        parameters: Parameters,
    ) -> Self {
        Self {
            id: format!("task-{}", uuid::Uuid::new_v4()),
            workflow_id: workflow_id.into(),
            step_id: step_id.into(),
            capability: capability.into(),
            priority,
            status: TaskStatus::Pending,
            retry_count: 0,
            parameters,
            created_at: Utc::now(),
            not_before: None,
        }
    }

    /// Number of attempts made so far, counting a running attempt.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    fn is_due(&self, now: Instant) -> bool {
        self.not_before.is_none_or(|at| at <= now)
    }
}

/// Heap entry: priority first, then enqueue order.
#[derive(Debug)]
struct QueuedTask {
    seq: u64,
    task: Task,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority wins, then the lower sequence number.
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| Reverse(self.seq).cmp(&Reverse(other.seq)))
    }
}

/// Queue metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueMetrics {
    /// Number of pending tasks.
    pub pending: usize,
    /// Number of running tasks.
    pub running: usize,
    /// Number of tasks that finished an attempt.
    pub finished: usize,
}

/// Priority queue of pending tasks plus the set of running ones.
pub struct TaskQueue {
    pending: Mutex<BinaryHeap<QueuedTask>>,
    running: Mutex<HashMap<String, Task>>,
    next_seq: AtomicU64,
    finished: AtomicUsize,
    notify: Notify,
}

impl TaskQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(BinaryHeap::new()),
            running: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            finished: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    /// Enqueues a task and wakes the scheduler.
    pub async fn enqueue(&self, mut task: Task) {
        debug!(
            task_id = %task.id,
            workflow_id = %task.workflow_id,
            step_id = %task.step_id,
            priority = ?task.priority,
            retry_count = task.retry_count,
            "Enqueueing task"
        );
        task.status = TaskStatus::Pending;
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.pending.lock().await.push(QueuedTask { seq, task });
        self.notify.notify_one();
    }

    /// Dequeues the highest priority task that is due at `now` and marks it running.
    pub async fn dequeue_ready(&self, now: Instant) -> Option<Task> {
        let mut pending = self.pending.lock().await;
        let mut deferred = Vec::new();
        let mut picked = None;

        while let Some(entry) = pending.pop() {
            if entry.task.is_due(now) {
                picked = Some(entry.task);
                break;
            }
            deferred.push(entry);
        }
        pending.extend(deferred);
        drop(pending);

        let mut task = picked?;
        task.status = TaskStatus::Running;
        debug!(task_id = %task.id, step_id = %task.step_id, priority = ?task.priority, "Dequeued task");
        self.running.lock().await.insert(task.id.clone(), task.clone());
        Some(task)
    }

    /// Records that a running task's attempt is over and wakes the scheduler.
    pub async fn mark_finished(&self, task_id: &str) {
        if self.running.lock().await.remove(task_id).is_some() {
            self.finished.fetch_add(1, AtomicOrdering::Relaxed);
            debug!(task_id = %task_id, "Task attempt finished");
        }
        self.notify.notify_one();
    }

    /// Drops a running task without counting a finished attempt (the task was parked or discarded).
    pub async fn release(&self, task_id: &str) {
        self.running.lock().await.remove(task_id);
        self.notify.notify_one();
    }

    /// Removes and returns every pending task of a workflow.
    pub async fn take_workflow(&self, workflow_id: &str) -> Vec<Task> {
        let mut pending = self.pending.lock().await;
        let (taken, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut *pending).into_vec().into_iter().partition(|e| e.task.workflow_id == workflow_id);
        *pending = kept.into_iter().collect();
        taken.into_iter().map(|e| e.task).collect()
    }

    /// Earliest backoff deadline among pending tasks that are not yet due.
    pub async fn next_due(&self, now: Instant) -> Option<Instant> {
        self.pending
            .lock()
            .await
            .iter()
            .filter_map(|e| e.task.not_before)
            .filter(|at| *at > now)
            .min()
    }

    /// Waits until a task is enqueued or finishes.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Returns the number of pending tasks.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Returns the number of running tasks.
    pub async fn running_count(&self) -> usize {
        self.running.lock().await.len()
    }

    /// Returns the number of running tasks owned by a workflow.
    pub async fn running_for(&self, workflow_id: &str) -> usize {
        self.running.lock().await.values().filter(|t| t.workflow_id == workflow_id).count()
    }

    /// Returns queue metrics.
    pub async fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            pending: self.pending_count().await,
            running: self.running_count().await,
            finished: self.finished.load(AtomicOrdering::Relaxed),
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("pending_count", &self.pending.try_lock().map(|q| q.len()).unwrap_or(0))
            .field("running_count", &self.running.try_lock().map(|r| r.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn task(workflow: &str, step: &str, priority: Priority) -> Task {
        Task::new(workflow, step, "cap", priority, Parameters::new())
    }

    #[tokio::test]
    async fn test_enqueue_dequeue() {
        let queue = TaskQueue::new();
        queue.enqueue(task("wf-1", "a", Priority::Normal)).await;

        let dequeued = queue.dequeue_ready(Instant::now()).await.unwrap();
        assert_eq!(dequeued.step_id, "a");
        assert_eq!(dequeued.status, TaskStatus::Running);
        assert!(queue.dequeue_ready(Instant::now()).await.is_none());
    }

    #[tokio::test]
    async fn test_priority_then_fifo_ordering() {
        let queue = TaskQueue::new();
        queue.enqueue(task("wf-1", "low", Priority::Low)).await;
        queue.enqueue(task("wf-2", "normal-first", Priority::Normal)).await;
        queue.enqueue(task("wf-3", "high", Priority::High)).await;
        queue.enqueue(task("wf-4", "normal-second", Priority::Normal)).await;

        let now = Instant::now();
        let order: Vec<String> = [
            queue.dequeue_ready(now).await,
            queue.dequeue_ready(now).await,
            queue.dequeue_ready(now).await,
            queue.dequeue_ready(now).await,
        ]
        .into_iter()
        .map(|t| t.unwrap().step_id)
        .collect();
        assert_eq!(order, vec!["high", "normal-first", "normal-second", "low"]);
    }

    #[tokio::test]
    async fn test_backoff_tasks_are_skipped_until_due() {
        let queue = TaskQueue::new();
        let now = Instant::now();

        let mut delayed = task("wf-1", "delayed", Priority::Critical);
        delayed.not_before = Some(now + Duration::from_secs(60));
        queue.enqueue(delayed).await;
        queue.enqueue(task("wf-2", "ready", Priority::Low)).await;

        assert_eq!(queue.dequeue_ready(now).await.unwrap().step_id, "ready");
        assert!(queue.dequeue_ready(now).await.is_none());
        assert_eq!(queue.pending_count().await, 1);
        assert_eq!(queue.next_due(now).await, Some(now + Duration::from_secs(60)));

        let later = now + Duration::from_secs(61);
        assert_eq!(queue.dequeue_ready(later).await.unwrap().step_id, "delayed");
    }

    #[tokio::test]
    async fn test_metrics() {
        let queue = TaskQueue::new();
        queue.enqueue(task("wf-1", "a", Priority::Normal)).await;
        assert_eq!(queue.metrics().await, QueueMetrics { pending: 1, running: 0, finished: 0 });

        let running = queue.dequeue_ready(Instant::now()).await.unwrap();
        assert_eq!(queue.running_count().await, 1);
        assert_eq!(queue.running_for("wf-1").await, 1);

        queue.mark_finished(&running.id).await;
        assert_eq!(queue.metrics().await, QueueMetrics { pending: 0, running: 0, finished: 1 });

        // Finishing an unknown task is a no-op.
        queue.mark_finished("task-unknown").await;
        assert_eq!(queue.metrics().await.finished, 1);
    }

    #[tokio::test]
    async fn test_take_workflow() {
        let queue = TaskQueue::new();
        queue.enqueue(task("wf-1", "a", Priority::Normal)).await;
        queue.enqueue(task("wf-2", "b", Priority::High)).await;

        let taken = queue.take_workflow("wf-1").await;
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].step_id, "a");
        assert_eq!(queue.pending_count().await, 1);
        assert_eq!(queue.dequeue_ready(Instant::now()).await.unwrap().workflow_id, "wf-2");
    }
}
