//! Priority Dispatch Queue
//!
//! Bounded holding area for accepted tasks, ordered by
//! `(priority desc, submission sequence asc)`.
//!
//! - `enqueue` is O(log n) and never blocks; it fails fast with
//!   `DeadlineExceeded`, `QueueFull` or `ShuttingDown`.
//! - `dequeue` waits until a task is available, or returns `None` once the
//!   queue is closed.
//!
//! Tasks cancelled while queued stay in the heap and are skipped when they
//! surface; a full queue purges them before rejecting. Tasks whose deadline
//! passed while queued are moved to `TimedOut` at dequeue time.
//!
//! There is no aging: under sustained high-priority load, low-priority tasks
//! can wait indefinitely.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::dispatch::record::TaskRecord;
use crate::error::{SubmitError, TaskFailure};
use crate::routing::metrics::Counter;
use crate::task::{TaskId, TaskState};

/// Heap entry
struct QueuedEntry {
    priority: i32,
    sequence: u64,
    record: Arc<TaskRecord>,
}

impl PartialEq for QueuedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedEntry {}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then lower sequence (FIFO)
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.sequence.cmp(&self.sequence),
            other => other,
        }
    }
}

struct QueueInner {
    heap: BinaryHeap<QueuedEntry>,
    closed: bool,
}

/// Thread-safe bounded priority queue of tasks
pub struct PriorityDispatchQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
    expired: Counter,
}

impl PriorityDispatchQueue {
    /// Create a queue holding at most `capacity` tasks
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            expired: Counter::default(),
        }
    }

    /// Configured capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a task
    pub fn enqueue(&self, record: Arc<TaskRecord>) -> Result<(), SubmitError> {
        let mut inner = self.inner.lock();

        if inner.closed {
            return Err(SubmitError::ShuttingDown);
        }
        if record.task().is_expired_at(Instant::now()) {
            return Err(SubmitError::DeadlineExceeded);
        }
        if inner.heap.len() >= self.capacity {
            inner
                .heap
                .retain(|entry| entry.record.state() == TaskState::Queued);
        }
        if inner.heap.len() >= self.capacity {
            return Err(SubmitError::QueueFull {
                capacity: self.capacity,
            });
        }

        let task = record.task();
        tracing::debug!(
            task_id = %task.id,
            priority = task.priority,
            sequence = record.sequence(),
            queue_size = inner.heap.len() + 1,
            "Task enqueued"
        );
        inner.heap.push(QueuedEntry {
            priority: task.priority,
            sequence: record.sequence(),
            record: record.clone(),
        });
        drop(inner);

        self.notify.notify_one();
        Ok(())
    }

    /// Take the most urgent task, waiting while the queue is empty
    ///
    /// Returns `None` once the queue is closed, even if tasks remain.
    pub async fn dequeue(&self) -> Option<Arc<TaskRecord>> {
        loop {
            // Register interest before checking, so an enqueue between the
            // check and the await is not missed
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(next) = self.try_dequeue() {
                return next;
            }

            notified.await;
        }
    }

    /// Non-blocking dequeue
    ///
    /// `Some(None)` means closed; `None` means empty.
    fn try_dequeue(&self) -> Option<Option<Arc<TaskRecord>>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Some(None);
        }

        while let Some(entry) = inner.heap.pop() {
            let record = entry.record;
            if record.state() != TaskState::Queued {
                continue;
            }
            if record.task().is_expired_at(Instant::now()) {
                if record
                    .finish(Err(TaskFailure::DeadlineExceeded {
                        failures: Vec::new(),
                    }))
                    .is_ok()
                {
                    self.expired.inc();
                    tracing::info!(task_id = %record.id(), "Task deadline passed while queued");
                }
                continue;
            }
            return Some(Some(record));
        }
        None
    }

    /// Remove a queued task (after it was cancelled)
    pub fn remove(&self, id: &TaskId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.heap.len();
        inner.heap.retain(|entry| entry.record.id() != id);
        inner.heap.len() != before
    }

    /// Stop handing out tasks and wake every waiting worker
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Whether the queue is closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Remove and return every task still waiting, in dispatch order
    pub fn drain(&self) -> Vec<Arc<TaskRecord>> {
        let mut inner = self.inner.lock();
        let heap = std::mem::take(&mut inner.heap);
        heap.into_sorted_vec()
            .into_iter()
            .rev()
            .map(|entry| entry.record)
            .filter(|record| record.state() == TaskState::Queued)
            .collect()
    }

    /// Identifiers of waiting tasks, in dispatch order
    #[must_use]
    pub fn queued_ids(&self) -> Vec<TaskId> {
        let inner = self.inner.lock();
        let mut entries: Vec<_> = inner
            .heap
            .iter()
            .filter(|entry| entry.record.state() == TaskState::Queued)
            .collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.iter().map(|entry| entry.record.id().clone()).collect()
    }

    /// Number of waiting tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .heap
            .iter()
            .filter(|entry| entry.record.state() == TaskState::Queued)
            .count()
    }

    /// Whether no task is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tasks timed out at dequeue
    #[must_use]
    pub fn expired_count(&self) -> u64 {
        self.expired.get()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::task::{Task, TaskRequest};

    fn record(priority: i32, sequence: u64) -> Arc<TaskRecord> {
        let task = Task::from_request(TaskRequest::new("q").with_priority(priority));
        Arc::new(TaskRecord::new(task, sequence))
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = PriorityDispatchQueue::new(10);
        let low_a = record(1, 1);
        let low_b = record(1, 2);
        let high = record(5, 3);
        let mid = record(3, 4);

        for r in [&low_a, &low_b, &high, &mid] {
            queue.enqueue(r.clone()).unwrap();
        }
        assert_eq!(
            queue.queued_ids(),
            vec![
                high.id().clone(),
                mid.id().clone(),
                low_a.id().clone(),
                low_b.id().clone()
            ]
        );

        let order: Vec<_> = [
            queue.dequeue().await,
            queue.dequeue().await,
            queue.dequeue().await,
            queue.dequeue().await,
        ]
        .into_iter()
        .map(|r| r.unwrap().sequence())
        .collect();
        assert_eq!(order, vec![3, 4, 1, 2]);
    }

    #[test]
    fn test_full_queue_rejects() {
        let queue = PriorityDispatchQueue::new(2);
        queue.enqueue(record(0, 1)).unwrap();
        queue.enqueue(record(0, 2)).unwrap();

        assert_eq!(
            queue.enqueue(record(9, 3)),
            Err(SubmitError::QueueFull { capacity: 2 })
        );
    }

    #[test]
    fn test_cancelled_entries_free_capacity() {
        let queue = PriorityDispatchQueue::new(1);
        let first = record(0, 1);
        queue.enqueue(first.clone()).unwrap();
        first.finish(Err(TaskFailure::Cancelled)).unwrap();

        assert!(queue.is_empty());
        queue.enqueue(record(0, 2)).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_deadline_rejected() {
        let queue = PriorityDispatchQueue::new(4);
        let task = Task::from_request(
            TaskRequest::new("late").with_deadline(Instant::now() - Duration::from_secs(1)),
        );

        assert_eq!(
            queue.enqueue(Arc::new(TaskRecord::new(task, 1))),
            Err(SubmitError::DeadlineExceeded)
        );
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_while_queued_is_timed_out() {
        let queue = PriorityDispatchQueue::new(4);
        let task = Task::from_request(TaskRequest::new("x").with_timeout(Duration::from_secs(5)));
        let expiring = Arc::new(TaskRecord::new(task, 1));
        let fresh = record(0, 2);
        queue.enqueue(expiring.clone()).unwrap();
        queue.enqueue(fresh.clone()).unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;

        let next = queue.dequeue().await.unwrap();
        assert_eq!(next.id(), fresh.id());
        assert_eq!(expiring.state(), TaskState::TimedOut);
        assert_eq!(queue.expired_count(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_enqueue() {
        let queue = Arc::new(PriorityDispatchQueue::new(4));
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.dequeue().await }
        });
        tokio::task::yield_now().await;

        let r = record(0, 1);
        queue.enqueue(r.clone()).unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.id(), r.id());
    }

    #[tokio::test]
    async fn test_close_wakes_waiters_and_drain_returns_rest() {
        let queue = Arc::new(PriorityDispatchQueue::new(4));
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.dequeue().await }
        });
        tokio::task::yield_now().await;

        queue.close();
        assert!(waiter.await.unwrap().is_none());
        assert_eq!(queue.enqueue(record(0, 1)), Err(SubmitError::ShuttingDown));

        let queue = PriorityDispatchQueue::new(4);
        queue.enqueue(record(1, 1)).unwrap();
        queue.enqueue(record(2, 2)).unwrap();
        queue.close();
        assert!(queue.dequeue().await.is_none());

        let rest: Vec<_> = queue.drain().iter().map(|r| r.sequence()).collect();
        assert_eq!(rest, vec![2, 1]);
    }
}
