// src/runtime/task_queue.rs
//! Priority queue feeding the worker pool
//!
//! A single shared queue ordered by priority (1 first), then by submission
//! order. Workers block on a condition variable until work arrives, the
//! poll timeout expires, or the queue is closed.
//!
//! # Architecture
//!
//! ```text
//!   submit ──► push ──┐                    ┌──► worker-0
//!   recovery ─► push ─┤   BinaryHeap       ├──► worker-1
//!   requeue ──► push ─┤ (priority, seq) ───┼──► worker-2
//!   cancel ◄── remove ┘                    └──► ...
//! ```

use crate::model::TaskId;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};
use tracing::trace;

/// A queued reference to a stored task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub task_id: TaskId,
    pub domain: String,

    /// 1 (most urgent) to 10
    pub priority: u8,

    /// Submission order; assigned by the queue on every push
    pub seq: u64,
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: the smallest (priority, seq) must compare greatest
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueState {
    heap: BinaryHeap<QueuedTask>,
    next_seq: u64,
    closed: bool,
}

/// Queue statistics
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub total_pushed: u64,
    pub closed: bool,
}

pub struct TaskQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Enqueue a task behind everything already queued at its priority
    pub fn push(&self, task_id: TaskId, domain: impl Into<String>, priority: u8) -> u64 {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(QueuedTask {
            task_id,
            domain: domain.into(),
            priority,
            seq,
        });
        drop(state);

        trace!(task_id = %task_id, priority, seq, "Task queued");
        self.available.notify_one();
        seq
    }

    /// Put a popped entry back at the end of its priority band
    pub fn requeue(&self, entry: QueuedTask) -> u64 {
        self.push(entry.task_id, entry.domain, entry.priority)
    }

    /// Pop the most urgent entry without blocking
    pub fn try_pop(&self) -> Option<QueuedTask> {
        self.state.lock().heap.pop()
    }

    /// Pop the most urgent entry, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` on timeout or once the queue is closed.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<QueuedTask> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            if state.closed {
                return None;
            }
            if let Some(entry) = state.heap.pop() {
                return Some(entry);
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                return if state.closed { None } else { state.heap.pop() };
            }
        }
    }

    /// Drop the entry for `task_id`; returns whether one was queued
    pub fn remove(&self, task_id: TaskId) -> bool {
        let mut state = self.state.lock();
        let before = state.heap.len();
        state.heap.retain(|entry| entry.task_id != task_id);
        before != state.heap.len()
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.state.lock().heap.iter().any(|entry| entry.task_id == task_id)
    }

    /// Wake every waiting worker and refuse further pops
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            depth: state.heap.len(),
            total_pushed: state.next_seq,
            closed: state.closed,
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;
    use ulid::Ulid;

    #[test]
    fn test_priority_then_fifo() {
        let queue = TaskQueue::new();
        let low = Ulid::new();
        let urgent_a = Ulid::new();
        let urgent_b = Ulid::new();

        queue.push(low, "general", 5);
        queue.push(urgent_a, "general", 1);
        queue.push(urgent_b, "general", 1);

        assert_eq!(queue.try_pop().unwrap().task_id, urgent_a);
        assert_eq!(queue.try_pop().unwrap().task_id, urgent_b);
        assert_eq!(queue.try_pop().unwrap().task_id, low);
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn test_requeue_goes_behind_its_band() {
        let queue = TaskQueue::new();
        let first = Ulid::new();
        let second = Ulid::new();
        queue.push(first, "sports", 3);
        queue.push(second, "sports", 3);

        let popped = queue.try_pop().unwrap();
        assert_eq!(popped.task_id, first);
        queue.requeue(popped);

        assert_eq!(queue.try_pop().unwrap().task_id, second);
        assert_eq!(queue.try_pop().unwrap().task_id, first);
    }

    #[test]
    fn test_remove() {
        let queue = TaskQueue::new();
        let id = Ulid::new();
        queue.push(id, "general", 5);
        assert!(queue.contains(id));
        assert!(queue.remove(id));
        assert!(!queue.remove(id));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_timeout_expires() {
        let queue = TaskQueue::new();
        let start = Instant::now();
        assert!(queue.pop_timeout(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let queue = Arc::new(TaskQueue::new());
        let id = Ulid::new();

        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_timeout(Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        queue.push(id, "general", 5);

        let popped = consumer.join().unwrap();
        assert_eq!(popped.map(|e| e.task_id), Some(id));
    }

    #[test]
    fn test_close_releases_waiters() {
        let queue = Arc::new(TaskQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_timeout(Duration::from_secs(30)))
        };

        thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(waiter.join().unwrap().is_none());
        assert!(queue.stats().closed);
    }

    proptest! {
        #[test]
        fn prop_pops_in_priority_then_submission_order(priorities in prop::collection::vec(1u8..=10, 1..64)) {
            let queue = TaskQueue::new();
            for p in &priorities {
                queue.push(Ulid::new(), "general", *p);
            }

            let mut popped = Vec::new();
            while let Some(entry) = queue.try_pop() {
                popped.push((entry.priority, entry.seq));
            }

            prop_assert_eq!(popped.len(), priorities.len());
            for pair in popped.windows(2) {
                prop_assert!(pair[0] < pair[1]);
            }
        }
    }
}
