//! Bounded, priority-ordered task queue (spec §4.6).

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use super::task::{Priority, Task};

struct Inner {
    high: VecDeque<Task>,
    medium: VecDeque<Task>,
    low: VecDeque<Task>,
    capacity: usize,
    closed: bool,
}

/// A bounded FIFO per priority level. `pop` always prefers HIGH over MEDIUM
/// over LOW. `close` wakes exactly `worker_count` waiters with a null task
/// (`None`), matching how Workers are told to stop.
pub struct TaskQueue {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        TaskQueue {
            inner: Mutex::new(Inner {
                high: VecDeque::new(),
                medium: VecDeque::new(),
                low: VecDeque::new(),
                capacity,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn queue_for(inner: &mut Inner, priority: Priority) -> &mut VecDeque<Task> {
        match priority {
            Priority::High => &mut inner.high,
            Priority::Medium => &mut inner.medium,
            Priority::Low => &mut inner.low,
        }
    }

    fn len(inner: &Inner) -> usize {
        inner.high.len() + inner.medium.len() + inner.low.len()
    }

    /// Push a task, blocking the caller while the queue is full. Fails if
    /// the queue has been closed (spec §4.6 "Push ... fails when closed").
    pub fn push(&self, task: Task) -> Result<(), ()> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return Err(());
            }
            if Self::len(&inner) < inner.capacity {
                break;
            }
            inner = self.not_full.wait(inner).unwrap();
        }
        let priority = task.priority();
        Self::queue_for(&mut inner, priority).push_back(task);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pop the highest-priority available task, blocking until one exists
    /// or the queue is closed and drained, in which case `None` is returned.
    pub fn pop(&self) -> Option<Task> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(t) = inner.high.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Some(t);
            }
            if let Some(t) = inner.medium.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Some(t);
            }
            if let Some(t) = inner.low.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Some(t);
            }
            if inner.closed {
                return None;
            }
            inner = self.not_empty.wait(inner).unwrap();
        }
    }

    /// Mark the queue closed and wake exactly `worker_count` waiters so each
    /// Worker's next `pop` returns `None` (spec §4.6, §5 cancellation (a)).
    pub fn shutdown(&self, worker_count: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        drop(inner);
        for _ in 0..worker_count {
            self.not_empty.notify_one();
        }
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn high_priority_pops_before_low() {
        let q = TaskQueue::new(10);
        q.push(Task::ChunkTable {
            schema: "s".into(),
            table: "t".into(),
        })
        .unwrap();
        q.push(Task::DumpSchemaDDL { schema: "s".into() }).unwrap();

        let first = q.pop().unwrap();
        assert!(matches!(first, Task::DumpSchemaDDL { .. }));
    }

    #[test]
    fn shutdown_wakes_waiters_with_none() {
        let q = TaskQueue::new(10);
        q.shutdown(1);
        assert_eq!(q.pop().is_none(), true);
    }

    #[test]
    fn push_after_shutdown_fails() {
        let q = TaskQueue::new(10);
        q.shutdown(0);
        let result = q.push(Task::DumpSchemaDDL { schema: "s".into() });
        assert!(result.is_err());
    }
}
