//! Priority queue of pending task ids
//!
//! Highest priority first; among equal priorities, first enqueued first.

use super::types::TaskPriority;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueuedTask {
    priority: TaskPriority,
    seq: u64,
    id: Uuid,
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    heap: BinaryHeap<QueuedTask>,
    next_seq: u64,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, id: Uuid, priority: TaskPriority) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedTask { priority, seq, id });
    }

    pub(crate) fn pop(&mut self) -> Option<Uuid> {
        self.heap.pop().map(|queued| queued.id)
    }

    pub(crate) fn remove(&mut self, id: Uuid) -> bool {
        let before = self.heap.len();
        self.heap.retain(|queued| queued.id != id);
        self.heap.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_highest_priority_first() {
        let mut queue = TaskQueue::new();
        let low = Uuid::new_v4();
        let critical = Uuid::new_v4();
        queue.push(low, TaskPriority::Low);
        queue.push(critical, TaskPriority::Critical);
        assert_eq!(queue.pop(), Some(critical));
        assert_eq!(queue.pop(), Some(low));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fifo_among_equal_priority() {
        let mut queue = TaskQueue::new();
        let ids: Vec<Uuid> = (0..20).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            queue.push(*id, TaskPriority::Normal);
        }
        let popped: Vec<Uuid> = std::iter::from_fn(|| queue.pop()).collect();
        assert_eq!(popped, ids);
    }

    #[test]
    fn test_remove() {
        let mut queue = TaskQueue::new();
        let keep = Uuid::new_v4();
        let drop = Uuid::new_v4();
        queue.push(keep, TaskPriority::High);
        queue.push(drop, TaskPriority::High);
        assert!(queue.remove(drop));
        assert!(!queue.remove(drop));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop(), Some(keep));
    }
}
