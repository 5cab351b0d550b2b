//! In-memory lane queues

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

use crate::task::LaneTask;

/// Heap entry ordered by (priority desc, admission seq asc)
struct PrioEntry {
    priority: i32,
    seq: u64,
    task: LaneTask,
}

impl PartialEq for PrioEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for PrioEntry {}

impl PartialOrd for PrioEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrioEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority wins, earlier
        // admission breaks ties.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum QueueInner {
    Fifo(VecDeque<LaneTask>),
    Priority(BinaryHeap<PrioEntry>),
}

/// Bounded-by-caller task queue, FIFO or priority ordered
pub struct LaneQueue {
    inner: QueueInner,
    seq: u64,
}

impl LaneQueue {
    /// Create a queue with the requested ordering
    pub fn new(priority: bool) -> Self {
        let inner = if priority {
            QueueInner::Priority(BinaryHeap::new())
        } else {
            QueueInner::Fifo(VecDeque::new())
        };
        Self { inner, seq: 0 }
    }

    /// Append a task
    pub fn push(&mut self, task: LaneTask) {
        match &mut self.inner {
            QueueInner::Fifo(queue) => queue.push_back(task),
            QueueInner::Priority(heap) => {
                let seq = self.seq;
                self.seq += 1;
                heap.push(PrioEntry {
                    priority: task.priority,
                    seq,
                    task,
                });
            }
        }
    }

    /// Take the next task in lane order
    pub fn pop(&mut self) -> Option<LaneTask> {
        match &mut self.inner {
            QueueInner::Fifo(queue) => queue.pop_front(),
            QueueInner::Priority(heap) => heap.pop().map(|entry| entry.task),
        }
    }

    /// Remove a queued task by identifier
    pub fn remove(&mut self, task_id: &str) -> Option<LaneTask> {
        match &mut self.inner {
            QueueInner::Fifo(queue) => {
                let pos = queue.iter().position(|t| t.task_id == task_id)?;
                queue.remove(pos)
            }
            QueueInner::Priority(heap) => {
                let mut removed = None;
                let entries: Vec<PrioEntry> = std::mem::take(heap).into_vec();
                let mut kept = BinaryHeap::with_capacity(entries.len());
                for entry in entries {
                    if removed.is_none() && entry.task.task_id == task_id {
                        removed = Some(entry.task);
                    } else {
                        kept.push(entry);
                    }
                }
                *heap = kept;
                removed
            }
        }
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        match &self.inner {
            QueueInner::Fifo(queue) => queue.len(),
            QueueInner::Priority(heap) => heap.len(),
        }
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return everything, in lane order
    pub fn drain(&mut self) -> Vec<LaneTask> {
        let mut out = Vec::with_capacity(self.len());
        while let Some(task) = self.pop() {
            out.push(task);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use troupe_core::WorkflowId;

    fn task(id: &str, priority: i32) -> LaneTask {
        LaneTask::new(WorkflowId::new(), id, serde_json::Value::Null).with_priority(priority)
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = LaneQueue::new(false);
        queue.push(task("a", 5));
        queue.push(task("b", 50));
        assert_eq!(queue.pop().map(|t| t.task_id), Some("a".to_string()));
        assert_eq!(queue.pop().map(|t| t.task_id), Some("b".to_string()));
    }

    #[test]
    fn test_priority_order_highest_first() {
        let mut queue = LaneQueue::new(true);
        queue.push(task("low", 1));
        queue.push(task("high", 10));
        queue.push(task("mid", 5));
        let order: Vec<String> = std::iter::from_fn(|| queue.pop().map(|t| t.task_id)).collect();
        assert_eq!(order, vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_priority_tie_is_fifo() {
        let mut queue = LaneQueue::new(true);
        queue.push(task("first", 3));
        queue.push(task("second", 3));
        assert_eq!(queue.pop().map(|t| t.task_id), Some("first".to_string()));
        assert_eq!(queue.pop().map(|t| t.task_id), Some("second".to_string()));
    }

    #[test]
    fn test_remove_from_heap_keeps_order() {
        let mut queue = LaneQueue::new(true);
        queue.push(task("a", 1));
        queue.push(task("b", 2));
        queue.push(task("c", 3));
        assert!(queue.remove("b").is_some());
        assert!(queue.remove("b").is_none());
        let order: Vec<String> = std::iter::from_fn(|| queue.pop().map(|t| t.task_id)).collect();
        assert_eq!(order, vec!["c", "a"]);
    }

    #[test]
    fn test_drain_returns_lane_order() {
        let mut queue = LaneQueue::new(true);
        queue.push(task("a", 1));
        queue.push(task("b", 9));
        let drained: Vec<String> = queue.drain().into_iter().map(|t| t.task_id).collect();
        assert_eq!(drained, vec!["b", "a"]);
        assert!(queue.is_empty());
    }
}
