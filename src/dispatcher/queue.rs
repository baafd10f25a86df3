//! Bounded priority queue for dispatch retries
//!
//! Higher priority drains first; inside a priority band tasks leave in
//! `created_at` order, with an insertion sequence breaking exact ties.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};

use crate::domain_types::{QueueCapacity, TaskId, TaskPriority};
use crate::error::{FleetError, FleetResult};

/// Queue entry; ordering is (priority desc, created_at asc, seq asc)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    pub task_id: TaskId,
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    seq: u64,
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: greater pops first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Bounded FIFO with priority override
#[derive(Debug)]
pub struct TaskQueue {
    heap: BinaryHeap<QueuedTask>,
    capacity: usize,
    seq: u64,
}

impl TaskQueue {
    /// Creates an empty queue with the given bound
    pub fn new(capacity: QueueCapacity) -> Self {
        Self {
            heap: BinaryHeap::new(),
            capacity: capacity.as_usize(),
            seq: 0,
        }
    }

    /// Enqueues a task reference.
    ///
    /// # Errors
    ///
    /// Returns `no_capacity` when the queue is at its bound.
    pub fn push(
        &mut self,
        task_id: TaskId,
        priority: TaskPriority,
        created_at: DateTime<Utc>,
    ) -> FleetResult<()> {
        if self.heap.len() >= self.capacity {
            return Err(FleetError::NoCapacity {
                task_id: task_id.to_string(),
            });
        }
        self.seq += 1;
        self.heap.push(QueuedTask {
            task_id,
            priority,
            created_at,
            seq: self.seq,
        });
        Ok(())
    }

    /// Removes and returns the highest-priority entry
    pub fn pop(&mut self) -> Option<QueuedTask> {
        self.heap.pop()
    }

    /// Drains every queued entry, highest priority first
    pub fn clear(&mut self) -> Vec<QueuedTask> {
        let mut drained = Vec::with_capacity(self.heap.len());
        while let Some(entry) = self.heap.pop() {
            drained.push(entry);
        }
        drained
    }

    /// Queued entries per priority band
    pub fn stats(&self) -> BTreeMap<u8, usize> {
        let mut stats = BTreeMap::new();
        for entry in &self.heap {
            *stats.entry(entry.priority.as_u8()).or_insert(0) += 1;
        }
        stats
    }

    /// Current queue depth
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue holds no entries
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
