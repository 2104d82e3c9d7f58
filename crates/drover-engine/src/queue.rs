//! Ready queue
//!
//! Ordered backlog of tasks whose hard dependencies are satisfied.
//! Ordering key: effective priority descending, then creation time
//! ascending, then insertion sequence — FIFO within a priority tier, so
//! scheduling is fair and deterministic under test.
//!
//! Binary heap with lazy invalidation: priority updates push a fresh
//! entry and stale ones are discarded when they surface, giving O(log n)
//! insert/update and amortized O(1) peek.

use chrono::{DateTime, Utc};
use drover_core::TaskId;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// A queue entry; opaque outside the crate. Popping returns it so the
/// scheduler can restore a task without costing it its FIFO slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    effective: i32,
    created_at: DateTime<Utc>,
    seq: u64,
    pub(crate) task_id: TaskId,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher effective first, then earlier creation,
        // then earlier insertion
        self.effective
            .cmp(&other.effective)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue over ready tasks
#[derive(Debug, Default)]
pub struct ReadyQueue {
    heap: BinaryHeap<Entry>,
    /// Authoritative membership and current key per task; heap entries
    /// that disagree are stale
    live: HashMap<TaskId, Entry>,
    next_seq: u64,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a task, or reposition it if already queued
    pub fn push(&mut self, task_id: TaskId, effective: i32, created_at: DateTime<Utc>) {
        if self.live.contains_key(&task_id) {
            self.update_priority(task_id, effective);
            return;
        }
        let entry = Entry {
            effective,
            created_at,
            seq: self.next_seq,
            task_id,
        };
        self.next_seq += 1;
        self.live.insert(task_id, entry.clone());
        self.heap.push(entry);
    }

    /// Reposition a task under a new effective priority
    ///
    /// The original insertion sequence is retained so FIFO ties among
    /// equal-priority peers inserted earlier are not disturbed.
    pub fn update_priority(&mut self, task_id: TaskId, effective: i32) {
        if let Some(current) = self.live.get_mut(&task_id) {
            if current.effective == effective {
                return;
            }
            current.effective = effective;
            let entry = current.clone();
            self.heap.push(entry);
        }
    }

    /// Remove a task from the queue
    pub fn remove(&mut self, task_id: TaskId) -> bool {
        self.live.remove(&task_id).is_some()
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.live.contains_key(&task_id)
    }

    /// Highest-ranked task without removing it
    pub fn peek(&mut self) -> Option<TaskId> {
        self.discard_stale();
        self.heap.peek().map(|e| e.task_id)
    }

    /// Pop the highest-ranked task satisfying `predicate`
    ///
    /// Entries that fail the predicate are set aside and restored, so a
    /// high-priority task nobody can take does not starve satisfiable
    /// lower-priority tasks in the same pass.
    pub fn pop_best<F>(&mut self, predicate: F) -> Option<TaskId>
    where
        F: FnMut(TaskId) -> bool,
    {
        self.pop_best_entry(predicate).map(|e| e.task_id)
    }

    /// Like [`pop_best`](Self::pop_best) but returns the full entry so it
    /// can be restored via [`restore_entry`](Self::restore_entry)
    pub fn pop_best_entry<F>(&mut self, mut predicate: F) -> Option<Entry>
    where
        F: FnMut(TaskId) -> bool,
    {
        let mut skipped: Vec<Entry> = Vec::new();
        let mut found = None;

        while let Some(entry) = self.heap.pop() {
            if !self.is_current(&entry) {
                continue;
            }
            if predicate(entry.task_id) {
                self.live.remove(&entry.task_id);
                found = Some(entry);
                break;
            }
            skipped.push(entry);
        }

        for entry in skipped {
            self.heap.push(entry);
        }
        found
    }

    /// Re-insert a previously popped entry with its original key, so the
    /// task keeps its place among equal-priority peers
    pub fn restore_entry(&mut self, entry: Entry) {
        self.next_seq = self.next_seq.max(entry.seq + 1);
        self.live.insert(entry.task_id, entry.clone());
        self.heap.push(entry);
    }

    /// Queued task ids in rank order (diagnostics and tests)
    pub fn ranked(&self) -> Vec<TaskId> {
        let mut entries: Vec<&Entry> = self.live.values().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.iter().map(|e| e.task_id).collect()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    fn is_current(&self, entry: &Entry) -> bool {
        self.live
            .get(&entry.task_id)
            .map(|live| live == entry)
            .unwrap_or(false)
    }

    fn discard_stale(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.is_current(top) {
                return;
            }
            self.heap.pop();
        }
    }
}
