//! Dead letter queue
//!
//! Tasks that exhaust their retry budget land here, append-only. Records
//! are never auto-reprocessed; an operator decides what to do with them.

use chrono::{DateTime, Utc};
use drover_core::TaskId;
use serde::{Deserialize, Serialize};

/// A task permanently removed from the active queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub task_id: TaskId,
    /// The last error before the retry cap was hit
    pub error: String,
    pub retry_count: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Append-only collection of dead-lettered tasks
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct DeadLetterQueue {
    records: Vec<DeadLetterRecord>,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record; returns a reference to the stored entry
    pub fn push(&mut self, task_id: TaskId, error: impl Into<String>, retry_count: u32) -> &DeadLetterRecord {
        self.records.push(DeadLetterRecord {
            task_id,
            error: error.into(),
            retry_count,
            recorded_at: Utc::now(),
        });
        self.records.last().unwrap()
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.records.iter().any(|r| r.task_id == task_id)
    }

    /// How many records reference `task_id` (the retry-cap invariant
    /// requires exactly one)
    pub fn count_for(&self, task_id: TaskId) -> usize {
        self.records.iter().filter(|r| r.task_id == task_id).count()
    }

    pub fn records(&self) -> &[DeadLetterRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
