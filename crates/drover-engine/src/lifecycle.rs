//! Task lifecycle state machine
//!
//! Enforces legal transitions and emits one event per edge. Pure: no I/O,
//! no dependencies on the rest of the engine, deterministic and testable.
//!
//! ```text
//! queued -> ready -> assigned -> in_progress -> {completed | failed}
//! failed -> queued (retries remain) | dead (budget exhausted)
//! queued/ready -> blocked (hard dependency can never succeed)
//! any non-terminal -> cancelled
//! ```
//!
//! An illegal edge indicates a coordination bug upstream, so it raises
//! `DroverError::InvalidTransition` rather than silently no-opping.

use chrono::Utc;
use drover_core::{DroverError, Result, Task, TaskStatus, TaskTransition};

use TaskStatus::*;

/// Whether `from -> to` is a legal lifecycle edge
pub fn is_legal(from: TaskStatus, to: TaskStatus) -> bool {
    matches!(
        (from, to),
        (Queued, Ready)
            | (Queued, Blocked)
            | (Queued, Cancelled)
            | (Ready, Assigned)
            | (Ready, Queued)
            | (Ready, Blocked)
            | (Ready, Cancelled)
            | (Assigned, InProgress)
            | (Assigned, Completed)
            | (Assigned, Failed)
            | (Assigned, Cancelled)
            | (InProgress, Completed)
            | (InProgress, Failed)
            | (InProgress, Cancelled)
            | (Failed, Queued)
            | (Failed, Dead)
    )
}

/// Apply a transition to a task, returning the emitted event
pub fn apply(task: &mut Task, to: TaskStatus, reason: impl Into<String>) -> Result<TaskTransition> {
    let from = task.status;
    if !is_legal(from, to) {
        return Err(DroverError::InvalidTransition {
            task_id: task.id,
            from,
            to,
        });
    }

    task.status = to;
    task.updated_at = Utc::now();
    Ok(TaskTransition::new(task.id, from, to, reason))
}
