//! Lifecycle and engine events
//!
//! Every state-machine transition emits a [`TaskTransition`]; subscribers
//! (presentation, persistence, the dependency resolver's recomputation
//! triggers) consume them from a broadcast channel. [`EngineEvent`] is the
//! single event type the coordinator reacts to; serializing all triggers
//! through one channel is what makes the assignment transaction atomic.

use crate::types::{TaskId, TaskStatus, WorkerId, WorkerStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single state-machine transition, emitted on every legal edge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTransition {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl TaskTransition {
    pub fn new(task_id: TaskId, from: TaskStatus, to: TaskStatus, reason: impl Into<String>) -> Self {
        Self {
            task_id,
            from,
            to,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Events broadcast to read-only subscribers (presentation, persistence)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum LifecycleEvent {
    /// A task moved between lifecycle states
    Transition(TaskTransition),
    /// Serializable per-task snapshot, emitted alongside every transition
    /// for the persistence collaborator
    Snapshot(TaskSnapshot),
    /// A task exhausted its retry budget and was dead-lettered
    DeadLettered { task_id: TaskId, error: String },
    /// Queued tasks older than the stuck timeout, surfaced by the sweep
    Stuck { task_ids: Vec<TaskId> },
    /// A worker changed availability
    Worker {
        worker_id: WorkerId,
        status: WorkerStatus,
    },
}

/// Triggers the coordinator reacts to
///
/// Commands mutate state directly; everything asynchronous (worker
/// notifications, timers, the health sweep) arrives as one of these.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Worker reported a task outcome
    TaskOutcome {
        task_id: TaskId,
        success: bool,
        detail: String,
    },
    /// Worker reported progress on an assigned task
    TaskProgress { task_id: TaskId },
    /// Worker became idle (freed by the lifecycle collaborator)
    WorkerIdle(WorkerId),
    /// Worker dropped out
    WorkerUnavailable(WorkerId),
    /// A retry backoff gate elapsed
    RetryDue(TaskId),
    /// Periodic health sweep tick
    Sweep,
}

/// Per-transition snapshot handed to the persistence collaborator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub assigned_worker: Option<WorkerId>,
    pub updated_at: DateTime<Utc>,
}
