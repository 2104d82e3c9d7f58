//! Unified error taxonomy for Drover
//!
//! Every error carries enough context (task id, worker id, attempt count,
//! underlying cause) to reconstruct the decision chain without replaying
//! logs line by line. Soft assignment conditions (no capable worker,
//! resource conflict) are deliberately NOT errors; tasks stay queued and
//! are retried on the next trigger.

use crate::types::{TaskId, TaskStatus, WorkerId};
use thiserror::Error;

/// Unified error type for all Drover operations
#[derive(Error, Debug)]
pub enum DroverError {
    // Validation errors: rejected synchronously, never enter the store
    #[error("invalid task config: {0}")]
    InvalidTaskConfig(String),

    #[error("cyclic hard dependency: {task_id} -> {depends_on}")]
    DependencyCycle { task_id: TaskId, depends_on: TaskId },

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("worker not found: {0}")]
    WorkerNotFound(WorkerId),

    #[error("duplicate worker id: {0}")]
    DuplicateWorker(WorkerId),

    #[error("worker {worker_id} is at capacity ({capacity})")]
    WorkerAtCapacity { worker_id: WorkerId, capacity: usize },

    // Lifecycle errors: an illegal edge indicates a coordination bug upstream
    #[error("illegal transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    // Readiness errors: surfaced as terminal status, never retried
    #[error("task {task_id} blocked permanently: {reason}")]
    BlockedPermanently { task_id: TaskId, reason: String },

    // Execution errors: routed through retry/backoff/dead-letter
    #[error("worker {worker_id} failed task {task_id} on attempt {attempt}: {detail}")]
    Execution {
        task_id: TaskId,
        worker_id: WorkerId,
        attempt: u32,
        detail: String,
    },

    // Circuit-open: systemic unavailability, distinct from a single failure
    #[error("target {0} temporarily unavailable (circuit open)")]
    CircuitOpen(WorkerId),

    // Protocol errors: logged and dropped at the router boundary
    #[error("malformed envelope: {0}")]
    Protocol(String),

    // I/O and serialization passthrough (snapshots, config)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

/// Result type alias using DroverError
pub type Result<T> = std::result::Result<T, DroverError>;
