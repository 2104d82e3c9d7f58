//! Worker endpoint boundary
//!
//! The agent-lifecycle collaborator (process spawning, stdio plumbing for a
//! specific AI CLI) lives behind [`WorkerEndpoint`]. The core only enqueues
//! notifications here; actual task execution happens out of process, and
//! outcomes come back asynchronously as engine events.

use async_trait::async_trait;
use drover_core::{Result, Task, TaskId, WorkerId};
use std::collections::HashSet;
use std::sync::Mutex;

/// Boundary to the agent-lifecycle collaborator
///
/// Implementations must be quick: hand the notification off and return.
/// The coordinator treats a returned error as a handoff failure and routes
/// it through the resilience layer.
#[async_trait]
pub trait WorkerEndpoint: Send + Sync {
    /// Notify a worker that a task has been assigned to it
    async fn notify_assigned(&self, worker_id: &WorkerId, task: &Task) -> Result<()>;

    /// Ask a worker to abandon a task (cancellation, timeout reassignment)
    async fn notify_cancelled(&self, worker_id: &WorkerId, task_id: TaskId) -> Result<()>;
}

/// Scriptable endpoint for tests
///
/// Records every notification and fails handoffs to workers registered via
/// [`with_failing_worker`](MockWorkerEndpoint::with_failing_worker).
#[derive(Default)]
pub struct MockWorkerEndpoint {
    failing: Mutex<HashSet<WorkerId>>,
    assignments: Mutex<Vec<(WorkerId, TaskId)>>,
    cancellations: Mutex<Vec<(WorkerId, TaskId)>>,
}

impl MockWorkerEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every handoff to `worker_id` fail
    pub fn with_failing_worker(self, worker_id: impl Into<WorkerId>) -> Self {
        self.failing.lock().unwrap().insert(worker_id.into());
        self
    }

    /// Stop failing handoffs to `worker_id`
    pub fn heal_worker(&self, worker_id: &WorkerId) {
        self.failing.lock().unwrap().remove(worker_id);
    }

    /// All recorded (worker, task) handoffs, in order
    pub fn assignments(&self) -> Vec<(WorkerId, TaskId)> {
        self.assignments.lock().unwrap().clone()
    }

    /// All recorded (worker, task) cancellations, in order
    pub fn cancellations(&self) -> Vec<(WorkerId, TaskId)> {
        self.cancellations.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerEndpoint for MockWorkerEndpoint {
    async fn notify_assigned(&self, worker_id: &WorkerId, task: &Task) -> Result<()> {
        if self.failing.lock().unwrap().contains(worker_id) {
            return Err(drover_core::DroverError::Execution {
                task_id: task.id,
                worker_id: worker_id.clone(),
                attempt: task.retry_count + 1,
                detail: "mock handoff failure".to_string(),
            });
        }
        self.assignments
            .lock()
            .unwrap()
            .push((worker_id.clone(), task.id));
        Ok(())
    }

    async fn notify_cancelled(&self, worker_id: &WorkerId, task_id: TaskId) -> Result<()> {
        self.cancellations
            .lock()
            .unwrap()
            .push((worker_id.clone(), task_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::Task;

    #[tokio::test]
    async fn test_mock_records_assignments() {
        let endpoint = MockWorkerEndpoint::new();
        let task = Task::new("test");

        endpoint
            .notify_assigned(&"w-1".to_string(), &task)
            .await
            .unwrap();

        let recorded = endpoint.assignments();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0], ("w-1".to_string(), task.id));
    }

    #[tokio::test]
    async fn test_mock_failing_worker() {
        let endpoint = MockWorkerEndpoint::new().with_failing_worker("w-bad");
        let task = Task::new("test");

        let result = endpoint.notify_assigned(&"w-bad".to_string(), &task).await;
        assert!(result.is_err());
        assert!(endpoint.assignments().is_empty());

        endpoint.heal_worker(&"w-bad".to_string());
        endpoint
            .notify_assigned(&"w-bad".to_string(), &task)
            .await
            .unwrap();
        assert_eq!(endpoint.assignments().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_records_cancellations() {
        let endpoint = MockWorkerEndpoint::new();
        let task = Task::new("test");

        endpoint
            .notify_cancelled(&"w-1".to_string(), task.id)
            .await
            .unwrap();
        assert_eq!(endpoint.cancellations(), vec![("w-1".to_string(), task.id)]);
    }
}
