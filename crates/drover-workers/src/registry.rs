//! Worker registry
//!
//! Tracks the worker fleet as the core sees it. Worker lifecycle (spawning,
//! process supervision) is owned by the agent-lifecycle collaborator; the
//! registry only records capabilities and the busy/idle transitions that
//! result from assignment and completion.

use drover_core::{DroverError, Result, TaskId, Worker, WorkerId, WorkerStatus};
use std::collections::HashMap;
use tracing::debug;

/// Registry of known workers
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, Worker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
        }
    }

    /// Register a new worker
    pub fn register(&mut self, worker: Worker) -> Result<()> {
        if self.workers.contains_key(&worker.id) {
            return Err(DroverError::DuplicateWorker(worker.id));
        }
        debug!("Registering worker {} ({})", worker.id, worker.role);
        self.workers.insert(worker.id.clone(), worker);
        Ok(())
    }

    /// Remove a worker entirely, returning any tasks it still held
    pub fn deregister(&mut self, worker_id: &WorkerId) -> Result<Vec<TaskId>> {
        let worker = self
            .workers
            .remove(worker_id)
            .ok_or_else(|| DroverError::WorkerNotFound(worker_id.clone()))?;
        Ok(worker.active_tasks)
    }

    pub fn get(&self, worker_id: &WorkerId) -> Option<&Worker> {
        self.workers.get(worker_id)
    }

    /// Workers eligible for new assignments: not unavailable, spare capacity
    pub fn idle_workers(&self) -> Vec<&Worker> {
        let mut idle: Vec<&Worker> = self
            .workers
            .values()
            .filter(|w| w.status != WorkerStatus::Unavailable && w.has_spare_capacity())
            .collect();
        idle.sort_by(|a, b| a.id.cmp(&b.id));
        idle
    }

    pub fn all_workers(&self) -> Vec<&Worker> {
        let mut all: Vec<&Worker> = self.workers.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Record an assignment: the worker takes on `task_id`
    ///
    /// Enforces the capacity invariant; exceeding it is a coordination bug
    /// upstream, reported loudly.
    pub fn begin_assignment(&mut self, worker_id: &WorkerId, task_id: TaskId) -> Result<()> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| DroverError::WorkerNotFound(worker_id.clone()))?;

        if !worker.has_spare_capacity() {
            return Err(DroverError::WorkerAtCapacity {
                worker_id: worker_id.clone(),
                capacity: worker.capacity,
            });
        }

        worker.active_tasks.push(task_id);
        worker.status = WorkerStatus::Busy;
        Ok(())
    }

    /// Record that a worker finished (or was relieved of) a task
    pub fn end_assignment(&mut self, worker_id: &WorkerId, task_id: TaskId) -> Result<()> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| DroverError::WorkerNotFound(worker_id.clone()))?;

        worker.active_tasks.retain(|t| *t != task_id);
        if worker.active_tasks.is_empty() && worker.status == WorkerStatus::Busy {
            worker.status = WorkerStatus::Idle;
        }
        Ok(())
    }

    /// Mark a worker unavailable, returning the tasks it was holding
    pub fn mark_unavailable(&mut self, worker_id: &WorkerId) -> Result<Vec<TaskId>> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| DroverError::WorkerNotFound(worker_id.clone()))?;

        worker.status = WorkerStatus::Unavailable;
        Ok(std::mem::take(&mut worker.active_tasks))
    }

    /// Mark a worker available again after an outage
    pub fn mark_idle(&mut self, worker_id: &WorkerId) -> Result<()> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| DroverError::WorkerNotFound(worker_id.clone()))?;

        worker.status = if worker.active_tasks.is_empty() {
            WorkerStatus::Idle
        } else {
            WorkerStatus::Busy
        };
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
