//! Coordinator: the assignment engine and command surface
//!
//! Owns every piece of mutable orchestration state (store, ready queue,
//! worker registry, circuit breakers, dead letters, router) behind one
//! lock, so the assignment transaction and dependency-driven priority
//! recomputation are mutually exclusive by construction: at most one
//! worker is ever assigned to a task, and no worker exceeds its declared
//! capacity.
//!
//! Scheduling is purely reactive. Commands, worker notifications, retry
//! timers, and the periodic health sweep (a safety net for dropped
//! events, not the primary mechanism) each run one scheduling pass; the
//! pass stops as soon as no candidate pair matches. No busy-waiting.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use drover_core::fail_open::fail_open;
use drover_core::{
    DroverConfig, DroverError, EngineEvent, LifecycleEvent, Result, Task, TaskConfig, TaskId,
    TaskSnapshot, TaskStatus, TaskTransition, Worker, WorkerId, WorkerStatus,
};
use drover_workers::{
    backoff, CircuitBreaker, CircuitState, DeadLetterQueue, DeadLetterRecord, WorkerEndpoint,
    WorkerRegistry,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::deps::{self, Readiness};
use crate::lifecycle;
use crate::matcher;
use crate::queue::ReadyQueue;
use crate::router::{Envelope, EnvelopeKind, MessageRouter};
use crate::snapshot::EngineSnapshot;
use crate::store::TaskStore;

/// Sender id the coordinator uses on the wire
pub const COORDINATOR_ID: &str = "coordinator";

pub(crate) struct EngineState {
    pub(crate) store: TaskStore,
    pub(crate) queue: ReadyQueue,
    pub(crate) registry: WorkerRegistry,
    pub(crate) breakers: HashMap<WorkerId, CircuitBreaker>,
    pub(crate) dead_letters: DeadLetterQueue,
    pub(crate) router: MessageRouter,
    /// Progress deadline per active task
    pub(crate) deadlines: HashMap<TaskId, DateTime<Utc>>,
}

impl EngineState {
    fn new() -> Self {
        Self {
            store: TaskStore::new(),
            queue: ReadyQueue::new(),
            registry: WorkerRegistry::new(),
            breakers: HashMap::new(),
            dead_letters: DeadLetterQueue::new(),
            router: MessageRouter::new(),
            deadlines: HashMap::new(),
        }
    }
}

/// Side effects accumulated under the lock, applied after release
#[derive(Default)]
struct Effects {
    events: Vec<LifecycleEvent>,
    retry_timers: Vec<(TaskId, Duration)>,
}

struct Inner<E> {
    config: DroverConfig,
    endpoint: E,
    state: Mutex<EngineState>,
    events_tx: broadcast::Sender<LifecycleEvent>,
}

/// The orchestration coordinator
///
/// Cheap to clone; clones share the same engine state.
pub struct Coordinator<E: WorkerEndpoint> {
    inner: Arc<Inner<E>>,
}

impl<E: WorkerEndpoint> Clone for Coordinator<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: WorkerEndpoint + 'static> Coordinator<E> {
    pub fn new(config: DroverConfig, endpoint: E) -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                config,
                endpoint,
                state: Mutex::new(EngineState::new()),
                events_tx,
            }),
        }
    }

    /// Rebuild a coordinator from a persisted snapshot
    ///
    /// Tasks that were in flight re-enter the backlog (the workers that
    /// held them are gone after a restart); readiness is re-run before
    /// the queue is repopulated.
    pub fn restore(config: DroverConfig, endpoint: E, snapshot: EngineSnapshot) -> Result<Self> {
        let mut tasks = snapshot.tasks;
        for task in &mut tasks {
            if task.status.is_active()
                || task.status == TaskStatus::Ready
                || task.status == TaskStatus::Failed
            {
                task.status = TaskStatus::Queued;
                task.assigned_worker = None;
            }
        }

        let mut state = EngineState::new();
        state.store = TaskStore::from_tasks(tasks)?;
        state.dead_letters = snapshot.dead_letters;
        for (worker_id, circuit) in snapshot.circuits {
            state
                .breakers
                .insert(worker_id, CircuitBreaker::restore(config.circuit.clone(), circuit));
        }

        // Re-run readiness in creation order so queue ranking is
        // identical to the pre-snapshot state
        let mut fx = Effects::default();
        let now = Utc::now();
        let queued: Vec<TaskId> = state
            .store
            .all_tasks()
            .iter()
            .filter(|t| t.status == TaskStatus::Queued)
            .map(|t| t.id)
            .collect();
        for task_id in queued {
            ready_or_block(&config, &mut state, &mut fx, task_id, now)?;
        }
        // No subscribers exist yet; restoration replays are not events

        let (events_tx, _) = broadcast::channel(1024);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                endpoint,
                state: Mutex::new(state),
                events_tx,
            }),
        })
    }

    /// Subscribe to lifecycle events (presentation, persistence)
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events_tx.subscribe()
    }

    // ---- command surface -------------------------------------------------

    /// Create a task and schedule a pass
    pub async fn create_task(&self, config: TaskConfig) -> Result<TaskId> {
        if config.title.trim().is_empty() {
            return Err(DroverError::InvalidTaskConfig(
                "title must not be empty".to_string(),
            ));
        }

        let task = config.build();
        let task_id = task.id;
        let mut fx = Effects::default();
        {
            let mut state = self.inner.state.lock().await;
            state.store.insert(task)?;
            info!("Task {} created", task_id);
            ready_or_block(&self.inner.config, &mut state, &mut fx, task_id, Utc::now())?;
            self.schedule(&mut state, &mut fx).await;
        }
        self.finish(fx);
        Ok(task_id)
    }

    /// Cancel a task, releasing its worker immediately if one holds it
    pub async fn cancel_task(&self, task_id: TaskId) -> Result<()> {
        let mut fx = Effects::default();
        {
            let mut state = self.inner.state.lock().await;
            let task = state
                .store
                .get(task_id)
                .ok_or(DroverError::TaskNotFound(task_id))?;
            let status = task.status;
            let worker = task.assigned_worker.clone();

            if !lifecycle::is_legal(status, TaskStatus::Cancelled) {
                return Err(DroverError::InvalidTransition {
                    task_id,
                    from: status,
                    to: TaskStatus::Cancelled,
                });
            }

            state.queue.remove(task_id);
            state.deadlines.remove(&task_id);
            if let Some(worker_id) = &worker {
                let _ = state.registry.end_assignment(worker_id, task_id);
                let request =
                    Envelope::new(EnvelopeKind::CancelRequest, COORDINATOR_ID, worker_id.as_str())
                        .with_payload(json!({ "task_id": task_id.to_string() }));
                if let Err(e) = state.router.send(worker_id, request) {
                    warn!("Cancel request for {} not routed: {}", task_id, e);
                }
            }
            if let Some(t) = state.store.get_mut(task_id) {
                t.assigned_worker = None;
            }
            emit_transition(&mut state, &mut fx, task_id, TaskStatus::Cancelled, "cancelled by command")?;

            if let Some(worker_id) = &worker {
                if let Err(e) = self.inner.endpoint.notify_cancelled(worker_id, task_id).await {
                    warn!("Worker {} cancel notification failed: {}", worker_id, e);
                }
            }

            settle(&self.inner.config, &mut state, &mut fx, vec![task_id])?;
            self.schedule(&mut state, &mut fx).await;
        }
        self.finish(fx);
        Ok(())
    }

    /// Record a successful outcome for an active task
    pub async fn complete_task(&self, task_id: TaskId) -> Result<()> {
        let mut fx = Effects::default();
        {
            let mut state = self.inner.state.lock().await;
            let task = state
                .store
                .get(task_id)
                .ok_or(DroverError::TaskNotFound(task_id))?;
            let status = task.status;
            let worker = task.assigned_worker.clone();

            if !lifecycle::is_legal(status, TaskStatus::Completed) {
                return Err(DroverError::InvalidTransition {
                    task_id,
                    from: status,
                    to: TaskStatus::Completed,
                });
            }

            if let Some(t) = state.store.get_mut(task_id) {
                t.assigned_worker = None;
            }
            emit_transition(
                &mut state,
                &mut fx,
                task_id,
                TaskStatus::Completed,
                "worker reported success",
            )?;
            state.deadlines.remove(&task_id);
            if let Some(worker_id) = &worker {
                let _ = state.registry.end_assignment(worker_id, task_id);
                if let Some(breaker) = state.breakers.get_mut(worker_id) {
                    breaker.record_success();
                }
            }

            let outcome = Envelope::broadcast(EnvelopeKind::TaskOutcome, COORDINATOR_ID)
                .with_payload(json!({ "task_id": task_id.to_string(), "success": true }));
            state.router.broadcast(outcome);

            settle(&self.inner.config, &mut state, &mut fx, vec![task_id])?;
            self.schedule(&mut state, &mut fx).await;
        }
        self.finish(fx);
        Ok(())
    }

    /// Record a failed outcome for an active task
    ///
    /// Routes through retry/backoff; past the retry cap the task is
    /// dead-lettered instead, with no exceptions.
    pub async fn fail_task(&self, task_id: TaskId, reason: &str) -> Result<()> {
        let mut fx = Effects::default();
        {
            let mut state = self.inner.state.lock().await;
            let task = state
                .store
                .get(task_id)
                .ok_or(DroverError::TaskNotFound(task_id))?;
            let status = task.status;
            if !status.is_active() {
                return Err(DroverError::InvalidTransition {
                    task_id,
                    from: status,
                    to: TaskStatus::Failed,
                });
            }
            if let Some(worker_id) = task.assigned_worker.clone() {
                self.breaker_for(&mut state, &worker_id).record_failure();
            }
            fail_active(&self.inner.config, &mut state, &mut fx, task_id, reason)?;
            self.schedule(&mut state, &mut fx).await;
        }
        self.finish(fx);
        Ok(())
    }

    /// Add a hard dependency edge; may re-gate or permanently block the task
    pub async fn add_hard_dependency(&self, task_id: TaskId, depends_on: TaskId) -> Result<()> {
        let mut fx = Effects::default();
        {
            let mut state = self.inner.state.lock().await;
            state.store.add_hard_dependency(task_id, depends_on)?;

            let verdict = {
                let task = state
                    .store
                    .get(task_id)
                    .ok_or(DroverError::TaskNotFound(task_id))?;
                (task.status, deps::readiness(task, &state.store, Utc::now()))
            };
            match verdict {
                (TaskStatus::Ready, Readiness::Blocked) => {
                    state.queue.remove(task_id);
                    emit_transition(
                        &mut state,
                        &mut fx,
                        task_id,
                        TaskStatus::Queued,
                        "new hard dependency pending",
                    )?;
                }
                (_, Readiness::BlockedPermanently { reason }) => {
                    state.queue.remove(task_id);
                    emit_transition(&mut state, &mut fx, task_id, TaskStatus::Blocked, reason)?;
                    settle(&self.inner.config, &mut state, &mut fx, vec![task_id])?;
                }
                _ => {}
            }
        }
        self.finish(fx);
        Ok(())
    }

    /// Add a soft "prefers" edge; only the effective priority moves
    pub async fn add_soft_dependency(&self, task_id: TaskId, prefers: TaskId) -> Result<()> {
        let mut fx = Effects::default();
        {
            let mut state = self.inner.state.lock().await;
            state.store.add_soft_dependency(task_id, prefers)?;
            reprioritize(&self.inner.config, &mut state, task_id);
        }
        self.finish(fx);
        Ok(())
    }

    /// Remove a task; dependents left with a missing hard dependency are
    /// driven to terminal blocked, never silently dropped
    pub async fn remove_task(&self, task_id: TaskId) -> Result<()> {
        let mut fx = Effects::default();
        {
            let mut state = self.inner.state.lock().await;
            let task = state
                .store
                .get(task_id)
                .ok_or(DroverError::TaskNotFound(task_id))?;
            let worker = task.assigned_worker.clone();

            state.queue.remove(task_id);
            state.deadlines.remove(&task_id);
            if let Some(worker_id) = &worker {
                let _ = state.registry.end_assignment(worker_id, task_id);
                if let Err(e) = self.inner.endpoint.notify_cancelled(worker_id, task_id).await {
                    warn!("Worker {} cancel notification failed: {}", worker_id, e);
                }
            }

            let cascade = state.store.remove(task_id)?;
            info!(
                "Task {} removed; {} dependents stranded",
                task_id,
                cascade.stranded_dependents.len()
            );

            let mut blocked = Vec::new();
            for dependent in cascade.stranded_dependents {
                let Some(status) = state.store.get(dependent).map(|t| t.status) else {
                    continue;
                };
                if matches!(status, TaskStatus::Queued | TaskStatus::Ready) {
                    state.queue.remove(dependent);
                    emit_transition(
                        &mut state,
                        &mut fx,
                        dependent,
                        TaskStatus::Blocked,
                        format!("hard dependency {} removed", task_id),
                    )?;
                    blocked.push(dependent);
                }
            }
            settle(&self.inner.config, &mut state, &mut fx, blocked)?;
            self.schedule(&mut state, &mut fx).await;
        }
        self.finish(fx);
        Ok(())
    }

    // ---- worker surface --------------------------------------------------

    /// Register a worker and run a pass (a new worker may unblock the head)
    pub async fn register_worker(&self, worker: Worker) -> Result<()> {
        let mut fx = Effects::default();
        {
            let mut state = self.inner.state.lock().await;
            let worker_id = worker.id.clone();
            let status = worker.status;
            state.registry.register(worker)?;
            state.router.register(&worker_id);
            fx.events.push(LifecycleEvent::Worker {
                worker_id: worker_id.clone(),
                status,
            });
            let announce = Envelope::broadcast(EnvelopeKind::WorkerStatus, COORDINATOR_ID)
                .with_payload(json!({ "worker_id": worker_id, "status": status.to_string() }));
            state.router.broadcast(announce);
            self.schedule(&mut state, &mut fx).await;
        }
        self.finish(fx);
        Ok(())
    }

    // ---- event intake ----------------------------------------------------

    /// React to an engine event (worker notifications, timers, sweep)
    pub async fn handle_event(&self, event: EngineEvent) -> Result<()> {
        match event {
            EngineEvent::TaskOutcome {
                task_id,
                success,
                detail,
            } => {
                if success {
                    self.complete_task(task_id).await
                } else {
                    self.fail_task(task_id, &detail).await
                }
            }
            EngineEvent::TaskProgress { task_id } => {
                let mut fx = Effects::default();
                {
                    let mut state = self.inner.state.lock().await;
                    let status = state
                        .store
                        .get(task_id)
                        .ok_or(DroverError::TaskNotFound(task_id))?
                        .status;
                    if status == TaskStatus::Assigned {
                        emit_transition(
                            &mut state,
                            &mut fx,
                            task_id,
                            TaskStatus::InProgress,
                            "progress reported",
                        )?;
                    }
                    // Late progress for a task that already left the
                    // worker must not re-arm the timeout
                    if status.is_active() {
                        let deadline = Utc::now()
                            + chrono_ms(self.inner.config.timeouts.assignment_timeout_ms);
                        state.deadlines.insert(task_id, deadline);
                    }
                }
                self.finish(fx);
                Ok(())
            }
            EngineEvent::WorkerIdle(worker_id) => {
                let mut fx = Effects::default();
                {
                    let mut state = self.inner.state.lock().await;
                    state.registry.mark_idle(&worker_id)?;
                    fx.events.push(LifecycleEvent::Worker {
                        worker_id: worker_id.clone(),
                        status: WorkerStatus::Idle,
                    });
                    self.schedule(&mut state, &mut fx).await;
                }
                self.finish(fx);
                Ok(())
            }
            EngineEvent::WorkerUnavailable(worker_id) => {
                let mut fx = Effects::default();
                {
                    let mut state = self.inner.state.lock().await;
                    let orphans = state.registry.mark_unavailable(&worker_id)?;
                    fx.events.push(LifecycleEvent::Worker {
                        worker_id: worker_id.clone(),
                        status: WorkerStatus::Unavailable,
                    });
                    for task_id in orphans {
                        fail_active(
                            &self.inner.config,
                            &mut state,
                            &mut fx,
                            task_id,
                            "worker became unavailable",
                        )?;
                    }
                    self.schedule(&mut state, &mut fx).await;
                }
                self.finish(fx);
                Ok(())
            }
            EngineEvent::RetryDue(task_id) => {
                let mut fx = Effects::default();
                {
                    let mut state = self.inner.state.lock().await;
                    if state.store.get(task_id).map(|t| t.status) == Some(TaskStatus::Queued) {
                        ready_or_block(&self.inner.config, &mut state, &mut fx, task_id, Utc::now())?;
                    }
                    self.schedule(&mut state, &mut fx).await;
                }
                self.finish(fx);
                Ok(())
            }
            EngineEvent::Sweep => self.sweep().await,
        }
    }

    /// Accept a raw wire envelope
    ///
    /// Malformed envelopes are logged and dropped at the router; they
    /// never crash the coordinator and never become task failures.
    pub async fn ingest_envelope(&self, value: Value) -> Result<()> {
        let envelope = {
            let mut state = self.inner.state.lock().await;
            state.router.receive(value)?
        };

        match envelope.kind {
            EnvelopeKind::TaskProgress => {
                let task_id = payload_task_id(&envelope)?;
                self.handle_event(EngineEvent::TaskProgress { task_id }).await
            }
            EnvelopeKind::TaskOutcome => {
                let task_id = payload_task_id(&envelope)?;
                let success = envelope.payload["success"].as_bool().unwrap_or(false);
                let detail = envelope.payload["detail"]
                    .as_str()
                    .unwrap_or("no detail")
                    .to_string();
                self.handle_event(EngineEvent::TaskOutcome {
                    task_id,
                    success,
                    detail,
                })
                .await
            }
            EnvelopeKind::WorkerStatus => {
                let status: WorkerStatus = envelope.payload["status"]
                    .as_str()
                    .unwrap_or_default()
                    .parse()
                    .map_err(DroverError::Protocol)?;
                let worker_id = envelope.from.clone();
                match status {
                    WorkerStatus::Idle => self.handle_event(EngineEvent::WorkerIdle(worker_id)).await,
                    WorkerStatus::Unavailable => {
                        self.handle_event(EngineEvent::WorkerUnavailable(worker_id)).await
                    }
                    WorkerStatus::Busy => Ok(()),
                }
            }
            EnvelopeKind::CancelAck => {
                debug!("Cancel acknowledged by {}", envelope.from);
                Ok(())
            }
            // Outbound-only kinds arriving inbound carry no action
            EnvelopeKind::TaskAssignment | EnvelopeKind::CancelRequest => Ok(()),
        }
    }

    // ---- health sweep ----------------------------------------------------

    /// One pass of the safety net: promote overdue retry gates, fail
    /// timed-out assignments, report stuck tasks, run a scheduling pass
    pub async fn sweep(&self) -> Result<()> {
        let mut fx = Effects::default();
        {
            let mut state = self.inner.state.lock().await;
            let now = Utc::now();

            // Promote queued tasks whose backoff gate elapsed (missed timers)
            let due: Vec<TaskId> = state
                .store
                .all_tasks()
                .iter()
                .filter(|t| t.status == TaskStatus::Queued)
                .map(|t| t.id)
                .collect();
            for task_id in due {
                ready_or_block(&self.inner.config, &mut state, &mut fx, task_id, now)?;
            }

            // Assignments with no progress inside the window are failures
            let overdue: Vec<TaskId> = state
                .deadlines
                .iter()
                .filter(|(_, deadline)| now > **deadline)
                .map(|(task_id, _)| *task_id)
                .collect();
            for task_id in overdue {
                warn!("Task {} saw no progress within the assignment window", task_id);
                let worker = state
                    .store
                    .get(task_id)
                    .and_then(|t| t.assigned_worker.clone());
                if let Some(worker_id) = &worker {
                    self.breaker_for(&mut state, worker_id).record_failure();
                }
                fail_active(
                    &self.inner.config,
                    &mut state,
                    &mut fx,
                    task_id,
                    "no progress within assignment timeout",
                )?;
                if let Some(worker_id) = &worker {
                    if let Err(e) = self.inner.endpoint.notify_cancelled(worker_id, task_id).await {
                        warn!("Worker {} cancel notification failed: {}", worker_id, e);
                    }
                }
            }

            // Surface tasks waiting longer than the stuck threshold
            let stuck_after = chrono_ms(self.inner.config.timeouts.stuck_timeout_ms);
            let stuck: Vec<TaskId> = state
                .store
                .all_tasks()
                .iter()
                .filter(|t| {
                    matches!(t.status, TaskStatus::Queued | TaskStatus::Ready)
                        && now - t.created_at > stuck_after
                })
                .map(|t| t.id)
                .collect();
            if !stuck.is_empty() {
                warn!("{} tasks stuck past the threshold", stuck.len());
                fx.events.push(LifecycleEvent::Stuck { task_ids: stuck });
            }

            self.schedule(&mut state, &mut fx).await;
        }
        self.finish(fx);
        Ok(())
    }

    /// Spawn the periodic sweep; abort the handle to stop it
    pub fn spawn_sweep(&self) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        let interval = self.inner.config.timeouts.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                fail_open("health_sweep", || this.sweep()).await;
            }
        })
    }

    // ---- persistence -----------------------------------------------------

    /// Full serializable engine snapshot
    pub async fn snapshot(&self) -> EngineSnapshot {
        let state = self.inner.state.lock().await;
        EngineSnapshot {
            tasks: state.store.all_tasks().into_iter().cloned().collect(),
            dead_letters: state.dead_letters.clone(),
            circuits: state
                .breakers
                .iter()
                .map(|(id, breaker)| (id.clone(), breaker.snapshot()))
                .collect(),
            taken_at: Utc::now(),
        }
    }

    // ---- queries ---------------------------------------------------------

    pub async fn task(&self, task_id: TaskId) -> Result<Task> {
        let state = self.inner.state.lock().await;
        state
            .store
            .get(task_id)
            .cloned()
            .ok_or(DroverError::TaskNotFound(task_id))
    }

    pub async fn tasks(&self) -> Vec<Task> {
        let state = self.inner.state.lock().await;
        state.store.all_tasks().into_iter().cloned().collect()
    }

    pub async fn worker(&self, worker_id: &WorkerId) -> Option<Worker> {
        let state = self.inner.state.lock().await;
        state.registry.get(worker_id).cloned()
    }

    /// Ready-queue contents in rank order
    pub async fn queued_order(&self) -> Vec<TaskId> {
        let state = self.inner.state.lock().await;
        state.queue.ranked()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        let state = self.inner.state.lock().await;
        state.dead_letters.records().to_vec()
    }

    pub async fn circuit_state(&self, worker_id: &WorkerId) -> Option<CircuitState> {
        let state = self.inner.state.lock().await;
        state.breakers.get(worker_id).map(|b| b.state())
    }

    /// Take queued router envelopes for a recipient (worker pumps)
    pub async fn drain_outbox(&self, recipient: &str) -> Vec<Envelope> {
        let mut state = self.inner.state.lock().await;
        state.router.drain(recipient)
    }

    // ---- internals -------------------------------------------------------

    fn breaker_for<'a>(
        &self,
        state: &'a mut EngineState,
        worker_id: &WorkerId,
    ) -> &'a mut CircuitBreaker {
        let config = self.inner.config.circuit.clone();
        state
            .breakers
            .entry(worker_id.clone())
            .or_insert_with(|| CircuitBreaker::new(config))
    }

    /// One scheduling pass: pair ready tasks with workers until nothing
    /// matches. The pass never waits; another trigger runs the next one.
    async fn schedule(&self, state: &mut EngineState, fx: &mut Effects) {
        loop {
            let candidates: Vec<Worker> = state
                .registry
                .idle_workers()
                .into_iter()
                .filter(|w| {
                    state
                        .breakers
                        .get(&w.id)
                        .map(|b| b.state() != CircuitState::Open)
                        .unwrap_or(true)
                })
                .cloned()
                .collect();
            if candidates.is_empty() {
                break;
            }

            // Highest-ranked task a present worker can take, skipping
            // footprint conflicts (soft back-pressure, not an error)
            let popped = {
                let store = &state.store;
                state.queue.pop_best_entry(|task_id| {
                    let Some(task) = store.get(task_id) else {
                        return false;
                    };
                    if !store.footprint_conflicts(task).is_empty() {
                        return false;
                    }
                    candidates.iter().any(|w| matcher::score(task, w).is_some())
                })
            };
            let Some(entry) = popped else {
                break;
            };
            let task_id = entry.task_id;

            let Some(task) = state.store.get(task_id).cloned() else {
                continue;
            };
            let refs: Vec<&Worker> = candidates.iter().collect();
            let Some(worker) = matcher::pick_best(&task, &refs) else {
                // Predicate guaranteed a match; restore and stop the pass
                state.queue.restore_entry(entry);
                break;
            };
            let worker_id = worker.id.clone();

            if !self.breaker_for(state, &worker_id).try_acquire() {
                // Half-open probe already spent this pass; try again on
                // the next trigger
                state.queue.restore_entry(entry);
                break;
            }

            if let Err(e) = self.assign(state, fx, task_id, &worker_id).await {
                warn!("Assignment of {} to {} failed: {}", task_id, worker_id, e);
                // The transaction never started; give the task its slot back
                if state.store.get(task_id).map(|t| t.status) == Some(TaskStatus::Ready) {
                    state.queue.restore_entry(entry);
                }
            }
        }
    }

    /// The atomic assignment transaction plus the resilience-wrapped handoff
    async fn assign(
        &self,
        state: &mut EngineState,
        fx: &mut Effects,
        task_id: TaskId,
        worker_id: &WorkerId,
    ) -> Result<()> {
        state.registry.begin_assignment(worker_id, task_id)?;
        if let Some(task) = state.store.get_mut(task_id) {
            task.assigned_worker = Some(worker_id.clone());
        }
        emit_transition(
            state,
            fx,
            task_id,
            TaskStatus::Assigned,
            format!("assigned to {}", worker_id),
        )?;
        let deadline = Utc::now() + chrono_ms(self.inner.config.timeouts.assignment_timeout_ms);
        state.deadlines.insert(task_id, deadline);

        let task = state
            .store
            .get(task_id)
            .cloned()
            .ok_or(DroverError::TaskNotFound(task_id))?;
        let notice = Envelope::new(EnvelopeKind::TaskAssignment, COORDINATOR_ID, worker_id.as_str())
            .with_payload(json!({
                "task_id": task_id.to_string(),
                "title": task.title.clone(),
                "description": task.description.clone(),
            }));
        if let Err(e) = state.router.send(worker_id, notice) {
            warn!("Assignment notice for {} not routed: {}", task_id, e);
        }

        match self.inner.endpoint.notify_assigned(worker_id, &task).await {
            Ok(()) => {
                self.breaker_for(state, worker_id).record_success();
                info!("Task {} assigned to {}", task_id, worker_id);
                Ok(())
            }
            Err(e) => {
                self.breaker_for(state, worker_id).record_failure();
                fail_active(
                    &self.inner.config,
                    state,
                    fx,
                    task_id,
                    format!("handoff failed: {}", e),
                )?;
                Ok(())
            }
        }
    }

    /// Apply accumulated side effects outside the lock
    fn finish(&self, fx: Effects) {
        for event in fx.events {
            // No subscribers is normal; events are fire-and-forget
            let _ = self.inner.events_tx.send(event);
        }
        for (task_id, delay) in fx.retry_timers {
            let this = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = this.handle_event(EngineEvent::RetryDue(task_id)).await {
                    warn!("Retry trigger for {} failed: {}", task_id, e);
                }
            });
        }
    }
}

// ---- lock-held helpers (free functions so borrows stay simple) -----------

fn chrono_ms(ms: u64) -> ChronoDuration {
    ChronoDuration::milliseconds(ms as i64)
}

fn emit_transition(
    state: &mut EngineState,
    fx: &mut Effects,
    task_id: TaskId,
    to: TaskStatus,
    reason: impl Into<String>,
) -> Result<TaskTransition> {
    let task = state
        .store
        .get_mut(task_id)
        .ok_or(DroverError::TaskNotFound(task_id))?;
    let transition = lifecycle::apply(task, to, reason)?;
    debug!(
        "Task {} {} -> {} ({})",
        task_id, transition.from, transition.to, transition.reason
    );
    let snapshot = TaskSnapshot {
        task_id,
        status: task.status,
        retry_count: task.retry_count,
        assigned_worker: task.assigned_worker.clone(),
        updated_at: task.updated_at,
    };
    fx.events.push(LifecycleEvent::Transition(transition.clone()));
    fx.events.push(LifecycleEvent::Snapshot(snapshot));
    Ok(transition)
}

/// Check a queued task's readiness and act on the verdict
fn ready_or_block(
    config: &DroverConfig,
    state: &mut EngineState,
    fx: &mut Effects,
    task_id: TaskId,
    now: DateTime<Utc>,
) -> Result<()> {
    let verdict = {
        let Some(task) = state.store.get(task_id) else {
            return Ok(());
        };
        if task.status != TaskStatus::Queued {
            return Ok(());
        }
        (
            deps::readiness(task, &state.store, now),
            deps::effective_priority(task, &state.store, config.soft_dep_boost),
            task.created_at,
        )
    };
    match verdict {
        (Readiness::Ready, effective, created_at) => {
            emit_transition(state, fx, task_id, TaskStatus::Ready, "dependencies satisfied")?;
            state.queue.push(task_id, effective, created_at);
        }
        (Readiness::BlockedPermanently { reason }, _, _) => {
            emit_transition(state, fx, task_id, TaskStatus::Blocked, reason)?;
            settle(config, state, fx, vec![task_id])?;
        }
        (Readiness::Blocked, _, _) => {}
    }
    Ok(())
}

/// Propagate the consequences of tasks reaching dependency-relevant
/// states: ready hard dependents, permanently block doomed ones, and
/// recompute soft-dependent priorities. Event-driven, never polled.
fn settle(
    config: &DroverConfig,
    state: &mut EngineState,
    fx: &mut Effects,
    seeds: Vec<TaskId>,
) -> Result<()> {
    let now = Utc::now();
    let mut work: Vec<TaskId> = seeds;

    while let Some(finished) = work.pop() {
        for dependent in state.store.hard_dependents_of(finished) {
            let verdict = {
                let Some(task) = state.store.get(dependent) else {
                    continue;
                };
                (
                    task.status,
                    deps::readiness(task, &state.store, now),
                    deps::effective_priority(task, &state.store, config.soft_dep_boost),
                    task.created_at,
                )
            };
            match verdict {
                (TaskStatus::Queued, Readiness::Ready, effective, created_at) => {
                    emit_transition(
                        state,
                        fx,
                        dependent,
                        TaskStatus::Ready,
                        "dependencies satisfied",
                    )?;
                    state.queue.push(dependent, effective, created_at);
                }
                (TaskStatus::Queued, Readiness::BlockedPermanently { reason }, _, _) => {
                    emit_transition(state, fx, dependent, TaskStatus::Blocked, reason)?;
                    work.push(dependent);
                }
                (TaskStatus::Ready, Readiness::BlockedPermanently { reason }, _, _) => {
                    state.queue.remove(dependent);
                    emit_transition(state, fx, dependent, TaskStatus::Blocked, reason)?;
                    work.push(dependent);
                }
                _ => {}
            }
        }

        for dependent in state.store.soft_dependents_of(finished) {
            reprioritize(config, state, dependent);
        }
    }
    Ok(())
}

/// Recompute a queued task's effective priority in place
fn reprioritize(config: &DroverConfig, state: &mut EngineState, task_id: TaskId) {
    if !state.queue.contains(task_id) {
        return;
    }
    let Some(task) = state.store.get(task_id) else {
        return;
    };
    let effective = deps::effective_priority(task, &state.store, config.soft_dep_boost);
    state.queue.update_priority(task_id, effective);
}

/// Fail an active task: release its worker, then retry or dead-letter
///
/// The retry cap is absolute. A task at the cap is dead-lettered exactly
/// once and never re-queued.
fn fail_active(
    config: &DroverConfig,
    state: &mut EngineState,
    fx: &mut Effects,
    task_id: TaskId,
    detail: impl Into<String>,
) -> Result<()> {
    let detail = detail.into();
    let worker = state
        .store
        .get_mut(task_id)
        .ok_or(DroverError::TaskNotFound(task_id))?
        .assigned_worker
        .take();
    if let Some(worker_id) = &worker {
        let _ = state.registry.end_assignment(worker_id, task_id);
    }
    state.deadlines.remove(&task_id);

    emit_transition(state, fx, task_id, TaskStatus::Failed, detail.clone())?;

    let retry_count = state
        .store
        .get(task_id)
        .map(|t| t.retry_count)
        .unwrap_or_default();
    if retry_count >= config.retry.max_retries {
        emit_transition(state, fx, task_id, TaskStatus::Dead, "retry budget exhausted")?;
        state.dead_letters.push(task_id, detail.clone(), retry_count);
        fx.events.push(LifecycleEvent::DeadLettered {
            task_id,
            error: detail.clone(),
        });
        let outcome = Envelope::broadcast(EnvelopeKind::TaskOutcome, COORDINATOR_ID).with_payload(
            json!({ "task_id": task_id.to_string(), "success": false, "detail": detail }),
        );
        state.router.broadcast(outcome);
        // Hard dependents can never be satisfied now
        settle(config, state, fx, vec![task_id])?;
    } else {
        let delay = backoff::retry_delay(&config.retry, retry_count + 1);
        if let Some(task) = state.store.get_mut(task_id) {
            task.retry_count = retry_count + 1;
            task.not_ready_before = Some(Utc::now() + chrono_ms(delay.as_millis() as u64));
        }
        emit_transition(
            state,
            fx,
            task_id,
            TaskStatus::Queued,
            format!(
                "retry {} of {} scheduled",
                retry_count + 1,
                config.retry.max_retries
            ),
        )?;
        fx.retry_timers.push((task_id, delay));
    }
    Ok(())
}

fn payload_task_id(envelope: &Envelope) -> Result<TaskId> {
    envelope.payload["task_id"]
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| {
            warn!("Envelope {} carries no parseable task_id", envelope.kind);
            DroverError::Protocol(format!("{} payload missing task_id", envelope.kind))
        })
}
