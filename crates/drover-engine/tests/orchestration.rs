//! End-to-end orchestration scenarios.
//!
//! Drives the coordinator through the full backlog lifecycle with mock
//! worker endpoints: dependency gating, FIFO fairness, soft-dependency
//! boosts, footprint conflicts, retry exhaustion into the dead letter
//! queue, circuit breaking, and snapshot restoration.

use drover_core::{
    DroverConfig, EngineEvent, LifecycleEvent, TaskConfig, TaskId, TaskStatus, Worker,
};
use drover_engine::Coordinator;
use drover_workers::{CircuitState, MockWorkerEndpoint};
use std::time::Duration;

fn config() -> DroverConfig {
    let mut config = DroverConfig::default();
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 40;
    config.retry.jitter = 0.0;
    config.circuit.cooldown_ms = 50_000;
    config.circuit.jitter = 0.0;
    config
}

fn builder(id: &str) -> Worker {
    Worker::new(id, "builder").with_capabilities(["rust"])
}

fn task(title: &str, priority: i32) -> TaskConfig {
    TaskConfig::new(title)
        .with_capabilities(["rust"])
        .with_priority(priority)
}

/// Collect all pending lifecycle events from a subscription
fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn hard_dependency_gates_assignment() {
    let coordinator = Coordinator::new(config(), MockWorkerEndpoint::new());
    coordinator.register_worker(builder("w-1")).await.unwrap();
    coordinator.register_worker(builder("w-2")).await.unwrap();

    let upstream = coordinator.create_task(task("upstream", 1)).await.unwrap();
    let downstream = coordinator
        .create_task(task("downstream", 100).with_hard_deps([upstream]))
        .await
        .unwrap();

    // The dependent never goes out while its dependency is unfinished,
    // no matter how urgent it is or how many workers sit idle
    assert_eq!(
        coordinator.task(downstream).await.unwrap().status,
        TaskStatus::Queued
    );

    coordinator.complete_task(upstream).await.unwrap();
    assert_eq!(
        coordinator.task(downstream).await.unwrap().status,
        TaskStatus::Assigned
    );
}

#[tokio::test]
async fn fifo_within_priority_tier() {
    let endpoint = MockWorkerEndpoint::new();
    let coordinator = Coordinator::new(config(), endpoint);

    // Same priority, created in order, no workers yet
    let a = coordinator.create_task(task("a", 10)).await.unwrap();
    let b = coordinator.create_task(task("b", 10)).await.unwrap();
    assert_eq!(coordinator.queued_order().await, vec![a, b]);

    coordinator.register_worker(builder("w-1")).await.unwrap();

    // A was created first; A goes out first
    assert_eq!(
        coordinator.task(a).await.unwrap().status,
        TaskStatus::Assigned
    );
    assert_eq!(coordinator.task(b).await.unwrap().status, TaskStatus::Ready);
}

#[tokio::test]
async fn soft_dependency_boost_moves_head() {
    let coordinator = Coordinator::new(config(), MockWorkerEndpoint::new());

    // The prefer target needs a capability no one else competes for
    let prefer = coordinator
        .create_task(TaskConfig::new("prefer").with_capabilities(["docs"]).with_priority(1))
        .await
        .unwrap();
    let competitor = coordinator.create_task(task("competitor", 100)).await.unwrap();
    let boosted = coordinator
        .create_task(task("boosted", 100).with_soft_deps([prefer]))
        .await
        .unwrap();

    // Outstanding prefer: 100 - 5 = 95, behind the flat 100
    assert_eq!(coordinator.queued_order().await, vec![competitor, boosted, prefer]);

    // Complete the preferred task via a docs-only worker
    coordinator
        .register_worker(Worker::new("w-docs", "writer").with_capabilities(["docs"]))
        .await
        .unwrap();
    coordinator.complete_task(prefer).await.unwrap();

    // Satisfied prefer: 100 + 5 = 105, ahead of the flat 100
    assert_eq!(coordinator.queued_order().await, vec![boosted, competitor]);
}

#[tokio::test]
async fn footprint_conflict_backpressure() {
    let coordinator = Coordinator::new(config(), MockWorkerEndpoint::new());
    coordinator.register_worker(builder("w-1")).await.unwrap();
    coordinator.register_worker(builder("w-2")).await.unwrap();

    let first = coordinator
        .create_task(task("first", 10).with_footprint(["src/lib.rs"]))
        .await
        .unwrap();
    let second = coordinator
        .create_task(task("second", 10).with_footprint(["src/lib.rs"]))
        .await
        .unwrap();
    let third = coordinator
        .create_task(task("third", 1).with_footprint(["docs/guide.md"]))
        .await
        .unwrap();

    // Overlapping footprints never run concurrently; the conflict-free
    // lower-priority task is picked instead
    assert_eq!(
        coordinator.task(first).await.unwrap().status,
        TaskStatus::Assigned
    );
    assert_eq!(
        coordinator.task(second).await.unwrap().status,
        TaskStatus::Ready
    );
    assert_eq!(
        coordinator.task(third).await.unwrap().status,
        TaskStatus::Assigned
    );

    // Releasing the footprint lets the held-back task through
    coordinator.complete_task(first).await.unwrap();
    assert_eq!(
        coordinator.task(second).await.unwrap().status,
        TaskStatus::Assigned
    );
}

#[tokio::test]
async fn retry_cap_routes_to_dead_letter_exactly_once() {
    let mut cfg = config();
    cfg.retry.max_retries = 2;
    let coordinator = Coordinator::new(cfg, MockWorkerEndpoint::new());
    coordinator.register_worker(builder("w-1")).await.unwrap();

    let task_id = coordinator.create_task(task("flaky", 5)).await.unwrap();

    // Fail it through every retry; timers are short in this config
    for _ in 0..3 {
        wait_for_status(&coordinator, task_id, TaskStatus::Assigned).await;
        coordinator.fail_task(task_id, "worker crashed").await.unwrap();
    }

    let final_task = coordinator.task(task_id).await.unwrap();
    assert_eq!(final_task.status, TaskStatus::Dead);
    assert_eq!(final_task.retry_count, 2);

    let dead = coordinator.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].task_id, task_id);
    assert_eq!(dead[0].retry_count, 2);

    // The worker is free again and the dead task never re-queues
    assert!(coordinator.queued_order().await.is_empty());
    let worker = coordinator.worker(&"w-1".to_string()).await.unwrap();
    assert!(worker.active_tasks.is_empty());
}

#[tokio::test]
async fn circuit_opens_after_repeated_handoff_failures() {
    let mut cfg = config();
    cfg.circuit.failure_threshold = 2;
    cfg.retry.max_retries = 5;
    let endpoint = MockWorkerEndpoint::new().with_failing_worker("w-bad");
    let coordinator = Coordinator::new(cfg, endpoint);
    coordinator.register_worker(builder("w-bad")).await.unwrap();

    let task_id = coordinator.create_task(task("victim", 5)).await.unwrap();

    // First handoff fails on create; the retry timer drives the second.
    // Two failures reach the threshold and trip the circuit.
    wait_for(|| async {
        coordinator.circuit_state(&"w-bad".to_string()).await == Some(CircuitState::Open)
    })
    .await;

    // Fail-fast: the queued task is not handed to the open target
    coordinator.sweep().await.unwrap();
    let status = coordinator.task(task_id).await.unwrap().status;
    assert!(
        matches!(status, TaskStatus::Queued | TaskStatus::Ready),
        "task should wait out the open circuit, was {}",
        status
    );

    // A healthy worker takes it immediately
    coordinator.register_worker(builder("w-good")).await.unwrap();
    coordinator.sweep().await.unwrap();
    wait_for_status(&coordinator, task_id, TaskStatus::Assigned).await;
    assert_eq!(
        coordinator.task(task_id).await.unwrap().assigned_worker.as_deref(),
        Some("w-good")
    );
}

#[tokio::test]
async fn terminally_failed_dependency_blocks_dependent() {
    let coordinator = Coordinator::new(config(), MockWorkerEndpoint::new());
    let mut events = coordinator.subscribe();

    let upstream = coordinator.create_task(task("e", 1)).await.unwrap();
    let dependent = coordinator
        .create_task(task("d", 1).with_hard_deps([upstream]))
        .await
        .unwrap();
    drain_events(&mut events);

    // Cancelling the dependency makes the dependent unsatisfiable
    coordinator.cancel_task(upstream).await.unwrap();

    assert_eq!(
        coordinator.task(dependent).await.unwrap().status,
        TaskStatus::Blocked
    );

    // Observable as exactly one blocked transition for the dependent
    let blocked: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            LifecycleEvent::Transition(t)
                if t.task_id == dependent && t.to == TaskStatus::Blocked =>
            {
                Some(t)
            }
            _ => None,
        })
        .collect();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].from, TaskStatus::Queued);
}

#[tokio::test]
async fn blocked_cascade_propagates() {
    let coordinator = Coordinator::new(config(), MockWorkerEndpoint::new());

    let a = coordinator.create_task(task("a", 1)).await.unwrap();
    let b = coordinator
        .create_task(task("b", 1).with_hard_deps([a]))
        .await
        .unwrap();
    let c = coordinator
        .create_task(task("c", 1).with_hard_deps([b]))
        .await
        .unwrap();

    coordinator.remove_task(a).await.unwrap();

    // B loses its dependency, C loses B, transitively
    assert_eq!(coordinator.task(b).await.unwrap().status, TaskStatus::Blocked);
    assert_eq!(coordinator.task(c).await.unwrap().status, TaskStatus::Blocked);
}

#[tokio::test]
async fn worker_dropout_requeues_its_tasks() {
    let coordinator = Coordinator::new(config(), MockWorkerEndpoint::new());
    coordinator.register_worker(builder("w-1")).await.unwrap();
    let task_id = coordinator.create_task(task("t", 5)).await.unwrap();
    assert_eq!(
        coordinator.task(task_id).await.unwrap().status,
        TaskStatus::Assigned
    );

    coordinator
        .handle_event(EngineEvent::WorkerUnavailable("w-1".to_string()))
        .await
        .unwrap();

    let after = coordinator.task(task_id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Queued);
    assert_eq!(after.retry_count, 1);
    assert_eq!(after.assigned_worker, None);

    // A replacement picks it up once the backoff gate opens
    coordinator.register_worker(builder("w-2")).await.unwrap();
    wait_for_status(&coordinator, task_id, TaskStatus::Assigned).await;
}

#[tokio::test]
async fn assignment_timeout_recycles_task() {
    let mut cfg = config();
    cfg.timeouts.assignment_timeout_ms = 20;
    let endpoint = MockWorkerEndpoint::new();
    let coordinator = Coordinator::new(cfg, endpoint);
    coordinator.register_worker(builder("w-slow")).await.unwrap();

    let task_id = coordinator.create_task(task("slow", 5)).await.unwrap();
    assert_eq!(
        coordinator.task(task_id).await.unwrap().status,
        TaskStatus::Assigned
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    coordinator.sweep().await.unwrap();

    let after = coordinator.task(task_id).await.unwrap();
    assert_eq!(after.status, TaskStatus::Queued);
    assert_eq!(after.retry_count, 1);
    let worker = coordinator.worker(&"w-slow".to_string()).await.unwrap();
    assert!(worker.active_tasks.is_empty());
}

#[tokio::test]
async fn stuck_tasks_surface_from_sweep() {
    let mut cfg = config();
    cfg.timeouts.stuck_timeout_ms = 0;
    let coordinator = Coordinator::new(cfg, MockWorkerEndpoint::new());
    let mut events = coordinator.subscribe();

    // No workers at all: the task can only wait
    let task_id = coordinator.create_task(task("stranded", 5)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    coordinator.sweep().await.unwrap();

    let stuck = drain_events(&mut events).into_iter().find_map(|e| match e {
        LifecycleEvent::Stuck { task_ids } => Some(task_ids),
        _ => None,
    });
    assert_eq!(stuck, Some(vec![task_id]));
}

#[tokio::test]
async fn snapshot_roundtrip_preserves_order_and_state() {
    let coordinator = Coordinator::new(config(), MockWorkerEndpoint::new());

    // Run one task to completion through the only worker
    coordinator.register_worker(builder("w-1")).await.unwrap();
    let done = coordinator.create_task(task("done", 1)).await.unwrap();
    coordinator.complete_task(done).await.unwrap();

    // The rest need a capability no registered worker has, so they wait
    let wasm = |title: &str, priority: i32| {
        TaskConfig::new(title)
            .with_capabilities(["wasm"])
            .with_priority(priority)
    };
    let high = coordinator.create_task(wasm("high", 50)).await.unwrap();
    let low = coordinator.create_task(wasm("low", 10)).await.unwrap();
    let gated = coordinator
        .create_task(wasm("gated", 99).with_hard_deps([high]))
        .await
        .unwrap();

    let before_order = coordinator.queued_order().await;
    assert_eq!(before_order, vec![high, low]);
    let snapshot = coordinator.snapshot().await;

    let restored = Coordinator::restore(config(), MockWorkerEndpoint::new(), snapshot).unwrap();

    // Same readiness and the same priority ordering
    assert_eq!(restored.queued_order().await, before_order);
    assert_eq!(
        restored.task(done).await.unwrap().status,
        TaskStatus::Completed
    );
    assert_eq!(
        restored.task(gated).await.unwrap().status,
        TaskStatus::Queued
    );
    assert_eq!(restored.task(low).await.unwrap().status, TaskStatus::Ready);
}

#[tokio::test]
async fn pooled_worker_respects_capacity() {
    let coordinator = Coordinator::new(config(), MockWorkerEndpoint::new());
    coordinator
        .register_worker(builder("pool").with_capacity(2))
        .await
        .unwrap();

    let a = coordinator.create_task(task("a", 3)).await.unwrap();
    let b = coordinator.create_task(task("b", 2)).await.unwrap();
    let c = coordinator.create_task(task("c", 1)).await.unwrap();

    // Two slots, three tasks: never over capacity
    assert_eq!(coordinator.task(a).await.unwrap().status, TaskStatus::Assigned);
    assert_eq!(coordinator.task(b).await.unwrap().status, TaskStatus::Assigned);
    assert_eq!(coordinator.task(c).await.unwrap().status, TaskStatus::Ready);

    let worker = coordinator.worker(&"pool".to_string()).await.unwrap();
    assert_eq!(worker.active_tasks.len(), 2);

    coordinator.complete_task(a).await.unwrap();
    assert_eq!(coordinator.task(c).await.unwrap().status, TaskStatus::Assigned);
}

// ---- helpers --------------------------------------------------------------

async fn wait_for_status<E: drover_workers::WorkerEndpoint + 'static>(
    coordinator: &Coordinator<E>,
    task_id: TaskId,
    status: TaskStatus,
) {
    wait_for(|| async { coordinator.task(task_id).await.map(|t| t.status).ok() == Some(status) })
        .await;
}

/// Poll a condition with a hard deadline; retry timers in these tests
/// fire within tens of milliseconds
async fn wait_for<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached within deadline");
}
