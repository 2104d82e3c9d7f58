//! Dependency resolver
//!
//! Pure functions over the task store: no I/O, no clocks beyond the
//! explicit `now` argument, fully deterministic. The coordinator calls
//! these on every lifecycle event that could change an answer; nothing
//! here is polled.

use crate::store::TaskStore;
use chrono::{DateTime, Utc};
use drover_core::Task;

/// Readiness verdict for a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Every hard dependency reached terminal success
    Ready,
    /// At least one hard dependency is still pending, or the retry
    /// backoff gate has not elapsed
    Blocked,
    /// A hard dependency can never succeed; the task must be driven to
    /// terminal blocked, not left waiting forever
    BlockedPermanently { reason: String },
}

/// Compute readiness for a task against the current store
pub fn readiness(task: &Task, store: &TaskStore, now: DateTime<Utc>) -> Readiness {
    let mut pending = false;

    for dep_id in &task.hard_deps {
        match store.get(*dep_id) {
            None => {
                return Readiness::BlockedPermanently {
                    reason: format!("hard dependency {} no longer exists", dep_id),
                };
            }
            Some(dep) => {
                if dep.status.is_terminal_failure() {
                    return Readiness::BlockedPermanently {
                        reason: format!(
                            "hard dependency {} ended {}",
                            dep_id, dep.status
                        ),
                    };
                }
                if !dep.status.is_terminal_success() {
                    pending = true;
                }
            }
        }
    }

    if pending {
        return Readiness::Blocked;
    }

    // Retry backoff gates readiness the same way an unmet dependency does
    if let Some(gate) = task.not_ready_before {
        if now < gate {
            return Readiness::Blocked;
        }
    }

    Readiness::Ready
}

/// Soft-dependency priority adjustment
///
/// Flat, all-or-nothing: `-k` while any "prefers" target is still
/// outstanding, `+k` once all of them completed, `0` when the task
/// declares none. Targets that ended without success (or were removed)
/// are no longer outstanding but cannot be honored either, so they
/// neutralize the boost.
pub fn soft_adjustment(task: &Task, store: &TaskStore, k: i32) -> i32 {
    if task.soft_deps.is_empty() {
        return 0;
    }

    let mut all_completed = true;
    for dep_id in &task.soft_deps {
        match store.get(*dep_id) {
            Some(dep) if !dep.status.is_terminal() => return -k,
            Some(dep) if !dep.status.is_terminal_success() => all_completed = false,
            None => all_completed = false,
            _ => {}
        }
    }

    if all_completed {
        k
    } else {
        0
    }
}

/// Effective priority: base plus the soft-dependency adjustment
///
/// Derived on demand, never stored; recomputing without an intervening
/// state change always yields the same value.
pub fn effective_priority(task: &Task, store: &TaskStore, k: i32) -> i32 {
    task.base_priority + soft_adjustment(task, store, k)
}
