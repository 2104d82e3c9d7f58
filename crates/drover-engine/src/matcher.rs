//! Capability matcher
//!
//! Scores workers against a task's requirements. Pure function of current
//! state, no side effects; the assignment engine takes the strict maximum
//! with worker-id tie-breaks so runs are reproducible.

use drover_core::{Task, Worker};

/// Integer score so ordering is total; breadth beyond the required set
/// counts for, current load counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MatchScore(i64);

impl MatchScore {
    pub fn value(&self) -> i64 {
        self.0
    }
}

const BREADTH_WEIGHT: i64 = 100;
const LOAD_SCALE: i64 = 1_000;

/// Score a worker for a task
///
/// `None` when the worker lacks a required capability or has no spare
/// capacity. Otherwise a score rewarding multi-skill workers (capability
/// overlap beyond the minimum required set) and penalizing current load.
pub fn score(task: &Task, worker: &Worker) -> Option<MatchScore> {
    if !worker.has_spare_capacity() {
        return None;
    }
    if !worker.covers(&task.required_capabilities) {
        return None;
    }

    let breadth = worker
        .capabilities
        .difference(&task.required_capabilities)
        .count() as i64;
    let load_penalty =
        LOAD_SCALE * worker.active_tasks.len() as i64 / worker.capacity.max(1) as i64;

    Some(MatchScore(BREADTH_WEIGHT * breadth - load_penalty))
}

/// Pick the best-scoring worker for a task
///
/// Strictly highest score wins; ties break to the lexicographically
/// smallest worker id for determinism.
pub fn pick_best<'a>(task: &Task, workers: &[&'a Worker]) -> Option<&'a Worker> {
    let mut best: Option<(&Worker, MatchScore)> = None;
    for worker in workers {
        if let Some(s) = score(task, worker) {
            best = match best {
                None => Some((worker, s)),
                Some((current, current_score)) => {
                    if s > current_score || (s == current_score && worker.id < current.id) {
                        Some((worker, s))
                    } else {
                        Some((current, current_score))
                    }
                }
            };
        }
    }
    best.map(|(w, _)| w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn task_requiring(caps: &[&str]) -> Task {
        Task::new("t").with_capabilities(caps.iter().copied())
    }

    #[test]
    fn test_missing_capability_unmatched() {
        let task = task_requiring(&["rust", "wasm"]);
        let worker = Worker::new("w-1", "builder").with_capabilities(["rust"]);

        assert!(score(&task, &worker).is_none());
    }

    #[test]
    fn test_exact_match_scores() {
        let task = task_requiring(&["rust"]);
        let worker = Worker::new("w-1", "builder").with_capabilities(["rust"]);

        assert_eq!(score(&task, &worker), Some(MatchScore(0)));
    }

    #[test]
    fn test_breadth_rewarded() {
        let task = task_requiring(&["rust"]);
        let narrow = Worker::new("w-1", "builder").with_capabilities(["rust"]);
        let broad = Worker::new("w-2", "builder").with_capabilities(["rust", "docs", "testing"]);

        let narrow_score = score(&task, &narrow).unwrap();
        let broad_score = score(&task, &broad).unwrap();
        assert!(broad_score > narrow_score);
    }

    #[test]
    fn test_load_penalized() {
        let task = task_requiring(&["rust"]);
        let mut loaded = Worker::new("w-1", "builder")
            .with_capabilities(["rust"])
            .with_capacity(2);
        loaded.active_tasks.push(Uuid::new_v4());
        let fresh = Worker::new("w-2", "builder")
            .with_capabilities(["rust"])
            .with_capacity(2);

        assert!(score(&task, &fresh).unwrap() > score(&task, &loaded).unwrap());
    }

    #[test]
    fn test_full_capacity_unmatched() {
        let task = task_requiring(&["rust"]);
        let mut full = Worker::new("w-1", "builder").with_capabilities(["rust"]);
        full.active_tasks.push(Uuid::new_v4());

        assert!(score(&task, &full).is_none());
    }

    #[test]
    fn test_no_requirements_matches_anyone() {
        let task = task_requiring(&[]);
        let worker = Worker::new("w-1", "generalist");

        assert!(score(&task, &worker).is_some());
    }

    #[test]
    fn test_pick_best_highest_score() {
        let task = task_requiring(&["rust"]);
        let narrow = Worker::new("w-1", "builder").with_capabilities(["rust"]);
        let broad = Worker::new("w-2", "builder").with_capabilities(["rust", "docs"]);

        let workers = vec![&narrow, &broad];
        assert_eq!(pick_best(&task, &workers).unwrap().id, "w-2");
    }

    #[test]
    fn test_pick_best_tie_breaks_by_id() {
        let task = task_requiring(&["rust"]);
        let b = Worker::new("w-b", "builder").with_capabilities(["rust"]);
        let a = Worker::new("w-a", "builder").with_capabilities(["rust"]);

        let workers = vec![&b, &a];
        assert_eq!(pick_best(&task, &workers).unwrap().id, "w-a");
    }

    #[test]
    fn test_pick_best_none_capable() {
        let task = task_requiring(&["wasm"]);
        let worker = Worker::new("w-1", "builder").with_capabilities(["rust"]);

        let workers = vec![&worker];
        assert!(pick_best(&task, &workers).is_none());
    }
}
