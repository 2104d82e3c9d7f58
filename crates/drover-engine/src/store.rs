//! Task store
//!
//! Owns every task record and the typed dependency edges between them.
//! Pure data plus invariant checks: cyclic hard dependencies are rejected
//! at creation/edge-add time, and removing a task reports the dependents
//! it strands instead of dropping them silently.

use drover_core::{DroverError, Result, Task, TaskId};
use std::collections::{BTreeSet, HashMap};

/// Outcome of removing a task from the store
#[derive(Debug, Clone)]
pub struct RemovalCascade {
    pub removed: Task,
    /// Tasks whose hard dependency set now references a missing task;
    /// the caller must drive them to terminal blocked
    pub stranded_dependents: Vec<TaskId>,
}

/// In-memory task store with forward and reverse dependency indexes
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: HashMap<TaskId, Task>,
    /// dep -> tasks that hard-depend on it
    hard_dependents: HashMap<TaskId, BTreeSet<TaskId>>,
    /// dep -> tasks that soft-depend on it
    soft_dependents: HashMap<TaskId, BTreeSet<TaskId>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from task records (snapshot restoration)
    ///
    /// Dangling hard deps are tolerated here; the readiness re-run after
    /// restore drives their dependents to blocked. Cycles are still
    /// rejected.
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self> {
        let mut store = Self::new();
        for task in tasks {
            if store.tasks.contains_key(&task.id) {
                return Err(DroverError::DuplicateTask(task.id));
            }
            store.index(&task);
            store.tasks.insert(task.id, task);
        }
        if let Some((task_id, depends_on)) = store.find_cycle() {
            return Err(DroverError::DependencyCycle { task_id, depends_on });
        }
        Ok(store)
    }

    /// Insert a new task
    ///
    /// Every referenced dependency must already exist; a task referencing
    /// itself is a trivial cycle and rejected the same way.
    pub fn insert(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(DroverError::DuplicateTask(task.id));
        }
        for dep in task.hard_deps.iter().chain(task.soft_deps.iter()) {
            if *dep == task.id {
                return Err(DroverError::DependencyCycle {
                    task_id: task.id,
                    depends_on: *dep,
                });
            }
            if !self.tasks.contains_key(dep) {
                return Err(DroverError::TaskNotFound(*dep));
            }
        }
        self.index(&task);
        self.tasks.insert(task.id, task);
        Ok(())
    }

    /// Remove a task, reporting stranded hard dependents
    pub fn remove(&mut self, task_id: TaskId) -> Result<RemovalCascade> {
        let removed = self
            .tasks
            .remove(&task_id)
            .ok_or(DroverError::TaskNotFound(task_id))?;

        // Drop this task from the reverse indexes of its own deps
        for dep in &removed.hard_deps {
            if let Some(set) = self.hard_dependents.get_mut(dep) {
                set.remove(&task_id);
            }
        }
        for dep in &removed.soft_deps {
            if let Some(set) = self.soft_dependents.get_mut(dep) {
                set.remove(&task_id);
            }
        }

        let stranded_dependents: Vec<TaskId> = self
            .hard_dependents
            .remove(&task_id)
            .unwrap_or_default()
            .into_iter()
            .collect();
        self.soft_dependents.remove(&task_id);

        Ok(RemovalCascade {
            removed,
            stranded_dependents,
        })
    }

    /// Add a hard dependency edge `task_id -> depends_on`
    ///
    /// Rejected when it would close a cycle, when either endpoint is
    /// missing, or when the dependent has already left the backlog.
    pub fn add_hard_dependency(&mut self, task_id: TaskId, depends_on: TaskId) -> Result<()> {
        self.check_edge_endpoints(task_id, depends_on)?;
        if self.reaches(depends_on, task_id) {
            return Err(DroverError::DependencyCycle {
                task_id,
                depends_on,
            });
        }
        self.tasks
            .get_mut(&task_id)
            .ok_or(DroverError::TaskNotFound(task_id))?
            .hard_deps
            .insert(depends_on);
        self.hard_dependents
            .entry(depends_on)
            .or_default()
            .insert(task_id);
        Ok(())
    }

    /// Add a soft "prefers" edge `task_id -> prefers`
    ///
    /// Soft edges never gate readiness, so cycles among them are harmless
    /// and allowed.
    pub fn add_soft_dependency(&mut self, task_id: TaskId, prefers: TaskId) -> Result<()> {
        self.check_edge_endpoints(task_id, prefers)?;
        self.tasks
            .get_mut(&task_id)
            .ok_or(DroverError::TaskNotFound(task_id))?
            .soft_deps
            .insert(prefers);
        self.soft_dependents
            .entry(prefers)
            .or_default()
            .insert(task_id);
        Ok(())
    }

    pub fn get(&self, task_id: TaskId) -> Option<&Task> {
        self.tasks.get(&task_id)
    }

    pub fn get_mut(&mut self, task_id: TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(&task_id)
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.tasks.contains_key(&task_id)
    }

    /// All tasks, ordered by creation time for deterministic iteration
    pub fn all_tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.values().collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        tasks
    }

    /// Tasks that hard-depend on `task_id`
    pub fn hard_dependents_of(&self, task_id: TaskId) -> Vec<TaskId> {
        self.hard_dependents
            .get(&task_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Tasks that soft-depend on `task_id`
    pub fn soft_dependents_of(&self, task_id: TaskId) -> Vec<TaskId> {
        self.soft_dependents
            .get(&task_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Active tasks whose footprint overlaps the given task's
    pub fn footprint_conflicts(&self, task: &Task) -> Vec<TaskId> {
        let mut conflicts: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.id != task.id && t.status.is_active() && t.conflicts_with(task))
            .map(|t| t.id)
            .collect();
        conflicts.sort();
        conflicts
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn index(&mut self, task: &Task) {
        for dep in &task.hard_deps {
            self.hard_dependents.entry(*dep).or_default().insert(task.id);
        }
        for dep in &task.soft_deps {
            self.soft_dependents.entry(*dep).or_default().insert(task.id);
        }
    }

    fn check_edge_endpoints(&self, task_id: TaskId, target: TaskId) -> Result<()> {
        if task_id == target {
            return Err(DroverError::DependencyCycle {
                task_id,
                depends_on: target,
            });
        }
        let task = self
            .tasks
            .get(&task_id)
            .ok_or(DroverError::TaskNotFound(task_id))?;
        if task.status.is_terminal() || task.status.is_active() {
            return Err(DroverError::InvalidTaskConfig(format!(
                "cannot add dependency to task {} in status {}",
                task_id, task.status
            )));
        }
        if !self.tasks.contains_key(&target) {
            return Err(DroverError::TaskNotFound(target));
        }
        Ok(())
    }

    /// Whether `from` can reach `to` following hard edges
    fn reaches(&self, from: TaskId, to: TaskId) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(task) = self.tasks.get(&id) {
                stack.extend(task.hard_deps.iter().copied());
            }
        }
        false
    }

    /// Tri-color DFS over hard edges; returns a back edge if one exists
    fn find_cycle(&self) -> Option<(TaskId, TaskId)> {
        let mut visited: HashMap<TaskId, u8> = HashMap::new();
        for &id in self.tasks.keys() {
            if let Some(edge) = self.dfs_cycle(id, &mut visited) {
                return Some(edge);
            }
        }
        None
    }

    fn dfs_cycle(&self, id: TaskId, visited: &mut HashMap<TaskId, u8>) -> Option<(TaskId, TaskId)> {
        match visited.get(&id) {
            Some(2) => return None,
            Some(1) => return None, // handled by the caller via back-edge check
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(task) = self.tasks.get(&id) {
            for dep in &task.hard_deps {
                if visited.get(dep) == Some(&1) {
                    return Some((id, *dep));
                }
                if let Some(edge) = self.dfs_cycle(*dep, visited) {
                    return Some(edge);
                }
            }
        }
        visited.insert(id, 2);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::TaskStatus;

    #[test]
    fn test_insert_and_get() {
        let mut store = TaskStore::new();
        let task = Task::new("First");
        let id = task.id;

        store.insert(task).unwrap();
        assert!(store.contains(id));
        assert_eq!(store.get(id).unwrap().title, "First");
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut store = TaskStore::new();
        let task = Task::new("First");
        let clone = task.clone();

        store.insert(task).unwrap();
        assert!(matches!(
            store.insert(clone),
            Err(DroverError::DuplicateTask(_))
        ));
    }

    #[test]
    fn test_unknown_dep_rejected() {
        let mut store = TaskStore::new();
        let ghost = uuid::Uuid::new_v4();
        let task = Task::new("Depends on ghost").with_hard_deps([ghost]);

        assert!(matches!(
            store.insert(task),
            Err(DroverError::TaskNotFound(_))
        ));
    }

    #[test]
    fn test_self_dependency_rejected() {
        let mut store = TaskStore::new();
        let mut task = Task::new("Narcissist");
        let id = task.id;
        task.hard_deps.insert(id);

        assert!(matches!(
            store.insert(task),
            Err(DroverError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn test_cycle_rejected_on_edge_add() {
        let mut store = TaskStore::new();
        let a = Task::new("A");
        let a_id = a.id;
        store.insert(a).unwrap();

        let b = Task::new("B").with_hard_deps([a_id]);
        let b_id = b.id;
        store.insert(b).unwrap();

        let c = Task::new("C").with_hard_deps([b_id]);
        let c_id = c.id;
        store.insert(c).unwrap();

        // a -> c would close a cycle a <- b <- c
        let err = store.add_hard_dependency(a_id, c_id).unwrap_err();
        assert!(matches!(err, DroverError::DependencyCycle { .. }));

        // The failed edge must leave no trace
        assert!(store.get(a_id).unwrap().hard_deps.is_empty());
        assert!(store.hard_dependents_of(c_id).is_empty());
    }

    #[test]
    fn test_edge_to_active_task_rejected() {
        let mut store = TaskStore::new();
        let a = Task::new("A");
        let a_id = a.id;
        store.insert(a).unwrap();

        let mut b = Task::new("B");
        b.status = TaskStatus::Assigned;
        let b_id = b.id;
        store.insert(b).unwrap();

        let err = store.add_hard_dependency(b_id, a_id).unwrap_err();
        assert!(matches!(err, DroverError::InvalidTaskConfig(_)));
    }

    #[test]
    fn test_reverse_indexes() {
        let mut store = TaskStore::new();
        let a = Task::new("A");
        let a_id = a.id;
        store.insert(a).unwrap();

        let b = Task::new("B").with_hard_deps([a_id]);
        let b_id = b.id;
        store.insert(b).unwrap();

        let c = Task::new("C").with_soft_deps([a_id]);
        let c_id = c.id;
        store.insert(c).unwrap();

        assert_eq!(store.hard_dependents_of(a_id), vec![b_id]);
        assert_eq!(store.soft_dependents_of(a_id), vec![c_id]);
    }

    #[test]
    fn test_remove_reports_stranded() {
        let mut store = TaskStore::new();
        let a = Task::new("A");
        let a_id = a.id;
        store.insert(a).unwrap();

        let b = Task::new("B").with_hard_deps([a_id]);
        let b_id = b.id;
        store.insert(b).unwrap();

        let cascade = store.remove(a_id).unwrap();
        assert_eq!(cascade.removed.id, a_id);
        assert_eq!(cascade.stranded_dependents, vec![b_id]);
        assert!(!store.contains(a_id));
    }

    #[test]
    fn test_footprint_conflicts_only_active() {
        let mut store = TaskStore::new();

        let mut active = Task::new("Active").with_footprint(["src/lib.rs"]);
        active.status = TaskStatus::InProgress;
        let active_id = active.id;
        store.insert(active).unwrap();

        let idle = Task::new("Idle").with_footprint(["src/lib.rs"]);
        store.insert(idle).unwrap();

        let candidate = Task::new("Candidate").with_footprint(["src/lib.rs"]);
        store.insert(candidate.clone()).unwrap();

        // Only the in-progress task conflicts
        assert_eq!(store.footprint_conflicts(&candidate), vec![active_id]);
    }

    #[test]
    fn test_from_tasks_rejects_cycle() {
        let mut a = Task::new("A");
        let mut b = Task::new("B");
        a.hard_deps.insert(b.id);
        b.hard_deps.insert(a.id);

        assert!(matches!(
            TaskStore::from_tasks(vec![a, b]),
            Err(DroverError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn test_from_tasks_tolerates_dangling() {
        let ghost = uuid::Uuid::new_v4();
        let a = Task::new("A").with_hard_deps([ghost]);
        let a_id = a.id;

        let store = TaskStore::from_tasks(vec![a]).unwrap();
        assert!(store.contains(a_id));
    }
}
