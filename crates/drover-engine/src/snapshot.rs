//! Engine snapshots
//!
//! Best-effort persistence boundary: the full task store, dead letters,
//! and circuit states serialize to one JSON document. Restoration goes
//! through [`Coordinator::restore`](crate::Coordinator::restore), which
//! re-runs readiness checks before repopulating the queue.

use chrono::{DateTime, Utc};
use drover_core::{Result, Task, WorkerId};
use drover_workers::{CircuitSnapshot, DeadLetterQueue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Serializable image of the whole engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    /// Every task record, in creation order
    pub tasks: Vec<Task>,
    pub dead_letters: DeadLetterQueue,
    /// Circuit breaker state per assignment target
    pub circuits: BTreeMap<WorkerId, CircuitSnapshot>,
    pub taken_at: DateTime<Utc>,
}

impl EngineSnapshot {
    /// Write the snapshot as pretty JSON
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Read a snapshot back from disk
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::TaskStatus;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("snapshot.json");

        let mut done = Task::new("done").with_priority(3);
        done.status = TaskStatus::Completed;
        let waiting = Task::new("waiting").with_hard_deps([done.id]);

        let snapshot = EngineSnapshot {
            tasks: vec![done.clone(), waiting.clone()],
            dead_letters: DeadLetterQueue::new(),
            circuits: BTreeMap::new(),
            taken_at: Utc::now(),
        };

        snapshot.save_to(&path).unwrap();
        let loaded = EngineSnapshot::load_from(&path).unwrap();

        assert_eq!(loaded.tasks.len(), 2);
        assert_eq!(loaded.tasks[0].id, done.id);
        assert_eq!(loaded.tasks[0].status, TaskStatus::Completed);
        assert_eq!(loaded.tasks[1].hard_deps, waiting.hard_deps);
    }

    #[test]
    fn test_load_missing_file() {
        let temp = TempDir::new().unwrap();
        assert!(EngineSnapshot::load_from(&temp.path().join("nope.json")).is_err());
    }
}
