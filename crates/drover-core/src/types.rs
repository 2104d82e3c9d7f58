//! Core type definitions for Drover orchestration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Task identifier (UUID, immutable once created)
pub type TaskId = Uuid;

/// Worker identifier, issued by the agent-lifecycle collaborator
pub type WorkerId = String;

/// A capability tag describing what kind of work a worker can perform
/// or a task requires
///
/// The vocabulary is open: tags are free-form strings, normalized to
/// lowercase so that `"Rust"` and `"rust"` match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(tag.as_ref().trim().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, waiting on dependencies or retry backoff
    #[default]
    Queued,
    /// All hard dependencies satisfied, sitting in the ready queue
    Ready,
    /// Handed to a worker, no progress reported yet
    Assigned,
    /// Worker reported progress
    InProgress,
    /// Terminal success
    Completed,
    /// Execution failed; may re-queue if retries remain
    Failed,
    /// Terminal: retry budget exhausted, dead-lettered
    Dead,
    /// Terminal: a hard dependency can never be satisfied
    Blocked,
    /// Terminal: cancelled by command
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions)
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Dead | Self::Blocked | Self::Cancelled
        )
    }

    /// Whether a worker currently holds this task
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Assigned | Self::InProgress)
    }

    /// Whether this status counts as terminal success for hard dependents
    pub fn is_terminal_success(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Whether this status can never reach terminal success
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::Dead | Self::Blocked | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Ready => write!(f, "ready"),
            Self::Assigned => write!(f, "assigned"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Dead => write!(f, "dead"),
            Self::Blocked => write!(f, "blocked"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "ready" => Ok(Self::Ready),
            "assigned" => Ok(Self::Assigned),
            "in_progress" | "inprogress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            "blocked" => Ok(Self::Blocked),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Worker availability status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Busy,
    Unavailable,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "idle" => Ok(Self::Idle),
            "busy" => Ok(Self::Busy),
            "unavailable" | "error" => Ok(Self::Unavailable),
            _ => Err(format!("Invalid worker status: {}", s)),
        }
    }
}

/// A unit of work in the backlog
///
/// Owned exclusively by the task store; the assignment engine holds only a
/// transient reference during the handoff transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique, immutable identifier
    pub id: TaskId,
    /// Short human-readable title
    pub title: String,
    /// Longer description handed to the worker
    pub description: String,
    /// Base priority; higher = more urgent
    pub base_priority: i32,
    /// Current lifecycle status
    pub status: TaskStatus,
    /// Capabilities a worker must declare to take this task
    pub required_capabilities: BTreeSet<Capability>,
    /// Tasks that must complete before this one is ready
    pub hard_deps: BTreeSet<TaskId>,
    /// Tasks whose completion only boosts priority ("prefers")
    pub soft_deps: BTreeSet<TaskId>,
    /// Worker currently holding this task, if any
    pub assigned_worker: Option<WorkerId>,
    /// Number of failed attempts so far
    pub retry_count: u32,
    /// Paths or resource keys touched by this task, for conflict detection
    pub footprint: BTreeSet<String>,
    /// Retry backoff gate; the task cannot become ready before this instant
    pub not_ready_before: Option<DateTime<Utc>>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: String::new(),
            base_priority: 0,
            status: TaskStatus::Queued,
            required_capabilities: BTreeSet::new(),
            hard_deps: BTreeSet::new(),
            soft_deps: BTreeSet::new(),
            assigned_worker: None,
            retry_count: 0,
            footprint: BTreeSet::new(),
            not_ready_before: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.base_priority = priority;
        self
    }

    pub fn with_capabilities<I, C>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Capability>,
    {
        self.required_capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_hard_deps(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        self.hard_deps = deps.into_iter().collect();
        self
    }

    pub fn with_soft_deps(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        self.soft_deps = deps.into_iter().collect();
        self
    }

    pub fn with_footprint<I, S>(mut self, footprint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.footprint = footprint.into_iter().map(Into::into).collect();
        self
    }

    /// Whether this task's footprint overlaps another's
    pub fn conflicts_with(&self, other: &Task) -> bool {
        !self.footprint.is_disjoint(&other.footprint)
    }
}

/// Creation-time task parameters, validated before entering the store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskConfig {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub base_priority: i32,
    #[serde(default)]
    pub required_capabilities: BTreeSet<Capability>,
    #[serde(default)]
    pub hard_deps: BTreeSet<TaskId>,
    #[serde(default)]
    pub soft_deps: BTreeSet<TaskId>,
    #[serde(default)]
    pub footprint: BTreeSet<String>,
}

impl TaskConfig {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.base_priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_capabilities<I, C>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Capability>,
    {
        self.required_capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_hard_deps(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        self.hard_deps = deps.into_iter().collect();
        self
    }

    pub fn with_soft_deps(mut self, deps: impl IntoIterator<Item = TaskId>) -> Self {
        self.soft_deps = deps.into_iter().collect();
        self
    }

    pub fn with_footprint<I, S>(mut self, footprint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.footprint = footprint.into_iter().map(Into::into).collect();
        self
    }

    /// Materialize a task from this config
    pub fn build(self) -> Task {
        let mut task = Task::new(self.title)
            .with_description(self.description)
            .with_priority(self.base_priority);
        task.required_capabilities = self.required_capabilities;
        task.hard_deps = self.hard_deps;
        task.soft_deps = self.soft_deps;
        task.footprint = self.footprint;
        task
    }
}

/// A worker as the core sees it
///
/// Lifecycle is owned by the agent-lifecycle collaborator; the core reads
/// capabilities and writes busy/idle transitions that result from
/// assignment and completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    /// Role label, informational only (capabilities drive matching)
    pub role: String,
    pub capabilities: BTreeSet<Capability>,
    pub status: WorkerStatus,
    /// Tasks currently assigned to this worker
    pub active_tasks: Vec<TaskId>,
    /// Concurrent task capacity (usually 1; >1 for pooled workers)
    pub capacity: usize,
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(id: impl Into<WorkerId>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            capabilities: BTreeSet::new(),
            status: WorkerStatus::Idle,
            active_tasks: Vec::new(),
            capacity: 1,
            registered_at: Utc::now(),
        }
    }

    pub fn with_capabilities<I, C>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Capability>,
    {
        self.capabilities = caps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Current load as assigned tasks over capacity
    pub fn load(&self) -> f64 {
        self.active_tasks.len() as f64 / self.capacity as f64
    }

    pub fn has_spare_capacity(&self) -> bool {
        self.active_tasks.len() < self.capacity
    }

    /// Whether this worker declares every capability in `required`
    pub fn covers(&self, required: &BTreeSet<Capability>) -> bool {
        required.is_subset(&self.capabilities)
    }
}
