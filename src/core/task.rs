//! Task data model for the dependency graph.
//!
//! A [`TaskNode`] is the unit of work the orchestrator schedules. Edges are
//! embedded in the nodes themselves: `dependencies` lists what must complete
//! first and `dependents` is the reverse index, kept as its exact transpose
//! by [`TaskGraph`](crate::core::TaskGraph).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Identifier for a task.
///
/// Ids come from external producers (decomposer output, delegation files),
/// so any non-empty string is accepted. [`TaskId::generate`] mints fresh ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn generate() -> Self {
        Self(format!("task-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Scheduling priority. Ordering is `Low < Normal < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for Priority {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(crate::Error::Validation(format!("unknown priority: {}", other))),
        }
    }
}

/// Task status in its lifecycle.
///
/// `Pending → Ready → Assigned → InProgress → {Completed | Failed}`, with a
/// dispatch failure reverting `Assigned` back to `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Waiting on at least one dependency.
    #[default]
    Pending,
    /// All dependencies completed; eligible for dispatch.
    Ready,
    /// Selected for dispatch; the dispatcher call may still be in flight.
    Assigned,
    /// The executing worker acknowledged the task.
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Ready,
        TaskStatus::Assigned,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// Completed or failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Assigned or in progress: counts against concurrency caps.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single task in the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskNode {
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<TaskId>,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub assigned_agent: Option<String>,
    #[serde(default)]
    pub preferred_agent: Option<String>,
    /// Agent to announce the outcome to, when the task arrived as a delegation.
    #[serde(default)]
    pub source_agent: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    #[serde(default)]
    pub dependents: BTreeSet<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Delegation nesting depth; direct insertions sit at 0.
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskNode {
    /// Create a pending task with the given id, title and description.
    pub fn new(task_id: impl Into<TaskId>, title: &str, description: &str) -> Self {
        Self {
            task_id: task_id.into(),
            parent_task_id: None,
            title: title.to_string(),
            description: description.to_string(),
            priority: Priority::Normal,
            status: TaskStatus::Pending,
            assigned_agent: None,
            preferred_agent: None,
            source_agent: None,
            dependencies: BTreeSet::new(),
            dependents: BTreeSet::new(),
            plan_id: None,
            step_id: None,
            depth: 0,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Add a dependency. Adding the same id twice is a no-op.
    pub fn depends_on(mut self, dep: impl Into<TaskId>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    pub fn with_preferred_agent(mut self, agent: &str) -> Self {
        self.preferred_agent = Some(agent.to_string());
        self
    }

    pub fn with_source_agent(mut self, agent: &str) -> Self {
        self.source_agent = Some(agent.to_string());
        self
    }

    pub fn mark_ready(&mut self) {
        self.status = TaskStatus::Ready;
    }

    /// Optimistically assign before the dispatcher call returns.
    pub fn assign(&mut self, agent: &str) {
        self.status = TaskStatus::Assigned;
        self.assigned_agent = Some(agent.to_string());
    }

    /// Undo [`assign`](Self::assign) after a failed dispatch.
    pub fn revert_assignment(&mut self) {
        self.status = TaskStatus::Ready;
        self.assigned_agent = None;
    }

    pub fn start(&mut self, agent: &str) {
        self.status = TaskStatus::InProgress;
        self.assigned_agent = Some(agent.to_string());
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self, result: &str) {
        self.status = TaskStatus::Completed;
        self.result = Some(result.to_string());
        self.error = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.to_string());
        self.result = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Agent the dispatcher should target: the preferred agent, else `fallback`.
    pub fn dispatch_target<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.preferred_agent.as_deref().unwrap_or(fallback)
    }
}
