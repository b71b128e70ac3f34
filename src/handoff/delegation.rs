//! Delegation requests: cross-agent work requests dropped on the shared filesystem.

use crate::core::{Priority, TaskId, TaskNode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// File-name prefix identifying delegation request files.
pub const DELEGATION_PREFIX: &str = "delegation";

/// At-rest form of a request for `target_agent` to run a task on behalf of
/// `source_agent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationRequest {
    pub task_id: TaskId,
    pub target_agent: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    pub source_agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Task the source agent was working on when it delegated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<TaskId>,
    /// Nesting depth claimed by the producer; overridden by the parent's depth when known.
    #[serde(default)]
    pub depth: u32,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl DelegationRequest {
    pub fn new(task_id: impl Into<TaskId>, source_agent: &str, target_agent: &str, title: &str) -> Self {
        Self {
            task_id: task_id.into(),
            target_agent: target_agent.to_string(),
            title: title.to_string(),
            description: String::new(),
            priority: Priority::Normal,
            source_agent: source_agent.to_string(),
            plan_id: None,
            step_id: None,
            parent_task_id: None,
            depth: 0,
            created_at: Utc::now(),
        }
    }

    /// Convert into a dependency-free node targeting `target_agent`.
    ///
    /// The graph derives `Ready` for it on insertion.
    pub fn into_node(self, depth: u32) -> TaskNode {
        let mut node = TaskNode::new(self.task_id, &self.title, &self.description)
            .with_priority(self.priority)
            .with_preferred_agent(&self.target_agent)
            .with_source_agent(&self.source_agent);
        node.parent_task_id = self.parent_task_id;
        node.plan_id = self.plan_id;
        node.step_id = self.step_id;
        node.depth = depth;
        node.created_at = self.created_at;
        node
    }
}
