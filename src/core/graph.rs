//! In-memory task graph with embedded dependency edges.
//!
//! The graph is the sole source of truth for scheduling decisions. Each node
//! carries its own `dependencies` and `dependents`; [`TaskGraph`] keeps the
//! two exactly transposed across the live node set, including when a
//! dependency arrives after the task that names it.

use crate::core::task::{TaskId, TaskNode, TaskStatus};
use crate::error::{Error, Result};
use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-status node counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub assigned: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    fn bump(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::Ready => self.ready += 1,
            TaskStatus::Assigned => self.assigned += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }

    pub fn get(&self, status: TaskStatus) -> usize {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Ready => self.ready,
            TaskStatus::Assigned => self.assigned,
            TaskStatus::InProgress => self.in_progress,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
        }
    }
}

/// Snapshot returned by [`TaskGraph::state`] for dashboards and debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphState {
    pub total: usize,
    pub counts: StatusCounts,
    /// Nodes in insertion order.
    pub nodes: Vec<TaskNode>,
}

/// The task dependency graph.
#[derive(Default)]
pub struct TaskGraph {
    nodes: HashMap<TaskId, TaskNode>,
    /// Insertion sequence, used only to break priority ties.
    seq: HashMap<TaskId, u64>,
    next_seq: u64,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node and wire its reverse edges.
    ///
    /// The node's status is derived from its dependencies: `Ready` when every
    /// dependency is present and completed (vacuously true for none),
    /// `Pending` otherwise. Any `dependents` supplied by the caller are
    /// replaced by the ones derived from nodes already in the graph.
    ///
    /// # Errors
    /// - [`Error::TaskExists`] if the id is already present
    /// - [`Error::CycleDetected`] if the node closes a dependency cycle
    pub fn insert(&mut self, mut node: TaskNode) -> Result<TaskStatus> {
        let id = node.task_id.clone();
        if self.nodes.contains_key(&id) {
            return Err(Error::TaskExists(id.to_string()));
        }
        if node.dependencies.contains(&id) {
            return Err(Error::CycleDetected(id.to_string()));
        }

        node.dependents = self
            .nodes
            .values()
            .filter(|other| other.dependencies.contains(&id))
            .map(|other| other.task_id.clone())
            .collect();

        let has_present_dep = node.dependencies.iter().any(|d| self.nodes.contains_key(d));
        if has_present_dep && !node.dependents.is_empty() && self.closes_cycle(&node) {
            return Err(Error::CycleDetected(id.to_string()));
        }

        for dep in &node.dependencies {
            if let Some(dep_node) = self.nodes.get_mut(dep) {
                dep_node.dependents.insert(id.clone());
            }
        }

        node.status = if self.dependencies_met(&node) {
            TaskStatus::Ready
        } else {
            TaskStatus::Pending
        };
        let status = node.status;

        self.seq.insert(id.clone(), self.next_seq);
        self.next_seq += 1;
        self.nodes.insert(id, node);
        Ok(status)
    }

    fn closes_cycle(&self, candidate: &TaskNode) -> bool {
        let mut g: DiGraphMap<&str, ()> = DiGraphMap::new();
        for node in self.nodes.values().chain(std::iter::once(candidate)) {
            g.add_node(node.task_id.as_str());
            for dep in &node.dependencies {
                g.add_edge(dep.as_str(), node.task_id.as_str(), ());
            }
        }
        is_cyclic_directed(&g)
    }

    fn dependencies_met(&self, node: &TaskNode) -> bool {
        node.dependencies.iter().all(|dep| {
            self.nodes
                .get(dep)
                .map(|d| d.status == TaskStatus::Completed)
                .unwrap_or(false)
        })
    }

    /// Promote every pending dependent of `id` whose dependencies are now all
    /// completed. Returns the promoted ids.
    pub fn promote_dependents(&mut self, id: &TaskId) -> Vec<TaskId> {
        let candidates: Vec<TaskId> = match self.nodes.get(id) {
            Some(node) => node.dependents.iter().cloned().collect(),
            None => return Vec::new(),
        };

        let mut promoted = Vec::new();
        for dependent in candidates {
            let ready = match self.nodes.get(&dependent) {
                Some(n) => n.status == TaskStatus::Pending && self.dependencies_met(n),
                None => false,
            };
            if ready {
                if let Some(n) = self.nodes.get_mut(&dependent) {
                    n.mark_ready();
                    promoted.push(dependent);
                }
            }
        }
        promoted
    }

    pub fn get(&self, id: &TaskId) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut TaskNode> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in insertion order.
    pub fn nodes_in_order(&self) -> Vec<&TaskNode> {
        let mut nodes: Vec<&TaskNode> = self.nodes.values().collect();
        nodes.sort_by_key(|n| self.seq.get(&n.task_id).copied().unwrap_or(u64::MAX));
        nodes
    }

    /// Ready tasks, highest priority first, insertion order within a priority.
    pub fn ready_by_priority(&self) -> Vec<&TaskNode> {
        let mut ready: Vec<&TaskNode> = self
            .nodes_in_order()
            .into_iter()
            .filter(|n| n.status == TaskStatus::Ready)
            .collect();
        // Stable sort keeps insertion order for equal priorities.
        ready.sort_by(|a, b| b.priority.cmp(&a.priority));
        ready
    }

    /// Number of assigned or in-progress tasks.
    pub fn active_count(&self) -> usize {
        self.nodes.values().filter(|n| n.status.is_active()).count()
    }

    /// Active task counts keyed by agent.
    pub fn active_by_agent(&self) -> HashMap<String, usize> {
        let mut by_agent = HashMap::new();
        for node in self.nodes.values().filter(|n| n.status.is_active()) {
            if let Some(agent) = &node.assigned_agent {
                *by_agent.entry(agent.clone()).or_insert(0) += 1;
            }
        }
        by_agent
    }

    /// Every task ever assigned to `agent`, in insertion order.
    pub fn agent_tasks(&self, agent: &str) -> Vec<&TaskNode> {
        self.nodes_in_order()
            .into_iter()
            .filter(|n| n.assigned_agent.as_deref() == Some(agent))
            .collect()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for node in self.nodes.values() {
            counts.bump(node.status);
        }
        counts
    }

    pub fn state(&self) -> GraphState {
        GraphState {
            total: self.nodes.len(),
            counts: self.counts(),
            nodes: self.nodes_in_order().into_iter().cloned().collect(),
        }
    }

    /// Drop terminal nodes that no non-terminal node still depends on.
    ///
    /// Removed ids are also scrubbed from surviving `dependents` sets so the
    /// transpose invariant holds over the remaining nodes.
    pub fn prune_terminal(&mut self) -> Vec<TaskId> {
        let needed: std::collections::HashSet<&TaskId> = self
            .nodes
            .values()
            .filter(|n| !n.status.is_terminal())
            .flat_map(|n| n.dependencies.iter())
            .collect();

        let removable: Vec<TaskId> = self
            .nodes
            .values()
            .filter(|n| n.status.is_terminal() && !needed.contains(&n.task_id))
            .map(|n| n.task_id.clone())
            .collect();

        for id in &removable {
            self.nodes.remove(id);
            self.seq.remove(id);
        }
        for node in self.nodes.values_mut() {
            for id in &removable {
                node.dependents.remove(id);
            }
        }
        removable
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.nodes.len())
            .field("active", &self.active_count())
            .finish()
    }
}
