//! Core domain models for agentrelay orchestration.
//!
//! This module contains the task node and the dependency graph the
//! orchestrator schedules from.

pub mod graph;
pub mod task;

pub use graph::{GraphState, StatusCounts, TaskGraph};
pub use task::{Priority, TaskId, TaskNode, TaskStatus};
