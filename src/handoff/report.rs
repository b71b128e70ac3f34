//! Worker progress reports for hosts that cannot call the orchestrator directly.

use crate::core::TaskId;
use serde::{Deserialize, Serialize};

/// File-name prefix identifying worker report files.
pub const REPORT_PREFIX: &str = "report";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Started,
    Completed,
    Failed,
}

/// A worker's statement about a task, applied as start/complete/fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerReport {
    pub task_id: TaskId,
    pub agent_id: String,
    pub kind: ReportKind,
    /// Result on completion, error message on failure.
    #[serde(default)]
    pub output: Option<String>,
}

impl WorkerReport {
    pub fn new(task_id: impl Into<TaskId>, agent_id: &str, kind: ReportKind) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.to_string(),
            kind,
            output: None,
        }
    }

    pub fn with_output(mut self, output: &str) -> Self {
        self.output = Some(output.to_string());
        self
    }
}
