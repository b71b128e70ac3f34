//! Result records: one JSON file per terminal task, named by task id.

use crate::core::{TaskId, TaskNode, TaskStatus};
use crate::error::{Error, Result};
use crate::handoff::queue::{encode_key, write_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Outcome of a terminal task, readable without an orchestrator reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub task_id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub agent_id: Option<String>,
    /// Result text on success, error text on failure.
    pub output: String,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl ResultRecord {
    /// Build the record for a terminal node.
    ///
    /// # Errors
    /// [`Error::Validation`] if the node has not finished.
    pub fn from_node(node: &TaskNode) -> Result<Self> {
        if !node.is_finished() {
            return Err(Error::Validation(format!(
                "task {} is {}, not terminal",
                node.task_id, node.status
            )));
        }
        let output = match node.status {
            TaskStatus::Completed => node.result.clone(),
            _ => node.error.clone(),
        }
        .unwrap_or_default();

        Ok(Self {
            task_id: node.task_id.clone(),
            title: node.title.clone(),
            status: node.status,
            agent_id: node.assigned_agent.clone(),
            output,
            completed_at: node.completed_at.unwrap_or_else(Utc::now),
            plan_id: node.plan_id.clone(),
            step_id: node.step_id.clone(),
        })
    }

    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

/// Directory of result records.
#[derive(Debug, Clone)]
pub struct ResultStore {
    dir: PathBuf,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, task_id: &TaskId) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(task_id.as_str())))
    }

    /// Whether a record exists for `task_id`.
    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.path_for(task_id).is_file()
    }

    /// Write (or overwrite) the record for its task.
    pub fn write(&self, record: &ResultRecord) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&record.task_id);
        write_atomic(&path, &serde_json::to_vec_pretty(record)?)?;
        Ok(path)
    }

    /// Read the record for `task_id`, `None` if no record exists yet.
    pub fn read(&self, task_id: &TaskId) -> Result<Option<ResultRecord>> {
        match fs::read_to_string(self.path_for(task_id)) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
