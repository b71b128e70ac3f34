//! Extension points through which the orchestrator reaches workers.
//!
//! The host registers one [`Dispatcher`] and one [`Announcer`]. Both are
//! awaited off the tick path, so a slow target only delays its own task.

use crate::core::{TaskId, TaskNode};
use crate::error::{Error, Result};
use crate::handoff::encode_key;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Hands an assigned task to the agent that should run it.
///
/// An `Err` reverts the task to ready for retry on a later tick.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, agent_id: &str, task: &TaskNode) -> Result<()>;
}

/// Tells the agent that delegated a task how it ended.
///
/// Best effort: an `Err` is logged and the terminal state stands.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(
        &self,
        source_agent: &str,
        task_id: &TaskId,
        output: &str,
        success: bool,
    ) -> Result<()>;
}

/// Payload written by [`InboxAnnouncer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub task_id: TaskId,
    pub success: bool,
    pub output: String,
    pub announced_at: DateTime<Utc>,
}

/// Dispatches by dropping `task-<id>.json` into `<inbox>/<agent>/`.
#[derive(Debug, Clone)]
pub struct InboxDispatcher {
    root: PathBuf,
}

impl InboxDispatcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn inbox_for(&self, agent_id: &str) -> PathBuf {
        self.root.join(encode_key(agent_id))
    }
}

#[async_trait]
impl Dispatcher for InboxDispatcher {
    async fn dispatch(&self, agent_id: &str, task: &TaskNode) -> Result<()> {
        let name = format!("task-{}.json", encode_key(task.task_id.as_str()));
        write_inbox_file(&self.inbox_for(agent_id), &name, &serde_json::to_vec_pretty(task)?)
            .await
            .map_err(|e| Error::Dispatch {
                agent: agent_id.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Announces by dropping `announce-<id>.json` into the source agent's inbox.
#[derive(Debug, Clone)]
pub struct InboxAnnouncer {
    root: PathBuf,
}

impl InboxAnnouncer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Announcer for InboxAnnouncer {
    async fn announce(
        &self,
        source_agent: &str,
        task_id: &TaskId,
        output: &str,
        success: bool,
    ) -> Result<()> {
        let announcement = Announcement {
            task_id: task_id.clone(),
            success,
            output: output.to_string(),
            announced_at: Utc::now(),
        };
        let name = format!("announce-{}.json", encode_key(task_id.as_str()));
        let dir = self.root.join(encode_key(source_agent));
        write_inbox_file(&dir, &name, &serde_json::to_vec_pretty(&announcement)?)
            .await
            .map_err(|e| Error::Announce {
                agent: source_agent.to_string(),
                reason: e.to_string(),
            })
    }
}

async fn write_inbox_file(dir: &Path, name: &str, bytes: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let tmp = dir.join(format!(".{}.tmp", name));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, dir.join(name)).await
}
