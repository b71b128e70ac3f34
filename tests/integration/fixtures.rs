//! Test fixtures for integration tests.
//!
//! Provides a relay rooted in a temporary shared directory with recording
//! mock dispatcher and announcer.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use agentrelay::config::OrchestratorConfig;
use agentrelay::core::{TaskId, TaskNode, TaskStatus};
use agentrelay::handoff::{DelegationRequest, DirectoryQueue, DELEGATION_PREFIX};
use agentrelay::orchestration::{Announcer, Dispatcher, Orchestrator};
use agentrelay::{Error, Result};
use async_trait::async_trait;
use tempfile::TempDir;

/// Records every dispatch; agents in `unreachable` fail.
#[derive(Default)]
pub struct MockDispatcher {
    pub calls: Mutex<Vec<(String, TaskId)>>,
    pub unreachable: Mutex<HashSet<String>>,
}

impl MockDispatcher {
    pub fn fail_for(&self, agent: &str) {
        self.unreachable.lock().unwrap().insert(agent.to_string());
    }

    pub fn recover(&self, agent: &str) {
        self.unreachable.lock().unwrap().remove(agent);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, task: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, t)| t.as_str() == task)
            .count()
    }
}

#[async_trait]
impl Dispatcher for MockDispatcher {
    async fn dispatch(&self, agent_id: &str, task: &TaskNode) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((agent_id.to_string(), task.task_id.clone()));
        if self.unreachable.lock().unwrap().contains(agent_id) {
            return Err(Error::Dispatch {
                agent: agent_id.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceCall {
    pub source_agent: String,
    pub task_id: TaskId,
    pub output: String,
    pub success: bool,
}

/// Records every announcement; fails all of them when `fail` is set.
#[derive(Default)]
pub struct MockAnnouncer {
    pub calls: Mutex<Vec<AnnounceCall>>,
    pub fail: Mutex<bool>,
}

impl MockAnnouncer {
    pub fn calls(&self) -> Vec<AnnounceCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Announcer for MockAnnouncer {
    async fn announce(
        &self,
        source_agent: &str,
        task_id: &TaskId,
        output: &str,
        success: bool,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(AnnounceCall {
            source_agent: source_agent.to_string(),
            task_id: task_id.clone(),
            output: output.to_string(),
            success,
        });
        if *self.fail.lock().unwrap() {
            return Err(Error::Announce {
                agent: source_agent.to_string(),
                reason: "inbox full".to_string(),
            });
        }
        Ok(())
    }
}

/// An orchestrator over a temporary shared directory.
pub struct TestRelay {
    pub temp_dir: TempDir,
    pub orchestrator: Orchestrator,
    pub dispatcher: Arc<MockDispatcher>,
    pub announcer: Arc<MockAnnouncer>,
}

impl TestRelay {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut OrchestratorConfig)) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let mut config = OrchestratorConfig::with_nas_path(temp_dir.path());
        tweak(&mut config);
        let dispatcher = Arc::new(MockDispatcher::default());
        let announcer = Arc::new(MockAnnouncer::default());
        let orchestrator = Orchestrator::new(config, dispatcher.clone(), announcer.clone())
            .expect("Failed to create orchestrator");
        Self {
            temp_dir,
            orchestrator,
            dispatcher,
            announcer,
        }
    }

    pub fn nas(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn delegations(&self) -> DirectoryQueue<DelegationRequest> {
        DirectoryQueue::new(self.nas().join("delegations"), DELEGATION_PREFIX)
            .expect("Failed to open delegation queue")
    }

    pub fn status(&self, id: &str) -> TaskStatus {
        self.orchestrator
            .get_task(&TaskId::from(id))
            .unwrap_or_else(|| panic!("task {} not in graph", id))
            .status
    }

    pub fn add(&mut self, node: TaskNode) {
        self.orchestrator.add_task(node).expect("Failed to add task");
    }

    pub fn complete(&mut self, id: &str) {
        assert!(self.orchestrator.complete_task(&TaskId::from(id), &format!("{} done", id)));
    }
}

pub fn id(s: &str) -> TaskId {
    TaskId::from(s)
}

/// Diamond: a -> {b, c} -> d.
pub fn diamond() -> Vec<TaskNode> {
    vec![
        TaskNode::new("a", "Design schema", ""),
        TaskNode::new("b", "Write migrations", "").depends_on("a"),
        TaskNode::new("c", "Write models", "").depends_on("a"),
        TaskNode::new("d", "Integrate", "").depends_on("b").depends_on("c"),
    ]
}
