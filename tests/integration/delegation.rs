//! Delegation pickup through the shared delegation directory.

use agentrelay::core::{Priority, TaskStatus};
use agentrelay::handoff::{DelegationRequest, ResultStore};
use tokio_test::assert_ok;

use crate::fixtures::{id, TestRelay};

fn request(task: &str) -> DelegationRequest {
    let mut req = DelegationRequest::new(task, "planner", "coder", "Add retry to client");
    req.description = "wrap the HTTP call".to_string();
    req.priority = Priority::High;
    req.plan_id = Some("plan-7".to_string());
    req
}

/// Test: a delegation becomes a ready node for its target agent
/// Given one delegation file
/// When the orchestrator ticks
/// Then the node exists, targets the agent, is dispatched, and the file is gone
#[tokio::test]
async fn test_delegation_becomes_ready_node() {
    let mut relay = TestRelay::new();
    assert_ok!(relay.delegations().push("d1", &request("d1")));

    let report = relay.orchestrator.tick();
    assert_eq!(report.delegations_picked_up, 1);
    assert_eq!(report.dispatched, vec![(id("d1"), "coder".to_string())]);

    let node = relay.orchestrator.get_task(&id("d1")).unwrap();
    assert_eq!(node.preferred_agent.as_deref(), Some("coder"));
    assert_eq!(node.source_agent.as_deref(), Some("planner"));
    assert_eq!(node.priority, Priority::High);
    assert_eq!(node.plan_id.as_deref(), Some("plan-7"));
    assert!(node.dependencies.is_empty());
    assert!(assert_ok!(relay.delegations().scan()).is_empty());
}

/// Test: two files for the same task id land between ticks
/// Then exactly one node exists and both files are removed
#[tokio::test]
async fn test_duplicate_files_one_node() {
    let mut relay = TestRelay::new();
    let queue = relay.delegations();
    assert_ok!(queue.push("dup", &request("dup")));
    assert_ok!(queue.push("dup", &request("dup")));
    assert_eq!(assert_ok!(queue.scan()).len(), 2);

    let report = relay.orchestrator.tick();
    assert_eq!(report.delegations_picked_up, 1);
    assert_eq!(report.delegations_duplicate, 1);
    assert_eq!(relay.orchestrator.graph().len(), 1);
    assert!(assert_ok!(queue.scan()).is_empty());
}

/// Test: re-presenting a known delegation later does not reset the task
#[tokio::test]
async fn test_redelivery_after_progress_is_ignored() {
    let mut relay = TestRelay::new();
    let queue = relay.delegations();
    assert_ok!(queue.push("r1", &request("r1")));
    relay.orchestrator.tick();
    relay.orchestrator.start_task(&id("r1"), "coder");

    assert_ok!(queue.push("r1", &request("r1")));
    relay.orchestrator.tick();
    assert_eq!(relay.status("r1"), TaskStatus::InProgress);
    assert_eq!(relay.orchestrator.graph().len(), 1);
}

/// Test: a finished and pruned delegation is not run again
/// Given a delegated task that completed and was pruned from the graph
/// When the same delegation file is delivered again
/// Then it is dropped as a duplicate and nothing is dispatched
#[tokio::test]
async fn test_redelivery_after_pruning_is_ignored() {
    let mut relay = TestRelay::with_config(|c| c.prune_threshold = 1);
    let queue = relay.delegations();
    assert_ok!(queue.push("p1", &request("p1")));
    assert_ok!(queue.push("p2", &request("p2")));
    relay.orchestrator.tick();
    relay.complete("p1");
    assert!(!relay.orchestrator.graph().contains(&id("p1")));
    relay.orchestrator.settle().await;
    let announced = relay.announcer.calls().len();

    assert_ok!(queue.push("p1", &request("p1")));
    let report = relay.orchestrator.tick();
    assert_eq!(report.delegations_duplicate, 1);
    assert_eq!(report.delegations_picked_up, 0);
    assert!(report.dispatched.is_empty());
    assert!(relay.orchestrator.get_task(&id("p1")).is_none());
    relay.orchestrator.settle().await;
    assert_eq!(relay.announcer.calls().len(), announced);
}

/// Test: malformed files are retained and redelivered
#[tokio::test]
async fn test_malformed_file_retained() {
    let mut relay = TestRelay::new();
    let dir = relay.nas().join("delegations");
    std::fs::create_dir_all(&dir).unwrap();
    let poisoned = dir.join("delegation-broken.json");
    std::fs::write(&poisoned, r#"{"taskId": "x", "targetAgent": }"#).unwrap();
    // Not matching the naming pattern: never touched.
    let stray = dir.join("notes.json");
    std::fs::write(&stray, "{}").unwrap();
    assert_ok!(relay.delegations().push("ok", &request("ok")));

    let first = relay.orchestrator.tick();
    assert_eq!(first.malformed_files, 1);
    assert_eq!(first.delegations_picked_up, 1);
    assert!(poisoned.exists());
    assert!(stray.exists());

    let second = relay.orchestrator.tick();
    assert_eq!(second.malformed_files, 1);
}

/// Test: nesting deeper than max_depth is failed back to the requester
#[tokio::test]
async fn test_depth_limit_fails_back() {
    let mut relay = TestRelay::with_config(|c| c.max_depth = 2);
    let queue = relay.delegations();

    let mut deep = request("deep");
    deep.depth = 3;
    assert_ok!(queue.push("deep", &deep));
    let mut ok = request("shallow");
    ok.depth = 2;
    assert_ok!(queue.push("shallow", &ok));

    let report = relay.orchestrator.tick();
    assert_eq!(report.delegations_rejected, 1);
    assert_eq!(report.delegations_picked_up, 1);
    assert_eq!(relay.status("deep"), TaskStatus::Failed);
    assert_eq!(report.dispatched, vec![(id("shallow"), "coder".to_string())]);
    assert!(assert_ok!(queue.scan()).is_empty());

    relay.orchestrator.settle().await;
    let calls = relay.announcer.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].task_id, id("deep"));
    assert!(!calls[0].success);

    let results = ResultStore::new(relay.nas().join("results"));
    let record = assert_ok!(results.read(&id("deep"))).unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
}

/// Test: a parent known to the graph decides the depth
#[tokio::test]
async fn test_depth_derived_from_parent() {
    let mut relay = TestRelay::new();
    let queue = relay.delegations();
    assert_ok!(queue.push("p", &request("p")));
    relay.orchestrator.tick();

    let mut child = request("c");
    child.parent_task_id = Some(id("p"));
    // Claimed depth is ignored when the parent is known.
    child.depth = 9;
    assert_ok!(queue.push("c", &child));
    relay.orchestrator.tick();

    let node = relay.orchestrator.get_task(&id("c")).unwrap();
    assert_eq!(node.depth, 1);
    assert_eq!(node.parent_task_id, Some(id("p")));
    assert_ne!(node.status, TaskStatus::Failed);
}
