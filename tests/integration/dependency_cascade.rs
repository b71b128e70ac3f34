//! Readiness propagation through the task graph.

use agentrelay::core::{TaskNode, TaskStatus};
use agentrelay::Error;
use tokio_test::{assert_err, assert_ok};

use crate::fixtures::{diamond, id, TestRelay};

/// Test: A/B/C/D scenario
/// Given A, B(A), C(A), D(B, C)
/// When A, B, C complete in turn
/// Then B and C ready after A, D ready only after both
#[tokio::test]
async fn test_fan_out_fan_in_cascade() {
    let mut relay = TestRelay::new();
    for node in diamond() {
        relay.add(node);
    }
    assert_eq!(relay.status("a"), TaskStatus::Ready);
    for pending in ["b", "c", "d"] {
        assert_eq!(relay.status(pending), TaskStatus::Pending);
    }

    relay.complete("a");
    assert_eq!(relay.status("b"), TaskStatus::Ready);
    assert_eq!(relay.status("c"), TaskStatus::Ready);
    assert_eq!(relay.status("d"), TaskStatus::Pending);

    relay.complete("b");
    assert_eq!(relay.status("d"), TaskStatus::Pending);

    relay.complete("c");
    assert_eq!(relay.status("d"), TaskStatus::Ready);
}

/// Test: completion order of the join does not matter
#[tokio::test]
async fn test_join_order_independent() {
    let mut relay = TestRelay::new();
    for node in diamond() {
        relay.add(node);
    }
    relay.complete("a");
    relay.complete("c");
    assert_eq!(relay.status("d"), TaskStatus::Pending);
    relay.complete("b");
    assert_eq!(relay.status("d"), TaskStatus::Ready);
}

/// Test: a failed dependency blocks its dependents for good
#[tokio::test]
async fn test_failure_does_not_cascade() {
    let mut relay = TestRelay::new();
    for node in diamond() {
        relay.add(node);
    }
    relay.complete("a");
    relay.orchestrator.fail_task(&id("b"), "migration error");
    relay.complete("c");

    assert_eq!(relay.status("b"), TaskStatus::Failed);
    assert_eq!(relay.status("d"), TaskStatus::Pending);

    // Nothing left to dispatch for d.
    let report = relay.orchestrator.tick();
    assert!(report.dispatched.iter().all(|(t, _)| t.as_str() != "d"));
}

/// Test: dependency inserted after its dependent
#[tokio::test]
async fn test_late_dependency_is_wired() {
    let mut relay = TestRelay::new();
    relay.add(TaskNode::new("child", "", "").depends_on("parent"));
    assert_eq!(relay.status("child"), TaskStatus::Pending);

    relay.add(TaskNode::new("parent", "", ""));
    let parent = relay.orchestrator.get_task(&id("parent")).unwrap();
    assert!(parent.dependents.contains(&id("child")));

    relay.complete("parent");
    assert_eq!(relay.status("child"), TaskStatus::Ready);
}

/// Test: a task whose dependencies are already completed is ready on insert
#[tokio::test]
async fn test_insert_after_dependency_completed() {
    let mut relay = TestRelay::new();
    relay.add(TaskNode::new("a", "", ""));
    relay.complete("a");
    relay.add(TaskNode::new("b", "", "").depends_on("a"));
    assert_eq!(relay.status("b"), TaskStatus::Ready);

    let a = relay.orchestrator.get_task(&id("a")).unwrap();
    assert_eq!(a.dependents.len(), 1);
}

/// Test: repeated dependency does not duplicate the reverse edge
#[tokio::test]
async fn test_edges_not_duplicated() {
    let mut relay = TestRelay::new();
    relay.add(TaskNode::new("a", "", ""));
    relay.add(TaskNode::new("b", "", "").depends_on("a").depends_on("a"));
    let a = relay.orchestrator.get_task(&id("a")).unwrap();
    assert_eq!(a.dependents.iter().filter(|d| d.as_str() == "b").count(), 1);
}

/// Test: duplicate ids and cycles are rejected
#[tokio::test]
async fn test_insert_rejections() {
    let mut relay = TestRelay::new();
    assert_ok!(relay.orchestrator.add_task(TaskNode::new("x", "", "").depends_on("y")));

    let dup = relay.orchestrator.add_task(TaskNode::new("x", "", ""));
    assert!(matches!(assert_err!(dup), Error::TaskExists(_)));

    let cycle = relay.orchestrator.add_task(TaskNode::new("y", "", "").depends_on("x"));
    assert!(matches!(assert_err!(cycle), Error::CycleDetected(_)));
    assert!(!relay.orchestrator.graph().contains(&id("y")));
}

/// Test: graph state snapshot tracks every status
#[tokio::test]
async fn test_graph_state_counts() {
    let mut relay = TestRelay::new();
    for node in diamond() {
        relay.add(node);
    }
    relay.complete("a");
    relay.orchestrator.tick();
    relay.orchestrator.start_task(&id("b"), "main");

    let state = relay.orchestrator.get_graph_state();
    assert_eq!(state.total, 4);
    assert_eq!(state.counts.completed, 1);
    assert_eq!(state.counts.in_progress, 1);
    assert_eq!(state.counts.assigned, 1);
    assert_eq!(state.counts.pending, 1);
    let ids: Vec<&str> = state.nodes.iter().map(|n| n.task_id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c", "d"]);
}
