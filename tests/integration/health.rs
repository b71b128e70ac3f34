//! Health monitor: liveness, system status, heartbeats and the cost ledger.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agentrelay::config::Config;
use agentrelay::core::TaskNode;
use agentrelay::handoff::DirectoryQueue;
use agentrelay::orchestration::{
    read_snapshot, spawn_watchdog, AgentLiveness, AgentStats, HealthConfig, HealthMonitor,
    HeartbeatBeacon, SystemStatus, UsageEntry, USAGE_PREFIX,
};
use agentrelay::store::{agent_key, MemoryStore, SqliteStore, StateStore};
use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use crate::fixtures::{id, TestRelay};

fn health_config(nas: &std::path::Path) -> HealthConfig {
    let mut config = Config::default();
    config.orchestrator.nas_path = nas.to_string_lossy().into_owned();
    config.health.heartbeat_interval_secs = 1;
    config.health.heartbeat_timeout_secs = 3;
    config.health.ledger_capacity = 4;
    HealthConfig::from(&config)
}

/// Test: busy agents come from the orchestrator's active tasks
/// Given two heartbeating agents, one holding a dispatched task
/// When health is evaluated with the orchestrator's active counts
/// Then that agent is busy, the other online, and the system healthy
#[tokio::test]
async fn test_busy_from_active_tasks() {
    let mut relay = TestRelay::new();
    relay.add(TaskNode::new("t", "", "").with_preferred_agent("coder"));
    relay.orchestrator.tick();

    let store = Arc::new(MemoryStore::new());
    let mut monitor = HealthMonitor::new(health_config(relay.nas()), store);
    let now = Utc::now();
    for agent in ["coder", "writer"] {
        assert_ok!(
            monitor
                .record_heartbeat(agent, now, &AgentStats::default())
                .await
        );
    }

    let health = monitor
        .get_health(&relay.orchestrator.active_tasks_by_agent())
        .await;
    assert_eq!(health.status, SystemStatus::Healthy);
    let coder = health.agents.iter().find(|a| a.agent_id == "coder").unwrap();
    assert_eq!(coder.liveness, AgentLiveness::Busy);
    assert_eq!(coder.active_tasks, 1);
    let writer = health.agents.iter().find(|a| a.agent_id == "writer").unwrap();
    assert_eq!(writer.liveness, AgentLiveness::Online);
}

/// Test: all agents offline is critical, some offline is degraded
#[tokio::test]
async fn test_offline_agents_drive_status() {
    let dir = TempDir::new().unwrap();
    let mut monitor = HealthMonitor::new(health_config(dir.path()), Arc::new(MemoryStore::new()));
    let old = Utc::now() - chrono::Duration::seconds(60);
    monitor.observe_heartbeat("a", old, &AgentStats::default());
    monitor.observe_heartbeat("b", old, &AgentStats::default());

    let none = HashMap::new();
    assert_eq!(monitor.get_health(&none).await.status, SystemStatus::Critical);

    monitor.observe_heartbeat("a", Utc::now(), &AgentStats::default());
    let health = monitor.get_health(&none).await;
    assert_eq!(health.status, SystemStatus::Degraded);
    let offline: Vec<&str> = health.offline_agents().map(|a| a.agent_id.as_str()).collect();
    assert_eq!(offline, vec!["b"]);
}

/// Run the monitor's heartbeats against a status writer on another handle
/// and check the record ends with the writer's status and the newest beat.
async fn heartbeat_status_race(monitor_store: Arc<dyn StateStore>, writer_store: Arc<dyn StateStore>) {
    let dir = TempDir::new().unwrap();
    let monitor = Arc::new(Mutex::new(HealthMonitor::new(
        health_config(dir.path()),
        monitor_store,
    )));
    let key = agent_key("coder");
    assert_ok!(writer_store.set_json(&key, json!({"status": "offline"}), None).await);

    let base = Utc::now();
    let beats = {
        let monitor = Arc::clone(&monitor);
        tokio::spawn(async move {
            for i in 0..100 {
                let at = base + chrono::Duration::milliseconds(i);
                let mut m = monitor.lock().await;
                m.record_heartbeat("coder", at, &AgentStats::default())
                    .await
                    .unwrap();
                drop(m);
                tokio::task::yield_now().await;
            }
        })
    };
    let writer = {
        let store = Arc::clone(&writer_store);
        let key = key.clone();
        tokio::spawn(async move {
            for _ in 0..100 {
                assert!(store.set_field(&key, "status", json!("busy")).await.unwrap());
                tokio::task::yield_now().await;
            }
        })
    };
    beats.await.unwrap();
    writer.await.unwrap();

    let value = writer_store.get_json(&key).await.unwrap().unwrap();
    assert_eq!(value["status"], "busy");
    assert_eq!(
        value["lastHeartbeat"],
        (base + chrono::Duration::milliseconds(99)).timestamp_millis()
    );
}

/// Test: heartbeat keeps a status written concurrently in the same process
/// Given one in-memory store shared by the monitor and a status writer
/// When heartbeats and field-level status writes interleave
/// Then the writer's status and the newest heartbeat both survive
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_heartbeat_and_status_writer_race() {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    heartbeat_status_race(Arc::clone(&store), store).await;
}

/// Test: heartbeat keeps a status written through another connection
/// Given two connections to one SQLite state file
/// When heartbeats and status writes interleave across them
/// Then the writer's status and the newest heartbeat both survive
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_heartbeat_and_status_writer_race_across_connections() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("state.db");
    let monitor_store: Arc<dyn StateStore> = Arc::new(assert_ok!(SqliteStore::open(&db)));
    let writer_store: Arc<dyn StateStore> = Arc::new(assert_ok!(SqliteStore::open(&db)));
    heartbeat_status_race(monitor_store, writer_store).await;
}

/// Test: beacons written by worker processes are collected
#[tokio::test]
async fn test_beacon_files_collected() {
    let dir = TempDir::new().unwrap();
    let config = health_config(dir.path());
    let mut monitor = HealthMonitor::new(config.clone(), Arc::new(MemoryStore::new()));
    for agent in ["coder", "writer"] {
        assert_ok!(
            HeartbeatBeacon::now(
                agent,
                AgentStats {
                    memory_bytes: Some(64 << 20),
                    process_started_at: Some(Utc::now() - chrono::Duration::seconds(120)),
                },
            )
            .write(&config.heartbeats_dir)
        );
    }

    assert_eq!(assert_ok!(monitor.collect_beacons().await), 2);
    let health = monitor.get_health(&HashMap::new()).await;
    assert_eq!(health.agents.len(), 2);
    assert!(health.agents.iter().all(|a| a.uptime_secs.unwrap_or(0) >= 120));
    assert!(health.agents.iter().all(|a| a.memory_bytes == Some(64 << 20)));
}

/// Test: ledger keeps only the newest entries and windows by age
#[tokio::test]
async fn test_cost_ledger_cap_and_window() {
    let dir = TempDir::new().unwrap();
    let mut monitor = HealthMonitor::new(health_config(dir.path()), Arc::new(MemoryStore::new()));
    let mut stale = UsageEntry::new("planner", "large", 10, 10, 9.0);
    stale.at = Utc::now() - chrono::Duration::hours(3);
    monitor.record_usage(stale);
    for i in 0..4 {
        monitor.record_usage(UsageEntry::new(
            if i % 2 == 0 { "planner" } else { "coder" },
            "small",
            100,
            10,
            0.5,
        ));
    }

    // Capacity 4: the stale entry was dropped.
    assert_eq!(monitor.ledger().len(), 4);
    let all = monitor.cost_breakdown(None);
    assert!(!all.by_model.contains_key("large"));
    assert_eq!(all.by_agent["planner"].entries, 2);
    assert!((all.total.cost_usd - 2.0).abs() < 1e-9);

    let last_minute = monitor.cost_breakdown(Some(Duration::from_secs(60)));
    assert_eq!(last_minute.total.entries, 4);
}

/// Test: the watchdog folds events and usage files into the snapshot
#[tokio::test]
async fn test_watchdog_snapshot_and_events() {
    let mut relay = TestRelay::new();
    let events = relay.orchestrator.subscribe();
    relay.add(TaskNode::new("t", "", "").with_preferred_agent("coder"));
    relay.orchestrator.tick();
    relay.orchestrator.start_task(&id("t"), "coder");
    relay.orchestrator.complete_task(&id("t"), "done");

    let nas = relay.nas().to_path_buf();
    let config = health_config(&nas);
    HeartbeatBeacon::now("coder", AgentStats::default())
        .write(&config.heartbeats_dir)
        .unwrap();
    let usage: DirectoryQueue<UsageEntry> =
        DirectoryQueue::new(&config.usage_dir, USAGE_PREFIX).unwrap();
    usage
        .push("coder", &UsageEntry::new("coder", "large", 1200, 300, 0.04))
        .unwrap();
    let monitor = Arc::new(Mutex::new(HealthMonitor::new(
        config,
        Arc::new(MemoryStore::new()),
    )));
    let TestRelay {
        temp_dir: _temp_dir,
        orchestrator,
        ..
    } = relay;
    let orchestrator = Arc::new(Mutex::new(orchestrator));

    let cancel = CancellationToken::new();
    let handle = spawn_watchdog(
        Arc::clone(&monitor),
        Arc::clone(&orchestrator),
        Some(events),
        cancel.clone(),
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    handle.await.unwrap();

    let m = monitor.lock().await;
    assert_eq!(m.vitals("coder").unwrap().tasks_completed, 1);
    assert_eq!(m.ledger().len(), 1);
    drop(m);

    let snapshot = assert_ok!(read_snapshot(&nas)).expect("snapshot written");
    assert_eq!(snapshot.health.status, SystemStatus::Healthy);
    assert_eq!(snapshot.health.agents.len(), 1);
    assert_eq!(snapshot.costs.by_model["large"].input_tokens, 1200);
    assert!(assert_ok!(usage.scan()).is_empty());
}
