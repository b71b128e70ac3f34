//! Health monitoring for agents.
//!
//! The `HealthMonitor` keeps per-agent vitals (last heartbeat, completed and
//! failed task counts, process start time, last reported memory use) and
//! turns them into a liveness judgment per agent plus a system-wide status.
//! It also holds a size-capped usage ledger for cost breakdowns.
//!
//! Heartbeats arrive either in-process via [`HealthMonitor::record_heartbeat`]
//! or as beacon files that worker processes overwrite under
//! `<nas>/heartbeats/<agent>.json`. Either way the shared store record is
//! touched only through [`StateStore::heartbeat_or_insert`], so a heartbeat
//! can never undo a status written concurrently by another process.
//!
//! Usage entries arrive as `usage-*.json` files under `<nas>/usage/` and are
//! drained into the ledger by the watchdog; the health snapshot carries the
//! resulting cost breakdown.
//!
//! The watchdog only logs stale agents; it never changes an agent's status.

use crate::config::Config;
use crate::error::Result;
use crate::handoff::{encode_key, write_atomic, Delivery, DirectoryQueue};
use crate::orchestration::orchestrator::{OrchestratorEvent, SharedOrchestrator};
use crate::store::{agent_key, StateStore, STATUS_FIELD};
use crate::{rlog, rlog_debug, rlog_error, rlog_warn};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Heartbeat age, in heartbeat intervals, after which the watchdog logs an agent as stale.
pub const STALE_INTERVALS: u32 = 3;

/// Name of the health snapshot written under the shared root.
pub const SNAPSHOT_FILE: &str = "health.json";

pub const USAGE_PREFIX: &str = "usage";

/// Window of the recent cost figures in the health snapshot.
pub const RECENT_COST_WINDOW: Duration = Duration::from_secs(3600);

/// Monitor shared between the watchdog and the host.
pub type SharedHealthMonitor = Arc<Mutex<HealthMonitor>>;

/// Configuration for health monitoring.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub heartbeat_interval: Duration,
    /// Heartbeat age beyond which an agent is judged offline.
    pub heartbeat_timeout: Duration,
    /// Usage entries kept before the oldest are dropped.
    pub ledger_capacity: usize,
    /// TTL for agent records the monitor creates in the store.
    pub agent_ttl: Duration,
    /// Shared filesystem root; its absence makes the system critical.
    pub nas_root: PathBuf,
    pub heartbeats_dir: PathBuf,
    pub usage_dir: PathBuf,
}

impl From<&Config> for HealthConfig {
    fn from(config: &Config) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(config.health.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(config.health.heartbeat_timeout_secs),
            ledger_capacity: config.health.ledger_capacity,
            agent_ttl: Duration::from_secs(config.store.agent_ttl_secs),
            nas_root: config.orchestrator.nas_root(),
            heartbeats_dir: config.orchestrator.heartbeats_dir(),
            usage_dir: config.orchestrator.usage_dir(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl HealthConfig {
    pub fn stale_after(&self) -> Duration {
        self.heartbeat_interval * STALE_INTERVALS
    }
}

/// Process statistics a worker reports alongside its heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStats {
    #[serde(default)]
    pub process_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub memory_bytes: Option<u64>,
}

/// Heartbeat beacon file, overwritten in place by the worker on every beat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatBeacon {
    pub agent_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub stats: AgentStats,
}

impl HeartbeatBeacon {
    pub fn now(agent_id: &str, stats: AgentStats) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            at: Utc::now(),
            stats,
        }
    }

    pub fn path_in(dir: &Path, agent_id: &str) -> PathBuf {
        dir.join(format!("{}.json", encode_key(agent_id)))
    }

    /// Write the beacon atomically into `dir`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = Self::path_in(dir, &self.agent_id);
        write_atomic(&path, &serde_json::to_vec_pretty(self)?)?;
        Ok(path)
    }
}

/// What the monitor knows about one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentVitals {
    /// `None` for agents known only through task outcomes.
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub process_started_at: Option<DateTime<Utc>>,
    pub memory_bytes: Option<u64>,
}

impl AgentVitals {
    fn new(last_heartbeat: Option<DateTime<Utc>>) -> Self {
        Self {
            last_heartbeat,
            tasks_completed: 0,
            tasks_failed: 0,
            process_started_at: None,
            memory_bytes: None,
        }
    }

    /// Time since the last heartbeat; zero for heartbeats stamped in the future.
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_heartbeat
            .map(|at| (now - at).to_std().unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentLiveness {
    Online,
    Busy,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Healthy,
    Degraded,
    Critical,
}

impl std::fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SystemStatus::Healthy => "healthy",
            SystemStatus::Degraded => "degraded",
            SystemStatus::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Result of probing one piece of required infrastructure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyHealth {
    pub name: String,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DependencyHealth {
    pub fn up(name: &str) -> Self {
        Self {
            name: name.to_string(),
            healthy: true,
            detail: None,
        }
    }

    pub fn down(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            healthy: false,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    pub agent_id: String,
    pub liveness: AgentLiveness,
    pub heartbeat_age_secs: u64,
    pub active_tasks: usize,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub uptime_secs: Option<u64>,
    pub memory_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub status: SystemStatus,
    pub agents: Vec<AgentHealth>,
    pub dependencies: Vec<DependencyHealth>,
    pub checked_at: DateTime<Utc>,
}

impl SystemHealth {
    pub fn offline_agents(&self) -> impl Iterator<Item = &AgentHealth> {
        self.agents
            .iter()
            .filter(|a| a.liveness == AgentLiveness::Offline)
    }
}

// ========== Usage Ledger ==========

/// One model invocation, as reported by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEntry {
    pub at: DateTime<Utc>,
    pub agent_id: String,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl UsageEntry {
    pub fn new(agent_id: &str, model: &str, input_tokens: u64, output_tokens: u64, cost_usd: f64) -> Self {
        Self {
            at: Utc::now(),
            agent_id: agent_id.to_string(),
            model: model.to_string(),
            input_tokens,
            output_tokens,
            cost_usd,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostTotals {
    pub entries: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl CostTotals {
    fn add(&mut self, entry: &UsageEntry) {
        self.entries += 1;
        self.input_tokens += entry.input_tokens;
        self.output_tokens += entry.output_tokens;
        self.cost_usd += entry.cost_usd;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    pub total: CostTotals,
    pub by_model: BTreeMap<String, CostTotals>,
    pub by_agent: BTreeMap<String, CostTotals>,
}

/// Append-only usage ledger. Once `capacity` is exceeded the oldest entries
/// are dropped.
#[derive(Debug, Clone)]
pub struct CostLedger {
    entries: VecDeque<UsageEntry>,
    capacity: usize,
}

impl CostLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, entry: UsageEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Totals over entries no older than `window`, or over everything.
    pub fn breakdown(&self, window: Option<Duration>, now: DateTime<Utc>) -> CostBreakdown {
        let cutoff = window
            .and_then(|w| chrono::Duration::from_std(w).ok())
            .map(|w| now - w);
        let mut out = CostBreakdown::default();
        for entry in &self.entries {
            if cutoff.is_some_and(|c| entry.at < c) {
                continue;
            }
            out.total.add(entry);
            out.by_model.entry(entry.model.clone()).or_default().add(entry);
            out.by_agent.entry(entry.agent_id.clone()).or_default().add(entry);
        }
        out
    }
}

// ========== Monitor ==========

pub struct HealthMonitor {
    config: HealthConfig,
    store: Arc<dyn StateStore>,
    agents: HashMap<String, AgentVitals>,
    ledger: CostLedger,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, store: Arc<dyn StateStore>) -> Self {
        let ledger = CostLedger::new(config.ledger_capacity);
        Self {
            config,
            store,
            agents: HashMap::new(),
            ledger,
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn vitals(&self, agent_id: &str) -> Option<&AgentVitals> {
        self.agents.get(agent_id)
    }

    /// Known agent ids, sorted.
    pub fn known_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Update in-memory vitals only. Out-of-order heartbeats never move
    /// `last_heartbeat` backwards.
    pub fn observe_heartbeat(&mut self, agent_id: &str, at: DateTime<Utc>, stats: &AgentStats) {
        let vitals = self
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentVitals::new(None));
        if vitals.last_heartbeat.map_or(true, |last| at > last) {
            vitals.last_heartbeat = Some(at);
        }
        if stats.process_started_at.is_some() {
            vitals.process_started_at = stats.process_started_at;
        }
        if stats.memory_bytes.is_some() {
            vitals.memory_bytes = stats.memory_bytes;
        }
    }

    /// Record a heartbeat locally and in the shared store.
    ///
    /// An existing store record only has its heartbeat touched; a missing one
    /// is created as `idle` with the agent TTL, in the same atomic step.
    pub async fn record_heartbeat(
        &mut self,
        agent_id: &str,
        at: DateTime<Utc>,
        stats: &AgentStats,
    ) -> Result<()> {
        self.observe_heartbeat(agent_id, at, stats);
        let fresh = json!({
            "agentId": agent_id,
            STATUS_FIELD: "idle",
        });
        let existed = self
            .store
            .heartbeat_or_insert(&agent_key(agent_id), at, fresh, Some(self.config.agent_ttl))
            .await?;
        if !existed {
            rlog_debug!("Registered agent {} in store", agent_id);
        }
        Ok(())
    }

    /// Count a finished task against `agent_id`.
    pub fn record_task_outcome(&mut self, agent_id: &str, success: bool) {
        let vitals = self
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentVitals::new(None));
        if success {
            vitals.tasks_completed += 1;
        } else {
            vitals.tasks_failed += 1;
        }
    }

    /// Fold an orchestrator lifecycle event into the per-agent counters.
    pub fn observe_event(&mut self, event: &OrchestratorEvent) {
        match event {
            OrchestratorEvent::TaskCompleted {
                agent_id: Some(agent),
                ..
            } => self.record_task_outcome(agent, true),
            OrchestratorEvent::TaskFailed {
                agent_id: Some(agent),
                ..
            } => self.record_task_outcome(agent, false),
            _ => {}
        }
    }

    /// Read every beacon file and record the ones newer than what is known.
    /// Returns how many were applied.
    pub async fn collect_beacons(&mut self) -> Result<usize> {
        let dir = self.config.heartbeats_dir.clone();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut beacons = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(crate::Error::from)
                .and_then(|s| serde_json::from_str::<HeartbeatBeacon>(&s).map_err(Into::into));
            match parsed {
                Ok(beacon) => beacons.push(beacon),
                Err(e) => rlog_warn!("Unreadable heartbeat beacon {}: {}", path.display(), e),
            }
        }

        let mut applied = 0;
        for beacon in beacons {
            let newer = self
                .agents
                .get(&beacon.agent_id)
                .and_then(|v| v.last_heartbeat)
                .map_or(true, |last| beacon.at > last);
            if newer {
                self.record_heartbeat(&beacon.agent_id, beacon.at, &beacon.stats)
                    .await?;
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Agents whose heartbeat is older than [`STALE_INTERVALS`] intervals, with their age.
    pub fn stale_agents(&self, now: DateTime<Utc>) -> Vec<(String, Duration)> {
        let limit = self.config.stale_after();
        let mut stale: Vec<(String, Duration)> = self
            .agents
            .iter()
            .filter_map(|(id, v)| v.heartbeat_age(now).map(|age| (id.clone(), age)))
            .filter(|(_, age)| *age > limit)
            .collect();
        stale.sort();
        stale
    }

    /// Log stale agents. Status is left alone.
    pub fn check_stale(&self, now: DateTime<Utc>) -> Vec<String> {
        self.stale_agents(now)
            .into_iter()
            .map(|(id, age)| {
                rlog_warn!("Agent {} stale: last heartbeat {}s ago", id, age.as_secs());
                id
            })
            .collect()
    }

    /// Judge agents and the system from in-memory vitals. Agents that never
    /// sent a heartbeat are left out.
    pub fn evaluate(
        &self,
        active_by_agent: &HashMap<String, usize>,
        dependencies: Vec<DependencyHealth>,
        now: DateTime<Utc>,
    ) -> SystemHealth {
        let mut agents: Vec<AgentHealth> = self
            .agents
            .iter()
            .filter_map(|(id, v)| {
                let age = v.heartbeat_age(now)?;
                let active_tasks = active_by_agent.get(id).copied().unwrap_or(0);
                let liveness = if age > self.config.heartbeat_timeout {
                    AgentLiveness::Offline
                } else if active_tasks > 0 {
                    AgentLiveness::Busy
                } else {
                    AgentLiveness::Online
                };
                Some(AgentHealth {
                    agent_id: id.clone(),
                    liveness,
                    heartbeat_age_secs: age.as_secs(),
                    active_tasks,
                    tasks_completed: v.tasks_completed,
                    tasks_failed: v.tasks_failed,
                    uptime_secs: v
                        .process_started_at
                        .and_then(|s| (now - s).to_std().ok())
                        .map(|d| d.as_secs()),
                    memory_bytes: v.memory_bytes,
                })
            })
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        let offline = agents
            .iter()
            .filter(|a| a.liveness == AgentLiveness::Offline)
            .count();
        let status = if dependencies.iter().any(|d| !d.healthy)
            || (!agents.is_empty() && offline == agents.len())
        {
            SystemStatus::Critical
        } else if offline > 0 {
            SystemStatus::Degraded
        } else {
            SystemStatus::Healthy
        };

        SystemHealth {
            status,
            agents,
            dependencies,
            checked_at: now,
        }
    }

    /// Check the store and the shared filesystem root.
    pub async fn check_dependencies(&self) -> Vec<DependencyHealth> {
        let store = match self.store.ping().await {
            Ok(()) => DependencyHealth::up("store"),
            Err(e) => DependencyHealth::down("store", e.to_string()),
        };
        let root = &self.config.nas_root;
        let nas = if root.is_dir() {
            DependencyHealth::up("nas")
        } else {
            DependencyHealth::down("nas", format!("{} is not a directory", root.display()))
        };
        vec![store, nas]
    }

    pub async fn get_health(&self, active_by_agent: &HashMap<String, usize>) -> SystemHealth {
        let dependencies = self.check_dependencies().await;
        self.evaluate(active_by_agent, dependencies, Utc::now())
    }

    pub fn record_usage(&mut self, entry: UsageEntry) {
        self.ledger.record(entry);
    }

    /// Move every queued usage file into the ledger. Malformed files are
    /// left in place. Returns how many entries were recorded.
    pub fn collect_usage(&mut self) -> Result<usize> {
        let queue: DirectoryQueue<UsageEntry> =
            DirectoryQueue::new(&self.config.usage_dir, USAGE_PREFIX)?;
        let mut recorded = 0;
        for delivery in queue.scan()? {
            match delivery {
                Delivery::Malformed { path, error } => {
                    rlog_warn!("Malformed usage entry {}: {}", path.display(), error);
                }
                Delivery::Parsed { path, item } => {
                    self.record_usage(item);
                    queue.ack(&path)?;
                    recorded += 1;
                }
            }
        }
        Ok(recorded)
    }

    pub fn ledger(&self) -> &CostLedger {
        &self.ledger
    }

    pub fn cost_breakdown(&self, window: Option<Duration>) -> CostBreakdown {
        self.ledger.breakdown(window, Utc::now())
    }

    /// Pair `health` with the ledger's cost figures as of its check time.
    pub fn snapshot(&self, health: SystemHealth) -> HealthSnapshot {
        let at = health.checked_at;
        HealthSnapshot {
            costs: self.ledger.breakdown(None, at),
            costs_last_hour: self.ledger.breakdown(Some(RECENT_COST_WINDOW), at),
            health,
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("agents", &self.agents)
            .field("ledger_len", &self.ledger.len())
            .finish()
    }
}

/// What the watchdog publishes to `<nas>/health.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    #[serde(flatten)]
    pub health: SystemHealth,
    /// Over every entry still in the ledger.
    pub costs: CostBreakdown,
    pub costs_last_hour: CostBreakdown,
}

/// Write `snapshot` to `<nas>/health.json` for external dashboards.
pub fn write_snapshot(nas_root: &Path, snapshot: &HealthSnapshot) -> Result<PathBuf> {
    let path = nas_root.join(SNAPSHOT_FILE);
    write_atomic(&path, &serde_json::to_vec_pretty(snapshot)?)?;
    Ok(path)
}

/// The last snapshot the watchdog wrote, if any.
pub fn read_snapshot(nas_root: &Path) -> Result<Option<HealthSnapshot>> {
    match fs::read_to_string(nas_root.join(SNAPSHOT_FILE)) {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Spawn the heartbeat watchdog.
///
/// Every heartbeat interval it collects beacon files and usage entries, logs
/// stale agents and writes a health snapshot. Orchestrator events, when supplied, feed the
/// per-agent task counters as they arrive.
pub fn spawn_watchdog(
    monitor: SharedHealthMonitor,
    orchestrator: SharedOrchestrator,
    mut events: Option<mpsc::UnboundedReceiver<OrchestratorEvent>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = monitor.lock().await.config().heartbeat_interval;
        let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_status: Option<SystemStatus> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = next_event(&mut events) => {
                    monitor.lock().await.observe_event(&event);
                    continue;
                }
                _ = interval.tick() => {}
            }

            let active = orchestrator.lock().await.active_tasks_by_agent();
            let mut m = monitor.lock().await;
            if let Err(e) = m.collect_beacons().await {
                rlog_error!("Heartbeat beacon scan failed: {}", e);
            }
            if let Err(e) = m.collect_usage() {
                rlog_error!("Usage scan failed: {}", e);
            }
            m.check_stale(Utc::now());
            let health = m.get_health(&active).await;
            let root = m.config().nas_root.clone();
            let snapshot = m.snapshot(health.clone());
            drop(m);

            if last_status != Some(health.status) {
                match health.status {
                    SystemStatus::Healthy => rlog!("System health: {}", health.status),
                    _ => rlog_warn!(
                        "System health: {} ({} agent(s) offline)",
                        health.status,
                        health.offline_agents().count()
                    ),
                }
                last_status = Some(health.status);
            }
            if let Err(e) = write_snapshot(&root, &snapshot) {
                rlog_debug!("Health snapshot not written: {}", e);
            }
        }
        rlog!("Health watchdog stopped");
    })
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<OrchestratorEvent>>,
) -> Option<OrchestratorEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
