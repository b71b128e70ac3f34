//! Dependency-aware orchestrator.
//!
//! The `Orchestrator` owns the task graph, picks up delegation requests and
//! worker reports from the shared filesystem, dispatches ready tasks under
//! per-agent and global concurrency caps, and on every terminal transition
//! cascades readiness, announces the outcome and publishes a result record.
//!
//! All mutation goes through `&mut self`. Hosts that need to reach the
//! orchestrator from several places share it as a [`SharedOrchestrator`];
//! [`run`] drives the periodic tick through that handle.

use crate::config::OrchestratorConfig;
use crate::core::{GraphState, TaskGraph, TaskId, TaskNode, TaskStatus};
use crate::error::Result;
use crate::handoff::{
    DelegationRequest, Delivery, DirectoryQueue, ReportKind, ResultRecord, ResultStore,
    WorkerReport, DELEGATION_PREFIX, REPORT_PREFIX,
};
use crate::orchestration::dispatch::{Announcer, Dispatcher};
use crate::{rlog, rlog_debug, rlog_error, rlog_warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{Id as JoinId, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Orchestrator shared between the tick loop and whoever reports task progress.
pub type SharedOrchestrator = Arc<Mutex<Orchestrator>>;

/// Lifecycle events for observers such as the health monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    TaskAdded {
        task_id: TaskId,
        status: TaskStatus,
    },
    TaskDispatched {
        task_id: TaskId,
        agent_id: String,
    },
    DispatchFailed {
        task_id: TaskId,
        agent_id: String,
        error: String,
    },
    TaskStarted {
        task_id: TaskId,
        agent_id: String,
    },
    TaskCompleted {
        task_id: TaskId,
        agent_id: Option<String>,
    },
    TaskFailed {
        task_id: TaskId,
        agent_id: Option<String>,
        error: String,
    },
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub delegations_picked_up: usize,
    pub delegations_duplicate: usize,
    pub delegations_rejected: usize,
    pub malformed_files: usize,
    pub reports_applied: usize,
    pub dispatch_reverted: usize,
    /// `(task, agent)` pairs assigned this tick, in dispatch order.
    pub dispatched: Vec<(TaskId, String)>,
    /// Dispatch skipped because the global cap was already reached.
    pub at_global_cap: bool,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == TickReport::default()
    }
}

enum CallbackOutcome {
    Dispatched {
        task_id: TaskId,
        agent_id: String,
        result: Result<()>,
    },
    Announced {
        task_id: TaskId,
        agent_id: String,
        result: Result<()>,
    },
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    graph: TaskGraph,
    dispatcher: Arc<dyn Dispatcher>,
    announcer: Arc<dyn Announcer>,
    delegations: DirectoryQueue<DelegationRequest>,
    reports: DirectoryQueue<WorkerReport>,
    results: ResultStore,
    /// Dispatch and announce calls still running.
    in_flight: JoinSet<CallbackOutcome>,
    /// Which task each in-flight dispatch belongs to, so a panicking
    /// dispatcher still reverts its task.
    dispatch_ids: HashMap<JoinId, TaskId>,
    event_tx: Option<mpsc::UnboundedSender<OrchestratorEvent>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        dispatcher: Arc<dyn Dispatcher>,
        announcer: Arc<dyn Announcer>,
    ) -> Result<Self> {
        let delegations = DirectoryQueue::new(config.delegations_dir(), DELEGATION_PREFIX)?;
        let reports = DirectoryQueue::new(config.reports_dir(), REPORT_PREFIX)?;
        let results = ResultStore::new(config.results_dir());
        Ok(Self {
            config,
            graph: TaskGraph::new(),
            dispatcher,
            announcer,
            delegations,
            reports,
            results,
            in_flight: JoinSet::new(),
            dispatch_ids: HashMap::new(),
            event_tx: None,
        })
    }

    /// Subscribe to lifecycle events. Replaces any earlier subscriber.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<OrchestratorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_tx = Some(tx);
        rx
    }

    fn emit(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn delegations(&self) -> &DirectoryQueue<DelegationRequest> {
        &self.delegations
    }

    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    /// Number of dispatch/announce calls not yet collected.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    // ========== Graph Operations ==========

    /// Insert a task; it is ready at once if its dependencies are all completed.
    pub fn add_task(&mut self, node: TaskNode) -> Result<TaskStatus> {
        let id = node.task_id.clone();
        let deps: Vec<&str> = node.dependencies.iter().map(|d| d.as_str()).collect();
        rlog!(
            "Adding task {} '{}' priority={} deps=[{}]",
            id,
            node.title,
            node.priority,
            deps.join(", ")
        );
        let status = self.graph.insert(node)?;
        self.emit(OrchestratorEvent::TaskAdded {
            task_id: id,
            status,
        });
        Ok(status)
    }

    /// Record success and cascade readiness to dependents.
    ///
    /// Unknown or already-finished tasks are ignored with a warning, since
    /// duplicate and stale completion signals are expected. Returns whether
    /// the completion was applied.
    pub fn complete_task(&mut self, task_id: &TaskId, result: &str) -> bool {
        let Some(node) = self.live_node_mut(task_id, "complete") else {
            return false;
        };
        node.complete(result);
        let agent_id = node.assigned_agent.clone();
        rlog!("Task {} completed", task_id);

        let promoted = self.graph.promote_dependents(task_id);
        for id in &promoted {
            rlog!("Task {} ready (dependency {} completed)", id, task_id);
        }

        self.emit(OrchestratorEvent::TaskCompleted {
            task_id: task_id.clone(),
            agent_id,
        });
        self.finish(task_id);
        true
    }

    /// Record failure. Dependents stay pending: a failed dependency blocks
    /// them permanently.
    pub fn fail_task(&mut self, task_id: &TaskId, error: &str) -> bool {
        let Some(node) = self.live_node_mut(task_id, "fail") else {
            return false;
        };
        node.fail(error);
        let agent_id = node.assigned_agent.clone();
        let blocked = node.dependents.len();
        rlog_warn!(
            "Task {} failed: {} ({} dependent(s) blocked)",
            task_id,
            error,
            blocked
        );

        self.emit(OrchestratorEvent::TaskFailed {
            task_id: task_id.clone(),
            agent_id,
            error: error.to_string(),
        });
        self.finish(task_id);
        true
    }

    /// Mark a task as picked up by `agent_id`. The caller is trusted.
    pub fn start_task(&mut self, task_id: &TaskId, agent_id: &str) -> bool {
        let Some(node) = self.graph.get_mut(task_id) else {
            rlog_warn!("start for unknown task {} from {}", task_id, agent_id);
            return false;
        };
        if matches!(node.status, TaskStatus::Pending) || node.status.is_terminal() {
            rlog_warn!(
                "start for task {} ignored: status is {}",
                task_id,
                node.status
            );
            return false;
        }
        node.start(agent_id);
        rlog!("Task {} in progress on {}", task_id, agent_id);
        self.emit(OrchestratorEvent::TaskStarted {
            task_id: task_id.clone(),
            agent_id: agent_id.to_string(),
        });
        true
    }

    fn live_node_mut(&mut self, task_id: &TaskId, op: &str) -> Option<&mut TaskNode> {
        match self.graph.get_mut(task_id) {
            None => {
                rlog_warn!("{} for unknown task {} ignored", op, task_id);
                None
            }
            Some(node) if node.is_finished() => {
                rlog_warn!(
                    "{} for task {} ignored: already {}",
                    op,
                    task_id,
                    node.status
                );
                None
            }
            Some(node) => Some(node),
        }
    }

    /// Shared tail of every terminal transition: announce, persist, prune.
    fn finish(&mut self, task_id: &TaskId) {
        let Some(node) = self.graph.get(task_id) else {
            return;
        };

        if let Some(source) = node.source_agent.clone() {
            let success = node.status == TaskStatus::Completed;
            let output = if success {
                node.result.clone()
            } else {
                node.error.clone()
            }
            .unwrap_or_default();
            let announcer = Arc::clone(&self.announcer);
            let task_id = task_id.clone();
            self.in_flight.spawn(async move {
                let result = announcer.announce(&source, &task_id, &output, success).await;
                CallbackOutcome::Announced {
                    task_id,
                    agent_id: source,
                    result,
                }
            });
        }

        match ResultRecord::from_node(node).and_then(|record| self.results.write(&record)) {
            Ok(path) => rlog_debug!("Result for {} written to {}", task_id, path.display()),
            Err(e) => rlog_error!("Failed to write result for {}: {}", task_id, e),
        }

        if self.graph.len() > self.config.prune_threshold {
            let pruned = self.graph.prune_terminal();
            if !pruned.is_empty() {
                rlog!(
                    "Pruned {} terminal task(s), {} remain",
                    pruned.len(),
                    self.graph.len()
                );
            }
        }
    }

    // ========== Queries ==========

    pub fn get_task(&self, task_id: &TaskId) -> Option<&TaskNode> {
        self.graph.get(task_id)
    }

    /// Ready tasks in dispatch order.
    pub fn get_ready_tasks(&self) -> Vec<&TaskNode> {
        self.graph.ready_by_priority()
    }

    pub fn get_agent_tasks(&self, agent_id: &str) -> Vec<&TaskNode> {
        self.graph.agent_tasks(agent_id)
    }

    pub fn get_graph_state(&self) -> GraphState {
        self.graph.state()
    }

    /// Active task counts per agent, as fed to the health monitor.
    pub fn active_tasks_by_agent(&self) -> HashMap<String, usize> {
        self.graph.active_by_agent()
    }

    // ========== Tick ==========

    /// One scheduling pass: collect finished callbacks, apply worker reports,
    /// pick up delegations, dispatch.
    ///
    /// Must be called inside a Tokio runtime; dispatch and announce calls are
    /// spawned, not awaited.
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        self.reap_callbacks(&mut report);
        self.apply_reports(&mut report);
        self.poll_delegations(&mut report);
        self.dispatch_ready(&mut report);
        report
    }

    fn poll_delegations(&mut self, report: &mut TickReport) {
        let deliveries = match self.delegations.scan() {
            Ok(d) => d,
            Err(e) => {
                rlog_error!(
                    "Cannot scan delegation directory {}: {}",
                    self.delegations.dir().display(),
                    e
                );
                return;
            }
        };

        for delivery in deliveries {
            match delivery {
                Delivery::Malformed { path, error } => {
                    // Left in place: redelivered next tick until an operator clears it.
                    rlog_warn!("Malformed delegation {}: {}", path.display(), error);
                    report.malformed_files += 1;
                }
                Delivery::Parsed { path, item } => {
                    if self.is_known(&item.task_id) {
                        rlog_debug!(
                            "Delegation {} already known, dropping {}",
                            item.task_id,
                            path.display()
                        );
                        report.delegations_duplicate += 1;
                    } else if self.accept_delegation(item) {
                        report.delegations_picked_up += 1;
                    } else {
                        report.delegations_rejected += 1;
                    }
                    if let Err(e) = self.delegations.ack(&path) {
                        rlog_error!("Cannot remove delegation {}: {}", path.display(), e);
                    }
                }
            }
        }
    }

    /// Ids in the graph, or finished and pruned but still on record.
    fn is_known(&self, task_id: &TaskId) -> bool {
        self.graph.contains(task_id) || self.results.contains(task_id)
    }

    /// Insert a delegation as a ready node. Requests nested deeper than
    /// `max_depth` are inserted and failed at once so the requester hears back.
    fn accept_delegation(&mut self, request: DelegationRequest) -> bool {
        let depth = request
            .parent_task_id
            .as_ref()
            .and_then(|p| self.graph.get(p))
            .map(|parent| parent.depth + 1)
            .unwrap_or(request.depth);
        let task_id = request.task_id.clone();
        let source = request.source_agent.clone();
        let target = request.target_agent.clone();

        if let Err(e) = self.add_task(request.into_node(depth)) {
            rlog_warn!("Delegation {} not inserted: {}", task_id, e);
            return false;
        }
        rlog!(
            "Picked up delegation {} from {} for {} (depth {})",
            task_id,
            source,
            target,
            depth
        );

        if depth > self.config.max_depth {
            self.fail_task(
                &task_id,
                &format!(
                    "delegation depth {} exceeds max_depth {}",
                    depth, self.config.max_depth
                ),
            );
            return false;
        }
        true
    }

    fn apply_reports(&mut self, report: &mut TickReport) {
        let deliveries = match self.reports.scan() {
            Ok(d) => d,
            Err(e) => {
                rlog_error!("Cannot scan report directory: {}", e);
                return;
            }
        };

        for delivery in deliveries {
            match delivery {
                Delivery::Malformed { path, error } => {
                    rlog_warn!("Malformed report {}: {}", path.display(), error);
                    report.malformed_files += 1;
                }
                Delivery::Parsed { path, item } => {
                    let output = item.output.as_deref().unwrap_or_default();
                    match item.kind {
                        ReportKind::Started => {
                            self.start_task(&item.task_id, &item.agent_id);
                        }
                        ReportKind::Completed => {
                            self.complete_task(&item.task_id, output);
                        }
                        ReportKind::Failed => {
                            self.fail_task(&item.task_id, output);
                        }
                    }
                    report.reports_applied += 1;
                    if let Err(e) = self.reports.ack(&path) {
                        rlog_error!("Cannot remove report {}: {}", path.display(), e);
                    }
                }
            }
        }
    }

    fn dispatch_ready(&mut self, report: &mut TickReport) {
        let max_total = self.config.max_total_concurrent;
        let max_per_agent = self.config.max_concurrent_per_agent;

        let mut active = self.graph.active_count();
        if active >= max_total {
            if !self.graph.ready_by_priority().is_empty() {
                rlog_debug!("Global cap reached ({}/{}), dispatch skipped", active, max_total);
            }
            report.at_global_cap = true;
            return;
        }

        let mut per_agent = self.graph.active_by_agent();
        let candidates: Vec<(TaskId, String)> = self
            .graph
            .ready_by_priority()
            .into_iter()
            .map(|n| {
                (
                    n.task_id.clone(),
                    n.dispatch_target(&self.config.default_agent).to_string(),
                )
            })
            .collect();

        for (task_id, agent_id) in candidates {
            if active >= max_total {
                break;
            }
            let held = per_agent.get(&agent_id).copied().unwrap_or(0);
            if held >= max_per_agent {
                rlog_debug!("Agent {} at cap ({}), {} stays ready", agent_id, held, task_id);
                continue;
            }
            let Some(node) = self.graph.get_mut(&task_id) else {
                continue;
            };
            node.assign(&agent_id);
            let snapshot = node.clone();
            active += 1;
            *per_agent.entry(agent_id.clone()).or_insert(0) += 1;

            rlog!("Dispatching {} to {}", task_id, agent_id);
            let dispatcher = Arc::clone(&self.dispatcher);
            let (tid, aid) = (task_id.clone(), agent_id.clone());
            let handle = self.in_flight.spawn(async move {
                let result = dispatcher.dispatch(&aid, &snapshot).await;
                CallbackOutcome::Dispatched {
                    task_id: tid,
                    agent_id: aid,
                    result,
                }
            });
            self.dispatch_ids.insert(handle.id(), task_id.clone());
            self.emit(OrchestratorEvent::TaskDispatched {
                task_id: task_id.clone(),
                agent_id: agent_id.clone(),
            });
            report.dispatched.push((task_id, agent_id));
        }
    }

    // ========== Callback Outcomes ==========

    fn reap_callbacks(&mut self, report: &mut TickReport) {
        while let Some(joined) = self.in_flight.try_join_next_with_id() {
            self.apply_joined(joined, report);
        }
    }

    /// Wait for every in-flight dispatch and announce call and apply the
    /// outcomes. Used before shutdown and by tests that need a quiescent state.
    pub async fn settle(&mut self) -> TickReport {
        let mut report = TickReport::default();
        while let Some(joined) = self.in_flight.join_next_with_id().await {
            self.apply_joined(joined, &mut report);
        }
        report
    }

    fn apply_joined(
        &mut self,
        joined: std::result::Result<(JoinId, CallbackOutcome), tokio::task::JoinError>,
        report: &mut TickReport,
    ) {
        match joined {
            Ok((id, outcome)) => {
                self.dispatch_ids.remove(&id);
                match outcome {
                    CallbackOutcome::Dispatched {
                        task_id,
                        agent_id,
                        result: Err(e),
                    } => {
                        if self.revert_dispatch(&task_id, &agent_id, &e.to_string()) {
                            report.dispatch_reverted += 1;
                        }
                    }
                    CallbackOutcome::Dispatched { task_id, agent_id, .. } => {
                        rlog_debug!("Dispatch of {} to {} acknowledged", task_id, agent_id);
                    }
                    CallbackOutcome::Announced {
                        task_id,
                        agent_id,
                        result: Err(e),
                    } => {
                        rlog_warn!("Announce of {} to {} failed: {}", task_id, agent_id, e);
                    }
                    CallbackOutcome::Announced { .. } => {}
                }
            }
            Err(join_err) => {
                let id = join_err.id();
                match self.dispatch_ids.remove(&id) {
                    Some(task_id) => {
                        let agent_id = self
                            .graph
                            .get(&task_id)
                            .and_then(|n| n.assigned_agent.clone())
                            .unwrap_or_default();
                        if self.revert_dispatch(&task_id, &agent_id, &join_err.to_string()) {
                            report.dispatch_reverted += 1;
                        }
                    }
                    None => rlog_warn!("Announce call aborted: {}", join_err),
                }
            }
        }
    }

    /// Put an assigned task back to ready. Tasks the worker already moved on
    /// are left alone.
    fn revert_dispatch(&mut self, task_id: &TaskId, agent_id: &str, error: &str) -> bool {
        let Some(node) = self.graph.get_mut(task_id) else {
            return false;
        };
        if node.status != TaskStatus::Assigned || node.assigned_agent.as_deref() != Some(agent_id) {
            return false;
        }
        node.revert_assignment();
        rlog_warn!(
            "Dispatch of {} to {} failed, back to ready: {}",
            task_id,
            agent_id,
            error
        );
        self.emit(OrchestratorEvent::DispatchFailed {
            task_id: task_id.clone(),
            agent_id: agent_id.to_string(),
            error: error.to_string(),
        });
        true
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("graph", &self.graph)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

/// Drive `orchestrator` until `cancel` fires.
///
/// Ticks on the configured interval, and early whenever a delegation file
/// lands (if the directory can be watched). On cancellation, in-flight
/// callbacks are awaited before returning.
pub async fn run(orchestrator: SharedOrchestrator, cancel: CancellationToken) -> Result<()> {
    let (wake_tx, mut wake_rx) = mpsc::channel::<()>(1);
    let (period, _watcher) = {
        let o = orchestrator.lock().await;
        let watcher = match o.delegations().watch(wake_tx) {
            Ok(w) => Some(w),
            Err(e) => {
                rlog_warn!("Delegation watch unavailable, polling only: {}", e);
                None
            }
        };
        (o.config().tick_interval(), watcher)
    };

    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    rlog!("Orchestrator running, tick every {:?}", period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
            Some(()) = wake_rx.recv() => {}
        }
        let report = orchestrator.lock().await.tick();
        if !report.is_idle() {
            rlog_debug!("Tick: {:?}", report);
        }
    }

    let mut o = orchestrator.lock().await;
    let pending = o.in_flight();
    if pending > 0 {
        rlog!("Waiting for {} in-flight call(s)", pending);
    }
    o.settle().await;
    rlog!("Orchestrator stopped");
    Ok(())
}
