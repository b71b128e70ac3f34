//! Orchestration layer: the dependency-aware orchestrator, the seams through
//! which it reaches workers, and the health monitor.

pub mod dispatch;
pub mod health;
pub mod orchestrator;

pub use dispatch::{Announcement, Announcer, Dispatcher, InboxAnnouncer, InboxDispatcher};
pub use health::{
    read_snapshot, spawn_watchdog, write_snapshot, AgentHealth, AgentLiveness, AgentStats,
    AgentVitals, CostBreakdown, CostLedger, CostTotals, DependencyHealth, HealthConfig,
    HealthMonitor, HealthSnapshot, HeartbeatBeacon, SharedHealthMonitor, SystemHealth,
    SystemStatus, UsageEntry, USAGE_PREFIX,
};
pub use orchestrator::{run, Orchestrator, OrchestratorEvent, SharedOrchestrator, TickReport};
