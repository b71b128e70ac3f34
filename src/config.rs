use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::{rlog_debug, Error, Result};

/// Top-level configuration, read from `~/.agentrelay/agentrelay.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub store: StoreSettings,
}

/// Scheduling and hand-off settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Shared-filesystem root holding the delegation, result, report and inbox directories.
    pub nas_path: String,
    pub max_concurrent_per_agent: usize,
    pub max_total_concurrent: usize,
    /// Deepest delegation chain accepted by pickup; deeper requests are rejected.
    pub max_depth: u32,
    pub tick_interval_secs: u64,
    /// Node count above which terminal nodes are pruned.
    pub prune_threshold: usize,
    /// Agent that receives tasks without a preferred agent.
    pub default_agent: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            nas_path: "~/.agentrelay/shared".to_string(),
            max_concurrent_per_agent: 2,
            max_total_concurrent: 8,
            max_depth: 3,
            tick_interval_secs: 5,
            prune_threshold: 500,
            default_agent: "main".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Shared-filesystem root with `~/` expanded.
    pub fn nas_root(&self) -> PathBuf {
        expand_tilde(&self.nas_path)
    }

    pub fn delegations_dir(&self) -> PathBuf {
        self.nas_root().join("delegations")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.nas_root().join("results")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.nas_root().join("reports")
    }

    pub fn inbox_dir(&self) -> PathBuf {
        self.nas_root().join("inbox")
    }

    /// Where agents drop usage entries for the cost ledger.
    pub fn usage_dir(&self) -> PathBuf {
        self.nas_root().join("usage")
    }

    /// Where worker processes drop `<agent>.json` heartbeat beacons.
    pub fn heartbeats_dir(&self) -> PathBuf {
        self.nas_root().join("heartbeats")
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs.max(1))
    }

    /// Build a config rooted at an explicit directory, other fields default.
    pub fn with_nas_path(path: impl Into<PathBuf>) -> Self {
        Self {
            nas_path: path.into().to_string_lossy().into_owned(),
            ..Default::default()
        }
    }
}

/// Heartbeat and usage-ledger settings for the health monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub heartbeat_interval_secs: u64,
    pub heartbeat_timeout_secs: u64,
    pub ledger_capacity: usize,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            ledger_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Sqlite,
    /// Process-local; nothing survives a restart.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// TTL applied to agent records written by the health monitor.
    pub agent_ttl_secs: u64,
    pub backend: StoreBackend,
    /// SQLite database file shared by every process on the host.
    pub path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            agent_ttl_secs: 300,
            backend: StoreBackend::Sqlite,
            path: "~/.agentrelay/state.db".to_string(),
        }
    }
}

impl StoreSettings {
    pub fn db_path(&self) -> PathBuf {
        expand_tilde(&self.path)
    }
}

impl Config {
    pub fn relay_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".agentrelay"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::relay_dir()?.join("agentrelay.toml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        rlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            rlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        config.validate()?;
        rlog_debug!(
            "Config loaded: nas_path={}, per_agent={}, total={}, max_depth={}",
            config.orchestrator.nas_path,
            config.orchestrator.max_concurrent_per_agent,
            config.orchestrator.max_total_concurrent,
            config.orchestrator.max_depth
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::relay_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        rlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Reject limits that would stall dispatch forever.
    pub fn validate(&self) -> Result<()> {
        let o = &self.orchestrator;
        if o.max_concurrent_per_agent == 0 || o.max_total_concurrent == 0 {
            return Err(Error::Validation(
                "concurrency limits must be at least 1".to_string(),
            ));
        }
        if self.health.heartbeat_timeout_secs < self.health.heartbeat_interval_secs {
            return Err(Error::Validation(format!(
                "heartbeat_timeout_secs ({}) is shorter than heartbeat_interval_secs ({})",
                self.health.heartbeat_timeout_secs, self.health.heartbeat_interval_secs
            )));
        }
        Ok(())
    }

    /// Create every shared directory the orchestrator reads or writes.
    pub fn ensure_dirs(&self) -> Result<()> {
        let o = &self.orchestrator;
        for dir in [
            o.delegations_dir(),
            o.results_dir(),
            o.reports_dir(),
            o.inbox_dir(),
            o.heartbeats_dir(),
            o.usage_dir(),
        ] {
            if !dir.exists() {
                rlog_debug!("Creating shared directory: {}", dir.display());
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
