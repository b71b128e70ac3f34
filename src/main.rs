use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use agentrelay::config::Config;
use agentrelay::core::{Priority, TaskId};
use agentrelay::handoff::{
    DelegationRequest, DirectoryQueue, ReportKind, ResultStore, WorkerReport, DELEGATION_PREFIX,
    REPORT_PREFIX,
};
use agentrelay::orchestration::{
    self, read_snapshot, spawn_watchdog, AgentStats, HealthConfig, HealthMonitor,
    HeartbeatBeacon, InboxAnnouncer, InboxDispatcher, Orchestrator, UsageEntry, USAGE_PREFIX,
};
use agentrelay::{rlog, store, Error, Result};

/// agentrelay - dependency-aware task relay between cooperating agents
#[derive(Parser, Debug)]
#[command(name = "agentrelay")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    AGENTRELAY_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.agentrelay/agentrelay.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the orchestrator tick loop and health watchdog until interrupted
    Run {
        /// Run a single tick, wait for its callbacks, and exit
        #[arg(long)]
        once: bool,
    },

    /// Drop a delegation request into the shared delegation directory
    Delegate {
        /// Agent that should run the task
        #[arg(long)]
        to: String,

        /// Agent delegating the task; receives the announcement
        #[arg(long)]
        from: String,

        /// Short task title
        title: String,

        #[arg(long, default_value = "")]
        description: String,

        #[arg(long, default_value = "normal")]
        priority: Priority,

        /// Task id (generated when omitted)
        #[arg(long)]
        task_id: Option<String>,

        /// Task this delegation was spawned from
        #[arg(long)]
        parent: Option<String>,

        /// Nesting depth, used when the parent is unknown to the orchestrator
        #[arg(long, default_value_t = 0)]
        depth: u32,
    },

    /// Report task progress as a worker
    Report {
        task_id: String,

        #[arg(value_enum)]
        kind: ReportArg,

        /// Reporting agent
        #[arg(long)]
        agent: String,

        /// Result text for completed tasks, error text for failed ones
        #[arg(long)]
        output: Option<String>,
    },

    /// Write a heartbeat beacon for an agent
    Heartbeat {
        #[arg(long)]
        agent: String,

        /// Resident memory of the agent process in bytes
        #[arg(long)]
        memory_bytes: Option<u64>,
    },

    /// Report one model invocation for the cost ledger
    Usage {
        #[arg(long)]
        agent: String,

        #[arg(long)]
        model: String,

        #[arg(long, default_value_t = 0)]
        input_tokens: u64,

        #[arg(long, default_value_t = 0)]
        output_tokens: u64,

        /// Cost of the call in USD
        #[arg(long, default_value_t = 0.0)]
        cost: f64,
    },

    /// Print the last health snapshot, including cost breakdowns
    Status,

    /// Print the result record of a finished task
    #[command(name = "result")]
    ShowResult { task_id: String },

    /// Print the effective configuration
    Config,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportArg {
    Started,
    Completed,
    Failed,
}

impl From<ReportArg> for ReportKind {
    fn from(arg: ReportArg) -> Self {
        match arg {
            ReportArg::Started => ReportKind::Started,
            ReportArg::Completed => ReportKind::Completed,
            ReportArg::Failed => ReportKind::Failed,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    agentrelay::log::init_with_debug(cli.debug);

    let config = Config::load()?;
    match cli.command {
        Command::Run { once } => run_orchestrator(config, once),
        Command::Delegate {
            to,
            from,
            title,
            description,
            priority,
            task_id,
            parent,
            depth,
        } => {
            let task_id = task_id.map(TaskId::from).unwrap_or_else(TaskId::generate);
            let mut request = DelegationRequest::new(task_id.clone(), &from, &to, &title);
            request.description = description;
            request.priority = priority;
            request.parent_task_id = parent.map(TaskId::from);
            request.depth = depth;

            let queue: DirectoryQueue<DelegationRequest> =
                DirectoryQueue::new(config.orchestrator.delegations_dir(), DELEGATION_PREFIX)?;
            let path = queue.push(task_id.as_str(), &request)?;
            rlog!("Delegation {} written to {}", task_id, path.display());
            println!("{}", task_id);
            Ok(())
        }
        Command::Report {
            task_id,
            kind,
            agent,
            output,
        } => {
            let mut report = WorkerReport::new(task_id.as_str(), &agent, kind.into());
            report.output = output;
            let queue: DirectoryQueue<WorkerReport> =
                DirectoryQueue::new(config.orchestrator.reports_dir(), REPORT_PREFIX)?;
            let path = queue.push(&task_id, &report)?;
            rlog!("Report for {} written to {}", task_id, path.display());
            Ok(())
        }
        Command::Heartbeat {
            agent,
            memory_bytes,
        } => {
            let stats = AgentStats {
                memory_bytes,
                ..Default::default()
            };
            HeartbeatBeacon::now(&agent, stats).write(&config.orchestrator.heartbeats_dir())?;
            Ok(())
        }
        Command::Usage {
            agent,
            model,
            input_tokens,
            output_tokens,
            cost,
        } => {
            let entry = UsageEntry::new(&agent, &model, input_tokens, output_tokens, cost);
            let queue: DirectoryQueue<UsageEntry> =
                DirectoryQueue::new(config.orchestrator.usage_dir(), USAGE_PREFIX)?;
            let path = queue.push(&agent, &entry)?;
            rlog!("Usage for {} written to {}", agent, path.display());
            Ok(())
        }
        Command::Status => {
            let root = config.orchestrator.nas_root();
            match read_snapshot(&root)? {
                Some(snapshot) => {
                    println!("{}", serde_json::to_string_pretty(&snapshot)?);
                    Ok(())
                }
                None => Err(Error::Validation(format!(
                    "no health snapshot under {}; is the orchestrator running?",
                    root.display()
                ))),
            }
        }
        Command::ShowResult { task_id } => {
            let store = ResultStore::new(config.orchestrator.results_dir());
            let task_id = TaskId::from(task_id);
            match store.read(&task_id)? {
                Some(record) => {
                    println!("{}", serde_json::to_string_pretty(&record)?);
                    Ok(())
                }
                None => Err(Error::TaskNotFound(task_id.to_string())),
            }
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn run_orchestrator(config: Config, once: bool) -> Result<()> {
    config.ensure_dirs()?;
    let inbox = config.orchestrator.inbox_dir();
    rlog!(
        "agentrelay starting: nas={} per_agent={} total={} max_depth={}",
        config.orchestrator.nas_root().display(),
        config.orchestrator.max_concurrent_per_agent,
        config.orchestrator.max_total_concurrent,
        config.orchestrator.max_depth
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let mut orchestrator = Orchestrator::new(
            config.orchestrator.clone(),
            Arc::new(InboxDispatcher::new(&inbox)),
            Arc::new(InboxAnnouncer::new(&inbox)),
        )?;

        if once {
            let mut report = orchestrator.tick();
            let settled = orchestrator.settle().await;
            report.dispatch_reverted += settled.dispatch_reverted;
            println!("{:#?}", report);
            return Ok(());
        }

        let events = orchestrator.subscribe();
        let orchestrator = Arc::new(Mutex::new(orchestrator));
        let monitor = Arc::new(Mutex::new(HealthMonitor::new(
            HealthConfig::from(&config),
            store::open(&config.store)?,
        )));

        let cancel = CancellationToken::new();
        let watchdog = spawn_watchdog(
            Arc::clone(&monitor),
            Arc::clone(&orchestrator),
            Some(events),
            cancel.child_token(),
        );
        let ticker = tokio::spawn(orchestration::run(
            Arc::clone(&orchestrator),
            cancel.child_token(),
        ));

        tokio::signal::ctrl_c().await?;
        rlog!("Interrupt received, shutting down");
        cancel.cancel();

        match tokio::time::timeout(Duration::from_secs(30), ticker).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => rlog!("Tick loop ended abnormally: {}", e),
            Err(_) => rlog!("Tick loop did not stop within 30s"),
        }
        let _ = watchdog.await;
        Ok::<(), Error>(())
    })
}
