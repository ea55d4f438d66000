use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use issue_dispatch::config::{Config, ProvisionerKind};
use issue_dispatch::dashboard::run_dashboard;
use issue_dispatch::discovery::{GhCliSource, IssueSource, TaskDiscoverer};
use issue_dispatch::orchestrator::{Orchestrator, OrchestratorSettings};
use issue_dispatch::platform::{Detector, Manifests, TaskMetadata};
use issue_dispatch::scheduler::{FileStore, TaskState, WorkQueue};
use issue_dispatch::shutdown::install_shutdown_handler;
use issue_dispatch::status::StatusAggregator;
use issue_dispatch::worker::{DockerProvisioner, ProcessProvisioner, Provisioner, WorkerManager};

#[derive(Parser, Debug)]
#[command(name = "issue-dispatch")]
#[command(version)]
#[command(about = "Dispatches labeled issues to isolated single-task workers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the orchestration loop
    Run(RunArgs),

    /// Show queue contents from a data directory
    Status(StatusArgs),

    /// Print the requirements inferred for a checkout
    Detect(DetectArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct RunArgs {
    /// TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Repository to watch (owner/repo)
    #[arg(long)]
    repo: Option<String>,

    /// Label that marks an issue for the bot
    #[arg(long)]
    label: Option<String>,

    /// Directory holding the queue and worker directories
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Checkout whose manifests drive requirement inference
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Maximum concurrent workers
    #[arg(long)]
    max_workers: Option<usize>,

    /// Port for the status dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Run one discovery and one dispatch cycle, then exit
    #[arg(long)]
    once: bool,

    #[command(flatten)]
    log: LogArgs,
}

#[derive(Parser, Debug)]
struct StatusArgs {
    /// TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Directory holding the queue
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Only show tasks in this state
    #[arg(long)]
    state: Option<TaskState>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Parser, Debug)]
struct DetectArgs {
    /// Directory to scan for manifests
    dir: PathBuf,

    /// Issue text to scan for keywords
    #[arg(long, default_value = "")]
    text: String,

    /// TOML configuration file (catalog and default profile)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Parser, Debug)]
struct LogArgs {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long)]
    debug: bool,

    /// Log line format
    #[arg(long, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging(args: &LogArgs) {
    let default_level = if args.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    })
}

fn build_provisioner(config: &Config) -> Arc<dyn Provisioner> {
    let workers_root = config.workers_dir();
    match config.workers.provisioner {
        ProvisionerKind::Docker => Arc::new(
            DockerProvisioner::new(
                config.sandbox.clone(),
                config.workers.command.clone(),
                workers_root,
            )
            .with_command_timeout(std::time::Duration::from_secs(
                config.source.command_timeout_secs,
            )),
        ),
        ProvisionerKind::Process => Arc::new(ProcessProvisioner::new(
            config.workers.command.clone(),
            workers_root,
        )),
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&args.log);

    let mut config = load_config(args.config.as_ref())?;
    if let Some(repo) = args.repo {
        config.source.repo = Some(repo);
    }
    if let Some(label) = args.label {
        config.source.trigger_label = label;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(workspace) = args.workspace {
        config.source.workspace_dir = Some(workspace);
    }
    if let Some(max_workers) = args.max_workers {
        config.workers.max_concurrent = max_workers;
    }
    if args.dashboard_port.is_some() {
        config.dashboard_port = args.dashboard_port;
    }
    config.validate()?;
    let repo = config.repo()?.to_string();

    tracing::info!(
        bot_id = %config.bot_id,
        repo = %repo,
        label = %config.source.trigger_label,
        data_dir = %config.data_dir.display(),
        max_workers = config.workers.max_concurrent,
        provisioner = ?config.workers.provisioner,
        "Starting issue-dispatch"
    );

    let store = FileStore::open(config.queue_dir())?;
    let queue = Arc::new(
        WorkQueue::open(Arc::new(store), config.queue.retry_policy())
            .await?
            .with_max_tasks(config.queue.max_tasks),
    );

    let source: Arc<dyn IssueSource> = Arc::new(
        GhCliSource::new(repo, config.source.trigger_label.clone()).with_command_timeout(
            std::time::Duration::from_secs(config.source.command_timeout_secs),
        ),
    );
    let detector = Detector::new(config.platforms.clone(), config.default_profile.clone());
    let discoverer = Arc::new(
        TaskDiscoverer::new(source.clone(), queue.clone(), detector)
            .with_workspace(config.source.workspace_dir.clone())
            .with_retry(&config.retry),
    );
    let workers = Arc::new(WorkerManager::new(build_provisioner(&config), &config.workers));
    // Workers from a previous run would otherwise keep going while the
    // reaper hands their tasks to new ones.
    if let Err(e) = workers.sweep_orphans().await {
        tracing::warn!(error = %e, "Could not sweep workers from a previous run");
    }

    let orchestrator = Arc::new(
        Orchestrator::new(
            queue.clone(),
            workers.clone(),
            discoverer,
            source,
            OrchestratorSettings::from(&config),
        )
        .with_templates(config.templates.clone())
        .with_catalog(config.platforms.clone()),
    );

    let shutdown = install_shutdown_handler()?;

    if let Some(port) = config.dashboard_port {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        let status = StatusAggregator::new(queue.clone(), workers.clone());
        tokio::spawn(run_dashboard(addr, status, shutdown.clone()));
    }

    if args.once {
        let report = tokio::select! {
            report = orchestrator.run_once() => report?,
            _ = shutdown.cancelled() => {
                orchestrator.drain().await;
                return Ok(());
            }
        };
        tracing::info!(
            spawned = report.spawned,
            completed = report.completed,
            requeued = report.requeued,
            failed = report.failed,
            "Single cycle finished"
        );
        shutdown.cancel();
        return Ok(());
    }

    orchestrator.run(shutdown).await?;
    Ok(())
}

async fn status(args: StatusArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(args.config.as_ref())?;
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    let store = FileStore::open_read_only(config.queue_dir())?;
    let queue = Arc::new(WorkQueue::open(Arc::new(store), config.queue.retry_policy()).await?);
    let aggregator = StatusAggregator::queue_only(queue);

    match args.output {
        OutputFormat::Json => {
            let mut snapshot = aggregator.snapshot().await;
            if args.state.is_some() {
                snapshot.tasks = aggregator.tasks(args.state).await;
            }
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        OutputFormat::Table => {
            let snapshot = aggregator.snapshot().await;
            let counts = snapshot.queue;
            println!("Queue Status");
            println!("{}", "=".repeat(40));
            println!("Pending:   {}", counts.pending);
            println!("Assigned:  {}", counts.assigned);
            println!("Completed: {}", counts.completed);
            println!("Failed:    {}", counts.failed);
            println!();

            let tasks = aggregator.tasks(args.state).await;
            if tasks.is_empty() {
                println!("No tasks found.");
                return Ok(());
            }
            println!(
                "{:<28} {:<10} {:<8} {:<7} REQUIREMENTS",
                "SOURCE", "STATE", "PRIORITY", "RETRIES"
            );
            println!("{}", "-".repeat(78));
            for task in &tasks {
                println!(
                    "{:<28} {:<10} {:<8} {:<7} {}",
                    task.source_id, task.state, task.priority, task.retry_count, task.requirements
                );
                if let Some(error) = &task.last_error {
                    println!("  last error: {}", error);
                }
            }
        }
    }
    Ok(())
}

async fn detect(args: DetectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_ref())?;
    let manifests = Manifests::read_from(&args.dir).await;
    let detector = Detector::new(config.platforms, config.default_profile);
    let inference = detector.analyze(&TaskMetadata {
        manifests: &manifests,
        issue_text: &args.text,
    });

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&inference)?),
        OutputFormat::Table => {
            println!("Requirements: {}", inference.requirements);
            if inference.used_default {
                println!("(no signals found; default profile applied)");
            }
            for signal in &inference.signals {
                println!("  {:<10} {:<16} from {}", signal.capability, signal.range, signal.source);
            }
            for conflict in &inference.conflicts {
                println!(
                    "  conflict: {} ({}) ignored in favour of {} ({})",
                    conflict.ignored.range,
                    conflict.ignored.source,
                    conflict.chosen.range,
                    conflict.chosen.source
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => run(run_args).await?,
        Commands::Status(status_args) => status(status_args).await?,
        Commands::Detect(detect_args) => detect(detect_args).await?,
    }

    Ok(())
}
