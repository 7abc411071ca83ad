//! scanward - durable orchestration of long-running nmap scans.
//!
//! Usage:
//!   scanward serve                   Run the orchestrator and HTTP API
//!   scanward scan <target> [args..]  Run one scan and print the result
//!   scanward validate <target> [..]  Check a target and arguments
//!   scanward list                    List scans in the SQLite store
//!   scanward status <id>             Show one scan's status
//!   scanward result <id>             Print a completed scan's result

use clap::{Parser, Subcommand};
use scanward::api::{self, RunScanResponse, ScanStatusResponse, ScanSummaryResponse};
use scanward::{
    Config, Dispatcher, Event, EventBus, EventHandler, InMemoryStorage, Orchestrator, Registry,
    ScanRunner, Storage, StorageConfig, TaskId, Validator,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// scanward - durable orchestration of long-running nmap scans
#[derive(Parser)]
#[command(name = "scanward")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (default: ./scanward.yaml if present)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// SQLite database file; overrides the configured storage
    #[arg(long, global = true, value_name = "PATH")]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator and the HTTP API
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,

        /// Port to bind to
        #[arg(short, long)]
        port: Option<u16>,

        /// Maximum concurrent scans
        #[arg(short = 'w', long)]
        max_workers: Option<usize>,
    },

    /// Run one scan, wait for it and print the result as JSON
    Scan {
        /// Host, address or network to scan
        #[arg(value_name = "TARGET")]
        target: String,

        /// Label shown in listings
        #[arg(short, long)]
        label: Option<String>,

        /// nmap arguments (default: configured default arguments)
        #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
        arguments: Vec<String>,
    },

    /// Check a target and arguments without running anything
    Validate {
        #[arg(value_name = "TARGET", allow_hyphen_values = true)]
        target: String,

        #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
        arguments: Vec<String>,
    },

    /// List scans in the SQLite store
    List,

    /// Show a scan's status, attempts and failure
    Status {
        #[arg(value_name = "SCAN_ID")]
        scan_id: String,
    },

    /// Print a completed scan's result as JSON
    Result {
        #[arg(value_name = "SCAN_ID")]
        scan_id: String,
    },
}

/// Logging event handler that reports scan lifecycle events.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::StateChanged {
                task_id, from, to, ..
            } => {
                info!("Scan '{}': {} -> {}", task_id, from, to);
            }
            Event::AttemptStarted {
                task_id, attempt, ..
            } => {
                info!("  Scan '{}' attempt {} started", task_id, attempt);
            }
            Event::AttemptFinished {
                task_id,
                attempt,
                outcome,
                ..
            } => {
                if outcome.is_success() {
                    info!("  Scan '{}' attempt {} succeeded", task_id, attempt);
                } else {
                    warn!("  Scan '{}' attempt {} failed: {:?}", task_id, attempt, outcome);
                }
            }
            Event::TaskRetrying {
                task_id,
                attempt,
                max_attempts,
                delay,
                ..
            } => {
                warn!(
                    "  Scan '{}' retrying after attempt {}/{} in {:?}",
                    task_id, attempt, max_attempts, delay
                );
            }
            Event::TaskResumed { task_id, state, .. } => {
                info!("Scan '{}' resumed in {}", task_id, state);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(path) = cli.db {
        config.storage = StorageConfig::Sqlite { path };
    }

    match cli.command {
        Commands::Serve {
            host,
            port,
            max_workers,
        } => {
            if let Some(host) = host {
                config.api.host = host;
            }
            if let Some(port) = port {
                config.api.port = port;
            }
            if let Some(max) = max_workers {
                config.max_workers = max;
            }
            config.validate()?;
            with_storage(config, Mode::Serve).await?;
        }
        Commands::Scan {
            target,
            label,
            arguments,
        } => {
            with_storage(config, Mode::Scan { target, label, arguments }).await?;
        }
        Commands::Validate { target, arguments } => {
            validate_input(&target, &arguments)?;
        }
        Commands::List => {
            let registry = open_store(&config).await?;
            list_scans(&registry).await?;
        }
        Commands::Status { scan_id } => {
            let registry = open_store(&config).await?;
            let record = registry.describe(&TaskId::new(scan_id)).await?;
            println!("{}", serde_json::to_string_pretty(&ScanStatusResponse::from(&record))?);
        }
        Commands::Result { scan_id } => {
            let registry = open_store(&config).await?;
            let result = registry.get_result(&TaskId::new(scan_id)).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

enum Mode {
    Serve,
    Scan {
        target: String,
        label: Option<String>,
        arguments: Vec<String>,
    },
}

/// Open the configured storage and run `mode` on it.
async fn with_storage(config: Config, mode: Mode) -> Result<(), Box<dyn std::error::Error>> {
    match config.storage.clone() {
        StorageConfig::Memory => {
            if matches!(mode, Mode::Serve) {
                warn!("Using in-memory storage; scans do not survive a restart");
            }
            run(Arc::new(InMemoryStorage::new()), config, mode).await
        }
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            info!("Using SQLite storage at {}", path);
            let storage = Arc::new(scanward::SqliteStorage::new(&path).await?);
            run(storage, config, mode).await
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => {
            Err("SQLite storage requires the 'sqlite' feature".into())
        }
    }
}

async fn run<S: Storage + 'static>(
    storage: Arc<S>,
    config: Config,
    mode: Mode,
) -> Result<(), Box<dyn std::error::Error>> {
    // Create event bus with logging handler
    let event_bus = EventBus::new();
    event_bus.register(Arc::new(LoggingHandler)).await;

    let runner: Arc<dyn ScanRunner> = Arc::new(config.command_runner());
    let orchestrator = Orchestrator::with_storage(Arc::clone(&storage), runner)
        .with_event_bus(event_bus)
        .with_max_workers(config.max_workers)
        .with_retry_policy(config.retry_policy())
        .with_heartbeat_timeout(config.heartbeat_timeout())
        .with_shutdown_timeout(config.shutdown_timeout());

    let resumable = orchestrator.recover().await?;
    if !resumable.is_empty() {
        info!("Found {} unfinished scan(s) to resume", resumable.len());
    }

    let (handle, orchestrator_task) = orchestrator.start().await;
    let dispatcher = Dispatcher::new(Registry::new(storage), handle.clone())
        .with_wait_timeout(config.run_wait_timeout());

    match mode {
        Mode::Serve => {
            let state = api::create_api_state(dispatcher, config.default_arguments.clone());
            let server = api::start_server(config.api_config(), state).await?;

            info!("Press Ctrl+C to stop");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down...");
                    server.abort();
                    handle.shutdown().await?;
                }
                _ = orchestrator_task => {
                    server.abort();
                    info!("Orchestrator stopped");
                }
            }
        }
        Mode::Scan {
            target,
            label,
            arguments,
        } => {
            let arguments = if arguments.is_empty() {
                config.default_arguments.clone()
            } else {
                arguments
            };
            let outcome = tokio::select! {
                outcome = dispatcher.run_and_wait(target, arguments, label) => outcome,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted; unfinished scans resume on next start");
                    handle.shutdown().await?;
                    return Ok(());
                }
            };
            handle.shutdown().await?;

            let record = outcome?;
            let failed = record.failure().is_some();
            println!("{}", serde_json::to_string_pretty(&RunScanResponse::from(record))?);
            if failed {
                return Err("scan failed".into());
            }
        }
    }

    info!("Goodbye!");
    Ok(())
}

/// Check a target and arguments without running anything.
fn validate_input(target: &str, arguments: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    match Validator::new().validate(target, arguments) {
        Ok(input) => {
            println!("OK: {} {}", input.target, input.arguments.join(" "));
            if input.requires_raw_socket {
                println!("note: this scan mode needs raw-socket privileges");
            }
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}

#[cfg(feature = "sqlite")]
async fn open_store(
    config: &Config,
) -> Result<Registry<scanward::SqliteStorage>, Box<dyn std::error::Error>> {
    match &config.storage {
        StorageConfig::Sqlite { path } => {
            let storage = scanward::SqliteStorage::new(path).await?;
            Ok(Registry::new(Arc::new(storage)))
        }
        StorageConfig::Memory => {
            Err("no persistent store configured; pass --db or set storage.type: sqlite".into())
        }
    }
}

#[cfg(not(feature = "sqlite"))]
async fn open_store(
    _config: &Config,
) -> Result<Registry<InMemoryStorage>, Box<dyn std::error::Error>> {
    Err("reading a persistent store requires the 'sqlite' feature".into())
}

/// Print all scans, oldest first.
async fn list_scans<S: Storage>(registry: &Registry<S>) -> Result<(), Box<dyn std::error::Error>> {
    let scans = registry.list().await?;

    if scans.is_empty() {
        println!("No scans found");
        return Ok(());
    }

    for summary in scans {
        let row = ScanSummaryResponse::from(summary);
        println!(
            "{}  {:<10}  {}  {}",
            row.scan_id,
            row.status,
            row.created_at.format("%Y-%m-%d %H:%M:%S"),
            row.label
        );
    }

    Ok(())
}
