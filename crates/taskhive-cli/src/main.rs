mod config;
mod notify;
mod tasks;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::{BackendKind, HiveConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use taskhive_agents::{AgentDirectory, StaticLedger};
use taskhive_batch::{BatchProcessor, BatchedModelBackend, CommandModelClient};
use taskhive_channels::{LogHandler, MessageRouter};
use taskhive_orchestrator::{CommandBackend, Coordinator, ExecutionBackend, ResourcePool};
use tasks::TaskFile;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taskhive", about = "TaskHive: dependency-aware task dispatch to worker agents")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "taskhive.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task file to completion
    Run {
        /// Task file with [[tasks]] entries
        #[arg(short, long)]
        tasks: PathBuf,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 3600)]
        timeout_secs: u64,
    },
    /// Check the config (and optionally a task file) without running anything
    Validate {
        #[arg(short, long)]
        tasks: Option<PathBuf>,
    },
    /// Print the agent directory built from the configured ledger
    Agents,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn build_directory(config: &HiveConfig) -> anyhow::Result<Arc<AgentDirectory>> {
    let directory = Arc::new(AgentDirectory::new(config.directory.clone()));
    let ledger = StaticLedger::new(config.agents.clone());
    let report = directory.sync_from_ledger(&ledger).await?;
    info!(
        added = report.added.len(),
        updated = report.updated.len(),
        offlined = report.offlined.len(),
        "Agent directory synced"
    );
    Ok(directory)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = HiveConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config '{}'", cli.config.display()))?;
    config.validate()?;

    match cli.command {
        Commands::Validate { tasks } => {
            if let Some(path) = tasks {
                let file = TaskFile::load(&path)
                    .with_context(|| format!("Failed to load task file '{}'", path.display()))?;
                println!("Task file OK: {} task(s)", file.tasks.len());
            }
            println!(
                "Configuration OK: {} agent(s), {} route(s)",
                config.agents.len(),
                config.routes.len()
            );
        }
        Commands::Agents => {
            let directory = build_directory(&config).await?;
            println!("{}", serde_json::to_string_pretty(&directory.snapshot())?);
        }
        Commands::Run {
            tasks,
            timeout_secs,
        } => {
            let file = TaskFile::load(&tasks)
                .with_context(|| format!("Failed to load task file '{}'", tasks.display()))?;
            run(config, file, Duration::from_secs(timeout_secs)).await?;
        }
    }

    Ok(())
}

async fn run(config: HiveConfig, file: TaskFile, timeout: Duration) -> anyhow::Result<()> {
    let directory = build_directory(&config).await?;
    let pool = Arc::new(ResourcePool::new(config.resources.clone()));

    let processor = match config.backend.kind {
        BackendKind::Batched => {
            let client = Arc::new(CommandModelClient::new(config.backend.command.clone()));
            Some(Arc::new(BatchProcessor::new(config.batch.clone(), client)))
        }
        BackendKind::Command => None,
    };
    let backend: Arc<dyn ExecutionBackend> = match &processor {
        Some(processor) => Arc::new(BatchedModelBackend::new(processor.clone())),
        None => Arc::new(CommandBackend::new(config.backend.command.clone())),
    };

    let coordinator = Coordinator::new(
        config.scheduler.clone(),
        pool,
        backend,
        Some(directory.clone()),
    );
    let ids = file.submit_all(&coordinator)?;
    info!(tasks = ids.len(), "Task file submitted");

    let router = Arc::new(MessageRouter::new(config.router.clone()));
    router.register_handler(Arc::new(LogHandler::new(config.notify.recipient.clone())));
    for route in &config.routes {
        for target in &route.targets {
            if target.handler != config.notify.recipient {
                router.register_handler(Arc::new(LogHandler::new(target.handler.clone())));
            }
        }
        router.add_route(route.clone())?;
    }

    let cancel = CancellationToken::new();
    let forwarder = notify::spawn_event_forwarder(
        coordinator.subscribe(),
        router.clone(),
        config.notify.recipient.clone(),
        config.notify.verbose,
        cancel.clone(),
    );
    let watchdog = {
        let directory = directory.clone();
        let cancel = cancel.clone();
        let threshold = Duration::from_secs(config.directory.stuck_after_secs);
        let period = (threshold / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let stuck = directory.detect_stuck(threshold);
                        if !stuck.is_empty() {
                            warn!(agents = ?stuck, "Agents marked stuck");
                        }
                    }
                }
            }
        })
    };

    router.start();
    if let Some(processor) = &processor {
        processor.start();
    }
    coordinator.start();

    let finished = tokio::select! {
        idle = coordinator.wait_idle(timeout) => idle,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, shutting down");
            false
        }
    };
    if !finished {
        warn!(timeout_secs = timeout.as_secs(), "Tasks still outstanding");
    }

    coordinator.shutdown().await;
    // The forwarder drains what the coordinator already emitted before exiting.
    cancel.cancel();
    if let Err(e) = forwarder.await {
        error!(error = %e, "Event forwarder terminated abnormally");
    }
    if let Err(e) = watchdog.await {
        error!(error = %e, "Stuck-agent watchdog terminated abnormally");
    }
    router.shutdown().await;
    if let Some(processor) = &processor {
        processor.shutdown().await;
        info!(stats = ?processor.stats(), "Batch processor summary");
    }

    let status = coordinator.status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    info!(metrics = ?router.metrics(), "Message router summary");

    let metrics = &status.metrics;
    if metrics.tasks_failed > 0 || metrics.tasks_blocked > 0 || !finished {
        anyhow::bail!(
            "{} task(s) failed, {} blocked",
            metrics.tasks_failed,
            metrics.tasks_blocked
        );
    }
    Ok(())
}
