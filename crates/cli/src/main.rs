//! relay CLI - inspect a task store and run chains from JSON files.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use relay_core::{ChainStatus, ExecutionFilter, Task, TaskStatus};
use relay_execution::{
    handler_fn, ChainDefinition, ChainExecutor, ChainSpec, ConcurrencyManager, RelayConfig, RunnerRegistry,
    TaskScheduler,
};
use relay_storage::{JsonStorage, Storage};
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Task orchestration for generative workloads", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Storage directory (overrides the config file)
    #[arg(short, long, global = true)]
    storage: Option<PathBuf>,

    /// SQLite database URL, used instead of the JSON store
    #[cfg(feature = "sqlite")]
    #[arg(long, global = true)]
    database: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Task counts by status
    Stats,
    /// Tasks left pending or running
    Unfinished,
    /// Show a task and its executions
    Show {
        /// Task ID
        id: String,
    },
    /// Delete finished records older than a retention window
    Cleanup {
        /// Retention window in days
        #[arg(long, default_value = "30")]
        days: u32,
        /// Also delete finished executions
        #[arg(long)]
        executions: bool,
    },
    /// Run a chain described in a JSON file
    RunChain {
        /// Chain file
        file: PathBuf,
        /// Give up waiting after this many seconds
        #[arg(long, default_value = "600")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => RelayConfig::default(),
    };
    if let Some(storage) = &cli.storage {
        config.storage_path = storage.clone();
    }

    let storage = open_storage(&cli, &config).await?;

    match cli.command {
        Commands::Stats => {
            let stats = storage.get_task_stats().await?;
            println!("Tasks: {}", stats.total);
            for status in TaskStatus::ALL {
                println!("  {:<10} {}", status, stats.count(status));
            }
        }
        Commands::Unfinished => {
            let tasks = storage.get_unfinished_tasks().await?;
            println!("Unfinished tasks ({})", tasks.len());
            for task in tasks {
                print_task_line(&task);
            }
        }
        Commands::Show { id } => {
            let task_id = id.parse().map_err(|_| anyhow::anyhow!("Invalid task ID: {}", id))?;
            let Some(task) = storage.load_task(task_id).await? else {
                println!("Task not found");
                return Ok(());
            };

            println!("Task: {}", task.id);
            println!("  Name: {}", task.name);
            if let Some(description) = &task.description {
                println!("  Description: {}", description);
            }
            println!("  Category: {}", task.category);
            println!("  Status: {}", task.status);
            println!("  Priority: {:?}", task.options.priority);
            println!("  Created: {}", task.created_at);
            println!("  Updated: {}", task.updated_at);

            let executions = storage.list_executions(&ExecutionFilter::for_task(task.id)).await?;
            println!("  Executions ({}):", executions.len());
            for execution in executions {
                println!(
                    "    {} | {} | {}%{}",
                    execution.id,
                    execution.status,
                    execution.progress,
                    execution.error.map(|e| format!(" | {}", e)).unwrap_or_default()
                );
            }
        }
        Commands::Cleanup { days, executions } => {
            let removed = storage.cleanup_old_tasks(days).await?;
            println!("Removed {} tasks older than {} days", removed, days);
            if executions {
                let removed = storage.cleanup_old_executions(days).await?;
                println!("Removed {} executions older than {} days", removed, days);
            }
        }
        Commands::RunChain { file, timeout } => {
            run_chain(&file, config, storage, Duration::from_secs(timeout)).await?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<RelayConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    RelayConfig::from_json(&raw).with_context(|| format!("parsing {}", path.display()))
}

#[allow(unused_variables)]
async fn open_storage(cli: &Cli, config: &RelayConfig) -> Result<Arc<dyn Storage>> {
    #[cfg(feature = "sqlite")]
    if let Some(url) = &cli.database {
        let storage = relay_storage::SqliteStorage::new(url).await?;
        return Ok(Arc::new(storage));
    }

    let storage = JsonStorage::new(&config.storage_path)
        .await
        .with_context(|| format!("opening store at {}", config.storage_path.display()))?;
    Ok(Arc::new(storage))
}

/// Handlers available to chains run from the command line.
fn builtin_runners() -> RunnerRegistry {
    RunnerRegistry::new()
        .register("echo", handler_fn(|_ctx, input| async move { Ok(input) }))
        .register(
            "delay",
            handler_fn(|ctx, input: Value| async move {
                let ms = input.get("ms").and_then(Value::as_u64).unwrap_or(100);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                    _ = ctx.cancelled() => bail!("cancelled after less than {}ms", ms),
                }
                Ok(json!({ "slept_ms": ms, "input": input }))
            }),
        )
}

async fn run_chain(file: &Path, config: RelayConfig, storage: Arc<dyn Storage>, timeout: Duration) -> Result<()> {
    let raw = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let spec: ChainSpec = serde_json::from_str(&raw).with_context(|| format!("parsing {}", file.display()))?;

    let manager = Arc::new(ConcurrencyManager::new(config.concurrency.clone()));
    let scheduler = TaskScheduler::builder(builtin_runners())
        .with_concurrency(manager)
        .with_storage(storage)
        .with_config(config.scheduler.clone())
        .build();
    let executor = ChainExecutor::new(scheduler.clone()).with_config(config.chain.clone());

    let chain = ChainDefinition::from(spec);
    info!("Running chain '{}' with {} nodes", chain.id, chain.nodes.len());

    let id = executor.execute_chain(chain).await?;
    let run = executor.wait_for_chain(id, timeout).await?;
    scheduler.shutdown(Duration::from_secs(5)).await?;

    println!("{}", serde_json::to_string_pretty(&run)?);
    if run.status != ChainStatus::Completed {
        bail!(
            "chain {} ended {}: {}",
            run.chain_id,
            run.status,
            run.error.unwrap_or_default()
        );
    }
    Ok(())
}

fn print_task_line(task: &Task) {
    println!(
        "  {} | {:<9} | {:<8} | {}",
        task.id, task.status, task.category, task.name
    );
}
