use anyhow::Context;
use clap::{Parser, Subcommand};
use conductor_agent::WebhookAgent;
use conductor_core::{TaskClass, TaskId, TaskRecord, TaskRequest, TaskStatus};
use conductor_orchestrator::{ConductorConfig, Orchestrator};
use conductor_store::TaskStore;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: agent task orchestration core")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the orchestrator, resume persisted work and submit tasks
    Run {
        /// JSON file with one task request or an array of them
        #[arg(long)]
        tasks: Option<PathBuf>,
        /// Exit once the submitted tasks finish instead of running until Ctrl-C
        #[arg(long)]
        wait: bool,
    },
    /// Show one task from the configured store
    Status {
        task_id: TaskId,
    },
    /// List tasks from the configured store
    List {
        /// Only tasks in this status (PENDING, RUNNING, COMPLETED, FAILED, CANCELLED)
        #[arg(long)]
        status: Option<TaskStatus>,
    },
    /// Delete a finished task and its workflow checkpoint
    Purge {
        task_id: TaskId,
    },
}

fn load_config(path: &Path) -> anyhow::Result<ConductorConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(ConductorConfig::default());
    }
    ConductorConfig::load(path)
        .with_context(|| format!("Failed to load config file '{}'", path.display()))
}

/// Accepts a single request object or an array of them.
fn parse_tasks(raw: &str) -> anyhow::Result<Vec<TaskRequest>> {
    let value: Value = serde_json::from_str(raw).context("Task file is not valid JSON")?;
    let requests = match value {
        Value::Array(_) => serde_json::from_value(value)?,
        other => vec![serde_json::from_value(other)?],
    };
    Ok(requests)
}

async fn run(config: ConductorConfig, tasks: Option<PathBuf>, wait: bool) -> anyhow::Result<()> {
    let webhooks = config.agents.webhooks.clone();
    let orchestrator = Orchestrator::builder(config).build().await?;

    for webhook in &webhooks {
        orchestrator.register_agent(
            webhook.descriptor(),
            Arc::new(WebhookAgent::from_config(webhook)),
        )?;
    }
    info!(count = webhooks.len(), "Webhook agents registered");

    orchestrator.start().await?;

    let mut submitted = Vec::new();
    if let Some(path) = tasks {
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read task file '{}'", path.display()))?;
        for request in parse_tasks(&raw)? {
            let task_id = orchestrator.schedule(request).await?;
            println!("{}", json!({"task_id": task_id, "status": TaskStatus::Pending}));
            submitted.push(task_id);
        }
    }

    if wait {
        let finals = futures_util::future::join_all(
            submitted.iter().map(|id| orchestrator.wait(*id)),
        )
        .await;
        for state in finals {
            println!("{}", serde_json::to_string(&state?)?);
        }
    } else {
        info!("Running until Ctrl-C");
        tokio::signal::ctrl_c().await?;
    }

    orchestrator.stop().await?;
    Ok(())
}

/// Delete a terminal task from the store. Returns `false` for unknown ids.
async fn purge(store: &dyn TaskStore, task_id: TaskId) -> anyhow::Result<bool> {
    let Some(record) = store.get_task(task_id).await? else {
        return Ok(false);
    };
    if !record.state.is_terminal() {
        anyhow::bail!(
            "task {task_id} is {}; only finished tasks can be purged",
            record.state.status
        );
    }
    let removed = store.delete_task(task_id).await?;
    if record.descriptor.task_class == TaskClass::Complex {
        store
            .delete_execution(&record.descriptor.workflow_id())
            .await?;
    }
    Ok(removed)
}

fn filter_status(records: Vec<TaskRecord>, status: Option<TaskStatus>) -> Vec<TaskRecord> {
    match status {
        Some(status) => records
            .into_iter()
            .filter(|r| r.state.status == status)
            .collect(),
        None => records,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run { tasks, wait } => run(config, tasks, wait).await?,
        Commands::Status { task_id } => {
            let store = config.storage.open().await?;
            let record = store
                .get_task(task_id)
                .await?
                .with_context(|| format!("Task {task_id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::List { status } => {
            let store = config.storage.open().await?;
            for record in filter_status(store.list_tasks().await?, status) {
                println!(
                    "{}",
                    json!({
                        "task_id": record.descriptor.task_id,
                        "agent_id": record.descriptor.agent_id,
                        "task_class": record.descriptor.task_class,
                        "status": record.state.status,
                        "attempts": record.state.attempts,
                        "last_updated_at": record.state.last_updated_at,
                    })
                );
            }
        }
        Commands::Purge { task_id } => {
            let store = config.storage.open().await?;
            let purged = purge(store.as_ref(), task_id).await?;
            println!("{}", json!({"task_id": task_id, "purged": purged}));
        }
    }

    Ok(())
}
