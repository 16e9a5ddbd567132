//! Launcher for the codeforge engine.
//!
//! `run` processes one task inline and prints the outcome; `serve` starts
//! the governor loop and drains gracefully on SIGINT. Exit code 0 on clean
//! shutdown, 1 on fatal startup error.

use clap::{Parser, Subcommand};
use codeforge_cli::{AppContext, EngineRunner};
use codeforge_core::TaskStatus;
use codeforge_governor::TaskRunner as _;
use codeforge_runner::cleanup_workspaces;
use codeforge_store::TaskStore as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "codeforge", about = "codeforge — multi-agent code generation engine")]
struct Cli {
    /// Path to a codex TOML file (defaults to the built-in codex)
    #[arg(long)]
    codex: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process one task inline and print the result
    Run {
        /// The task description
        description: String,
        /// Template to seed the container from
        #[arg(long)]
        template: Option<String>,
        /// API key identifying the owner (quotas and rate limits)
        #[arg(long)]
        api_key: Option<String>,
    },
    /// Start the governor loop and process queued tasks until SIGINT
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let context = Arc::new(AppContext::from_env(cli.codex.as_deref())?);

    cleanup_workspaces(
        &context.config.workspace_root,
        context.config.workspace_ttl_days,
    )?;
    if let Some(ttl_days) = context.config.task_ttl_days {
        let purged = context.store.purge_expired(ttl_days).await?;
        if purged > 0 {
            info!(purged, "purged expired tasks");
        }
    }

    match cli.command {
        Commands::Run {
            description,
            template,
            api_key,
        } => {
            let task_id = context
                .submit_task(
                    &description,
                    api_key.as_deref(),
                    template.as_deref(),
                    None,
                )
                .await?;

            // Inline mode: run the item directly instead of starting the
            // dispatcher loop.
            let engine = EngineRunner::new(context.clone());
            let Some(row) = context.store.get_task(&task_id).await? else {
                anyhow::bail!("task {task_id} vanished after submission");
            };
            engine
                .run(codeforge_governor::QueueItem {
                    task_id: task_id.clone(),
                    description: row.description.clone(),
                    template_id: row.template_id.clone(),
                    request_id: None,
                    resume_from_stage: None,
                })
                .await?;

            let Some(row) = context.store.get_task(&task_id).await? else {
                anyhow::bail!("task {task_id} vanished during processing");
            };
            println!("{}", serde_json::to_string_pretty(&row)?);
            if matches!(row.status, TaskStatus::Failed | TaskStatus::Error) {
                std::process::exit(1);
            }
        }
        Commands::Serve => {
            let engine = Arc::new(EngineRunner::new(context.clone()));
            let requeued = context.governor.bootstrap(context.store.as_ref()).await?;
            if requeued > 0 {
                info!(requeued, "re-enqueued persisted tasks");
            }
            context.governor.start(engine);
            info!(
                max_concurrent = context.config.max_concurrent_tasks,
                "governor started, waiting for tasks (SIGINT to stop)"
            );

            tokio::signal::ctrl_c().await?;
            info!("SIGINT received, draining");
            context.governor.stop();
            // Give in-flight runners a moment to reach a persistable state;
            // anything still processing is recovered as queued on restart.
            let drain_deadline = tokio::time::Instant::now() + Duration::from_secs(30);
            while !context.governor.running_tasks().is_empty()
                && tokio::time::Instant::now() < drain_deadline
            {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            info!("shutdown complete");
        }
    }

    Ok(())
}
