use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use foreman_config::{config_path_from_env, load_config, FileConfigSource};
use foreman_core::SqliteBacklogStore;
use foreman_runtime::{CommandQualityGateRunner, ExecutionRuntimeConfig, ProcessExecutionRuntime};
use foreman_scheduler::Scheduler;
use foreman_vcs::GitSyncEngine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config_path = config_path_from_env();
    let config = load_config(&config_path)
        .with_context(|| format!("load configuration from {}", config_path.display()))?;

    let database_path = config.database_path();
    if let Some(parent) = database_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create database directory {}", parent.display()))?;
    }
    let store = Arc::new(
        SqliteBacklogStore::open(&database_path)
            .with_context(|| format!("open backlog store at {}", database_path.display()))?,
    );

    let runtime = Arc::new(ProcessExecutionRuntime::new(
        ExecutionRuntimeConfig {
            repo_root: config.workspace_root(),
            worktrees_root: config.worktrees_root(),
            agent_binary: PathBuf::from(&config.runtime.agent_binary),
            agent_args: config.runtime.agent_args.clone(),
        },
        GitSyncEngine::new(PathBuf::from(&config.git.binary)),
    ));

    let config_source = Arc::new(FileConfigSource::new(
        config_path.clone(),
        config.scheduler_config(),
    ));

    let scheduler = Scheduler::new(
        store.clone(),
        runtime,
        Arc::new(CommandQualityGateRunner),
        store,
        config_source,
    );

    scheduler.start().await;
    tracing::info!(
        config = %config_path.display(),
        database = %database_path.display(),
        "foreman running; press ctrl-c to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    scheduler.stop().await;
    tracing::info!("shutdown complete");

    Ok(())
}
