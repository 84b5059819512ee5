use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use vaultline_api::{CommandServer, EngineClient};
use vaultline_infra::config::{EngineConfig, DEFAULT_COMMAND_PORT};
use vaultline_infra::engine::BackupEngine;
use vaultline_infra::notification::LoggingNotificationHandler;
use vaultline_infra::store::{Collection, InMemoryCollection, PostgresStore};
use vaultline_observability::{LogConfig, LogFormat};
use vaultline_tasks::{Backup, Restore, TaskKind};

#[derive(Debug, Parser)]
#[command(name = "vaultline", version, about = "Distributed backup task engine", propagate_version = true)]
struct Cli {
    /// Engine config file (JSON). Falls back to VAULTLINE_* environment variables.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Command port of the engine to talk to (stop/status).
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run an engine in the foreground until it is stopped.
    Start,
    /// Ask a running engine to stop once its workers finish.
    Stop,
    /// Print a running engine's status.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Start => start(cli.config.as_deref()).await,
        Commands::Stop => {
            let client = EngineClient::local(command_port(&cli));
            println!("{}", client.stop().await?);
            Ok(())
        }
        Commands::Status => {
            let client = EngineClient::local(command_port(&cli));
            println!("{}", serde_json::to_string_pretty(&client.status().await?)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::from_env()?,
    };
    Ok(config)
}

fn command_port(cli: &Cli) -> u16 {
    cli.port
        .or_else(|| load_config(cli.config.as_deref()).ok().map(|c| c.command_port))
        .unwrap_or(DEFAULT_COMMAND_PORT)
}

async fn open_collections(
    config: &EngineConfig,
) -> anyhow::Result<(Arc<dyn Collection<Backup>>, Arc<dyn Collection<Restore>>)> {
    match &config.database_url {
        Some(url) => {
            let max_connections = u32::try_from(config.max_workers * 2 + 2).unwrap_or(u32::MAX);
            let store = PostgresStore::connect(url, max_connections)
                .await
                .context("connecting to the task store")?;
            let backups: Arc<dyn Collection<Backup>> =
                Arc::new(store.open::<Backup>(TaskKind::Backup.collection_name()).await?);
            let restores: Arc<dyn Collection<Restore>> =
                Arc::new(store.open::<Restore>(TaskKind::Restore.collection_name()).await?);
            Ok((backups, restores))
        }
        None => {
            warn!("no databaseUrl configured, using an in-memory task store");
            let backups: Arc<dyn Collection<Backup>> =
                Arc::new(InMemoryCollection::<Backup>::new(TaskKind::Backup.collection_name()));
            let restores: Arc<dyn Collection<Restore>> =
                Arc::new(InMemoryCollection::<Restore>::new(TaskKind::Restore.collection_name()));
            Ok((backups, restores))
        }
    }
}

async fn start(config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let format: LogFormat = config.log_format.parse().map_err(anyhow::Error::msg)?;
    vaultline_observability::init(&LogConfig::default().with_format(format));

    let (backups, restores) = open_collections(&config).await?;
    let engine = Arc::new(BackupEngine::from_config(
        &config,
        backups,
        restores,
        Arc::new(LoggingNotificationHandler),
    )?);

    let preparing = engine.clone();
    tokio::task::spawn_blocking(move || preparing.prepare()).await??;

    let server = CommandServer::bind(SocketAddr::from(([0, 0, 0, 0], config.command_port)), engine.clone())
        .await
        .with_context(|| format!("binding command port {}", config.command_port))?;

    let running = engine.clone();
    let outcome = tokio::task::spawn_blocking(move || running.run()).await?;
    server.stop().await?;
    outcome?;
    info!(engine = %engine.guid(), "engine stopped");
    Ok(())
}
