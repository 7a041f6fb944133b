use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use arena_broker::{
    client::query_status,
    config::{ServerConfig, DEFAULT_PORT},
    logging::init_logging,
    server::ArenaServer,
};

#[derive(Debug, Parser)]
#[command(name = "arena-broker")]
#[command(about = "Connection and turn broker for agent competitions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Accept agents and broker their turns until interrupted.
    Serve(ServeCommand),
    /// Ask a running server for its teams and current simulation.
    Status(StatusCommand),
}

#[derive(Debug, clap::Args)]
struct ServeCommand {
    /// JSON config file with the team roster.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Debug, clap::Args)]
struct StatusCommand {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
}

impl ServeCommand {
    fn resolve(self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(cmd) => run_serve(cmd).await,
        Commands::Status(cmd) => run_status(cmd).await,
    }
}

async fn run_serve(cmd: ServeCommand) -> Result<()> {
    let config = cmd.resolve()?;
    init_logging(&config.log_level)?;

    let server = ArenaServer::start(config).await?;
    wait_for_shutdown().await?;
    tracing::info!("shutting down");
    server.shutdown().await;
    Ok(())
}

async fn run_status(cmd: StatusCommand) -> Result<()> {
    let status = query_status((cmd.host.as_str(), cmd.port))
        .await
        .with_context(|| format!("status query to {}:{} failed", cmd.host, cmd.port))?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
