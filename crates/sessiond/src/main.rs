//! Sessiond
//!
//! WebSocket daemon that relays every message a client sends to the other
//! clients joined to the same session.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sessiond::config::Config;
use sessiond::orchestrator::{DaemonOrchestrator, OrchestratorEvent};

/// Sessiond - WebSocket session broadcast daemon.
#[derive(Parser, Debug)]
#[command(name = "sessiond")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the daemon and serve until SIGINT or SIGTERM
    Start {
        /// Address to listen on, overriding the config file
        #[arg(long, value_name = "ADDR")]
        bind: Option<String>,

        /// Register a session at startup (repeatable)
        #[arg(long = "session", value_name = "KEY")]
        sessions: Vec<String>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Initialize tracing
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        std::env::var("SESSIOND_LOG_LEVEL")
            .ok()
            .filter(|level| !level.is_empty())
            .unwrap_or_else(|| config.daemon.log_level.clone())
            .to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(config_path) = &cli.config {
        tracing::info!("Using config file: {:?}", config_path);
    }

    // Apply environment variable overrides
    config.apply_env_overrides();

    match cli.command {
        Commands::Start { bind, sessions } => {
            apply_start_overrides(&mut config, bind, sessions);
            config.validate()?;

            tracing::info!("Sessiond starting...");
            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run_until_signal(&mut orchestrator).await?;
        }
        Commands::Config => {
            config.validate()?;
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/// Applies `start` flags on top of the loaded configuration.
///
/// Keys already present in the config are not registered twice.
fn apply_start_overrides(config: &mut Config, bind: Option<String>, sessions: Vec<String>) {
    if let Some(addr) = bind {
        config.server.bind_addr = addr;
    }
    for key in sessions {
        if !config.sessions.initial.contains(&key) {
            config.sessions.initial.push(key);
        }
    }
}

/// Runs the orchestrator until a shutdown signal arrives.
async fn run_until_signal(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    // Subscribe before starting so the startup events are logged too
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::debug!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::Listening(addr) => {
                    tracing::info!("Accepting WebSocket clients on ws://{}/<session>", addr);
                }
                OrchestratorEvent::ConnectionsClosed(count) => {
                    tracing::info!("Closed {} connection(s) on shutdown", count);
                }
            }
        }
    });

    orchestrator.start().await?;

    let signal = wait_for_shutdown_signal().await;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;
    signal
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}
