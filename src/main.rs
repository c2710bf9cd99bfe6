use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use editorial_orchestrator::config::ServiceRole;

mod cmd;

#[derive(Parser)]
#[command(name = "editorial")]
#[command(version, about = "Editorial validation and checkpoint orchestration service")]
pub struct Cli {
    /// Path to editorial.toml (defaults to ./editorial.toml when present)
    #[arg(short, long, global = true, env = "EDITORIAL_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP service
    Serve(ServeArgs),
    /// View, validate or create configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

/// Flags override the file and environment.
#[derive(clap::Args, Clone, Debug, Default)]
pub struct ServeArgs {
    /// Interface to bind
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Which routes to serve: all, editorial, orchestrator
    #[arg(long)]
    pub role: Option<ServiceRole>,

    /// Redis URL for durable checkpoint/sequence state
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Rule collection export (YAML or JSON)
    #[arg(long)]
    pub rules_file: Option<PathBuf>,

    /// Editorial service URL used by the orchestrator role
    #[arg(long)]
    pub editorial_url: Option<String>,

    /// Permissive CORS for local UI development
    #[arg(long)]
    pub dev: bool,

    /// Emit logs as JSON
    #[arg(long)]
    pub json_logs: bool,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default editorial.toml
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    match &cli.command {
        Commands::Serve(args) => cmd::cmd_serve(cli.config.as_deref(), &cwd, args).await?,
        Commands::Config { command } => {
            cmd::cmd_config(cli.config.as_deref(), &cwd, command.clone())?
        }
    }

    Ok(())
}
