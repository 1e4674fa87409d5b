use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use labtriage::config::TriageConfig;
use labtriage::logging::init_logging;

mod cmd;

#[derive(Parser)]
#[command(name = "labtriage")]
#[command(version, about = "Checkpointed lab report triage with human approval gates")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding `.labtriage/` (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Print machine-readable JSON on stdout
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API and WebSocket event feed
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        #[arg(long)]
        host: Option<String>,
    },
    /// Start a session from a lab report
    Create {
        /// Text file holding the report
        file: Option<PathBuf>,

        /// Report text given inline instead of a file
        #[arg(long, conflicts_with = "file")]
        text: Option<String>,

        /// Patient location used for the specialist search
        #[arg(short, long)]
        location: Option<String>,

        /// Advance the new session straight away
        #[arg(long)]
        advance: bool,
    },
    /// Run a session until it needs approval or completes
    Advance { session_id: String },
    /// Answer a pending approval and continue the session
    Resume {
        session_id: String,

        #[arg(long, conflicts_with = "deny")]
        approve: bool,

        #[arg(long)]
        deny: bool,

        /// The interrupt you expect to be pending (e.g. specialist_search)
        #[arg(long)]
        interrupt: Option<String>,
    },
    /// Show the latest state of a session
    Status { session_id: String },
    /// Show every checkpoint written for a session
    History { session_id: String },
    /// Submit a completed session's results to the FHIR record store
    Submit { session_id: String },
    /// Ask a question about a session's interpreted results
    Chat { session_id: String, message: String },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default labtriage.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let mut config = TriageConfig::with_cli_args(project_dir, cli.verbose)
        .context("Failed to load configuration")?;
    let log_dir = config.log_dir();
    let _log_guard = init_logging(&config.toml.logging, cli.verbose, log_dir.as_deref())?;

    match &cli.command {
        Commands::Serve { port, host } => {
            if let Some(port) = port {
                config.toml.server.port = *port;
            }
            if let Some(host) = host {
                config.toml.server.host = host.clone();
            }
            cmd::cmd_serve(&config).await?;
        }
        Commands::Create {
            file,
            text,
            location,
            advance,
        } => {
            cmd::cmd_create(
                &config,
                &cli,
                file.as_deref(),
                text.as_deref(),
                location.as_deref(),
                *advance,
            )
            .await?
        }
        Commands::Advance { session_id } => cmd::cmd_advance(&config, &cli, session_id).await?,
        Commands::Resume {
            session_id,
            approve,
            deny,
            interrupt,
        } => {
            cmd::cmd_resume(&config, &cli, session_id, *approve, *deny, interrupt.as_deref())
                .await?
        }
        Commands::Status { session_id } => cmd::cmd_status(&config, &cli, session_id).await?,
        Commands::History { session_id } => cmd::cmd_history(&config, &cli, session_id).await?,
        Commands::Submit { session_id } => cmd::cmd_submit(&config, &cli, session_id).await?,
        Commands::Chat {
            session_id,
            message,
        } => cmd::cmd_chat(&config, &cli, session_id, message).await?,
        Commands::Config { command } => cmd::cmd_config(&config, &cli, command.clone())?,
    }

    Ok(())
}
