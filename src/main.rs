use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

use stagegate::config::StagegateConfig;
use stagegate::logging::{self, LogOptions};

mod cmd;

#[derive(Parser)]
#[command(name = "stagegate")]
#[command(version, about = "Resumable, human-gated pipeline engine")]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the HTTP API and event streams
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Start a pipeline from an input document and run it to its first gate
    Start {
        /// Path to the input document
        file: PathBuf,
    },
    /// Show the status of a session
    Status { session_id: String },
    /// Resolve the open gate of a session and resume it
    Decide {
        session_id: String,
        #[arg(long, conflicts_with_all = ["revise", "abort"])]
        approve: bool,
        /// Request a revision with this feedback
        #[arg(long, value_name = "FEEDBACK", conflicts_with = "abort")]
        revise: Option<String>,
        #[arg(long)]
        abort: bool,
        /// Gate token (defaults to the token of the open gate)
        #[arg(long)]
        token: Option<String>,
    },
    /// Continue a session that stopped without reaching a gate, e.g. after a crash
    Resume { session_id: String },
    /// List sessions, newest first
    List,
    /// Show the persisted event log of a session
    Log { session_id: String },
    /// Print an artifact of a stage or work item as JSON
    Artifact { session_id: String, key: String },
    /// Fail sessions that have been idle longer than the timeout
    Sweep {
        /// Override [janitor] idle_timeout_secs
        #[arg(long)]
        idle_secs: Option<u64>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default stagegate.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Config commands must work even when the file is broken.
    if let Commands::Config { command } = &cli.command {
        return cmd::cmd_config(&project_dir, command.clone());
    }

    let config = StagegateConfig::load(project_dir)?.with_verbose(cli.verbose);
    let _log_guard = logging::init(&LogOptions {
        verbose: cli.verbose,
        level: config.toml.logging.level.clone(),
        json: config.toml.logging.json,
        dir: config.log_dir(),
    })?;

    match &cli.command {
        Commands::Serve { host, port } => {
            cmd::cmd_serve(config, host.clone(), *port).await?;
        }
        Commands::Start { file } => cmd::cmd_start(&config, file).await?,
        Commands::Status { session_id } => cmd::cmd_status(&config, session_id).await?,
        Commands::Decide {
            session_id,
            approve,
            revise,
            abort,
            token,
        } => {
            let choice = cmd::DecisionChoice::from_flags(*approve, revise.clone(), *abort);
            cmd::cmd_decide(&config, session_id, choice, token.as_deref()).await?;
        }
        Commands::Resume { session_id } => cmd::cmd_resume(&config, session_id).await?,
        Commands::List => cmd::cmd_list(&config).await?,
        Commands::Log { session_id } => cmd::cmd_log(&config, session_id).await?,
        Commands::Artifact { session_id, key } => {
            cmd::cmd_artifact(&config, session_id, key).await?
        }
        Commands::Sweep { idle_secs } => cmd::cmd_sweep(&config, *idle_secs).await?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
