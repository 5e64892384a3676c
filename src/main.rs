use anyhow::Result;
use clap::{Parser, Subcommand};
use shift::logging::{self, LogFormat};
use shift::phase::PipelinePhase;
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "shift")]
#[command(version, about = "REST-to-GraphQL migration orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format on stderr
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    /// Pipeline config file (.toml or .json)
    #[arg(short, long, global = true, env = "SHIFT_CONFIG", default_value = "shift.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run every phase from Discovery, discarding earlier results
    Run {
        /// Per-phase timeout in seconds
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        timeout: Option<u64>,
    },
    /// Continue from a phase, reusing the results before it
    Resume {
        /// Phase to restart from (defaults to the first incomplete phase)
        #[arg(long)]
        from: Option<PipelinePhase>,
    },
    /// Show per-phase progress of the last run
    Status,
    /// List recorded savepoints
    Savepoints,
    /// Serve worker tool requests on stdin/stdout
    Bridge {
        #[arg(long)]
        phase: PipelinePhase,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and list any problems
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_format)?;

    let completed = match &cli.command {
        Commands::Run { timeout } => cmd::cmd_run(&cli.config, *timeout).await?,
        Commands::Resume { from } => cmd::cmd_resume(&cli.config, *from).await?,
        Commands::Status => {
            cmd::cmd_status(&cli.config)?;
            true
        }
        Commands::Savepoints => {
            cmd::cmd_savepoints(&cli.config)?;
            true
        }
        Commands::Bridge { phase } => {
            cmd::cmd_bridge(&cli.config, *phase).await?;
            true
        }
        Commands::Config { command } => {
            cmd::cmd_config(&cli.config, command.clone())?;
            true
        }
    };

    if !completed {
        std::process::exit(1);
    }
    Ok(())
}
