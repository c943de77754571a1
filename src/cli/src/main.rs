//! taskq - administer queues and their worker daemons.
//!
//! Talks to the job table and the control store directly, using the same
//! configuration as `taskqd`.

mod commands;
mod context;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{dispatch, jobs, worker};
use context::CliContext;
use output::OutputFormat;

/// taskq - durable background job queue
#[derive(Parser)]
#[command(
    name = "taskq",
    version,
    about = "Administer taskq queues and workers",
    long_about = "Inspect and control worker daemons, flush or retry jobs, and enqueue test jobs.",
    propagate_version = true
)]
pub struct Cli {
    /// Configuration file layered under TASKQ__* environment variables
    #[arg(long, global = true, env = "TASKQ_CONFIG")]
    config: Option<String>,

    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Worker daemon control
    #[command(subcommand)]
    Worker(worker::WorkerCommands),

    /// Job table maintenance
    #[command(subcommand)]
    Jobs(jobs::JobsCommands),

    /// Enqueue built-in tasks
    #[command(subcommand)]
    Dispatch(dispatch::DispatchCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let Cli {
        config,
        output: format,
        command,
        ..
    } = cli;

    let result = async move {
        let ctx = CliContext::connect(config.as_deref()).await?;
        match command {
            Commands::Worker(cmd) => worker::execute(cmd, &ctx, format).await,
            Commands::Jobs(cmd) => jobs::execute(cmd, &ctx, format).await,
            Commands::Dispatch(cmd) => dispatch::execute(cmd, &ctx, format).await,
        }
    }
    .await;

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
