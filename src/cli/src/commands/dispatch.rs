//! Enqueue built-in tasks from the command line.

use anyhow::Result;
use clap::Subcommand;

use taskq_core::jobs::{EchoData, EchoTask};

use crate::context::CliContext;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum DispatchCommands {
    /// Enqueue an echo job to smoke-test a queue
    Echo {
        #[arg(short, long)]
        queue: String,

        #[arg(short, long)]
        message: String,

        /// Make the job report failure
        #[arg(long)]
        fail: bool,
    },
}

pub async fn execute(cmd: DispatchCommands, ctx: &CliContext, format: OutputFormat) -> Result<()> {
    match cmd {
        DispatchCommands::Echo { queue, message, fail } => {
            let job = ctx
                .producer()
                .dispatch::<EchoTask>(&queue, &EchoData { message, fail })
                .await?;
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("Enqueued job {} on '{}'", job.id, job.queue));
                    output::print_detail("Run after", &job.run_after.to_rfc3339());
                }
                _ => output::print_item(&job, format)?,
            }
        }
    }
    Ok(())
}
