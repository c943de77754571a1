//! Job table commands: counts, flush, and the failed-job sweep.

use anyhow::{bail, Result};
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use taskq_core::jobs::{DispatchOutcome, JobRepository, JobStatus};

use crate::context::CliContext;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum JobsCommands {
    /// Count rows per status
    Counts {
        #[arg(short, long)]
        queue: String,
    },

    /// Delete finished rows
    Flush {
        #[arg(short, long)]
        queue: String,

        /// success or failed
        #[arg(short, long, default_value = "success")]
        status: JobStatus,
    },

    /// Put failed rows with retries left back on the queue
    RetryFailed {
        #[arg(short, long)]
        queue: String,
    },
}

#[derive(Serialize, Tabled)]
struct CountRow {
    #[tabled(rename = "Status")]
    status: &'static str,
    #[tabled(rename = "Jobs")]
    count: u64,
}

pub async fn execute(cmd: JobsCommands, ctx: &CliContext, format: OutputFormat) -> Result<()> {
    let repository = ctx.manager.repository();

    match cmd {
        JobsCommands::Counts { queue } => {
            let counts = repository.counts(&queue).await?;
            match format {
                OutputFormat::Table => {
                    output::print_header(&format!("Queue '{}'", queue));
                    let rows = [
                        CountRow {
                            status: "pending",
                            count: counts.pending,
                        },
                        CountRow {
                            status: "reserved",
                            count: counts.reserved,
                        },
                        CountRow {
                            status: "success",
                            count: counts.success,
                        },
                        CountRow {
                            status: "failed",
                            count: counts.failed,
                        },
                    ];
                    output::print_list(&rows, format)?;
                    output::print_detail("Total", &counts.total().to_string());
                }
                _ => output::print_item(&counts, format)?,
            }
        }

        JobsCommands::Flush { queue, status } => {
            if !status.is_terminal() {
                bail!("only success or failed jobs can be flushed");
            }
            let deleted = repository.delete_by_status(Some(&queue), status).await?;
            output::print_success(&format!("Deleted {} {} jobs from '{}'", deleted, status, queue));
        }

        JobsCommands::RetryFailed { queue } => {
            let outcome = ctx.dispatcher().failed(queue).run().await?;
            match (format, &outcome) {
                (OutputFormat::Table, DispatchOutcome::Completed(report)) if report.requeued == 0 => {
                    output::print_warning(&format!("No failed jobs with retries left in '{}'", report.queue));
                }
                (OutputFormat::Table, _) => output::print_success(&outcome.to_string()),
                _ => output::print_item(&outcome, format)?,
            }
        }
    }

    Ok(())
}
