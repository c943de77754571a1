//! Worker daemon control commands.
//!
//! Each command rewrites the queue's control record; stop and restart wait
//! for the daemon to acknowledge.

use anyhow::Result;
use clap::Subcommand;
use serde::Serialize;
use tabled::Tabled;

use taskq_core::jobs::WorkerStatusReport;
use taskq_core::QueueError;

use crate::context::CliContext;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum WorkerCommands {
    /// Show the recorded daemon state
    Status {
        #[arg(short, long)]
        queue: String,
    },

    /// Stop the daemon and wait until it exits
    Stop {
        #[arg(short, long)]
        queue: String,
    },

    /// Restart the daemon's children and wait for the acknowledgement
    Restart {
        #[arg(short, long)]
        queue: String,
    },

    /// Stop dispatching without stopping the daemon
    Pause {
        #[arg(short, long)]
        queue: String,
    },

    /// Resume a paused daemon
    Resume {
        #[arg(short, long)]
        queue: String,
    },
}

#[derive(Serialize, Tabled)]
struct StatusRow {
    #[tabled(rename = "Queue")]
    queue: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "PID")]
    pid: String,
    #[tabled(rename = "Alive")]
    alive: bool,
    #[tabled(rename = "Last Seen")]
    last_seen: String,
}

impl From<&WorkerStatusReport> for StatusRow {
    fn from(report: &WorkerStatusReport) -> Self {
        Self {
            queue: report.queue.clone(),
            status: report.status.to_string(),
            pid: report.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            alive: report.alive,
            last_seen: report
                .last_seen
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "-".into()),
        }
    }
}

pub async fn execute(cmd: WorkerCommands, ctx: &CliContext, format: OutputFormat) -> Result<()> {
    let control = ctx.worker_control();

    let (queue, action, done) = match cmd {
        WorkerCommands::Status { queue } => {
            let report = control.status(&queue).await?;
            return match format {
                OutputFormat::Table => output::print_list(&[StatusRow::from(&report)], format),
                _ => output::print_item(&report, format),
            };
        }
        WorkerCommands::Stop { queue } => {
            let done = control.stop(&queue).await?;
            (queue, "stopped", done)
        }
        WorkerCommands::Restart { queue } => {
            let done = control.restart(&queue).await?;
            (queue, "restarted", done)
        }
        WorkerCommands::Pause { queue } => {
            let done = control.pause(&queue).await?;
            (queue, "paused", done)
        }
        WorkerCommands::Resume { queue } => {
            let done = control.resume(&queue).await?;
            (queue, "resumed", done)
        }
    };

    if !done {
        return Err(QueueError::worker_not_running(&queue).into());
    }
    output::print_success(&format!("Worker for queue '{}' {}", queue, action));
    Ok(())
}
