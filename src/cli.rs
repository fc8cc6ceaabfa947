use clap::{Parser, Subcommand};
use std::net::SocketAddr;

#[derive(Parser, Debug)]
#[command(name = "pixelift")]
#[command(about = "PixeLift image-restoration control plane", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the control plane: HTTP API, worker pool, schedulers
    Api(ApiArgs),

    /// Run only the worker pool and queue maintenance
    Worker,

    /// Operator tooling for jobs and the dead-letter archive. Opens the
    /// data directory directly; stop the service first.
    Jobs {
        #[command(subcommand)]
        command: JobsCommand,
    },
}

#[derive(clap::Args, Debug)]
pub struct ApiArgs {
    /// Override the configured bind address
    #[arg(long)]
    pub address: Option<SocketAddr>,

    /// Serve HTTP only, without the embedded worker pool
    #[arg(long, default_value_t = false)]
    pub no_workers: bool,
}

#[derive(Subcommand, Debug)]
pub enum JobsCommand {
    /// Print queue, record, and dead-letter state for one job
    Status { id: String },

    /// Print queue counters
    QueueStats,

    /// Dead-letter inspection and replay
    Replay {
        #[command(subcommand)]
        command: ReplayCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ReplayCommand {
    /// List archived dead-letter entries
    List {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Archive totals and age
    Stats,

    /// Replay one entry by job id
    Replay {
        id: String,
        #[arg(long, default_value = "operator")]
        operator: String,
        #[arg(long, default_value = "manual replay")]
        reason: String,
        /// Override the attempt budget for the replayed task
        #[arg(long)]
        attempts: Option<u32>,
    },

    /// Replay every archived entry
    ReplayAll {
        #[arg(long, default_value = "operator")]
        operator: String,
        #[arg(long, default_value = "bulk replay")]
        reason: String,
    },

    /// Replay all entries belonging to one user
    ReplayUser {
        user_id: String,
        #[arg(long, default_value = "operator")]
        operator: String,
        #[arg(long, default_value = "bulk replay")]
        reason: String,
    },

    /// Drop entries past the retention window
    Cleanup {
        /// Retention in days; defaults to the configured window
        #[arg(long)]
        days: Option<u32>,
    },
}
