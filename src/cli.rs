use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Maintenance interface for a pkgswarm node. The download engine itself is
/// driven by the embedding proxy; these commands inspect and tidy the state
/// it leaves on disk.
#[derive(Debug, Parser)]
#[command(name = "pkgswarm", about = "P2P package distribution cache", version)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// List downloads still pending in the resume store
    Pending,

    /// Remove stale unfinished downloads from the resume store
    Cleanup {
        /// Age threshold in hours; defaults to the configured max age
        #[arg(long)]
        max_age_hours: Option<u64>,
    },

    /// Print the effective configuration as TOML
    Config,

    /// Show the most recent audit events
    AuditTail {
        /// Number of events to show
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
    },
}
