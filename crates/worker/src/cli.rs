//! Command line interface.
//!
//! The backends are in-memory, so all four workers always run together in
//! one process, one thread each.

use clap::Parser;

/// Job lifecycle and storage-tier workers.
#[derive(Debug, Parser)]
#[command(name = "strata-worker", version, about)]
pub struct Cli {
    /// Submit this many demo jobs (alternating account classes) at startup.
    #[arg(long, default_value_t = 0)]
    pub seed_jobs: usize,

    /// Upgrade the standard-class owners of the seeded jobs after this many
    /// seconds, which requests a restore of their archived results.
    #[arg(long)]
    pub restore_after: Option<u64>,

    /// Stop this many seconds after startup instead of running until killed.
    #[arg(long)]
    pub run_for: Option<u64>,

    /// Seconds between simulated archive-tier retrieval completions.
    #[arg(long, default_value_t = 5)]
    pub archive_tick: u64,
}
