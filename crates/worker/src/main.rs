mod app;
mod cli;

use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;

use strata_infra::WorkerConfig;

use crate::app::{ArchiveTicker, Backends};
use crate::cli::Cli;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let started = Instant::now();
    strata_observability::init();

    let config = WorkerConfig::from_env().context("loading worker configuration")?;
    tracing::info!(
        retention_grace_secs = config.retention_grace.as_secs(),
        batch_size = config.poll.batch_size,
        "starting strata workers"
    );

    let backends = Backends::in_memory(&config);
    let seeded = match cli.seed_jobs {
        0 => Vec::new(),
        n => app::seed_jobs(n, &config, &backends)?,
    };

    let ticker = ArchiveTicker::spawn(
        backends.archive.clone(),
        Duration::from_secs(cli.archive_tick.max(1)),
    )?;
    let workers = app::spawn_workers(&config, &backends)?;

    if let Some(secs) = cli.restore_after {
        if seeded.is_empty() {
            tracing::warn!("--restore-after has no seeded jobs to restore");
        } else {
            std::thread::sleep(Duration::from_secs(secs));
            app::request_restores(&seeded, &backends)?;
        }
    }

    match cli.run_for {
        Some(secs) => {
            let remaining = Duration::from_secs(secs).saturating_sub(started.elapsed());
            std::thread::sleep(remaining);
            tracing::info!("run time elapsed; shutting down");
            for w in workers {
                w.shutdown();
            }
            ticker.shutdown();
        }
        None => {
            for w in workers {
                w.join();
            }
        }
    }

    Ok(())
}
