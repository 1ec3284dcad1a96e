use std::time::Duration;

use anyhow::Context;
use gridstore::{Config, GridStorage};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::stresstest::perform_stresstest;
use crate::workload::Workload;

mod stresstest;
mod workload;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // set `STRESSTEST_SEED` to replay a previous run
    let seed: u64 = match std::env::var("STRESSTEST_SEED") {
        Ok(seed) => seed.parse().context("STRESSTEST_SEED must be a u64")?,
        Err(_) => rand::random(),
    };

    let dir = tempfile::tempdir()?;
    info!(seed, path = %dir.path().display(), "Starting stress test");
    let keyspace = fjall::Config::new(dir.path()).open_transactional()?;
    let storage = GridStorage::with_keyspace(&keyspace, Config::default())?;

    let attachments = Workload::builder("attachments")
        .seed(seed)
        .concurrency(16)
        .size_distribution(16 * 1024, 1024 * 1024) // p50 = 16K, p99 = 1M
        .action_weights(40, 30, 20, 10)
        .build()?;
    let large_files = Workload::builder("large files")
        .seed(seed.wrapping_add(1))
        .concurrency(4)
        .size_distribution(2 * 1024 * 1024, 32 * 1024 * 1024)
        .action_weights(50, 10, 30, 10)
        .build()?;

    perform_stresstest(
        &storage,
        vec![attachments, large_files],
        Duration::from_secs(5),
    )
}
