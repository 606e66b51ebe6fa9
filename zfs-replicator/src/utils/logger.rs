//! Log output for a replication run.
//!
//! `RUST_LOG` wins over the configured level so a single run can be traced
//! without touching the parameters file.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Level used when the configured one does not parse.
const FALLBACK_LEVEL: &str = "info";

pub fn init(level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_for(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()?;

    Ok(())
}

/// Filter for a configured level such as `debug` or `zfs_replicator=trace`.
fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_new(level.trim()).unwrap_or_else(|_| EnvFilter::new(FALLBACK_LEVEL))
}
