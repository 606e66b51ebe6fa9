//! zfs-replicate - Main entry point
//!
//! Replicates the local ZFS tree to the remote host once, then exits.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use zfs_replicator::lock::RunLock;
use zfs_replicator::replicator::run_with_session;
use zfs_replicator::transfer::SuccessPolicy;
use zfs_replicator::{utils, Parameters, ReplicationError, Replicator};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the parameters file (INI or TOML)
    #[arg(short, long, value_name = "FILE", default_value = "parameters.ini")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Check each pipeline stage's exit status and the received snapshot
    #[arg(long)]
    strict: bool,

    /// Show what would be transferred without transferring anything
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            let code = e
                .downcast_ref::<ReplicationError>()
                .map(ReplicationError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    // Load configuration
    let params = match Parameters::from_file(&args.config) {
        Ok(params) => params,
        Err(e) => {
            let _ = utils::logger::init(args.log_level.as_deref().unwrap_or("info"));
            return Err(e.into());
        }
    };

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&params.log_level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting zfs-replicate v{} ({} -> {}:{})",
        env!("CARGO_PKG_VERSION"),
        params.zfs_local_path,
        params.ssh_host,
        params.zfs_distant_path
    );

    let _lock = RunLock::acquire(&params.lock_file)?;

    let mut replicator = Replicator::new(&params).with_dry_run(args.dry_run);
    if args.strict {
        replicator = replicator.with_policy(SuccessPolicy::StrictExitStatus);
    }

    // SSH work is blocking
    let summary =
        tokio::task::spawn_blocking(move || run_with_session(&params, &replicator)).await??;

    if summary.failed > 0 {
        tracing::warn!(
            failed = summary.failed,
            volumes = ?summary.failed_volumes,
            "Some volumes were not replicated this cycle"
        );
    }
    Ok(())
}
