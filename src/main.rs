use std::io;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pmm::config::Config;
use pmm::{CancelToken, Daemon};

/// Build performance models of the routines listed in a configuration file.
#[derive(Debug, Parser)]
#[clap(name = "pmmd", version)]
struct Opts {
    /// Configuration file.
    #[clap(short = 'c', long, default_value = "pmmd.json")]
    config: PathBuf,

    /// Exit once every model is complete instead of idling.
    #[clap(short = 'b', long)]
    build_only: bool,

    /// Log level, used unless RUST_LOG is set.
    #[clap(long, default_value = "info")]
    log_level: String,
}

fn run(opts: Opts) -> Result<()> {
    let mut config = Config::load(&opts.config)
        .with_context(|| format!("cannot load configuration from {}", opts.config.display()))?;
    config.build_only |= opts.build_only;

    let quit = CancelToken::new();
    let q = quit.clone();
    ctrlc::set_handler(move || q.cancel()).context("Error setting termination handler")?;

    let daemon = Daemon::from_config(&config, quit).context("cannot set up routines")?;
    let routines = daemon.run()?;
    let complete = routines.iter().filter(|r| r.is_complete()).count();
    info!(complete, total = routines.len(), "exiting");
    Ok(())
}

fn main() {
    let opts = Opts::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&opts.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run(opts) {
        eprintln!("error: {:#}", e);
        process::exit(1);
    }
}
