use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use pinger::args::Args;
use pinger::resolve::resolve;
use pinger::{Interrupt, ProbeConfig, run_probe};

/// Probes one host with ICMP echo requests.
/// Raw sockets need root (or CAP_NET_RAW on Linux).
fn main() -> Result<ExitCode> {
    let args = Args::parse();
    args.validate()?;

    // Diagnostics go to stderr, stdout carries the report
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    // Installed first so an early Ctrl+C still ends with a summary
    let interrupt = Interrupt::install()?;

    let destination = resolve(&args.target, args.preference())
        .with_context(|| format!("failed to resolve {}", args.target))?;

    let config = ProbeConfig::new(&args, destination);
    Ok(run_probe(&config, interrupt))
}
