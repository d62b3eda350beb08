//! SLUICE Engine
//!
//! Boots one control-plane replica over in-memory collaborators and runs the
//! background monitors until interrupted.

#![warn(missing_docs)]
#![warn(clippy::all)]

use anyhow::{Context, Result};
use clap::Parser;
use sluice_engine::{Collaborators, ControlPlane, ControlPlaneConfig};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sluice-engine")]
#[command(about = "SLUICE pipeline control plane replica", long_about = None)]
struct Args {
    /// JSON configuration file; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, overrides RUST_LOG
    #[arg(long)]
    log_filter: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_logging(args: &Args) -> Result<()> {
    let filter = match &args.log_filter {
        Some(directives) => EnvFilter::try_new(directives).context("invalid --log-filter")?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sluice=info")),
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if args.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = match &args.config {
        Some(path) => ControlPlaneConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ControlPlaneConfig::default(),
    };

    let plane = ControlPlane::new(config, Collaborators::in_memory())?;
    let monitors = plane.start().await?;
    tracing::info!(monitors, "Replica running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    plane.stop().await;
    Ok(())
}
