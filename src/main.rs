//! Binary entry point (C14).
//!
//! Intentionally thin: parse a config path, load and validate it, install
//! logging, build the orchestrator, start it, and wait for a shutdown
//! signal. No HTTP serving, no routing, no simulator logic - those are
//! external collaborators (§1).

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use daq_ingest::config::AppConfig;
use daq_ingest::storage::DemoStore;
use daq_ingest::Orchestrator;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "daq-ingestd", version, about = "Industrial data-acquisition ingest pipeline")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let config = match AppConfig::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration from {:?}: {e}", args.config);
            std::process::exit(1);
        }
    };

    if !config.demo_mode {
        eprintln!("no production TimeSeriesStore is bundled with this crate (the database is an external collaborator); re-run with demo_mode = true to exercise the pipeline against a logging-only store");
        std::process::exit(1);
    }

    let store = Arc::new(DemoStore::new());
    let mut orchestrator = match Orchestrator::new(config, store).await {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            eprintln!("failed to initialize ingest pipeline: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = orchestrator.start().await {
        eprintln!("failed to start ingest pipeline: {e}");
        std::process::exit(1);
    }

    tracing::info!("daq-ingestd running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl_c");

    orchestrator.stop().await;
}
