// SPDX-License-Identifier: Apache-2.0
// Copyright Arbor Project Authors

//! `arbord`: the cluster node daemon.

use clap::Parser;
use config::{DaemonConfig, Properties};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "arbord")]
#[command(about = "Hierarchical kernel scheduler daemon", long_about = None)]
struct Args {
    /// Configuration file with key=value lines.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Individual key=value overrides, applied after the file.
    #[arg(value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_names(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn load_config(args: &Args) -> Result<DaemonConfig, config::ConfigError> {
    let mut props = match &args.config {
        Some(path) => Properties::load(path)?,
        None => Properties::new(),
    };
    for token in &args.overrides {
        props.apply_token(token)?;
    }
    DaemonConfig::from_properties(&props)
}

fn main() {
    init_logging();
    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("bad configuration: {e}");
            std::process::exit(1);
        }
    };
    info!("starting daemon on port {}", config.port);
    match daemon::run(&config) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("daemon failed: {e}");
            std::process::exit(1);
        }
    }
}
