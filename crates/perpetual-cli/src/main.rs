//! Perpetual CLI entry point

use clap::Parser;
use perpetual_core::Scheduler;
use tokio::runtime::{Builder, Runtime};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use perpetual_cli::{
    cli::Cli,
    commands::CommandDispatcher,
    config::CliAppConfig,
    error::{CliError, Result},
};

fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Load configuration: defaults < file < env < command line
    let config = CliAppConfig::load_with_overrides(&cli)?;

    // Initialize logging
    setup_logging(config.cli.verbose);

    // One shared runtime backs every worker, timer and socket
    let runtime = build_runtime(config.runtime.worker_threads)?;
    let scheduler = Scheduler::new(runtime.handle().clone());
    info!(
        channel = %config.channel.name,
        address = %cli.command.url(),
        "Starting perpetual channel"
    );

    if let Err(e) = runtime.block_on(CommandDispatcher::execute(cli, config, scheduler)) {
        error!("Command execution failed: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

/// Setup logging based on verbosity level; `RUST_LOG` takes precedence
fn setup_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // stdout carries messages, logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn build_runtime(worker_threads: usize) -> Result<Runtime> {
    let mut builder = Builder::new_multi_thread();
    builder.enable_all().thread_name("perpetual-worker");
    if worker_threads > 0 {
        builder.worker_threads(worker_threads);
    }
    builder
        .build()
        .map_err(|e| CliError::Runtime(format!("Failed to start runtime: {}", e)))
}
