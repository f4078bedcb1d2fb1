use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use linetrip::{
    ConfigFile, ConfigSource, Dispatcher, EngineOptions, EngineState, FileRegistry, MailNotifier,
    ProcessRunner, WatchManager,
};

/// Watches log directories and fires actions when trigger strings appear.
#[derive(Debug, Parser)]
#[command(name = "linetrip", version)]
struct Args {
    /// Configuration file; watched for changes while running.
    #[arg(long, short, default_value = "linetrip.toml")]
    config: PathBuf,

    /// Directory holding the commands profiles may run.
    /// Defaults to `commands` next to the configuration file.
    #[arg(long)]
    command_dir: Option<PathBuf>,

    /// Log filter, used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
        )
        .init();

    let source = Arc::new(ConfigFile::new(&args.config));
    let config = match source.load_validated() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let command_dir = args.command_dir.unwrap_or_else(|| {
        args.config
            .parent()
            .map(|dir| dir.join("commands"))
            .unwrap_or_else(|| PathBuf::from("commands"))
    });

    let dispatcher = Dispatcher::new(
        Arc::new(MailNotifier::new()),
        Arc::new(ProcessRunner::new(command_dir)),
    );
    let manager = WatchManager::new(
        source,
        Arc::new(dispatcher),
        FileRegistry::new(),
        EngineOptions::default(),
    );

    if let Err(e) = manager.start(config) {
        error!(error = %e, "Failed to start log scanner");
        return ExitCode::FAILURE;
    }

    let mut state = manager.subscribe();
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown requested");
        }
        _ = state.wait_for(|s| *s == EngineState::Stopped) => {
            error!("Log scanner stopped itself");
            return ExitCode::FAILURE;
        }
    }

    manager.stop();
    info!("Log scanner stopped");
    ExitCode::SUCCESS
}
