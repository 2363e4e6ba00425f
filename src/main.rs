//! zk-collector - site agent that captures punches from ZKTeco devices and
//! forwards them to an HTTP backend.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{info, warn};

use zk_collector::config::{AppConfig, ConfigLoadResult, LogConfig};
use zk_collector::service::CollectorService;
use zk_collector::startup;

#[derive(Parser, Debug)]
#[command(name = "zk-collector", version, about = "ZKTeco attendance collector agent")]
struct Cli {
    /// Start quietly (accepted for service managers; the agent is headless)
    #[arg(long)]
    minimized: bool,

    /// Register the collector as a Windows service
    #[arg(long)]
    install_service: bool,

    /// Remove the Windows service registration
    #[arg(long)]
    uninstall_service: bool,

    /// Launch the collector at user logon
    #[arg(long)]
    enable_autostart: bool,

    /// Remove the logon launch entry
    #[arg(long)]
    disable_autostart: bool,

    /// Path to configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // one-shot administration flags run and exit before anything else
    if cli.install_service {
        return finish(startup::install_service());
    }
    if cli.uninstall_service {
        return finish(startup::uninstall_service());
    }
    if cli.enable_autostart {
        return finish(startup::enable_auto_start());
    }
    if cli.disable_autostart {
        return finish(startup::disable_auto_start());
    }

    let config_path = cli.config.unwrap_or_else(AppConfig::default_path);
    let config = match AppConfig::try_load(&config_path) {
        ConfigLoadResult::Loaded(config) => config,
        ConfigLoadResult::Missing => AppConfig::default(),
        ConfigLoadResult::Invalid(e) => {
            eprintln!("invalid configuration at {}: {e}", config_path.display());
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = init_logging(&config.log);
    info!("zk-collector {} starting", env!("CARGO_PKG_VERSION"));
    info!("config path: {}", config_path.display());
    if cli.minimized {
        info!("running in background mode");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(CollectorService::new(config).run()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("collector failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn finish(result: zk_collector::Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Console plus daily-rolling file logging. The returned guard flushes the
/// file writer on drop.
fn init_logging(config: &LogConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
    let stdout_layer = tracing_subscriber::fmt::layer();

    match std::fs::create_dir_all(&config.directory) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(&config.directory, "zk-collector.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        Err(e) => {
            tracing_subscriber::registry().with(filter).with(stdout_layer).init();
            warn!("log directory unavailable ({e}); console logging only");
            None
        }
    }
}
