//! debounced - keyed debounce timer service

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod cmd;
mod oneshot;
mod settings;

/// Debounced - coalesce bursts of keyed events into one delayed callback
#[derive(Parser)]
#[command(name = "debounced")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/debounced/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Socket path, overriding config and DEBOUNCED_SOCKET
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Wait interval in seconds, overriding config and DEBOUNCED_TIMEOUT
    #[arg(long, global = true)]
    timeout: Option<f64>,

    /// Log filter, e.g. "info" or "debounce_service=trace" (RUST_LOG wins when set)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the timer service until SIGTERM or SIGINT
    Serve,
    /// Cancel every pending timer on a running service
    Reset,
    /// Report whether a service is running
    ///
    /// Reads the lock and socket files only; nothing is sent to the service.
    Status {
        /// Also connect to learn whether a client is attached. When none is,
        /// the service adopts this connection for a moment, and any timer
        /// firing meanwhile is delivered here and lost.
        #[arg(long)]
        check_client: bool,
    },
    /// Print the resolved configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_logging(&cli.log_level, cli.log_file.as_deref())?;

    let overrides = settings::Overrides {
        config_file: cli.config,
        socket: cli.socket,
        timeout: cli.timeout,
    };
    let resolved = settings::resolve(&overrides, |key| std::env::var(key).ok())?;

    match cli.command {
        Commands::Serve => cmd::serve::run(resolved.config).await,
        Commands::Reset => cmd::reset::run(&resolved.config).await,
        Commands::Status { check_client } => cmd::status::run(&resolved.config, check_client).await,
        Commands::Config => cmd::config::run(&resolved),
    }
}

/// Install the global subscriber
///
/// The returned guard flushes the file writer and must live until exit.
fn init_logging(level: &str, log_file: Option<&std::path::Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let Some(path) = log_file else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
    let file_name = path
        .file_name()
        .with_context(|| format!("Log file path has no file name: {}", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
    Ok(Some(guard))
}
