//! model-copy CLI - copy models between local stores and inference servers.

use clap::{Parser, Subcommand};
use model_copy::{
    Config, CopyError, CopyEvent, CopyRequest, CopyResult, ModelEndpoint, TransferOrchestrator,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

/// Config file read when `--config` is not given, if it exists.
const DEFAULT_CONFIG_PATH: &str = "model-copy.yaml";

#[derive(Parser)]
#[command(name = "model-copy")]
#[command(about = "Copy models between local stores and remote inference servers")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file [default: model-copy.yaml, if present]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output JSON result to stdout
    #[arg(long)]
    output_json: bool,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Timeout in seconds for graceful shutdown after a signal (default: 30)
    #[arg(long, default_value = "30")]
    shutdown_timeout: u64,

    /// Print progress events as JSON lines to stderr
    #[arg(long)]
    progress: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a model. Plain names (`llama3:8b`) refer to the local store,
    /// `http(s)://host:port/llama3:8b` to a remote server whose API is served
    /// at the URL root
    Copy {
        /// Model to copy from
        source: String,

        /// Model to copy to
        destination: String,

        /// Bandwidth ceiling in bytes/sec per transfer leg (0 = unlimited)
        #[arg(long)]
        bandwidth_limit: Option<u64>,

        /// Maximum bytes buffered in memory when relaying between two servers
        #[arg(long)]
        max_buffer: Option<u64>,

        /// Override the local models directory
        #[arg(long)]
        models_dir: Option<PathBuf>,
    },

    /// Resolve a model's manifest and print it as JSON
    Inspect {
        /// Model to inspect (local name or server URL)
        model: String,

        /// Override the local models directory
        #[arg(long)]
        models_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.format_detailed());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), CopyError> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli.verbosity, &cli.log_format).map_err(CopyError::Config)?;

    let mut config = load_config(cli.config.as_deref())?;

    // Setup signal handling for graceful shutdown (SIGINT and SIGTERM)
    let cancel_token = setup_signal_handler(cli.shutdown_timeout)?;

    match cli.command {
        Commands::Copy {
            source,
            destination,
            bandwidth_limit,
            max_buffer,
            models_dir,
        } => {
            // Apply overrides
            if let Some(limit) = bandwidth_limit {
                config.transfer.bandwidth_limit = limit;
            }
            if let Some(max) = max_buffer {
                config.transfer.max_buffered_bytes = Some(max);
            }
            if let Some(dir) = models_dir {
                config.local.models_dir = dir;
            }
            config.validate()?;
            let config = config.with_auto_tuning();

            let models_dir = config.local.models_dir.clone();
            let request = CopyRequest {
                source: ModelEndpoint::parse(&source, &models_dir)?,
                destination: ModelEndpoint::parse(&destination, &models_dir)?,
            };

            let mut orchestrator = TransferOrchestrator::new(config, cancel_token.clone())?;
            let printer = if cli.progress {
                let (tx, rx) = mpsc::channel(256);
                orchestrator = orchestrator.with_events(tx);
                Some(tokio::spawn(print_events(rx)))
            } else {
                None
            };

            let result = with_shutdown_timeout(
                orchestrator.run(&request),
                &cancel_token,
                cli.shutdown_timeout,
            )
            .await;

            // Dropping the orchestrator closes the event channel.
            drop(orchestrator);
            if let Some(printer) = printer {
                let _ = printer.await;
            }

            let result = result?;
            if cli.output_json {
                println!("{}", result.to_json()?);
            } else {
                print_summary(&result);
            }
        }

        Commands::Inspect { model, models_dir } => {
            if let Some(dir) = models_dir {
                config.local.models_dir = dir;
            }
            config.validate()?;

            let endpoint = ModelEndpoint::parse(&model, &config.local.models_dir)?;
            let orchestrator = TransferOrchestrator::new(config, cancel_token.clone())?;
            let (resolved, manifest) = with_shutdown_timeout(
                orchestrator.inspect(&endpoint),
                &cancel_token,
                cli.shutdown_timeout,
            )
            .await?;

            let output = serde_json::json!({
                "model": resolved.to_string(),
                "location": endpoint.location.to_string(),
                "total_size": manifest.total_size(),
                "manifest": manifest,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

/// Load the config file: an explicit path must exist, the default path may not.
fn load_config(path: Option<&Path>) -> Result<Config, CopyError> {
    let config = match path {
        Some(path) => {
            let config = Config::load(path)?;
            info!("Loaded configuration from {:?}", path);
            config
        }
        None => Config::load_or_default(DEFAULT_CONFIG_PATH)?,
    };
    Ok(config)
}

/// Await `work`; once cancellation is requested, give it `timeout_secs` to
/// wind down before giving up on it.
async fn with_shutdown_timeout<T>(
    work: impl Future<Output = Result<T, CopyError>>,
    cancel: &CancellationToken,
    timeout_secs: u64,
) -> Result<T, CopyError> {
    tokio::select! {
        result = work => result,
        _ = async {
            cancel.cancelled().await;
            tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
        } => {
            warn!("Shutdown timeout of {}s elapsed, abandoning copy", timeout_secs);
            Err(CopyError::Cancelled)
        }
    }
}

async fn print_events(mut rx: mpsc::Receiver<CopyEvent>) {
    while let Some(event) = rx.recv().await {
        if let Ok(line) = serde_json::to_string(&event) {
            eprintln!("{}", line);
        }
    }
}

fn print_summary(result: &CopyResult) {
    println!("\nCopy completed!");
    println!("  Run ID: {}", result.run_id);
    println!("  Source: {} ({})", result.source, result.source_model);
    println!("  Destination: {}", result.destination);
    println!("  Duration: {:.2}s", result.duration_seconds);
    println!(
        "  Layers: {} transferred, {} skipped, {} total",
        result.layers_transferred, result.layers_skipped, result.layers_total
    );
    println!(
        "  Transferred: {:.1} MiB",
        result.bytes_transferred as f64 / (1024.0 * 1024.0)
    );
}

fn setup_logging(verbosity: &str, format: &str) -> Result<(), String> {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        other => return Err(format!("unknown verbosity '{}'", other)),
    };

    // Logs go to stderr so stdout stays clean for --output-json.
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        "json" => subscriber.json().init(),
        "text" => subscriber.init(),
        other => return Err(format!("unknown log format '{}'", other)),
    }

    Ok(())
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM.
/// Returns a CancellationToken that will be cancelled when a signal is received.
#[cfg(unix)]
fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, CopyError> {
    let cancel_token = CancellationToken::new();

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let token = cancel_token.clone();

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };
        eprintln!(
            "\nReceived {}. Shutting down gracefully (timeout: {}s)...",
            name, shutdown_timeout
        );
        token.cancel();
    });

    Ok(cancel_token)
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler(shutdown_timeout: u64) -> Result<CancellationToken, CopyError> {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!(
                "\nReceived Ctrl-C. Shutting down gracefully (timeout: {}s)...",
                shutdown_timeout
            );
            token.cancel();
        }
    });

    Ok(cancel_token)
}
