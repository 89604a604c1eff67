//! Model Export - Command line entry point

use anyhow::{Context, Result};
use clap::Parser;
use model_export::{DataFormatVersion, ExportOptions, Exporter, config::ExporterConfig, metrics};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Bytes between two progress log lines
const PROGRESS_LOG_STEP: u64 = 8 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "model-export")]
#[command(about = "Lock a server model and export it to one artifact", long_about = None)]
#[command(version)]
struct Cli {
    /// Model server host name
    #[arg(short, long)]
    server: String,

    /// Logical model path, e.g. "|ProjectA|Sub|model.ext"
    #[arg(short, long)]
    model: String,

    /// Destination file of the exported artifact
    #[arg(short, long)]
    output: PathBuf,

    /// Data format version of the artifact (latest, v2, v1)
    #[arg(long, default_value = "latest")]
    format_version: DataFormatVersion,

    /// Server version hint used to pick contract libraries
    #[arg(long)]
    server_version: Option<String>,

    /// Directory holding contract manifests
    #[arg(long)]
    contracts_dir: Option<PathBuf>,

    /// Replace an existing destination
    #[arg(long)]
    overwrite: bool,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "json")]
    log_format: String,

    /// Print Prometheus metrics to stderr when done
    #[arg(long)]
    print_metrics: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the artifact path
    match cli.log_format.as_str() {
        "pretty" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .json()
                .init();
        }
    }

    tracing::info!("Starting Model Export");

    let config = ExporterConfig::load(cli.config).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    tracing::info!(
        client_name = %config.client_name,
        contracts_dir = ?config.contracts_dir,
        chunk_size = config.chunk_size,
        lock_options = config.lock.options.bits(),
        "Configuration loaded"
    );

    let prometheus_handle = metrics::setup_metrics().context("Failed to set up metrics")?;

    let options = ExportOptions {
        format_version: cli.format_version,
        server_version: cli.server_version,
        contracts_dir: cli.contracts_dir,
        overwrite: cli.overwrite,
        ..ExportOptions::new(cli.server, cli.model, cli.output)
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    let logged = AtomicU64::new(0);
    let progress = |bytes: u64| {
        let last = logged.load(Ordering::Relaxed);
        if bytes >= last + PROGRESS_LOG_STEP {
            logged.store(bytes, Ordering::Relaxed);
            tracing::info!(bytes, "Download progress");
        }
    };

    let exporter = Exporter::new(config);
    let result = exporter.export(&options, &progress, &cancel).await;

    if cli.print_metrics {
        eprintln!("{}", prometheus_handle.render());
    }

    match result {
        Ok(path) => {
            println!("{}", path.display());
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("model-export: {}", e);
            if let Some(detail) = e.remote_detail() {
                eprintln!("server detail: {}", detail);
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, cancelling export");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM signal, cancelling export");
        },
    }
}
