use anyhow::{Context, Result};
use bonjour_core::{AppConfig, LogFormat, LoggingConfig, ResolveStrategy};
use bonjour_discovery::{ScanOptions, ScanResult, Scanner};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// bonjour-scan - Discover and resolve DNS-SD services on the local network
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "BONJOUR_CONFIG")]
    config: Option<PathBuf>,

    /// Service type to browse for (e.g. _ipp._tcp)
    #[arg(short = 't', long = "type", global = true)]
    service_type: Option<String>,

    /// Browse domain
    #[arg(short, long, global = true)]
    domain: Option<String>,

    /// Per-service resolution timeout in milliseconds
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Resolve one service at a time
    #[arg(long, global = true)]
    serialized: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Scan for a fixed time and print the resolved services as JSON
    Scan {
        /// Scan duration in seconds
        #[arg(long)]
        duration: Option<u64>,
    },

    /// Print every change until interrupted
    Watch,
}

/// One line of `watch` output
#[derive(Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
enum WatchEvent<'a> {
    Results {
        at: String,
        results: &'a [ScanResult],
    },
    State {
        at: String,
        scanning: bool,
    },
    Failure {
        at: String,
        failure: String,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    // Logs go to stderr; stdout carries the JSON output
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = match logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
}

fn emit(event: &WatchEvent<'_>) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => tracing::error!(error = %e, "Failed to encode event"),
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(args.config.as_ref()).context("Failed to load configuration")?;
    if let Some(service_type) = args.service_type {
        config.scan.service_type = service_type;
    }
    if let Some(domain) = args.domain {
        config.scan.domain = domain;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.scan.address_resolve_timeout_ms = timeout_ms;
    }
    if args.serialized {
        config.scan.resolve_strategy = ResolveStrategy::Serialized;
    }
    if let Command::Scan {
        duration: Some(secs),
    } = args.command
    {
        config.scan.scan_duration_secs = secs;
    }
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.logging);

    let scan = config.scan.clone();
    let scanner = Scanner::with_mdns(scan.clone()).context("Failed to create scanner")?;
    let options = ScanOptions::default().with_address_resolve_timeout_ms(scan.address_resolve_timeout_ms);

    info!(
        service_type = %scan.service_type,
        domain = %scan.domain,
        strategy = scan.resolve_strategy.description(),
        "Starting bonjour-scan"
    );

    match args.command {
        Command::Scan { .. } => {
            let results = scanner
                .scan_for(scan.scan_duration(), &scan.service_type, &scan.domain, options)
                .await
                .context("Scan failed")?;

            let output = serde_json::to_string_pretty(&results).context("Failed to encode results")?;
            println!("{}", output);
        }
        Command::Watch => {
            let _results = scanner.listen_for_scan_results(|results: &[ScanResult]| {
                emit(&WatchEvent::Results { at: now(), results });
            });
            let _state = scanner.listen_for_scan_state(|scanning: bool| {
                emit(&WatchEvent::State { at: now(), scanning });
            });
            let _failures = scanner.listen_for_scan_fail(|failure| {
                emit(&WatchEvent::Failure {
                    at: now(),
                    failure: failure.to_string(),
                });
            });

            scanner
                .scan(&scan.service_type, &scan.domain, options)
                .context("Failed to start scanning")?;

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;

            info!("Interrupted, stopping");
            scanner.stop();
            scanner.flush().await;
        }
    }

    Ok(())
}
