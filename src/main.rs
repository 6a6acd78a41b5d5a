//! Datagate - scientific data gateway
//!
//! Command-line driver for the session pool and transaction runner. Runs a
//! single transaction when a dataset is given on the command line, otherwise
//! drops into a console loop reading one transaction per stdin line.
//!
//! Product bytes go to stdout; logs go to stderr so piped output stays clean.

// Compiler warning configuration
#![deny(unused_imports)]
#![deny(unused_mut)]
#![deny(unused_variables)]
#![warn(dead_code)]
#![warn(unused_must_use)]

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use datagate::config::Config;
use datagate::endpoints;
use datagate::errors::GatewayError;
use datagate::pool::SessionPool;
use datagate::transaction::{Product, Transaction, TransactionRunner};

/// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Dataset to retrieve once, e.g. /data/nc/fnoc1.nc. Omit for console
    /// mode.
    #[arg(short, long)]
    dataset: Option<String>,

    /// Product to retrieve
    #[arg(short, long, default_value = "dds")]
    product: Product,

    /// Constraint expression for the retrieval
    #[arg(long)]
    constraint: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Metrics port override
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose)?;

    info!("🚀 Starting datagate backend gateway");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    info!("📋 Loading configuration from: {}", args.config);
    let config = load_config(&args.config)?;
    info!(
        "🔌 Backend endpoint: {}:{} (pool capacity {})",
        config.backend.host, config.backend.port, config.pool.capacity
    );

    if config.monitoring.enable_metrics {
        let port = args.metrics_port.unwrap_or(config.monitoring.metrics_port);
        info!("📊 Starting metrics endpoint on port {}", port);
        tokio::spawn(async move {
            if let Err(e) = endpoints::endpoint_server(port).await {
                error!("Metrics endpoint error: {}", e);
            }
        });
    }

    let pool = Arc::new(SessionPool::from_config(&config));
    if !pool.configure(
        &config.backend.host,
        config.backend.port,
        config.pool.capacity,
    ) {
        anyhow::bail!("session pool rejected configuration");
    }
    let runner = TransactionRunner::new(Arc::clone(&pool));

    let outcome = match args.dataset {
        Some(dataset) => run_once(&runner, dataset, args.product, args.constraint).await,
        None => run_console(&runner).await,
    };

    info!("🛑 Draining session pool");
    pool.shutdown().await;
    info!("👋 Shutdown complete");
    outcome
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        "datagate=debug,info"
    } else {
        "datagate=info,warn,error"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr),
        )
        .init();

    Ok(())
}

/// Load configuration from file with fallback to defaults
fn load_config(path: &str) -> Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file_with_env(path)
            .with_context(|| format!("Failed to load config from {}", path))
    } else {
        warn!("Config file '{}' not found, using defaults", path);
        Ok(Config::default())
    }
}

/// Execute a single transaction and exit.
async fn run_once(
    runner: &TransactionRunner,
    dataset: String,
    product: Product,
    constraint: Option<String>,
) -> Result<()> {
    let mut tx = Transaction::new(dataset, product);
    if let Some(ce) = constraint {
        tx = tx.with_constraint(ce);
    }
    let mut stdout = tokio::io::stdout();
    match runner.run(&tx, &mut stdout).await {
        Ok(receipt) => {
            info!(
                "✅ {} delivered: {} bytes in {}ms",
                receipt.product, receipt.bytes_relayed, receipt.elapsed_ms
            );
            Ok(())
        }
        Err(e) => {
            report_gateway_error(&e);
            Err(e).context("transaction failed")
        }
    }
}

/// Console loop: one transaction per line, `<product> <dataset> [constraint]`.
async fn run_console(runner: &TransactionRunner) -> Result<()> {
    info!("⌨️  Console mode: `<product> <dataset> [constraint]` per line, ctrl-c to exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stats_interval = tokio::time::interval(Duration::from_secs(60));

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => handle_console_line(runner, line.trim()).await,
                    None => {
                        info!("stdin closed");
                        break;
                    }
                }
            }

            // Periodic statistics reporting
            _ = stats_interval.tick() => {
                let stats = runner.pool().stats();
                info!(
                    "📊 Pool: {} checked out, {} idle, {} created, {} destroyed, {} retired",
                    stats.checked_out,
                    stats.idle,
                    stats.created_total,
                    stats.destroyed_total,
                    stats.retired_total
                );
            }

            // Graceful shutdown signal
            _ = tokio::signal::ctrl_c() => {
                info!("🛑 Received shutdown signal");
                break;
            }
        }
    }
    Ok(())
}

async fn handle_console_line(runner: &TransactionRunner, line: &str) {
    if line.is_empty() {
        return;
    }
    let mut parts = line.splitn(3, char::is_whitespace);
    let product = match parts.next().unwrap_or("").parse::<Product>() {
        Ok(product) => product,
        Err(e) => {
            warn!("{}", e);
            return;
        }
    };
    let tx = if product.uses_show() {
        match parts.next() {
            Some(dataset) => Transaction::new(dataset, product),
            None => Transaction::show(product),
        }
    } else {
        let Some(dataset) = parts.next() else {
            warn!("missing dataset for {}", product);
            return;
        };
        let mut tx = Transaction::new(dataset, product);
        if let Some(ce) = parts.next() {
            tx = tx.with_constraint(ce);
        }
        tx
    };

    let mut stdout = tokio::io::stdout();
    match runner.run(&tx, &mut stdout).await {
        Ok(receipt) => info!(
            "✅ {} delivered: {} bytes in {}ms (session {})",
            receipt.product, receipt.bytes_relayed, receipt.elapsed_ms, receipt.session_id
        ),
        Err(e) => report_gateway_error(&e),
    }
}

fn report_gateway_error(e: &GatewayError) {
    match e {
        GatewayError::Fault(fault) => warn!(
            status = fault.suggested_http_status(),
            kind = %fault.kind,
            "backend fault: {}",
            fault.message
        ),
        other => error!(
            status = other.suggested_http_status(),
            "transaction failed: {}",
            other
        ),
    }
}
