//! chaintrace CLI: index a supply-chain contract and serve its read API.
//!
//! Usage:
//! ```bash
//! # Backfill, follow new blocks, serve HTTP on :3001
//! CONTRACT_ADDRESS=0x5fbd... chaintrace run
//!
//! # One bounded pass, then exit
//! chaintrace backfill --to 5000
//!
//! chaintrace status
//! chaintrace info
//! ```

mod config;
mod logging;
mod server;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, warn, Instrument};

use chaintrace_core::indexer::IndexerConfig;
use chaintrace_core::query::QueryEngine;
use chaintrace_core::store::{ProjectionReader, ProjectionStore};
use chaintrace_evm::{ChainScanner, IndexerBuilder, JsonRpcLedger, SchemaRegistry};

use config::IndexerArgs;
use logging::LogConfig;
use server::{AppState, StatsBody};

type Scanner = ChainScanner<JsonRpcLedger, dyn ProjectionStore>;

/// ChainTrace: supply-chain event indexer.
#[derive(Parser, Debug)]
#[command(name = "chaintrace")]
#[command(about = "Index supply-chain contract events and serve provenance queries")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Per-component level override, `component=level`. Repeatable.
    #[arg(long = "log", global = true)]
    log_components: Vec<String>,

    /// Enable JSON log output.
    #[arg(long, env = "JSON_LOGS", global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Backfill, follow new blocks and serve the HTTP API (default).
    Run(RunArgs),
    /// Run one bounded backfill pass and exit.
    Backfill {
        #[command(flatten)]
        indexer: IndexerArgs,
        /// Stop after this height (defaults to the chain head).
        #[arg(long)]
        to: Option<u64>,
    },
    /// Print the persisted cursor and counters.
    Status {
        #[command(flatten)]
        indexer: IndexerArgs,
    },
    /// Show defaults and the recognised events.
    Info,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    indexer: IndexerArgs,

    /// HTTP API bind address.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// HTTP API port.
    #[arg(long, env = "PORT", default_value = "3001")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(&LogConfig::from_flags(
        &cli.log_level,
        cli.json_logs,
        &cli.log_components,
    ));

    let command = cli
        .command
        .unwrap_or_else(|| Command::Run(RunArgs::parse_from(["run"])));

    match command {
        Command::Run(args) => cmd_run(args).await,
        Command::Backfill { indexer, to } => cmd_backfill(indexer, to).await,
        Command::Status { indexer } => cmd_status(indexer).await,
        Command::Info => {
            cmd_info();
            Ok(())
        }
    }
}

/// Build the scanner and return it with the store it writes to.
async fn build_scanner(args: &IndexerArgs) -> Result<(Arc<Scanner>, Arc<dyn ProjectionStore>)> {
    let config = args.indexer_config()?;
    if config.watched_contracts.is_empty() {
        warn!("no contract address configured; every transaction will be examined");
    }
    debug!(rpc_url = %args.rpc_url, db_path = %args.db_path, storage = ?args.storage, "endpoints");

    let store = args.open_store().await?;
    let poll_interval = Duration::from_millis(config.poll_interval_ms.max(1));
    let builder = IndexerBuilder::from_config(config);
    let ledger = JsonRpcLedger::new(args.rpc_url.as_str())
        .context("Failed to create JSON-RPC client")?
        .with_retry(builder.retry_policy())
        .with_poll_interval(poll_interval);

    let scanner = builder.build(Arc::new(ledger), store.clone());
    Ok((Arc::new(scanner), store))
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    info!("🚀 Starting ChainTrace");
    let (scanner, store) = build_scanner(&args.indexer).await?;
    let state = AppState::new(store, scanner.status());

    let listener = TcpListener::bind((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", args.host, args.port))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut http_shutdown_rx = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(
        async move {
            let shutdown = async move {
                while !*http_shutdown_rx.borrow() {
                    if http_shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            };
            if let Err(e) = server::serve(listener, state, shutdown).await {
                error!(error = %e, "❌ HTTP server error");
            }
            debug!("HTTP server stopped");
        }
        .instrument(info_span!("http")),
    );

    let indexer_shutdown_tx = shutdown_tx.clone();
    let indexer_handle = tokio::spawn(
        async move {
            let result = scanner.run(shutdown_rx).await;
            if result.is_err() {
                // Fatal to the process: take the HTTP server down too.
                let _ = indexer_shutdown_tx.send(true);
            }
            result
        }
        .instrument(info_span!("indexer")),
    );

    info!("✅ ChainTrace ready");
    info!("   🌐 API:  http://localhost:{}/api", args.port);
    info!("   Press Ctrl+C to stop");

    let mut fatal_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = fatal_rx.wait_for(|stop| *stop) => {}
    }

    info!("🛑 Shutting down...");
    let _ = shutdown_tx.send(true);

    let outcome = match tokio::time::timeout(Duration::from_secs(30), indexer_handle).await {
        Ok(Ok(Ok(()))) => {
            debug!("Indexer stopped");
            Ok(())
        }
        Ok(Ok(Err(e))) => Err(anyhow!(e).context("Indexer failed")),
        Ok(Err(e)) => Err(anyhow!(e).context("Indexer task panicked")),
        Err(_) => {
            warn!("⚠️  Indexer shutdown timed out");
            Ok(())
        }
    };

    match tokio::time::timeout(Duration::from_secs(10), http_handle).await {
        Ok(_) => debug!("HTTP server stopped"),
        Err(_) => warn!("⚠️  HTTP server shutdown timed out"),
    }

    info!("🛑 Shutdown complete");
    outcome
}

async fn cmd_backfill(args: IndexerArgs, to: Option<u64>) -> Result<()> {
    let (scanner, _store) = build_scanner(&args).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let report = scanner
        .backfill_until(to, &shutdown_rx)
        .await
        .context("Backfill failed")?;

    println!("Backfill {}..={}", report.from, report.target);
    println!("  Blocks committed: {}", report.committed);
    println!("  Events decoded:   {}", report.events);
    match report.cursor {
        Some(c) => println!("  Cursor:           {c}"),
        None => println!("  Cursor:           (empty)"),
    }
    if report.interrupted {
        println!("  Interrupted before reaching the target");
    }
    if let Some(height) = report.halted_at {
        bail!(
            "backfill halted at block {height}: {}",
            report.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn cmd_status(args: IndexerArgs) -> Result<()> {
    let store = args.open_store().await?;
    let query = QueryEngine::new(store);
    let cursor = query
        .reader()
        .cursor()
        .await
        .context("Failed to read cursor")?;
    let stats = StatsBody::from(query.stats().await);

    let body = serde_json::json!({
        "cursor": cursor,
        "stats": stats,
    });
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn cmd_info() {
    let defaults = IndexerConfig::default();
    println!("ChainTrace v{}", env!("CARGO_PKG_VERSION"));
    println!("  Default RPC URL: http://localhost:8545");
    println!("  Default start block: {}", defaults.start_block);
    println!("  Default progress log: every {} blocks", defaults.progress_interval);
    println!("  Default head poll interval: {} ms", defaults.poll_interval_ms);
    println!(
        "  Default RPC retries: {} (initial backoff {} ms)",
        defaults.rpc_max_retries, defaults.rpc_backoff_ms
    );
    println!("  Storage backends: SQLite (default, ./observer.db), memory");
    println!("  Events:");
    for schema in SchemaRegistry::supply_chain().iter() {
        println!("    {:<12} {}", schema.name, schema.topic0());
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
