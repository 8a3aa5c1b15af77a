//! Signal executor
//!
//! Turns parsed trading signals into leveraged limit orders on one or more
//! accounts, then reconciles every trade against the venue until it closes.

mod config;
mod db;
mod error;
mod exchange;
mod models;
mod simulation;
mod trading;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::AppConfig;
use crate::db::{Database, TradeStore};
use crate::exchange::{AdapterFactory, BridgeClient, ExchangeAdapter};
use crate::models::TradeSignal;
use crate::simulation::{load_price_path, paper_venue, run_simulation};
use crate::trading::{OrderPlacer, TradeMonitor};

/// Signal executor CLI.
#[derive(Parser)]
#[command(name = "signal-executor")]
#[command(about = "Place and monitor leveraged trades from parsed signals", long_about = None)]
struct Cli {
    /// JSON config file (defaults are used when omitted)
    #[arg(short, long, env = "SIGNAL_EXECUTOR_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL, overriding the config file
    #[arg(short, long)]
    database: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a signal on every routed account
    Place {
        /// Signal JSON file
        #[arg(short, long)]
        signal: PathBuf,
    },

    /// Run reconciliation loops until Ctrl+C
    ///
    /// The `simulated` paper venue is in-process only; use `simulate` to
    /// replay it over a price path.
    Monitor {
        /// Channel to monitor; pairs with the --exchange at the same position
        #[arg(long, required = true)]
        channel: Vec<String>,

        /// Exchange to monitor
        #[arg(long, required = true)]
        exchange: Vec<String>,
    },

    /// Show recent trades
    Status {
        /// Number of trades to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: i64,
    },

    /// Replay a signal over a recorded price path
    Simulate {
        /// Signal JSON file
        #[arg(short, long)]
        signal: PathBuf,

        /// Price path JSON file (array of prices)
        #[arg(short, long)]
        prices: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    if let Some(url) = cli.database {
        config.database_url = url;
    }
    let config = Arc::new(config);

    match cli.command {
        Commands::Place { signal } => {
            let signal = load_signal(&signal)?;
            let store = open_store(&config).await?;
            let placer = OrderPlacer::new(config.clone(), build_factory(&config), store);

            let outcomes = placer.place_signal(&signal).await;
            if outcomes.is_empty() {
                println!("No account selected for this signal.");
                return Ok(());
            }

            println!("\n{:<16} {:<10} {}", "ACCOUNT", "RESULT", "DETAIL");
            println!("{}", "-".repeat(72));
            for outcome in outcomes {
                match outcome.result {
                    Ok(placed) => println!(
                        "{:<16} {:<10} trade {} qty {} @ {}",
                        truncate(&outcome.account, 16),
                        "placed",
                        placed.trade_id,
                        placed.quantity,
                        placed.entry_price
                    ),
                    Err(e) if e.is_skip() => {
                        println!("{:<16} {:<10} {}", truncate(&outcome.account, 16), "skipped", e)
                    }
                    Err(e) => {
                        println!("{:<16} {:<10} {}", truncate(&outcome.account, 16), "failed", e)
                    }
                }
            }
        }

        Commands::Monitor { channel, exchange } => {
            if channel.len() != exchange.len() {
                anyhow::bail!("Each --channel needs a matching --exchange");
            }

            let factory = build_factory(&config);
            if let Some(unknown) = exchange.iter().find(|e| !factory.supports(e)) {
                anyhow::bail!("No adapter for exchange {}; add it to bridge.base_urls", unknown);
            }

            let store = open_store(&config).await?;
            let shutdown = Arc::new(AtomicBool::new(false));

            let flag = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received shutdown signal");
                    flag.store(true, Ordering::SeqCst);
                }
            });

            println!("\n=== Signal Executor Monitor ===");
            println!("Poll interval: {}ms", config.monitor.poll_interval_ms);
            let handles: Vec<_> = channel
                .into_iter()
                .zip(exchange)
                .map(|(channel, exchange)| {
                    println!("Watching: {} on {}", channel, exchange);
                    let monitor = TradeMonitor::new(channel, exchange, &config, factory.clone(), store.clone())
                        .with_shutdown(shutdown.clone());
                    tokio::spawn(monitor.run())
                })
                .collect();
            println!("\nPress Ctrl+C to stop.\n");

            for result in join_all(handles).await {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %e, "Monitor loop failed"),
                    Err(e) => error!(error = %e, "Monitor task panicked"),
                }
            }
        }

        Commands::Status { limit } => {
            let store = open_store(&config).await?;
            let trades = store.list_trades(limit).await?;
            if trades.is_empty() {
                println!("No trades yet. Use 'signal-executor place --signal <file>' to place one.");
                return Ok(());
            }

            println!(
                "\n{:<10} {:<12} {:<12} {:<6} {:<10} {:>12} {:>12} {:>12}",
                "TRADE", "ACCOUNT", "PAIR", "SIDE", "STATUS", "ENTRY", "QTY", "PNL"
            );
            println!("{}", "-".repeat(92));
            for trade in trades {
                println!(
                    "{:<10} {:<12} {:<12} {:<6} {:<10} {:>12} {:>12} {:>12}",
                    truncate(&trade.id, 8),
                    truncate(&trade.account_name, 12),
                    truncate(&trade.trading_pair, 12),
                    trade.direction.as_str(),
                    trade.status.as_str(),
                    trade.entry_price.to_string(),
                    trade.quantity.to_string(),
                    trade.pnl.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string())
                );
            }
        }

        Commands::Simulate { signal, prices, json } => {
            let signal = load_signal(&signal)?;
            let prices = load_price_path(&prices)?;
            let report = run_simulation(&config, &signal, &prices).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", report);
            }
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&*config)?);
        }
    }

    Ok(())
}

fn load_signal(path: &Path) -> Result<TradeSignal> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read signal {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse signal {}", path.display()))
}

async fn open_store(config: &AppConfig) -> Result<Arc<dyn TradeStore>> {
    let db = Database::new(&config.database_url).await?;
    Ok(Arc::new(db))
}

/// Adapters: the in-process paper venue for `simulated`, the HTTP bridge for
/// every exchange with a configured base URL.
fn build_factory(config: &AppConfig) -> AdapterFactory {
    let paper: Arc<dyn ExchangeAdapter> = Arc::new(paper_venue(config));
    let mut factory = AdapterFactory::new().register_shared("simulated", paper);

    let timeout = Duration::from_secs(config.bridge.timeout_secs);
    for (exchange_id, base_url) in &config.bridge.base_urls {
        let base_url = base_url.clone();
        info!(exchange = %exchange_id, url = %base_url, "Registering bridge adapter");
        factory = factory.register(exchange_id.clone(), move |account, credentials| {
            let client = BridgeClient::new(account.exchange.clone(), base_url.clone(), credentials, timeout)?;
            Ok(Arc::new(client) as Arc<dyn ExchangeAdapter>)
        });
    }
    factory
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
