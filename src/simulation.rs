//! Historical replay of one signal against a recorded price path.
//!
//! Runs the real placer and monitor against the in-memory venue: the price
//! path drives fills, stops and take-profits, one monitor tick per price.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{AccountConfig, AppConfig, RoutingConfig};
use crate::db::{Database, TradeStore};
use crate::exchange::{AdapterFactory, RetryPolicy, SimulatedExchange};
use crate::models::{Order, TradeSignal, TradeStatus};
use crate::trading::{MonitorConfig, OrderPlacer, TradeMonitor};

const SIM_ACCOUNT: &str = "simulation";
const SIM_EXCHANGE: &str = "simulated";

/// Result of a replay.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub trading_pair: String,
    pub trade_id: Option<String>,
    pub status: Option<TradeStatus>,
    pub entry_price: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub exit_price: Option<Decimal>,
    pub pnl: Option<Decimal>,
    /// Monitor ticks run before the trade finished or the path ran out
    pub ticks: usize,
    pub orders: Vec<Order>,
    /// Why nothing was placed, if nothing was
    pub rejected: Option<String>,
}

impl std::fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn show(v: &Option<Decimal>) -> String {
            v.map(|d| d.to_string()).unwrap_or_else(|| "-".to_string())
        }

        writeln!(f, "\n{:=^60}", " SIMULATION RESULT ")?;
        writeln!(f, "Pair:        {}", self.trading_pair)?;
        if let Some(reason) = &self.rejected {
            writeln!(f, "Rejected:    {}", reason)?;
            return writeln!(f, "{:=^60}", "");
        }
        writeln!(
            f,
            "Status:      {}",
            self.status.map(|s| s.as_str()).unwrap_or("-")
        )?;
        writeln!(f, "Entry:       {}", show(&self.entry_price))?;
        writeln!(f, "Quantity:    {}", show(&self.quantity))?;
        writeln!(f, "Exit:        {}", show(&self.exit_price))?;
        writeln!(f, "PnL:         {}", show(&self.pnl))?;
        writeln!(f, "Ticks:       {}", self.ticks)?;
        writeln!(f)?;
        writeln!(f, "--- Orders ---")?;
        for order in &self.orders {
            writeln!(
                f,
                "{:<16} {:>14} x {:<12} {}",
                order.kind.as_str(),
                order.price,
                order.quantity,
                order.status.as_str()
            )?;
        }
        write!(f, "{:=^60}", "")
    }
}

/// Read a price path: a JSON array of prices (numbers or decimal strings).
pub fn load_price_path(path: &Path) -> Result<Vec<Decimal>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read price path {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse price path {}", path.display()))
}

/// The CLI's paper venue: configured symbols listed, paper balance set.
/// Prices stay unset, so market entries are refused until one is fed.
pub fn paper_venue(app: &AppConfig) -> SimulatedExchange {
    let venue = SimulatedExchange::with_id(SIM_EXCHANGE);
    for symbol in &app.paper.symbols {
        venue.add_default_symbol(symbol);
    }
    venue.set_balance(app.placement.simulation_balance);
    venue
}

/// Configuration for the replay: one simulated account modelled on the
/// first configured account, a max-speed monitor, and no venue retries.
fn simulation_config(app: &AppConfig) -> AppConfig {
    let template = app.accounts.first().cloned().unwrap_or_default();
    let account = AccountConfig {
        name: SIM_ACCOUNT.to_string(),
        exchange: SIM_EXCHANGE.to_string(),
        simulation: true,
        credentials: None,
        ..template
    };

    let mut placement = app.placement.clone();
    placement.retry = RetryPolicy::none();

    AppConfig {
        accounts: vec![account],
        routing: RoutingConfig {
            rules: Vec::new(),
            default_accounts: vec![SIM_ACCOUNT.to_string()],
        },
        risk_policies: app.risk_policies.clone(),
        placement,
        monitor: MonitorConfig {
            max_speed: true,
            retry: RetryPolicy::none(),
            ..app.monitor.clone()
        },
        ..app.clone()
    }
}

/// Replay `signal` over `prices`.
pub async fn run_simulation(
    app: &AppConfig,
    signal: &TradeSignal,
    prices: &[Decimal],
) -> Result<SimulationReport> {
    let Some(&opening) = prices.first() else {
        anyhow::bail!("Price path is empty");
    };

    let config = Arc::new(simulation_config(app));
    info!(
        pair = %signal.trading_pair,
        direction = %signal.direction,
        points = prices.len(),
        "Starting simulation"
    );

    let venue = Arc::new(SimulatedExchange::new());
    venue.add_default_symbol(&signal.trading_pair);
    venue.set_balance(config.placement.simulation_balance);
    venue.set_price(&signal.trading_pair, opening);

    let store = Arc::new(
        Database::in_memory()
            .await
            .context("Failed to open simulation store")?,
    );
    let factory = AdapterFactory::new().register_shared(SIM_EXCHANGE, venue.clone());

    let mut report = SimulationReport {
        trading_pair: signal.trading_pair.clone(),
        trade_id: None,
        status: None,
        entry_price: None,
        quantity: None,
        exit_price: None,
        pnl: None,
        ticks: 0,
        orders: Vec::new(),
        rejected: None,
    };

    let placer = OrderPlacer::new(config.clone(), factory.clone(), store.clone());
    let placed = match placer.place_signal(signal).await.into_iter().next() {
        Some(outcome) => outcome.result,
        None => anyhow::bail!("Simulation account was not selected"),
    };
    let placed = match placed {
        Ok(placed) => placed,
        Err(e) => {
            warn!(error = %e, "Simulated placement rejected");
            report.rejected = Some(e.to_string());
            return Ok(report);
        }
    };

    let mut monitor = TradeMonitor::new(&signal.channel, SIM_EXCHANGE, &config, factory, store.clone());
    for price in prices {
        venue.set_price(&signal.trading_pair, *price);
        let summary = monitor.tick().await?;
        report.ticks += 1;
        debug!(price = %price, ?summary, "Simulation tick");

        let trade = store
            .get_trade(&placed.trade_id)
            .await?
            .context("Simulated trade disappeared")?;
        if trade.status.is_terminal() {
            break;
        }
        tokio::task::yield_now().await;
    }

    let trade = store
        .get_trade(&placed.trade_id)
        .await?
        .context("Simulated trade disappeared")?;
    report.trade_id = Some(trade.id.clone());
    report.status = Some(trade.status);
    report.entry_price = Some(trade.entry_price);
    report.quantity = Some(trade.quantity);
    report.exit_price = trade.exit_price;
    report.pnl = trade.pnl;
    report.orders = store.get_orders_by_trade_id(&trade.id).await?;

    info!(
        status = %trade.status,
        ticks = report.ticks,
        pnl = ?trade.pnl,
        "Simulation complete"
    );
    Ok(report)
}
