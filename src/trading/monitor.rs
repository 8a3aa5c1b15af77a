//! Reconciliation loop for one (channel, exchange) pair.
//!
//! Each tick re-reads venue state per account and walks every non-terminal
//! trade through its state machine:
//!
//! - pending: expiry, stop crossed before fill, entry fill
//! - active: child order fills, position closure, breakeven, stop crossed
//!
//! Venue reads that stay failing after retries leave the trade untouched
//! until the next tick. A fatal venue error skips that account for the tick.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{AccountConfig, AppConfig};
use crate::db::TradeStore;
use crate::error::{ExchangeError, PlacementError};
use crate::exchange::{observe, open_session, with_retry, AdapterFactory, ExchangeAdapter};
use crate::models::{
    LimitOrderRequest, ModifyPositionRequest, Order, OrderKind, OrderSide, OrderStatus, SymbolInfo,
    Trade, TradeStatus, VenuePosition,
};

use super::position_sizer::floor_to_step;
use super::protection::{Protection, ProtectionOutcome};
use super::snapshot::{FillCheck, VenueSnapshot};
use super::{BreakevenMode, MonitorConfig};

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Non-terminal trades seen at the start of the tick
    pub trades: usize,
    pub activated: usize,
    /// Trades that reached a terminal status
    pub finished: usize,
    /// Accounts skipped on a fatal venue error
    pub skipped_accounts: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TradeChange {
    Unchanged,
    Updated,
    Activated,
    Finished(TradeStatus),
}

/// P&L over partial exits: filled take-profit and breakeven orders at their
/// own prices, whatever is left at `exit`.
fn realized_pnl(trade: &Trade, orders: &[Order], exit: Option<Decimal>) -> Option<Decimal> {
    let mut pnl = Decimal::ZERO;
    let mut closed = Decimal::ZERO;
    for order in orders.iter().filter(|o| {
        o.status == OrderStatus::Filled
            && matches!(o.kind, OrderKind::TakeProfit | OrderKind::BreakevenLimit)
    }) {
        let price = order.filled_price.unwrap_or(order.price);
        pnl += trade.calculate_pnl_for(price, order.quantity);
        closed += order.quantity;
    }

    let remaining = (trade.quantity - closed).max(Decimal::ZERO);
    if remaining.is_zero() {
        return Some(pnl);
    }
    exit.map(|price| pnl + trade.calculate_pnl_for(price, remaining))
}

fn fatal_message(err: &anyhow::Error) -> Option<String> {
    let venue = match err.downcast_ref::<PlacementError>() {
        Some(PlacementError::Venue(e)) => Some(e),
        _ => err.downcast_ref::<ExchangeError>(),
    };
    match venue {
        Some(ExchangeError::Fatal(msg)) => Some(msg.clone()),
        _ => None,
    }
}

/// Latest child fill price, if any child order filled.
fn last_fill_price(orders: &[Order]) -> Option<Decimal> {
    orders
        .iter()
        .filter(|o| o.kind != OrderKind::Entry && o.status == OrderStatus::Filled)
        .max_by_key(|o| o.filled_at)
        .and_then(|o| o.filled_price)
}

/// Polls one (channel, exchange) pair until stopped.
pub struct TradeMonitor {
    channel: String,
    exchange: String,
    config: MonitorConfig,
    accounts: Vec<AccountConfig>,
    factory: AdapterFactory,
    store: Arc<dyn TradeStore>,
    sessions: HashMap<String, Arc<dyn ExchangeAdapter>>,
    symbols: HashMap<String, SymbolInfo>,
    shutdown: Arc<AtomicBool>,
}

impl TradeMonitor {
    pub fn new(
        channel: impl Into<String>,
        exchange: impl Into<String>,
        app: &AppConfig,
        factory: AdapterFactory,
        store: Arc<dyn TradeStore>,
    ) -> Self {
        let exchange = exchange.into();
        let accounts = app
            .accounts
            .iter()
            .filter(|a| a.exchange == exchange)
            .cloned()
            .collect();

        Self {
            channel: channel.into(),
            exchange,
            config: app.monitor.clone(),
            accounts,
            factory,
            store,
            sessions: HashMap::new(),
            symbols: HashMap::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a stop flag; the loop exits after the tick in progress.
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run ticks until the stop flag is set, then disconnect.
    pub async fn run(mut self) -> Result<()> {
        info!(
            channel = %self.channel,
            exchange = %self.exchange,
            poll_interval_ms = self.config.poll_interval_ms,
            max_speed = self.config.max_speed,
            "Starting monitor loop"
        );

        let mut poll = interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.shutdown.load(Ordering::SeqCst) {
            if self.config.max_speed {
                tokio::task::yield_now().await;
            } else {
                poll.tick().await;
            }

            match self.tick().await {
                Ok(summary) if summary != TickSummary::default() => {
                    debug!(channel = %self.channel, exchange = %self.exchange, ?summary, "Tick complete")
                }
                Ok(_) => {}
                Err(e) => error!(channel = %self.channel, exchange = %self.exchange, error = %e, "Error in monitor tick"),
            }
        }

        self.disconnect_all().await;
        info!(channel = %self.channel, exchange = %self.exchange, "Monitor loop stopped");
        Ok(())
    }

    /// Reconcile every non-terminal trade of this loop once.
    pub async fn tick(&mut self) -> Result<TickSummary> {
        let trades = self
            .store
            .get_active_trades(Some(&self.channel), Some(&self.exchange))
            .await?;

        let mut summary = TickSummary {
            trades: trades.len(),
            ..Default::default()
        };

        let mut by_account: BTreeMap<String, Vec<Trade>> = BTreeMap::new();
        for trade in trades {
            by_account.entry(trade.account_name.clone()).or_default().push(trade);
        }

        for (account, trades) in by_account {
            if let Err(e) = self.reconcile_account(&account, trades, &mut summary).await {
                error!(account = %account, error = %e, "Fatal venue error, skipping account this tick");
                self.sessions.remove(&account);
                summary.skipped_accounts += 1;
            }
        }

        Ok(summary)
    }

    async fn reconcile_account(
        &mut self,
        account: &str,
        trades: Vec<Trade>,
        summary: &mut TickSummary,
    ) -> Result<(), ExchangeError> {
        let adapter = self.session(account).await?;
        let snapshot = VenueSnapshot::observe(adapter.as_ref(), &self.config.retry).await?;
        let mut prices: HashMap<String, Option<Decimal>> = HashMap::new();

        for mut trade in trades {
            let price = match prices.get(&trade.trading_pair) {
                Some(price) => *price,
                None => {
                    let pair = trade.trading_pair.clone();
                    let price = observe(&self.config.retry, "get_current_price", || {
                        adapter.get_current_price(&pair)
                    })
                    .await?
                    .flatten();
                    prices.insert(pair, price);
                    price
                }
            };

            let result = match trade.status {
                TradeStatus::Pending => self.process_pending(adapter.as_ref(), &snapshot, &mut trade, price).await,
                TradeStatus::Active => self.process_active(adapter.as_ref(), &snapshot, &mut trade, price).await,
                _ => Ok(TradeChange::Unchanged),
            };

            match result {
                Ok(TradeChange::Activated) => summary.activated += 1,
                Ok(TradeChange::Finished(status)) => {
                    summary.finished += 1;
                    info!(trade_id = %trade.id, account, status = %status, pnl = ?trade.pnl, "Trade finished");
                }
                Ok(_) => {}
                Err(e) => {
                    // Fatal errors abort the account; everything else waits for the next tick.
                    if let Some(msg) = fatal_message(&e) {
                        return Err(ExchangeError::Fatal(msg));
                    }
                    warn!(trade_id = %trade.id, error = %e, "Reconciliation step failed, retrying next tick");
                }
            }
        }

        Ok(())
    }

    async fn session(&mut self, account: &str) -> Result<Arc<dyn ExchangeAdapter>, ExchangeError> {
        if let Some(adapter) = self.sessions.get(account) {
            return Ok(adapter.clone());
        }

        let config = self
            .accounts
            .iter()
            .find(|a| a.name == account)
            .ok_or_else(|| ExchangeError::Fatal(format!("account {} is not configured", account)))?;
        let credentials = config
            .resolve_credentials()
            .ok_or_else(|| ExchangeError::Fatal(format!("no credentials for account {}", account)))?;

        let adapter = open_session(&self.factory, config, credentials).await?;
        info!(account, exchange = %self.exchange, "Venue session opened");
        self.sessions.insert(account.to_string(), adapter.clone());
        Ok(adapter)
    }

    async fn symbol_info(
        &mut self,
        adapter: &dyn ExchangeAdapter,
        symbol: &str,
    ) -> Result<SymbolInfo, ExchangeError> {
        if let Some(info) = self.symbols.get(symbol) {
            return Ok(info.clone());
        }
        let info = with_retry(&self.config.retry, "get_symbol_info", || adapter.get_symbol_info(symbol)).await?;
        self.symbols.insert(symbol.to_string(), info.clone());
        Ok(info)
    }

    fn protection<'a>(&'a self, adapter: &'a dyn ExchangeAdapter) -> Protection<'a> {
        Protection {
            adapter,
            store: self.store.as_ref(),
            retry: self.config.retry,
        }
    }

    // ==================== Pending ====================

    async fn process_pending(
        &mut self,
        adapter: &dyn ExchangeAdapter,
        snapshot: &VenueSnapshot,
        trade: &mut Trade,
        price: Option<Decimal>,
    ) -> Result<TradeChange> {
        let fill = snapshot.entry_fill(trade);

        // A visible position means the entry is live on the venue whatever the
        // clock or price says; it is handled as a fill below.
        if !matches!(fill, FillCheck::Filled(Some(_))) {
            if trade.is_expired(Utc::now()) {
                self.cancel_entry(adapter, trade, "entry order expired").await?;
                return Ok(TradeChange::Finished(TradeStatus::Cancelled));
            }
            if let Some(price) = price {
                if trade.direction.stop_crossed(trade.stop_loss, price) {
                    self.cancel_entry(adapter, trade, "price crossed stop loss before entry filled")
                        .await?;
                    return Ok(TradeChange::Finished(TradeStatus::Cancelled));
                }
            }
        }

        let FillCheck::Filled(position) = fill else {
            return Ok(TradeChange::Unchanged);
        };

        let info = match &position {
            Some(_) => Some(self.symbol_info(adapter, &trade.trading_pair).await?),
            None => None,
        };

        let protection = self.protection(adapter);
        protection.activate(trade, position.as_ref()).await?;
        if let (Some(position), Some(info)) = (position, info) {
            protection.ensure(trade, &position, &info, price).await?;
        }

        Ok(if trade.status.is_terminal() {
            TradeChange::Finished(trade.status)
        } else {
            TradeChange::Activated
        })
    }

    async fn cancel_entry(
        &self,
        adapter: &dyn ExchangeAdapter,
        trade: &mut Trade,
        reason: &str,
    ) -> Result<()> {
        match with_retry(&self.config.retry, "cancel_order", || adapter.cancel_order(&trade.entry_order_id)).await {
            Ok(()) | Err(ExchangeError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        trade.transition_to(TradeStatus::Cancelled)?;
        self.store.update_trade(trade).await?;
        for mut order in self.store.get_orders_by_trade_id(&trade.id).await? {
            if order.kind == OrderKind::Entry && order.is_pending() {
                order.status = OrderStatus::Cancelled;
                self.store.update_order(&order).await?;
            }
        }

        info!(trade_id = %trade.id, reason, "Entry cancelled");
        Ok(())
    }

    // ==================== Active ====================

    async fn process_active(
        &mut self,
        adapter: &dyn ExchangeAdapter,
        snapshot: &VenueSnapshot,
        trade: &mut Trade,
        price: Option<Decimal>,
    ) -> Result<TradeChange> {
        let now = Utc::now();
        let mut change = TradeChange::Unchanged;
        let mut orders = self.store.get_orders_by_trade_id(&trade.id).await?;
        let position = snapshot.position_for(trade).cloned();

        if let (Some(p), None) = (&position, &trade.position_id) {
            trade.position_id = Some(p.position_id.clone());
            self.store.update_trade(trade).await?;
            change = TradeChange::Updated;
        }

        // Child order fills.
        let position_gone = snapshot.position_closed(trade) == Some(true);
        let mut stopped_at = None;
        for order in orders.iter_mut().filter(|o| o.is_pending()) {
            let filled = match order.kind {
                OrderKind::TakeProfit | OrderKind::BreakevenLimit => {
                    snapshot.order_fill(&order.venue_order_id).is_filled()
                }
                OrderKind::StopLoss => {
                    position_gone && price.is_some_and(|p| trade.direction.stop_crossed(order.price, p))
                }
                OrderKind::Entry => false,
            };
            if !filled {
                continue;
            }

            order.mark_filled(order.price, now);
            self.store.update_order(order).await?;
            change = TradeChange::Updated;
            match order.kind {
                OrderKind::TakeProfit => {
                    info!(trade_id = %trade.id, tp_index = ?order.tp_index, price = %order.price, "Take profit filled")
                }
                OrderKind::BreakevenLimit => {
                    info!(trade_id = %trade.id, price = %order.price, "Breakeven order filled")
                }
                OrderKind::StopLoss => stopped_at = Some(order.price),
                OrderKind::Entry => {}
            }
        }

        if let Some(stop_price) = stopped_at {
            self.finish(adapter, trade, &mut orders, TradeStatus::Stopped, Some(stop_price)).await?;
            return Ok(TradeChange::Finished(TradeStatus::Stopped));
        }

        if position_gone {
            let exit = last_fill_price(&orders).or(price);
            self.finish(adapter, trade, &mut orders, TradeStatus::Closed, exit).await?;
            return Ok(TradeChange::Finished(TradeStatus::Closed));
        }

        let Some(position) = position else {
            return Ok(change);
        };

        // Until the ladder is complete the claim is free and this fills in
        // whatever is missing; afterwards it is a single no-op claim attempt.
        let needs_protection = !orders.iter().any(|o| o.kind == OrderKind::StopLoss)
            || (!trade.take_profits.is_empty() && !trade.stop_loss_breakeven);
        if needs_protection {
            let info = self.symbol_info(adapter, &trade.trading_pair).await?;
            match self.protection(adapter).ensure(trade, &position, &info, price).await {
                Ok(ProtectionOutcome::AlreadyPlaced) => {}
                Ok(_) => {
                    if trade.status.is_terminal() {
                        return Ok(TradeChange::Finished(trade.status));
                    }
                    orders = self.store.get_orders_by_trade_id(&trade.id).await?;
                    change = TradeChange::Updated;
                }
                Err(PlacementError::Venue(e)) if e.is_fatal() => return Err(PlacementError::Venue(e).into()),
                // Keep going so a crossed stop is still acted on this tick.
                Err(e) => {
                    warn!(trade_id = %trade.id, error = %e, "Protection incomplete, retrying next tick");
                    orders = self.store.get_orders_by_trade_id(&trade.id).await?;
                }
            }
        }

        let filled_tps = orders
            .iter()
            .filter(|o| o.kind == OrderKind::TakeProfit && o.status == OrderStatus::Filled)
            .count() as u32;
        let threshold = self.config.breakeven_after_tps;
        if threshold > 0 && filled_tps >= threshold && !trade.stop_loss_breakeven {
            self.apply_breakeven(adapter, trade, &mut orders, &position).await?;
            change = TradeChange::Updated;
        }

        // Covers gaps and venues that never report the stop fill.
        if let Some(price) = price {
            if trade.direction.stop_crossed(trade.stop_loss, price) {
                warn!(
                    trade_id = %trade.id,
                    price = %price,
                    stop_loss = %trade.stop_loss,
                    "Price crossed stop without a confirmed stop fill, closing position"
                );
                match with_retry(&self.config.retry, "close_position", || {
                    adapter.close_position(&position.position_id)
                })
                .await
                {
                    Ok(()) | Err(ExchangeError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                for order in orders.iter_mut().filter(|o| o.kind == OrderKind::StopLoss && o.is_pending()) {
                    order.mark_filled(price, now);
                    self.store.update_order(order).await?;
                }
                self.finish(adapter, trade, &mut orders, TradeStatus::Stopped, Some(price)).await?;
                return Ok(TradeChange::Finished(TradeStatus::Stopped));
            }
        }

        Ok(change)
    }

    /// Record the terminal state and cancel whatever is still resting.
    async fn finish(
        &self,
        adapter: &dyn ExchangeAdapter,
        trade: &mut Trade,
        orders: &mut [Order],
        status: TradeStatus,
        exit: Option<Decimal>,
    ) -> Result<()> {
        for order in orders.iter_mut().filter(|o| o.is_pending() && o.kind != OrderKind::Entry) {
            if order.kind != OrderKind::StopLoss {
                let cancelled = with_retry(&self.config.retry, "cancel_order", || {
                    adapter.cancel_order(&order.venue_order_id)
                })
                .await;
                match cancelled {
                    Ok(()) | Err(ExchangeError::NotFound(_)) => {}
                    Err(e) => {
                        warn!(order_id = %order.venue_order_id, error = %e, "Failed to cancel leftover order");
                        continue;
                    }
                }
            }
            order.status = OrderStatus::Cancelled;
            self.store.update_order(order).await?;
        }

        trade.finish(status, exit, Utc::now())?;
        trade.pnl = realized_pnl(trade, orders, exit);
        self.store.update_trade(trade).await?;
        Ok(())
    }

    // ==================== Breakeven ====================

    async fn apply_breakeven(
        &mut self,
        adapter: &dyn ExchangeAdapter,
        trade: &mut Trade,
        orders: &mut Vec<Order>,
        position: &VenuePosition,
    ) -> Result<()> {
        if !self.store.claim_breakeven(&trade.id).await? {
            return Ok(());
        }

        let result = match self.config.breakeven_mode {
            BreakevenMode::MoveStop => self.move_stop_to_entry(adapter, trade, orders, position).await,
            BreakevenMode::Limit => self.place_breakeven_limit(adapter, trade, orders, position).await,
        };

        if result.is_err() {
            if let Err(e) = self.store.release_breakeven(&trade.id).await {
                error!(trade_id = %trade.id, error = %e, "Failed to release breakeven claim");
            }
        }
        result
    }

    async fn move_stop_to_entry(
        &self,
        adapter: &dyn ExchangeAdapter,
        trade: &mut Trade,
        orders: &mut Vec<Order>,
        position: &VenuePosition,
    ) -> Result<()> {
        let request = ModifyPositionRequest {
            position_id: position.position_id.clone(),
            stop_loss: Some(trade.entry_price),
            take_profit: None,
        };
        with_retry(&self.config.retry, "modify_position", || adapter.modify_position(&request)).await?;

        match orders.iter_mut().find(|o| o.kind == OrderKind::StopLoss && o.is_pending()) {
            Some(stop) => {
                stop.price = trade.entry_price;
                self.store.update_order(stop).await?;
            }
            None => {
                let stop = Order::new(
                    &trade.id,
                    OrderKind::StopLoss,
                    position.position_id.clone(),
                    trade.entry_price,
                    position.volume,
                );
                self.store.insert_order(&stop).await?;
                orders.push(stop);
            }
        }

        trade.stop_loss = trade.entry_price;
        trade.stop_loss_breakeven = true;
        self.store.update_trade(trade).await?;
        info!(trade_id = %trade.id, stop_loss = %trade.stop_loss, "Stop moved to breakeven");
        Ok(())
    }

    async fn place_breakeven_limit(
        &mut self,
        adapter: &dyn ExchangeAdapter,
        trade: &mut Trade,
        orders: &mut Vec<Order>,
        position: &VenuePosition,
    ) -> Result<()> {
        let info = self.symbol_info(adapter, &trade.trading_pair).await?;
        let taken: Decimal = orders
            .iter()
            .filter(|o| o.kind == OrderKind::TakeProfit && o.status == OrderStatus::Filled)
            .map(|o| o.quantity)
            .sum();
        let remaining = floor_to_step(
            (trade.quantity - taken).min(position.volume),
            info.volume_step,
            info.qty_precision,
        );
        if remaining < info.min_volume || remaining <= Decimal::ZERO {
            warn!(trade_id = %trade.id, remaining = %remaining, "Remaining quantity too small for a breakeven order");
            return Ok(());
        }

        let request = LimitOrderRequest {
            symbol: trade.trading_pair.clone(),
            volume: remaining,
            side: OrderSide::closing(trade.direction),
            price: trade.entry_price,
        };
        let venue_id = adapter.place_limit_order(&request).await?;
        let order = Order::new(&trade.id, OrderKind::BreakevenLimit, venue_id, trade.entry_price, remaining);
        self.store.insert_order(&order).await?;
        orders.push(order);

        trade.stop_loss_breakeven = true;
        self.store.update_trade(trade).await?;
        info!(trade_id = %trade.id, quantity = %remaining, price = %trade.entry_price, "Breakeven limit placed");
        Ok(())
    }

    async fn disconnect_all(&mut self) {
        for (account, adapter) in self.sessions.drain() {
            if let Err(e) = adapter.disconnect().await {
                debug!(account = %account, error = %e, "Disconnect failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoutingConfig;
    use crate::db::Database;
    use crate::exchange::{RetryPolicy, SimulatedExchange};
    use crate::models::{Direction, TradeSignal};
    use crate::trading::{OrderPlacer, PlacementConfig};
    use rust_decimal_macros::dec;

    struct Harness {
        venue: Arc<SimulatedExchange>,
        db: Arc<Database>,
        placer: OrderPlacer,
        monitor: TradeMonitor,
    }

    async fn harness(entry_timeout_secs: i64, breakeven_mode: BreakevenMode) -> Harness {
        let venue = Arc::new(SimulatedExchange::new());
        venue.add_default_symbol("BTCUSDT");
        venue.set_price("BTCUSDT", dec!(101));

        let db = Arc::new(Database::in_memory().await.unwrap());
        let factory = AdapterFactory::new().register_shared("simulated", venue.clone());
        let app = Arc::new(AppConfig {
            accounts: vec![AccountConfig {
                name: "main".to_string(),
                risk_percentage: dec!(2),
                ..Default::default()
            }],
            routing: RoutingConfig {
                rules: Vec::new(),
                default_accounts: vec!["main".to_string()],
            },
            placement: PlacementConfig {
                entry_timeout_secs,
                retry: RetryPolicy::none(),
                ..Default::default()
            },
            monitor: MonitorConfig {
                breakeven_mode,
                retry: RetryPolicy::none(),
                ..Default::default()
            },
            ..Default::default()
        });

        let placer = OrderPlacer::new(app.clone(), factory.clone(), db.clone());
        let monitor = TradeMonitor::new("alpha", "simulated", &app, factory, db.clone());
        Harness {
            venue,
            db,
            placer,
            monitor,
        }
    }

    fn signal() -> TradeSignal {
        TradeSignal {
            message_id: "msg-7".to_string(),
            channel: "alpha".to_string(),
            trading_pair: "BTCUSDT".to_string(),
            direction: Direction::Long,
            entry_price: Some(dec!(100)),
            stop_loss: dec!(95),
            take_profits: vec![dec!(105), dec!(110), dec!(120)],
            leverage: None,
            signal_type: None,
        }
    }

    async fn place(h: &Harness) -> String {
        let outcomes = h.placer.place_signal(&signal()).await;
        outcomes[0].result.as_ref().unwrap().trade_id.clone()
    }

    async fn trade(h: &Harness, id: &str) -> Trade {
        h.db.get_trade(id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_expired_entry_is_cancelled_once() {
        let mut h = harness(0, BreakevenMode::MoveStop).await;
        let id = place(&h).await;
        assert_eq!(h.venue.open_order_count(), 1);

        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.finished, 1);
        assert_eq!(trade(&h, &id).await.status, TradeStatus::Cancelled);
        assert_eq!(h.venue.open_order_count(), 0);

        let next = h.monitor.tick().await.unwrap();
        assert_eq!(next.trades, 0);
    }

    #[tokio::test]
    async fn test_fill_activates_and_protects() {
        let mut h = harness(3600, BreakevenMode::MoveStop).await;
        let id = place(&h).await;
        assert_eq!(h.monitor.tick().await.unwrap().activated, 0);

        h.venue.set_price("BTCUSDT", dec!(100));
        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.activated, 1);

        let t = trade(&h, &id).await;
        assert_eq!(t.status, TradeStatus::Active);
        let position_id = t.position_id.clone().unwrap();
        assert_eq!(h.venue.position_stop(&position_id), Some(dec!(95)));

        let orders = h.db.get_orders_by_trade_id(&id).await.unwrap();
        assert_eq!(orders.iter().filter(|o| o.kind == OrderKind::TakeProfit).count(), 3);
        assert_eq!(orders.iter().filter(|o| o.kind == OrderKind::StopLoss).count(), 1);
    }

    #[tokio::test]
    async fn test_absent_position_closes_trade() {
        let mut h = harness(3600, BreakevenMode::MoveStop).await;
        let id = place(&h).await;
        h.venue.set_price("BTCUSDT", dec!(100));
        h.monitor.tick().await.unwrap();

        let position_id = trade(&h, &id).await.position_id.unwrap();
        h.venue.remove_position(&position_id);
        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.finished, 1);

        let t = trade(&h, &id).await;
        assert_eq!(t.status, TradeStatus::Closed);
        assert!(t.exit_filled_at.is_some());
        assert_eq!(h.venue.open_order_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_fill_marks_stopped_with_loss() {
        let mut h = harness(3600, BreakevenMode::MoveStop).await;
        let id = place(&h).await;
        h.venue.set_price("BTCUSDT", dec!(100));
        h.monitor.tick().await.unwrap();

        h.venue.set_price("BTCUSDT", dec!(94));
        h.monitor.tick().await.unwrap();

        let t = trade(&h, &id).await;
        assert_eq!(t.status, TradeStatus::Stopped);
        assert_eq!(t.exit_price, Some(dec!(95)));
        assert_eq!(t.pnl, Some(dec!(-200)));
    }

    #[tokio::test]
    async fn test_take_profit_moves_stop_to_breakeven() {
        let mut h = harness(3600, BreakevenMode::MoveStop).await;
        let id = place(&h).await;
        h.venue.set_price("BTCUSDT", dec!(100));
        h.monitor.tick().await.unwrap();

        h.venue.set_price("BTCUSDT", dec!(106));
        h.monitor.tick().await.unwrap();
        let t = trade(&h, &id).await;
        assert!(t.stop_loss_breakeven);
        assert_eq!(t.stop_loss, dec!(100));
        assert_eq!(h.venue.position_stop(t.position_id.as_deref().unwrap()), Some(dec!(100)));

        h.venue.set_price("BTCUSDT", dec!(99));
        h.monitor.tick().await.unwrap();
        let t = trade(&h, &id).await;
        assert_eq!(t.status, TradeStatus::Stopped);
        assert_eq!(t.exit_price, Some(dec!(100)));
        assert_eq!(t.pnl, Some(dec!(66.665)));
    }

    #[tokio::test]
    async fn test_limit_breakeven_places_order_then_closes() {
        let mut h = harness(3600, BreakevenMode::Limit).await;
        let id = place(&h).await;
        h.venue.set_price("BTCUSDT", dec!(100));
        h.monitor.tick().await.unwrap();

        h.venue.set_price("BTCUSDT", dec!(106));
        h.monitor.tick().await.unwrap();
        let orders = h.db.get_orders_by_trade_id(&id).await.unwrap();
        assert!(orders.iter().any(|o| o.kind == OrderKind::BreakevenLimit));
        assert!(trade(&h, &id).await.stop_loss_breakeven);

        h.monitor.tick().await.unwrap();
        let t = trade(&h, &id).await;
        assert_eq!(t.status, TradeStatus::Closed);
        assert_eq!(t.pnl, Some(dec!(66.665)));
        assert_eq!(h.venue.open_order_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_leave_trade_for_next_tick() {
        let mut h = harness(3600, BreakevenMode::MoveStop).await;
        let id = place(&h).await;
        h.monitor.tick().await.unwrap();

        h.venue.set_price("BTCUSDT", dec!(100));
        h.venue.inject_failures(2, ExchangeError::Transient("gateway timeout".into()));
        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.activated, 0);
        assert_eq!(trade(&h, &id).await.status, TradeStatus::Pending);

        assert_eq!(h.monitor.tick().await.unwrap().activated, 1);
    }

    #[tokio::test]
    async fn test_fatal_error_skips_account() {
        let mut h = harness(3600, BreakevenMode::MoveStop).await;
        place(&h).await;
        h.monitor.tick().await.unwrap();

        h.venue.inject_failures(1, ExchangeError::Fatal("session revoked".into()));
        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.skipped_accounts, 1);
    }

    fn count(orders: &[Order], kind: OrderKind) -> usize {
        orders.iter().filter(|o| o.kind == kind).count()
    }

    #[tokio::test]
    async fn test_failed_take_profits_are_placed_on_a_later_tick() {
        let mut h = harness(3600, BreakevenMode::MoveStop).await;
        let id = place(&h).await;
        h.venue
            .inject_call_failures("place_limit_order", 3, ExchangeError::Transient("rate limited".into()));
        h.venue.set_price("BTCUSDT", dec!(100));
        h.monitor.tick().await.unwrap();

        assert_eq!(trade(&h, &id).await.status, TradeStatus::Active);
        let orders = h.db.get_orders_by_trade_id(&id).await.unwrap();
        assert_eq!(count(&orders, OrderKind::StopLoss), 1);
        assert_eq!(count(&orders, OrderKind::TakeProfit), 0);

        h.monitor.tick().await.unwrap();
        let orders = h.db.get_orders_by_trade_id(&id).await.unwrap();
        assert_eq!(count(&orders, OrderKind::TakeProfit), 3);
        assert_eq!(h.venue.open_order_count(), 3);

        h.monitor.tick().await.unwrap();
        let orders = h.db.get_orders_by_trade_id(&id).await.unwrap();
        assert_eq!(count(&orders, OrderKind::TakeProfit), 3);
        assert_eq!(count(&orders, OrderKind::StopLoss), 1);
    }

    #[tokio::test]
    async fn test_stop_crossed_before_fill_cancels_entry() {
        let mut h = harness(3600, BreakevenMode::MoveStop).await;
        let id = place(&h).await;

        h.venue.set_quote("BTCUSDT", dec!(94));
        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.finished, 1);
        assert_eq!(trade(&h, &id).await.status, TradeStatus::Cancelled);
        assert_eq!(h.venue.open_order_count(), 0);

        let orders = h.db.get_orders_by_trade_id(&id).await.unwrap();
        assert_eq!(orders[0].status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_gap_through_stop_closes_position() {
        let mut h = harness(3600, BreakevenMode::MoveStop).await;
        let id = place(&h).await;
        h.venue.set_price("BTCUSDT", dec!(100));
        h.monitor.tick().await.unwrap();
        let position_id = trade(&h, &id).await.position_id.unwrap();

        // Quoted below the stop while the venue still shows the position.
        h.venue.set_quote("BTCUSDT", dec!(93));
        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.finished, 1);

        let t = trade(&h, &id).await;
        assert_eq!(t.status, TradeStatus::Stopped);
        assert_eq!(t.exit_price, Some(dec!(93)));
        assert_eq!(t.pnl, Some(dec!(-280)));
        assert_eq!(h.venue.close_price(&position_id), Some(dec!(93)));
        assert_eq!(h.venue.open_order_count(), 0);

        let orders = h.db.get_orders_by_trade_id(&id).await.unwrap();
        let stop = orders.iter().find(|o| o.kind == OrderKind::StopLoss).unwrap();
        assert_eq!(stop.status, OrderStatus::Filled);
        assert_eq!(stop.filled_price, Some(dec!(93)));
    }

    #[tokio::test]
    async fn test_entry_reported_filled_without_position_activates() {
        let mut h = harness(3600, BreakevenMode::MoveStop).await;
        let id = place(&h).await;
        h.venue.report_filled_orders(true);
        h.venue.set_price("BTCUSDT", dec!(100));
        let position_id = h.venue.get_open_positions().await.unwrap()[0].position_id.clone();
        h.venue.remove_position(&position_id);

        let entry_id = trade(&h, &id).await.entry_order_id;
        let listed = h.venue.get_open_orders().await.unwrap();
        assert!(listed
            .iter()
            .any(|o| o.order_id == entry_id && o.status == crate::models::VenueOrderStatus::Filled));

        assert_eq!(h.monitor.tick().await.unwrap().activated, 1);
        let t = trade(&h, &id).await;
        assert_eq!(t.status, TradeStatus::Active);
        assert!(t.position_id.is_none());
        let orders = h.db.get_orders_by_trade_id(&id).await.unwrap();
        assert_eq!(orders[0].status, OrderStatus::Filled);
        assert_eq!(count(&orders, OrderKind::StopLoss), 0);

        // No position behind it, so the next tick closes it.
        h.monitor.tick().await.unwrap();
        assert_eq!(trade(&h, &id).await.status, TradeStatus::Closed);
    }

    #[tokio::test]
    async fn test_visible_position_beats_expiry() {
        let mut h = harness(0, BreakevenMode::MoveStop).await;
        let id = place(&h).await;
        h.venue.set_price("BTCUSDT", dec!(100));

        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.activated, 1);
        assert_eq!(summary.finished, 0);

        let t = trade(&h, &id).await;
        assert_eq!(t.status, TradeStatus::Active);
        assert_eq!(h.venue.position_stop(t.position_id.as_deref().unwrap()), Some(dec!(95)));
        assert_eq!(h.venue.call_count("cancel_order"), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_flag() {
        let h = harness(3600, BreakevenMode::MoveStop).await;
        let stop = Arc::new(AtomicBool::new(true));
        h.monitor.with_shutdown(stop).run().await.unwrap();
    }

    #[test]
    fn test_realized_pnl_over_partial_exits() {
        let mut trade = crate::models::fixtures::pending_long();
        trade.quantity = dec!(10);
        let mut tp = Order::new(&trade.id, OrderKind::TakeProfit, "tp", dec!(110), dec!(4));
        tp.mark_filled(dec!(110), Utc::now());

        assert_eq!(realized_pnl(&trade, &[tp.clone()], Some(dec!(95))), Some(dec!(10)));
        assert_eq!(realized_pnl(&trade, &[tp], None), None);
    }
}
