//! Signal placement: route, validate, size, risk-check, submit, persist.
//!
//! Each selected account is attempted concurrently and independently; one
//! account failing never stops the others.

use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::config::{AccountConfig, AppConfig, SizingMode};
use crate::db::TradeStore;
use crate::error::{ExchangeError, PlacementError, StoreError, ValidationError};
use crate::exchange::{open_session, with_retry, AdapterFactory, ExchangeAdapter};
use crate::models::{
    Direction, EntryOrderType, LimitOrderRequest, Order, OrderKind, OrderSide, SymbolInfo,
    Trade, TradeSignal, TradeStatus,
};

use super::position_sizer::{calculate_position_size, calculate_quantity, fit_quantity, round_price};
use super::protection::{Protection, ProtectionOutcome};
use super::risk::{aggregate_open_risk, validate_trade_against_policies, worst_case_loss};
use super::routing::select_accounts;
use super::snapshot::{FillCheck, VenueSnapshot};
use super::take_profit::dedup_take_profits;

/// A trade that reached the venue and the store.
#[derive(Debug, Clone)]
pub struct PlacedTrade {
    pub trade_id: String,
    pub entry_order_id: String,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    /// Set when the entry filled during placement
    pub protection: Option<ProtectionOutcome>,
}

/// Result of one account's attempt.
#[derive(Debug)]
pub struct AccountOutcome {
    pub account: String,
    pub result: Result<PlacedTrade, PlacementError>,
}

/// Stop on the loss side and every target on the profit side of `entry`.
fn validate_sides(
    direction: Direction,
    entry: Decimal,
    stop: Decimal,
    take_profits: &[Decimal],
) -> Result<(), ValidationError> {
    if entry == stop {
        return Err(ValidationError::ZeroStopDistance { entry, stop });
    }
    if direction.is_profit_side(entry, stop) {
        return Err(ValidationError::StopLossSide { entry, stop });
    }
    if let Some(tp) = take_profits
        .iter()
        .find(|tp| !direction.is_profit_side(entry, **tp))
    {
        return Err(ValidationError::TakeProfitSide { entry, tp: *tp });
    }
    Ok(())
}

/// Places signals on routed accounts.
pub struct OrderPlacer {
    config: Arc<AppConfig>,
    factory: AdapterFactory,
    store: Arc<dyn TradeStore>,
}

impl OrderPlacer {
    pub fn new(config: Arc<AppConfig>, factory: AdapterFactory, store: Arc<dyn TradeStore>) -> Self {
        Self {
            config,
            factory,
            store,
        }
    }

    /// Place `signal` on every routed account and collect each outcome.
    pub async fn place_signal(&self, signal: &TradeSignal) -> Vec<AccountOutcome> {
        let accounts = select_accounts(&self.config, signal);
        if accounts.is_empty() {
            warn!(signal_id = %signal.message_id, "No account routed for signal");
            return Vec::new();
        }

        info!(
            signal_id = %signal.message_id,
            pair = %signal.trading_pair,
            direction = %signal.direction,
            accounts = accounts.len(),
            "Placing signal"
        );

        let attempts = accounts.into_iter().map(|account| async move {
            let result = self.place_for_account(account, signal).await;
            match &result {
                Ok(placed) => info!(
                    account = %account.name,
                    trade_id = %placed.trade_id,
                    quantity = %placed.quantity,
                    entry = %placed.entry_price,
                    "Entry order placed"
                ),
                Err(e) if e.is_skip() => info!(account = %account.name, reason = %e, "Account skipped"),
                Err(e) => warn!(account = %account.name, error = %e, "Placement failed"),
            }
            AccountOutcome {
                account: account.name.clone(),
                result,
            }
        });

        join_all(attempts).await
    }

    async fn place_for_account(
        &self,
        account: &AccountConfig,
        signal: &TradeSignal,
    ) -> Result<PlacedTrade, PlacementError> {
        let credentials = account
            .resolve_credentials()
            .ok_or_else(|| PlacementError::MissingCredentials(account.name.clone()))?;
        let adapter = open_session(&self.factory, account, credentials).await?;

        let result = self.place_on(adapter.as_ref(), account, signal).await;

        if let Err(e) = adapter.disconnect().await {
            debug!(account = %account.name, error = %e, "Disconnect failed");
        }
        result
    }

    async fn place_on(
        &self,
        adapter: &dyn ExchangeAdapter,
        account: &AccountConfig,
        signal: &TradeSignal,
    ) -> Result<PlacedTrade, PlacementError> {
        let placement = &self.config.placement;
        let retry = &placement.retry;
        let pair = signal.trading_pair.as_str();
        let direction = signal.direction;

        let balance = if account.simulation {
            placement.simulation_balance
        } else {
            with_retry(retry, "get_account_info", || adapter.get_account_info())
                .await?
                .balance
        };

        let info = match with_retry(retry, "get_symbol_info", || adapter.get_symbol_info(pair)).await {
            Ok(info) => info,
            Err(ExchangeError::NotFound(_)) => {
                return Err(ValidationError::UnknownSymbol(pair.to_string()).into())
            }
            Err(e) => return Err(e.into()),
        };
        if !info.tradeable {
            return Err(ValidationError::SymbolNotTradeable(pair.to_string()).into());
        }

        let market_price =
            with_retry(retry, "get_current_price", || adapter.get_current_price(pair)).await?;
        let (raw_entry, entry_order_type) = match (signal.entry_price, market_price) {
            (Some(price), _) => (price, EntryOrderType::Limit),
            (None, Some(price)) => (price, EntryOrderType::Market),
            (None, None) => return Err(ValidationError::NoEntryPrice(pair.to_string()).into()),
        };

        // Market entries are checked against the real fill instead.
        if entry_order_type == EntryOrderType::Limit {
            validate_sides(direction, raw_entry, signal.stop_loss, &signal.take_profits)?;
        }

        let leverage =
            account.effective_leverage(signal.leverage.unwrap_or(placement.default_leverage));
        let entry_price = round_price(raw_entry, info.price_precision, info.tick_size)?;
        let stop_loss = round_price(signal.stop_loss, info.price_precision, info.tick_size)?;
        let take_profits = match entry_order_type {
            EntryOrderType::Limit => dedup_take_profits(
                &signal.take_profits,
                direction,
                entry_price,
                info.price_precision,
                info.tick_size,
            ),
            EntryOrderType::Market => signal
                .take_profits
                .iter()
                .filter_map(|tp| round_price(*tp, info.price_precision, info.tick_size).ok())
                .collect(),
        };

        let raw_quantity = match &account.sizing {
            SizingMode::Risk => calculate_position_size(
                balance,
                account.risk_percentage,
                entry_price,
                stop_loss,
                leverage,
                account.base_leverage,
            )?,
            SizingMode::FixedNotional { amount } => {
                calculate_quantity(*amount * leverage, entry_price, info.qty_precision)?
            }
        };
        let quantity = fit_quantity(raw_quantity, &info)?;

        let proposed_loss = worst_case_loss(entry_price, stop_loss, quantity, direction);
        self.check_risk(adapter, account, balance, proposed_loss).await?;

        if let Some(price) = market_price {
            if direction.stop_crossed(stop_loss, price) {
                return Err(ValidationError::StopAlreadyCrossed {
                    price,
                    stop: stop_loss,
                }
                .into());
            }
        }

        let request = LimitOrderRequest {
            symbol: pair.to_string(),
            volume: quantity,
            side: OrderSide::opening(direction),
            price: entry_price,
        };
        let entry_order_id = adapter.place_limit_order(&request).await?;

        let now = Utc::now();
        let mut trade = Trade {
            id: uuid::Uuid::new_v4().to_string(),
            signal_id: signal.message_id.clone(),
            channel: signal.channel.clone(),
            trading_pair: pair.to_string(),
            direction,
            entry_price,
            stop_loss,
            take_profits,
            leverage,
            quantity,
            risk_percentage: account.risk_percentage,
            exchange: account.exchange.clone(),
            account_name: account.name.clone(),
            entry_order_id: entry_order_id.clone(),
            position_id: None,
            entry_order_type,
            status: TradeStatus::Pending,
            stop_loss_breakeven: false,
            entry_filled_at: None,
            exit_filled_at: None,
            exit_price: None,
            pnl: None,
            expires_at: now + Duration::seconds(placement.entry_timeout_secs),
            created_at: now,
        };

        if let Err(e) = self.store.insert_trade(&trade).await {
            if matches!(e, StoreError::Duplicate { .. }) {
                // Another attempt already owns this signal on this account.
                if let Err(cancel) = adapter.cancel_order(&entry_order_id).await {
                    warn!(order_id = %entry_order_id, error = %cancel, "Failed to cancel duplicate entry order");
                }
            }
            return Err(e.into());
        }
        let entry_order = Order::new(&trade.id, OrderKind::Entry, entry_order_id.clone(), entry_price, quantity);
        self.store.insert_order(&entry_order).await?;

        let protection = self
            .protect_if_filled(adapter, &mut trade, &info, market_price)
            .await;

        Ok(PlacedTrade {
            trade_id: trade.id,
            entry_order_id,
            entry_price,
            quantity,
            protection,
        })
    }

    /// Cumulative worst-case loss check; a no-op without policies.
    async fn check_risk(
        &self,
        adapter: &dyn ExchangeAdapter,
        account: &AccountConfig,
        balance: Decimal,
        proposed_loss: Decimal,
    ) -> Result<(), PlacementError> {
        let policies = &self.config.risk_policies;
        if policies.is_empty() {
            return Ok(());
        }

        let retry = &self.config.placement.retry;
        let positions = with_retry(retry, "get_open_positions", || adapter.get_open_positions()).await?;
        let local: Vec<Trade> = self
            .store
            .get_active_trades(None, Some(&account.exchange))
            .await?
            .into_iter()
            .filter(|t| t.account_name == account.name)
            .collect();
        let open = aggregate_open_risk(&positions, &local);
        let day_start = self
            .store
            .day_start_balance(&account.name, Utc::now().date_naive(), balance)
            .await?;

        debug!(
            account = %account.name,
            existing = %open.total,
            proposed = %proposed_loss,
            day_start = %day_start,
            excluded = open.excluded.len(),
            "Risk check"
        );

        validate_trade_against_policies(open.total, proposed_loss, day_start, policies)
            .map_err(PlacementError::RiskPolicy)
    }

    /// Immediate-fill path. Anything short of a visible position is left to
    /// the monitor; failures here are logged, never returned, because the
    /// trade is already persisted and will be reconciled.
    async fn protect_if_filled(
        &self,
        adapter: &dyn ExchangeAdapter,
        trade: &mut Trade,
        info: &SymbolInfo,
        market_price: Option<Decimal>,
    ) -> Option<ProtectionOutcome> {
        let retry = self.config.placement.retry;
        let snapshot = match VenueSnapshot::observe(adapter, &retry).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(trade_id = %trade.id, error = %e, "Could not observe fill after placement");
                return None;
            }
        };

        let FillCheck::Filled(Some(position)) = snapshot.entry_fill(trade) else {
            return None;
        };

        let protection = Protection {
            adapter,
            store: self.store.as_ref(),
            retry,
        };
        let result = async {
            protection.activate(trade, Some(&position)).await?;
            protection.ensure(trade, &position, info, market_price).await
        }
        .await;

        match result {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(trade_id = %trade.id, error = %e, "Immediate protection failed, monitor will retry");
                None
            }
        }
    }
}
