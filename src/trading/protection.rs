//! Stop and take-profit placement for a freshly filled trade.
//!
//! Shared by the placer (immediate fill) and the monitor (deferred fill).
//! The store claim makes it place-if-absent: whichever caller wins the claim
//! places, every other call is a no-op. The claim stays held once the ladder
//! is complete and is released on any failure, so a later call fills in the
//! levels that are still missing.

use std::collections::HashSet;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::db::TradeStore;
use crate::error::{ExchangeError, PlacementError};
use crate::exchange::{with_retry, ExchangeAdapter, RetryPolicy};
use crate::models::{
    LimitOrderRequest, ModifyPositionRequest, Order, OrderKind, OrderSide, OrderStatus, SymbolInfo,
    Trade, TradeStatus, VenuePosition,
};

use super::take_profit::{allocate, dedup_take_profits};

/// What `Protection::ensure` did.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtectionOutcome {
    /// Stop attached and this many take-profit orders placed on this call
    Placed { take_profits: usize },
    /// Another caller already placed (or is placing) protection
    AlreadyPlaced,
    /// Stop attached; no take-profit level could be placed
    StopOnly,
    /// No take-profit survived against the fill price; position closed
    Closed,
    /// The fill was already through the stop; position closed
    Stopped,
}

/// Venue session, store, and retry policy for protective order work.
pub struct Protection<'a> {
    pub adapter: &'a dyn ExchangeAdapter,
    pub store: &'a dyn TradeStore,
    pub retry: RetryPolicy,
}

impl Protection<'_> {
    /// Record an observed entry fill: trade becomes active, entry order filled.
    pub async fn activate(
        &self,
        trade: &mut Trade,
        position: Option<&VenuePosition>,
    ) -> Result<(), PlacementError> {
        let now = Utc::now();
        trade.transition_to(TradeStatus::Active)?;
        trade.entry_filled_at = Some(now);
        if let Some(position) = position {
            trade.position_id = Some(position.position_id.clone());
        }
        self.store.update_trade(trade).await?;

        let fill_price = position.and_then(|p| p.avg_price).unwrap_or(trade.entry_price);
        for mut order in self.store.get_orders_by_trade_id(&trade.id).await? {
            if order.kind == OrderKind::Entry && order.is_pending() {
                order.mark_filled(fill_price, now);
                self.store.update_order(&order).await?;
            }
        }

        info!(
            trade_id = %trade.id,
            account = %trade.account_name,
            position_id = ?trade.position_id,
            fill_price = %fill_price,
            "Entry filled"
        );
        Ok(())
    }

    /// Attach the stop and place the take-profit ladder for an active trade.
    pub async fn ensure(
        &self,
        trade: &mut Trade,
        position: &VenuePosition,
        info: &SymbolInfo,
        current_price: Option<Decimal>,
    ) -> Result<ProtectionOutcome, PlacementError> {
        if !self.store.claim_take_profit_placement(&trade.id).await? {
            return Ok(ProtectionOutcome::AlreadyPlaced);
        }

        match self.place(trade, position, info, current_price).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(release) = self.store.release_take_profit_claim(&trade.id).await {
                    error!(trade_id = %trade.id, error = %release, "Failed to release take-profit claim");
                }
                Err(e)
            }
        }
    }

    async fn place(
        &self,
        trade: &mut Trade,
        position: &VenuePosition,
        info: &SymbolInfo,
        current_price: Option<Decimal>,
    ) -> Result<ProtectionOutcome, PlacementError> {
        let fill_price = position.avg_price.unwrap_or(trade.entry_price);
        let exit_estimate = current_price.unwrap_or(fill_price);

        // Market entries defer side validation to the real fill.
        if trade.direction.stop_crossed(trade.stop_loss, fill_price) {
            warn!(
                trade_id = %trade.id,
                fill_price = %fill_price,
                stop_loss = %trade.stop_loss,
                "Filled through the stop loss, closing position"
            );
            self.close_out(trade, &position.position_id, TradeStatus::Stopped, Some(exit_estimate))
                .await?;
            return Ok(ProtectionOutcome::Stopped);
        }

        let quantity = position.volume.min(trade.quantity);
        let existing = self.store.get_orders_by_trade_id(&trade.id).await?;
        if !existing.iter().any(|o| o.kind == OrderKind::StopLoss) {
            let request = ModifyPositionRequest {
                position_id: position.position_id.clone(),
                stop_loss: Some(trade.stop_loss),
                take_profit: None,
            };
            with_retry(&self.retry, "modify_position", || self.adapter.modify_position(&request))
                .await?;
            let stop = Order::new(
                &trade.id,
                OrderKind::StopLoss,
                position.position_id.clone(),
                trade.stop_loss,
                quantity,
            );
            self.store.insert_order(&stop).await?;
            info!(trade_id = %trade.id, stop_loss = %trade.stop_loss, "Stop loss attached");
        }

        let prices = dedup_take_profits(
            &trade.take_profits,
            trade.direction,
            fill_price,
            info.price_precision,
            info.tick_size,
        );

        if prices.is_empty() {
            if trade.take_profits.is_empty() {
                return Ok(ProtectionOutcome::StopOnly);
            }
            warn!(
                trade_id = %trade.id,
                fill_price = %fill_price,
                "No take profit is valid against the fill price, closing position"
            );
            self.close_out(trade, &position.position_id, TradeStatus::Closed, Some(exit_estimate))
                .await?;
            return Ok(ProtectionOutcome::Closed);
        }

        // Resting take-profits are still inside the position volume; filled ones
        // are not, so add them back to size the ladder as first placed.
        let taken: Decimal = existing
            .iter()
            .filter(|o| o.kind == OrderKind::TakeProfit && o.status == OrderStatus::Filled)
            .map(|o| o.quantity)
            .sum();
        let levels = allocate((position.volume + taken).min(trade.quantity), &prices, info);
        if levels.is_empty() {
            warn!(
                trade_id = %trade.id,
                quantity = %quantity,
                min_volume = %info.min_volume,
                "No take-profit level fits venue volume limits, stop loss only"
            );
            return Ok(ProtectionOutcome::StopOnly);
        }

        let done: HashSet<u32> = existing
            .iter()
            .filter(|o| o.kind == OrderKind::TakeProfit)
            .filter_map(|o| o.tp_index)
            .collect();
        let side = OrderSide::closing(trade.direction);
        let mut placed = 0;
        let mut last_error: Option<ExchangeError> = None;
        for level in levels.iter().filter(|l| !done.contains(&l.index)) {
            let request = LimitOrderRequest {
                symbol: trade.trading_pair.clone(),
                volume: level.quantity,
                side,
                price: level.price,
            };
            // Submissions are not idempotent, so no retry here.
            match self.adapter.place_limit_order(&request).await {
                Ok(venue_id) => {
                    let order = Order::new(&trade.id, OrderKind::TakeProfit, venue_id, level.price, level.quantity)
                        .with_tp_index(level.index);
                    self.store.insert_order(&order).await?;
                    placed += 1;
                }
                Err(e) => {
                    error!(trade_id = %trade.id, price = %level.price, error = %e, "Take profit placement failed");
                    last_error = Some(e);
                }
            }
        }

        // Any missing level fails the call so the claim is released and the
        // next pass places only what is still absent.
        if let Some(e) = last_error {
            warn!(trade_id = %trade.id, take_profits = placed, "Take-profit ladder incomplete");
            return Err(e.into());
        }
        info!(trade_id = %trade.id, take_profits = placed, "Take profits placed");
        Ok(ProtectionOutcome::Placed { take_profits: placed })
    }

    /// Close the venue position and record the trade's terminal state.
    pub async fn close_out(
        &self,
        trade: &mut Trade,
        position_id: &str,
        status: TradeStatus,
        exit_price: Option<Decimal>,
    ) -> Result<(), PlacementError> {
        match with_retry(&self.retry, "close_position", || self.adapter.close_position(position_id)).await {
            Ok(()) | Err(ExchangeError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        let now = Utc::now();
        for mut order in self.store.get_orders_by_trade_id(&trade.id).await? {
            if !order.is_pending() || order.kind == OrderKind::Entry {
                continue;
            }
            match (order.kind, status, exit_price) {
                (OrderKind::StopLoss, TradeStatus::Stopped, Some(price)) => order.mark_filled(price, now),
                (OrderKind::StopLoss, _, _) => order.status = OrderStatus::Cancelled,
                _ => {
                    match with_retry(&self.retry, "cancel_order", || self.adapter.cancel_order(&order.venue_order_id))
                        .await
                    {
                        Ok(()) | Err(ExchangeError::NotFound(_)) => {}
                        Err(e) => {
                            warn!(order_id = %order.venue_order_id, error = %e, "Failed to cancel leftover order");
                            continue;
                        }
                    }
                    order.status = OrderStatus::Cancelled;
                }
            }
            self.store.update_order(&order).await?;
        }

        trade.finish(status, exit_price, now)?;
        self.store.update_trade(trade).await?;
        info!(trade_id = %trade.id, status = %status, exit_price = ?exit_price, pnl = ?trade.pnl, "Trade closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::exchange::SimulatedExchange;
    use crate::models::fixtures;
    use rust_decimal_macros::dec;

    struct Setup {
        venue: SimulatedExchange,
        db: Database,
        trade: Trade,
        position: VenuePosition,
        info: SymbolInfo,
    }

    async fn filled_long() -> Setup {
        let venue = SimulatedExchange::new();
        venue.add_default_symbol("BTCUSDT");
        venue.set_price("BTCUSDT", dec!(100));
        venue.open_position("BTCUSDT", OrderSide::Buy, dec!(10), dec!(100));
        let position = venue.get_open_positions().await.unwrap().remove(0);
        let info = venue.get_symbol_info("BTCUSDT").await.unwrap();

        let db = Database::in_memory().await.unwrap();
        let mut trade = fixtures::pending_long();
        trade.status = TradeStatus::Active;
        trade.position_id = Some(position.position_id.clone());
        db.insert_trade(&trade).await.unwrap();

        Setup { venue, db, trade, position, info }
    }

    fn protection<'a>(s: &'a Setup) -> Protection<'a> {
        Protection {
            adapter: &s.venue,
            store: &s.db,
            retry: RetryPolicy::none(),
        }
    }

    #[tokio::test]
    async fn test_places_stop_and_ladder_once() {
        let s = filled_long().await;
        let mut trade = s.trade.clone();

        let first = protection(&s)
            .ensure(&mut trade, &s.position, &s.info, Some(dec!(100)))
            .await
            .unwrap();
        assert_eq!(first, ProtectionOutcome::Placed { take_profits: 3 });

        let second = protection(&s)
            .ensure(&mut trade, &s.position, &s.info, Some(dec!(100)))
            .await
            .unwrap();
        assert_eq!(second, ProtectionOutcome::AlreadyPlaced);

        let orders = s.db.get_orders_by_trade_id(&trade.id).await.unwrap();
        let tps: Vec<_> = orders.iter().filter(|o| o.kind == OrderKind::TakeProfit).collect();
        assert_eq!(tps.len(), 3);
        assert_eq!(tps.iter().map(|o| o.quantity).sum::<Decimal>(), dec!(10));
        assert_eq!(s.venue.position_stop(&s.position.position_id), Some(dec!(95)));
    }

    #[tokio::test]
    async fn test_no_valid_target_closes_position() {
        let mut s = filled_long().await;
        s.trade.take_profits = vec![dec!(90)];
        let mut trade = s.trade.clone();

        let outcome = protection(&s)
            .ensure(&mut trade, &s.position, &s.info, Some(dec!(101)))
            .await
            .unwrap();
        assert_eq!(outcome, ProtectionOutcome::Closed);
        assert_eq!(trade.status, TradeStatus::Closed);
        assert!(s.venue.get_open_positions().await.unwrap().is_empty());

        let orders = s.db.get_orders_by_trade_id(&trade.id).await.unwrap();
        let stop = orders.iter().find(|o| o.kind == OrderKind::StopLoss).unwrap();
        assert_eq!(stop.status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_missing_levels_are_placed_on_next_call() {
        let s = filled_long().await;
        let mut trade = s.trade.clone();
        s.venue
            .inject_call_failures("place_limit_order", 1, ExchangeError::Transient("rate limited".into()));

        assert!(protection(&s)
            .ensure(&mut trade, &s.position, &s.info, Some(dec!(100)))
            .await
            .is_err());
        let tps = |orders: Vec<Order>| -> Vec<Order> {
            orders.into_iter().filter(|o| o.kind == OrderKind::TakeProfit).collect()
        };
        assert_eq!(tps(s.db.get_orders_by_trade_id(&trade.id).await.unwrap()).len(), 2);

        let retried = protection(&s)
            .ensure(&mut trade, &s.position, &s.info, Some(dec!(100)))
            .await
            .unwrap();
        assert_eq!(retried, ProtectionOutcome::Placed { take_profits: 1 });

        let ladder = tps(s.db.get_orders_by_trade_id(&trade.id).await.unwrap());
        let mut indices: Vec<u32> = ladder.iter().filter_map(|o| o.tp_index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(ladder.iter().map(|o| o.quantity).sum::<Decimal>(), dec!(10));
        assert_eq!(s.venue.call_count("modify_position"), 1);
    }

    #[tokio::test]
    async fn test_failed_stop_releases_claim() {
        let s = filled_long().await;
        let mut trade = s.trade.clone();
        s.venue.inject_failures(1, ExchangeError::Rejected("position locked".into()));

        assert!(protection(&s)
            .ensure(&mut trade, &s.position, &s.info, None)
            .await
            .is_err());
        assert!(s.db.claim_take_profit_placement(&trade.id).await.unwrap());
    }
}
