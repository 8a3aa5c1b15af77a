//! One observation of an account's venue state, and fill checks against it.
//!
//! Either half of the snapshot may be unknown when the venue read failed
//! after retries; checks then answer `Unknown` and the caller revisits the
//! trade next tick.

use crate::error::ExchangeError;
use crate::exchange::{observe, ExchangeAdapter, RetryPolicy};
use crate::models::{OrderSide, Trade, VenueOrder, VenueOrderStatus, VenuePosition};

/// Outcome of a fill check.
#[derive(Debug, Clone, PartialEq)]
pub enum FillCheck {
    /// Filled; the position is attached when the venue showed one
    Filled(Option<VenuePosition>),
    Open,
    Unknown,
}

impl FillCheck {
    pub fn is_filled(&self) -> bool {
        matches!(self, FillCheck::Filled(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct VenueSnapshot {
    pub positions: Option<Vec<VenuePosition>>,
    pub orders: Option<Vec<VenueOrder>>,
}

impl VenueSnapshot {
    /// Read open positions and orders. Only a fatal venue error is returned.
    pub async fn observe(
        adapter: &dyn ExchangeAdapter,
        retry: &RetryPolicy,
    ) -> Result<Self, ExchangeError> {
        let positions = observe(retry, "get_open_positions", || adapter.get_open_positions()).await?;
        let orders = observe(retry, "get_open_orders", || adapter.get_open_orders()).await?;
        Ok(Self { positions, orders })
    }

    /// Open position backing `trade`: by position id once known, otherwise
    /// the first open position on the same symbol and side.
    pub fn position_for(&self, trade: &Trade) -> Option<&VenuePosition> {
        let positions = self.positions.as_ref()?;
        let side = OrderSide::opening(trade.direction);
        match &trade.position_id {
            Some(id) => positions.iter().find(|p| &p.position_id == id && p.is_open()),
            None => positions
                .iter()
                .find(|p| p.symbol == trade.trading_pair && p.side == side && p.is_open()),
        }
    }

    /// Whether the trade's position is gone. `None` if positions are unknown.
    pub fn position_closed(&self, trade: &Trade) -> Option<bool> {
        self.positions.as_ref()?;
        Some(self.position_for(trade).is_none())
    }

    /// Entry fill: a matching position exists, or the entry order has left
    /// the open-orders list, or the venue reports it FILLED.
    pub fn entry_fill(&self, trade: &Trade) -> FillCheck {
        if let Some(position) = self.position_for(trade) {
            return FillCheck::Filled(Some(position.clone()));
        }
        match self.order_fill(&trade.entry_order_id) {
            FillCheck::Unknown if self.positions.is_some() => FillCheck::Open,
            other => other,
        }
    }

    /// Resting order fill: gone from the open-orders list, or reported FILLED.
    pub fn order_fill(&self, venue_order_id: &str) -> FillCheck {
        let Some(orders) = &self.orders else {
            return FillCheck::Unknown;
        };
        match orders.iter().find(|o| o.order_id == venue_order_id) {
            None => FillCheck::Filled(None),
            Some(o) if o.status == VenueOrderStatus::Filled => FillCheck::Filled(None),
            Some(_) => FillCheck::Open,
        }
    }
}
