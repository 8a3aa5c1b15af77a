//! Normalized venue records.
//!
//! Every adapter maps its raw responses into these types; nothing outside
//! `exchange` looks at a raw venue payload.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Direction;

/// Order side on the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    /// Side that opens a position in `direction`.
    pub fn opening(direction: Direction) -> Self {
        match direction {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        }
    }

    /// Side that reduces a position in `direction`.
    pub fn closing(direction: Direction) -> Self {
        match direction {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            OrderSide::Buy => Direction::Long,
            OrderSide::Sell => Direction::Short,
        }
    }
}

/// Balance and precision reported for an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: Decimal,
    /// Decimal places of the account currency
    pub precision: u32,
}

/// Trading constraints for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub price_precision: u32,
    pub qty_precision: u32,
    pub tick_size: Option<Decimal>,
    pub min_volume: Decimal,
    pub max_volume: Decimal,
    pub volume_step: Decimal,
    pub tradeable: bool,
}

/// Open position as reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenuePosition {
    pub position_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub volume: Decimal,
    pub avg_price: Option<Decimal>,
    /// Stop attached on the venue, when the venue reports it
    pub stop_loss: Option<Decimal>,
}

impl VenuePosition {
    pub fn is_open(&self) -> bool {
        self.volume > Decimal::ZERO
    }
}

/// Normalized status of a venue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueOrderStatus {
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Unknown,
}

/// Open order as reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueOrder {
    pub order_id: String,
    pub status: VenueOrderStatus,
    pub price: Option<Decimal>,
    pub symbol: String,
}

/// Limit order submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitOrderRequest {
    pub symbol: String,
    pub volume: Decimal,
    pub side: OrderSide,
    pub price: Decimal,
}

/// Protective level update on an open position.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModifyPositionRequest {
    pub position_id: String,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}
