//! Order model: a single venue-facing order tied to a trade.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What an order is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Entry,
    StopLoss,
    TakeProfit,
    BreakevenLimit,
}

impl OrderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Entry => "entry",
            OrderKind::StopLoss => "stop_loss",
            OrderKind::TakeProfit => "take_profit",
            OrderKind::BreakevenLimit => "breakeven_limit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entry" => Some(Self::Entry),
            "stop_loss" => Some(Self::StopLoss),
            "take_profit" => Some(Self::TakeProfit),
            "breakeven_limit" => Some(Self::BreakevenLimit),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "filled" => Some(Self::Filled),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Venue order record. Prices and quantities are already venue-rounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub trade_id: String,
    pub kind: OrderKind,

    /// Venue order id; for attached stops this is the position id
    pub venue_order_id: String,

    pub price: Decimal,
    pub quantity: Decimal,

    /// Position in the take-profit ladder (take-profit orders only)
    pub tp_index: Option<u32>,

    pub status: OrderStatus,
    pub filled_price: Option<Decimal>,
    pub filled_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn new(
        trade_id: &str,
        kind: OrderKind,
        venue_order_id: impl Into<String>,
        price: Decimal,
        quantity: Decimal,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            trade_id: trade_id.to_string(),
            kind,
            venue_order_id: venue_order_id.into(),
            price,
            quantity,
            tp_index: None,
            status: OrderStatus::Pending,
            filled_price: None,
            filled_at: None,
        }
    }

    pub fn with_tp_index(mut self, index: u32) -> Self {
        self.tp_index = Some(index);
        self
    }

    pub fn mark_filled(&mut self, price: Decimal, at: DateTime<Utc>) {
        self.status = OrderStatus::Filled;
        self.filled_price = Some(price);
        self.filled_at = Some(at);
    }

    pub fn is_pending(&self) -> bool {
        self.status == OrderStatus::Pending
    }
}
