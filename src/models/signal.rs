//! Parsed trading signal handed to the order placer.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Direction;

/// A trading signal after text parsing.
///
/// `entry_price` is absent for market-style signals; the placer then
/// resolves it from the current market price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    /// Source message id
    pub message_id: String,

    pub channel: String,

    pub trading_pair: String,

    pub direction: Direction,

    #[serde(default)]
    pub entry_price: Option<Decimal>,

    pub stop_loss: Decimal,

    #[serde(default)]
    pub take_profits: Vec<Decimal>,

    #[serde(default)]
    pub leverage: Option<Decimal>,

    /// Free-form classification used by account routing (e.g. "scalp", "swing")
    #[serde(default)]
    pub signal_type: Option<String>,
}
