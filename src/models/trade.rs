//! Trade model: one position's intent and its observed lifecycle on the venue.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "long" | "buy" => Some(Self::Long),
            "short" | "sell" => Some(Self::Short),
            _ => None,
        }
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Long => Decimal::ONE,
            Direction::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// True if `price` lies on the profit side of `entry` for this direction.
    pub fn is_profit_side(&self, entry: Decimal, price: Decimal) -> bool {
        match self {
            Direction::Long => price > entry,
            Direction::Short => price < entry,
        }
    }

    /// True if `price` has reached or passed `stop` against this direction.
    pub fn stop_crossed(&self, stop: Decimal, price: Decimal) -> bool {
        match self {
            Direction::Long => price <= stop,
            Direction::Short => price >= stop,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a trade.
///
/// `Pending -> {Active, Cancelled}` and `Active -> {Stopped, Closed}`; the
/// other three are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Pending,
    Active,
    Stopped,
    Closed,
    Cancelled,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Pending => "pending",
            TradeStatus::Active => "active",
            TradeStatus::Stopped => "stopped",
            TradeStatus::Closed => "closed",
            TradeStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "stopped" => Some(Self::Stopped),
            "closed" => Some(Self::Closed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TradeStatus::Stopped | TradeStatus::Closed | TradeStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TradeStatus) -> bool {
        matches!(
            (self, next),
            (TradeStatus::Pending, TradeStatus::Active)
                | (TradeStatus::Pending, TradeStatus::Cancelled)
                | (TradeStatus::Active, TradeStatus::Stopped)
                | (TradeStatus::Active, TradeStatus::Closed)
        )
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the entry was requested. Both are submitted as venue limit orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryOrderType {
    /// Entry price came from the signal.
    Limit,
    /// Entry price was resolved from the current market price.
    Market,
}

impl EntryOrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryOrderType::Limit => "limit",
            EntryOrderType::Market => "market",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "limit" => Some(Self::Limit),
            "market" => Some(Self::Market),
            _ => None,
        }
    }
}

/// A trading position's full intent and observed lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,

    /// Identifier of the source message; unique together with `account_name`
    pub signal_id: String,

    /// Channel the signal came from
    pub channel: String,

    pub trading_pair: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub stop_loss: Decimal,

    /// Ordered take-profit prices, all on the profit side of entry
    pub take_profits: Vec<Decimal>,

    pub leverage: Decimal,
    pub quantity: Decimal,
    pub risk_percentage: Decimal,

    /// Exchange identifier (adapter factory key)
    pub exchange: String,
    pub account_name: String,

    pub entry_order_id: String,
    pub position_id: Option<String>,
    pub entry_order_type: EntryOrderType,
    pub status: TradeStatus,
    pub stop_loss_breakeven: bool,

    pub entry_filled_at: Option<DateTime<Utc>>,
    pub exit_filled_at: Option<DateTime<Utc>>,
    pub exit_price: Option<Decimal>,
    pub pnl: Option<Decimal>,

    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Trade {
    /// Move to `next`, rejecting anything the state machine does not allow.
    pub fn transition_to(&mut self, next: TradeStatus) -> Result<(), StoreError> {
        if !self.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                trade_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// P&L if the full quantity were closed at `exit_price`.
    pub fn calculate_pnl(&self, exit_price: Decimal) -> Decimal {
        self.calculate_pnl_for(exit_price, self.quantity)
    }

    pub fn calculate_pnl_for(&self, exit_price: Decimal, quantity: Decimal) -> Decimal {
        (exit_price - self.entry_price) * quantity * self.direction.sign()
    }

    /// Record the exit and move to a terminal status.
    pub fn finish(
        &mut self,
        status: TradeStatus,
        exit_price: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.transition_to(status)?;
        self.exit_filled_at = Some(at);
        self.exit_price = exit_price;
        self.pnl = exit_price.map(|p| self.calculate_pnl(p));
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const ALL: [TradeStatus; 5] = [
        TradeStatus::Pending,
        TradeStatus::Active,
        TradeStatus::Stopped,
        TradeStatus::Closed,
        TradeStatus::Cancelled,
    ];

    #[test]
    fn test_pending_reaches_only_active_or_cancelled() {
        let reachable: Vec<_> = ALL
            .iter()
            .copied()
            .filter(|s| TradeStatus::Pending.can_transition_to(*s))
            .collect();
        assert_eq!(reachable, vec![TradeStatus::Active, TradeStatus::Cancelled]);
    }

    #[test]
    fn test_active_reaches_only_stopped_or_closed() {
        let reachable: Vec<_> = ALL
            .iter()
            .copied()
            .filter(|s| TradeStatus::Active.can_transition_to(*s))
            .collect();
        assert_eq!(reachable, vec![TradeStatus::Stopped, TradeStatus::Closed]);
    }

    #[test]
    fn test_terminal_states_are_final() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            assert!(ALL.iter().all(|to| !from.can_transition_to(*to)));
        }
    }

    #[test]
    fn test_transition_rejects_backward_move() {
        let mut trade = fixtures::pending_long();
        trade.transition_to(TradeStatus::Active).unwrap();
        let err = trade.transition_to(TradeStatus::Pending).unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(trade.status, TradeStatus::Active);
    }

    #[test]
    fn test_pnl_is_direction_aware() {
        let mut trade = fixtures::pending_long();
        assert_eq!(trade.calculate_pnl(dec!(110)), dec!(100));
        assert_eq!(trade.calculate_pnl(dec!(95)), dec!(-50));

        trade.direction = Direction::Short;
        assert_eq!(trade.calculate_pnl(dec!(90)), dec!(100));
    }

    #[test]
    fn test_stop_crossed() {
        assert!(Direction::Long.stop_crossed(dec!(95), dec!(94.9)));
        assert!(Direction::Long.stop_crossed(dec!(95), dec!(95)));
        assert!(!Direction::Long.stop_crossed(dec!(95), dec!(96)));
        assert!(Direction::Short.stop_crossed(dec!(105), dec!(106)));
        assert!(!Direction::Short.stop_crossed(dec!(105), dec!(104)));
    }
}
