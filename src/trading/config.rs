//! Placement, monitoring, and risk-policy configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::exchange::RetryPolicy;

/// Configuration for initial order placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Seconds an unfilled entry order stays live before it is cancelled
    pub entry_timeout_secs: i64,

    /// Balance used for simulated accounts instead of asking the venue
    pub simulation_balance: Decimal,

    /// Leverage applied when a signal does not state one
    pub default_leverage: Decimal,

    /// Retry policy for venue reads made while placing
    pub retry: RetryPolicy,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            entry_timeout_secs: 24 * 3600, // 1 day
            simulation_balance: dec!(10000),
            default_leverage: dec!(1),
            retry: RetryPolicy::default(),
        }
    }
}

/// How breakeven is applied once enough take-profits have filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakevenMode {
    /// Place a reduce-side limit order at entry for the remaining quantity
    Limit,
    /// Move the attached stop to the entry price
    MoveStop,
}

/// Configuration for the per-(channel, exchange) reconciliation loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Delay between ticks in milliseconds
    pub poll_interval_ms: u64,

    /// Skip the inter-tick delay and only yield (historical simulation)
    pub max_speed: bool,

    /// Number of filled take-profits that triggers breakeven (0 disables)
    pub breakeven_after_tps: u32,

    pub breakeven_mode: BreakevenMode,

    /// Retry policy for venue reads made during a tick
    pub retry: RetryPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            max_speed: false,
            breakeven_after_tps: 1,
            breakeven_mode: BreakevenMode::MoveStop,
            retry: RetryPolicy::default(),
        }
    }
}

/// Portfolio-level loss limits, in percent of the reference balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskPolicy {
    pub name: String,
    pub max_daily_loss_pct: Decimal,
    pub max_total_loss_pct: Decimal,
    pub initial_balance: Decimal,
}
