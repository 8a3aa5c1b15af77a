//! Trading logic: routing, sizing, risk policies, placement, and the
//! reconciliation loop.

mod config;
mod monitor;
mod order_placer;
mod position_sizer;
mod protection;
mod risk;
mod routing;
mod snapshot;
mod take_profit;

pub use config::{BreakevenMode, MonitorConfig, PlacementConfig, RiskPolicy};
pub use monitor::{TickSummary, TradeMonitor};
pub use order_placer::{AccountOutcome, OrderPlacer, PlacedTrade};
pub use position_sizer::{calculate_position_size, calculate_quantity, fit_quantity, round_price};
pub use protection::ProtectionOutcome;
pub use risk::{aggregate_open_risk, validate_trade_against_policies, OpenRisk, PolicyViolation};
pub use routing::select_accounts;
pub use take_profit::{allocate, TpAllocation};
