//! Data models for trades, orders, signals, and normalized venue records.

mod order;
mod signal;
mod trade;
mod venue;

pub use order::{Order, OrderKind, OrderStatus};
pub use signal::TradeSignal;
pub use trade::{Direction, EntryOrderType, Trade, TradeStatus};
pub use venue::{
    AccountInfo, LimitOrderRequest, ModifyPositionRequest, OrderSide, SymbolInfo, VenueOrder,
    VenueOrderStatus, VenuePosition,
};

#[cfg(test)]
pub(crate) use trade::fixtures;
