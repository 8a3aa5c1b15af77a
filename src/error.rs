//! Typed errors at the venue, store, and placement boundaries.
//!
//! Application plumbing uses `anyhow::Result`; these enums exist where a
//! caller has to branch on the kind of failure (retry or not, skip an
//! account, surface risk reasons).

use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::TradeStatus;
use crate::trading::PolicyViolation;

/// Failure talking to a venue.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Timeout, rate limit, or temporary outage; worth retrying.
    #[error("transient venue error: {0}")]
    Transient(String),

    /// Bad credentials or authentication failure; abort this account.
    #[error("fatal venue error: {0}")]
    Fatal(String),

    /// The venue refused the request (bad volume, closed market, ...).
    #[error("venue rejected request: {0}")]
    Rejected(String),

    #[error("not found on venue: {0}")]
    NotFound(String),
}

impl ExchangeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transient(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ExchangeError::Fatal(_))
    }
}

/// Input that must be rejected before any order reaches the venue.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("unknown symbol {0}")]
    UnknownSymbol(String),

    #[error("symbol {0} is not tradeable")]
    SymbolNotTradeable(String),

    #[error("invalid price {0}")]
    InvalidPrice(Decimal),

    #[error("invalid quantity {0}")]
    InvalidQuantity(Decimal),

    #[error("no entry price given and no market price available for {0}")]
    NoEntryPrice(String),

    #[error("stop loss {stop} equals entry {entry}")]
    ZeroStopDistance { entry: Decimal, stop: Decimal },

    #[error("stop loss {stop} is on the wrong side of entry {entry}")]
    StopLossSide { entry: Decimal, stop: Decimal },

    #[error("take profit {tp} is on the wrong side of entry {entry}")]
    TakeProfitSide { entry: Decimal, tp: Decimal },

    #[error("market price {price} has already crossed stop loss {stop}")]
    StopAlreadyCrossed { price: Decimal, stop: Decimal },
}

/// Persistence failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("trade for signal {signal_id} on account {account} already exists")]
    Duplicate { signal_id: String, account: String },

    #[error("trade {trade_id} cannot move from {from} to {to}")]
    InvalidTransition {
        trade_id: String,
        from: TradeStatus,
        to: TradeStatus,
    },

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Why a signal could not be placed on one account.
#[derive(Debug, Error)]
pub enum PlacementError {
    #[error("no credentials configured for account {0}")]
    MissingCredentials(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("risk policy violated: {}", format_violations(.0))]
    RiskPolicy(Vec<PolicyViolation>),

    #[error(transparent)]
    Venue(#[from] ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PlacementError {
    /// Skips are not failures: the account simply does not take part.
    pub fn is_skip(&self) -> bool {
        matches!(self, PlacementError::MissingCredentials(_))
    }
}

fn format_violations(violations: &[PolicyViolation]) -> String {
    violations
        .iter()
        .map(|v| v.reason.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}
