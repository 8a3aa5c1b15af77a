//! Risk-based sizing and venue precision rounding.
//!
//! Quantity is capital-at-risk over the per-unit stop distance. Every price
//! and quantity that leaves this module is already rounded for the venue.

use rust_decimal::{Decimal, RoundingStrategy};
use tracing::warn;

use crate::error::ValidationError;
use crate::models::SymbolInfo;

/// Units to trade so that hitting the stop loses `risk_pct` of `balance`.
///
/// Leverage above the account's base leverage scales the risk budget
/// proportionally. A non-positive base leverage disables scaling.
pub fn calculate_position_size(
    balance: Decimal,
    risk_pct: Decimal,
    entry_price: Decimal,
    stop_loss: Decimal,
    leverage: Decimal,
    base_leverage: Decimal,
) -> Result<Decimal, ValidationError> {
    let distance = (entry_price - stop_loss).abs();
    if distance.is_zero() {
        return Err(ValidationError::ZeroStopDistance {
            entry: entry_price,
            stop: stop_loss,
        });
    }

    let leverage_scale = if base_leverage > Decimal::ZERO && leverage > Decimal::ZERO {
        leverage / base_leverage
    } else {
        Decimal::ONE
    };

    let capital_at_risk = balance * risk_pct / Decimal::ONE_HUNDRED * leverage_scale;
    let size = capital_at_risk / distance;
    if size <= Decimal::ZERO {
        return Err(ValidationError::InvalidQuantity(size));
    }
    Ok(size)
}

/// Round to the nearest tick when one is given, else to `precision` decimals.
pub fn round_price(
    price: Decimal,
    precision: u32,
    tick_size: Option<Decimal>,
) -> Result<Decimal, ValidationError> {
    let rounded = match tick_size {
        Some(tick) if tick > Decimal::ZERO => ((price / tick)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            * tick)
            .normalize(),
        _ => price
            .round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero)
            .normalize(),
    };

    if rounded <= Decimal::ZERO {
        return Err(ValidationError::InvalidPrice(price));
    }
    Ok(rounded)
}

/// Units bought by spending `position_size` at `price`.
pub fn calculate_quantity(
    position_size: Decimal,
    price: Decimal,
    precision: u32,
) -> Result<Decimal, ValidationError> {
    if price <= Decimal::ZERO {
        return Err(ValidationError::InvalidPrice(price));
    }
    Ok((position_size / price).round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero))
}

/// Floor `quantity` to a multiple of `step`; without a step, truncate to `precision`.
pub fn floor_to_step(quantity: Decimal, step: Decimal, precision: u32) -> Decimal {
    if step > Decimal::ZERO {
        ((quantity / step).floor() * step).normalize()
    } else {
        quantity.round_dp_with_strategy(precision, RoundingStrategy::ToZero)
    }
}

/// Fit a raw quantity to the venue's step, minimum and maximum.
///
/// Raising to the minimum increases the realized risk, and capping at the
/// maximum leaves stop and target prices untouched; both are logged.
pub fn fit_quantity(raw: Decimal, info: &SymbolInfo) -> Result<Decimal, ValidationError> {
    let mut quantity = floor_to_step(raw, info.volume_step, info.qty_precision);

    if quantity < info.min_volume {
        warn!(
            symbol = %info.symbol,
            computed = %quantity,
            min_volume = %info.min_volume,
            "Quantity below venue minimum, raising to minimum"
        );
        quantity = info.min_volume;
    }
    if quantity > info.max_volume {
        warn!(
            symbol = %info.symbol,
            computed = %quantity,
            max_volume = %info.max_volume,
            "Quantity above venue maximum, capping"
        );
        quantity = info.max_volume;
    }

    if quantity <= Decimal::ZERO {
        return Err(ValidationError::InvalidQuantity(quantity));
    }
    Ok(quantity)
}
