//! Portfolio loss limits: worst-case loss of open positions plus the
//! proposed trade, checked against every configured policy.

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::warn;

use crate::models::{Direction, Trade, VenuePosition};

use super::RiskPolicy;

/// A policy the proposed trade would break.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyViolation {
    pub policy: String,
    pub reason: String,
}

/// Loss if price moves straight from `entry` to `stop`.
///
/// A stop on the profit side of entry locks in gains and contributes nothing.
pub fn worst_case_loss(entry: Decimal, stop: Decimal, volume: Decimal, direction: Direction) -> Decimal {
    let per_unit = (entry - stop) * direction.sign();
    per_unit.max(Decimal::ZERO) * volume.abs()
}

/// Worst-case loss across open positions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenRisk {
    pub total: Decimal,
    /// Positions left out of `total` because entry or stop was unknown
    pub excluded: Vec<String>,
}

/// Sum worst-case loss over venue positions.
///
/// Stops come from the venue when it reports them, otherwise from the local
/// trade matched by position id, or failing that by symbol and side.
pub fn aggregate_open_risk(positions: &[VenuePosition], trades: &[Trade]) -> OpenRisk {
    let mut risk = OpenRisk::default();

    for position in positions.iter().filter(|p| p.is_open()) {
        let direction = position.side.direction();
        let trade = trades
            .iter()
            .find(|t| t.position_id.as_deref() == Some(position.position_id.as_str()))
            .or_else(|| {
                trades
                    .iter()
                    .find(|t| t.trading_pair == position.symbol && t.direction == direction)
            });

        let entry = position.avg_price.or_else(|| trade.map(|t| t.entry_price));
        let stop = position.stop_loss.or_else(|| trade.map(|t| t.stop_loss));

        match (entry, stop) {
            (Some(entry), Some(stop)) => {
                risk.total += worst_case_loss(entry, stop, position.volume, direction);
            }
            _ => {
                warn!(
                    position_id = %position.position_id,
                    symbol = %position.symbol,
                    "Open position has no known entry or stop; worst-case loss bound is incomplete"
                );
                risk.excluded.push(position.position_id.clone());
            }
        }
    }

    risk
}

/// Check `existing + proposed` worst-case loss against each policy.
///
/// The reference balance is the smaller of the policy's initial balance and
/// today's starting balance.
pub fn validate_trade_against_policies(
    existing_loss: Decimal,
    proposed_loss: Decimal,
    day_start_balance: Decimal,
    policies: &[RiskPolicy],
) -> Result<(), Vec<PolicyViolation>> {
    let cumulative = existing_loss + proposed_loss;

    let violations: Vec<PolicyViolation> = policies
        .iter()
        .filter_map(|policy| {
            let reference = if day_start_balance > Decimal::ZERO {
                policy.initial_balance.min(day_start_balance)
            } else {
                policy.initial_balance
            };
            if reference <= Decimal::ZERO {
                return Some(PolicyViolation {
                    policy: policy.name.clone(),
                    reason: format!("{}: no positive reference balance", policy.name),
                });
            }

            let pct = (cumulative / reference * Decimal::ONE_HUNDRED).round_dp(4);
            let mut breached = Vec::new();
            if pct > policy.max_daily_loss_pct {
                breached.push(format!("daily limit {}%", policy.max_daily_loss_pct));
            }
            if pct > policy.max_total_loss_pct {
                breached.push(format!("total limit {}%", policy.max_total_loss_pct));
            }

            (!breached.is_empty()).then(|| PolicyViolation {
                policy: policy.name.clone(),
                reason: format!(
                    "{}: worst-case loss {} is {}% of {}, exceeding {}",
                    policy.name,
                    cumulative.round_dp(2),
                    pct.normalize(),
                    reference,
                    breached.join(" and ")
                ),
            })
        })
        .collect();

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{fixtures, OrderSide};
    use rust_decimal_macros::dec;

    fn policy(daily: Decimal, total: Decimal) -> RiskPolicy {
        RiskPolicy {
            name: "prop-firm".to_string(),
            max_daily_loss_pct: daily,
            max_total_loss_pct: total,
            initial_balance: dec!(10000),
        }
    }

    #[test]
    fn test_worst_case_loss_is_direction_aware() {
        assert_eq!(worst_case_loss(dec!(100), dec!(95), dec!(2), Direction::Long), dec!(10));
        assert_eq!(worst_case_loss(dec!(100), dec!(105), dec!(2), Direction::Short), dec!(10));
        assert_eq!(worst_case_loss(dec!(100), dec!(105), dec!(2), Direction::Long), dec!(0));
    }

    #[test]
    fn test_policy_uses_smaller_reference_balance() {
        // 300 of min(10000, 5000) = 6%
        let result = validate_trade_against_policies(dec!(100), dec!(200), dec!(5000), &[policy(dec!(5), dec!(10))]);
        let violations = result.unwrap_err();
        assert_eq!(violations.len(), 1);
        assert!(violations[0].reason.contains("daily limit"));
        assert!(!violations[0].reason.contains("total limit"));

        assert!(validate_trade_against_policies(dec!(100), dec!(200), dec!(20000), &[policy(dec!(5), dec!(10))]).is_ok());
    }

    #[test]
    fn test_no_policies_always_passes() {
        assert!(validate_trade_against_policies(dec!(1000000), dec!(1000000), dec!(1), &[]).is_ok());
    }

    #[test]
    fn test_aggregate_joins_local_stops_and_excludes_unknown() {
        let mut trade = fixtures::pending_long();
        trade.position_id = Some("pos-1".to_string());

        let positions = vec![
            VenuePosition {
                position_id: "pos-1".to_string(),
                symbol: "BTCUSDT".to_string(),
                side: OrderSide::Buy,
                volume: dec!(4),
                avg_price: Some(dec!(100)),
                stop_loss: None,
            },
            VenuePosition {
                position_id: "orphan".to_string(),
                symbol: "ETHUSDT".to_string(),
                side: OrderSide::Sell,
                volume: dec!(1),
                avg_price: Some(dec!(2000)),
                stop_loss: None,
            },
        ];

        let risk = aggregate_open_risk(&positions, &[trade]);
        assert_eq!(risk.total, dec!(20));
        assert_eq!(risk.excluded, vec!["orphan".to_string()]);
    }
}
