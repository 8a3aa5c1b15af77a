//! Take-profit ladder: dedup, even split, venue-constraint redistribution.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::models::{Direction, SymbolInfo};

use super::position_sizer::{floor_to_step, round_price};

/// One take-profit level ready for submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TpAllocation {
    /// Position in the deduplicated ladder
    pub index: u32,
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Round, keep only profit-side prices, sort toward the far target, and
/// collapse duplicates. Long ladders ascend, short ladders descend.
pub fn dedup_take_profits(
    prices: &[Decimal],
    direction: Direction,
    entry: Decimal,
    price_precision: u32,
    tick_size: Option<Decimal>,
) -> Vec<Decimal> {
    let mut kept: Vec<Decimal> = prices
        .iter()
        .filter_map(|p| round_price(*p, price_precision, tick_size).ok())
        .filter(|p| direction.is_profit_side(entry, *p))
        .collect();

    match direction {
        Direction::Long => kept.sort(),
        Direction::Short => kept.sort_by(|a, b| b.cmp(a)),
    }
    kept.dedup();
    kept
}

/// Split `total` evenly across `levels`; the last level takes the remainder.
pub fn distribute_quantity(total: Decimal, levels: usize, precision: u32) -> Vec<Decimal> {
    if levels == 0 {
        return Vec::new();
    }

    let share = (total / Decimal::from(levels as u64))
        .round_dp_with_strategy(precision, RoundingStrategy::ToZero);
    let mut split = vec![share; levels - 1];
    let assigned: Decimal = split.iter().sum();
    split.push(total - assigned);
    split
}

/// Enforce step, minimum and maximum on an allocation.
///
/// Entries below the minimum are dropped and their quantity moves to the
/// last surviving entry. Entries above the maximum are capped and the excess
/// spreads backwards over entries with headroom; whatever does not fit is
/// dropped. The result may be empty.
#[allow(clippy::too_many_arguments)]
pub fn validate_and_redistribute(
    allocated: &[Decimal],
    prices: &[Decimal],
    total: Decimal,
    volume_step: Decimal,
    min_volume: Decimal,
    max_volume: Decimal,
    precision: u32,
) -> Vec<TpAllocation> {
    let target = total.min(allocated.iter().sum());

    let mut levels: Vec<TpAllocation> = allocated
        .iter()
        .zip(prices)
        .enumerate()
        .map(|(i, (qty, price))| TpAllocation {
            index: i as u32,
            price: *price,
            quantity: floor_to_step(*qty, volume_step, precision),
        })
        .filter(|l| l.quantity > Decimal::ZERO && l.quantity >= min_volume)
        .collect();

    let assigned: Decimal = levels.iter().map(|l| l.quantity).sum();
    let freed = target - assigned;
    match levels.last_mut() {
        None => return Vec::new(),
        Some(last) if freed > Decimal::ZERO => {
            last.quantity = floor_to_step(last.quantity + freed, volume_step, precision);
        }
        Some(_) => {}
    }

    for i in 0..levels.len() {
        if levels[i].quantity <= max_volume {
            continue;
        }
        let mut excess = levels[i].quantity - max_volume;
        levels[i].quantity = max_volume;

        for j in (0..levels.len()).rev() {
            if j == i || excess <= Decimal::ZERO {
                continue;
            }
            let headroom = max_volume - levels[j].quantity;
            let moved = floor_to_step(headroom.min(excess), volume_step, precision);
            if moved > Decimal::ZERO {
                levels[j].quantity += moved;
                excess -= moved;
            }
        }
    }

    levels
}

/// Allocate `total` across the ladder, shrinking to fewer (nearer) levels
/// when the full ladder cannot keep every level above the venue minimum.
pub fn allocate(total: Decimal, prices: &[Decimal], info: &SymbolInfo) -> Vec<TpAllocation> {
    let attempt = |levels: usize| {
        let split = distribute_quantity(total, levels, info.qty_precision);
        validate_and_redistribute(
            &split,
            &prices[..levels],
            total,
            info.volume_step,
            info.min_volume,
            info.max_volume,
            info.qty_precision,
        )
    };

    for levels in (1..=prices.len()).rev() {
        let result = attempt(levels);
        if result.len() == levels {
            return result;
        }
    }
    if prices.is_empty() {
        return Vec::new();
    }
    attempt(prices.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_long_ladder_dedup_and_split() {
        let prices = dedup_take_profits(
            &[dec!(110), dec!(105), dec!(120), dec!(90), dec!(110.001)],
            Direction::Long,
            dec!(100),
            2,
            None,
        );
        assert_eq!(prices, vec![dec!(105), dec!(110), dec!(120)]);
        assert_eq!(
            distribute_quantity(dec!(10), prices.len(), 0),
            vec![dec!(3), dec!(3), dec!(4)]
        );
    }

    #[test]
    fn test_short_ladder_descends() {
        let prices = dedup_take_profits(
            &[dec!(90), dec!(95), dec!(105), dec!(80)],
            Direction::Short,
            dec!(100),
            2,
            None,
        );
        assert_eq!(prices, vec![dec!(95), dec!(90), dec!(80)]);
    }

    #[test]
    fn test_below_minimum_moves_to_last() {
        let result = validate_and_redistribute(
            &[dec!(0.5), dec!(2), dec!(2.5)],
            &[dec!(105), dec!(110), dec!(120)],
            dec!(5),
            dec!(0.1),
            dec!(1),
            dec!(100),
            1,
        );
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].index, 1);
        assert_eq!(result[1].quantity, dec!(3));
    }

    #[test]
    fn test_excess_above_maximum_spreads_backwards() {
        let result = validate_and_redistribute(
            &[dec!(8), dec!(2), dec!(2)],
            &[dec!(105), dec!(110), dec!(120)],
            dec!(12),
            dec!(1),
            dec!(1),
            dec!(5),
            0,
        );
        let quantities: Vec<_> = result.iter().map(|l| l.quantity).collect();
        assert_eq!(quantities, vec![dec!(5), dec!(2), dec!(5)]);
    }

    #[test]
    fn test_nothing_valid_is_empty() {
        let result = validate_and_redistribute(
            &[dec!(0.1), dec!(0.1)],
            &[dec!(105), dec!(110)],
            dec!(0.2),
            dec!(0.1),
            dec!(1),
            dec!(10),
            1,
        );
        assert!(result.is_empty());
    }

    #[test]
    fn test_allocate_falls_back_to_fewer_levels() {
        let info = SymbolInfo {
            symbol: "BTCUSDT".to_string(),
            price_precision: 2,
            qty_precision: 0,
            tick_size: None,
            min_volume: dec!(2),
            max_volume: dec!(100),
            volume_step: dec!(1),
            tradeable: true,
        };
        let result = allocate(dec!(5), &[dec!(105), dec!(110), dec!(120)], &info);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].price, dec!(105));
        assert_eq!(result[1].price, dec!(110));
        assert_eq!(result[0].quantity + result[1].quantity, dec!(5));
    }

    proptest! {
        #[test]
        fn prop_distribution_sums_to_total(units in 0u64..1_000_000, levels in 1usize..8, precision in 0u32..4) {
            let total = Decimal::new(units as i64, precision);
            let split = distribute_quantity(total, levels, precision);
            prop_assert_eq!(split.len(), levels);
            prop_assert_eq!(split.iter().sum::<Decimal>(), total);
        }

        #[test]
        fn prop_redistribution_respects_bounds(
            quantities in proptest::collection::vec(0u64..5_000, 1..6),
            min_units in 1u64..50,
            extra_units in 0u64..2_000,
        ) {
            let step = dec!(0.01);
            let min = Decimal::new(min_units as i64, 2);
            let max = min + Decimal::new(extra_units as i64, 2);
            let allocated: Vec<Decimal> = quantities.iter().map(|q| Decimal::new(*q as i64, 2)).collect();
            let prices: Vec<Decimal> = (0..allocated.len()).map(|i| Decimal::from(100 + i as u64)).collect();
            let total: Decimal = allocated.iter().sum();

            let result = validate_and_redistribute(&allocated, &prices, total, step, min, max, 2);
            let sum: Decimal = result.iter().map(|l| l.quantity).sum();
            prop_assert!(sum <= total);
            for level in &result {
                prop_assert!(level.quantity >= min);
                prop_assert!(level.quantity <= max);
            }
        }
    }
}
