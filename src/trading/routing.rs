//! Account selection for an incoming signal.

use rust_decimal::Decimal;
use tracing::warn;

use crate::config::{AccountConfig, AppConfig, RoutingRule};
use crate::models::TradeSignal;

fn rule_matches(rule: &RoutingRule, signal: &TradeSignal, leverage: Decimal) -> bool {
    let pair_ok = rule.trading_pairs.is_empty()
        || rule
            .trading_pairs
            .iter()
            .any(|p| p.eq_ignore_ascii_case(&signal.trading_pair));

    let type_ok = rule.signal_types.is_empty()
        || signal
            .signal_type
            .as_deref()
            .is_some_and(|t| rule.signal_types.iter().any(|s| s.eq_ignore_ascii_case(t)));

    let min_ok = rule.min_leverage.map_or(true, |min| leverage >= min);
    let max_ok = rule.max_leverage.map_or(true, |max| leverage <= max);

    pair_ok && type_ok && min_ok && max_ok
}

/// Accounts a signal should be placed on.
///
/// Union of the accounts of every matching rule, in config order without
/// repeats; the default list when nothing matches.
pub fn select_accounts<'a>(config: &'a AppConfig, signal: &TradeSignal) -> Vec<&'a AccountConfig> {
    let leverage = signal.leverage.unwrap_or(config.placement.default_leverage);

    let mut names: Vec<&str> = config
        .routing
        .rules
        .iter()
        .filter(|rule| rule_matches(rule, signal, leverage))
        .flat_map(|rule| rule.accounts.iter().map(String::as_str))
        .collect();

    if names.is_empty() {
        names = config
            .routing
            .default_accounts
            .iter()
            .map(String::as_str)
            .collect();
    }

    let mut selected: Vec<&AccountConfig> = Vec::new();
    for name in names {
        if selected.iter().any(|a| a.name == name) {
            continue;
        }
        match config.account(name) {
            Some(account) => selected.push(account),
            None => warn!(account = name, "Routing names an unknown account, skipping"),
        }
    }
    selected
}
