//! Application configuration: accounts, routing, policies, loop settings.
//!
//! Loaded from a JSON file; every section falls back to its `Default`.
//! Credentials never live in the file: each account names the environment
//! variables (usually from `.env`) that hold its key and secret.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::exchange::Credentials;
use crate::trading::{MonitorConfig, PlacementConfig, RiskPolicy};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Database URL
    pub database_url: String,

    pub accounts: Vec<AccountConfig>,

    pub routing: RoutingConfig,

    pub risk_policies: Vec<RiskPolicy>,

    pub placement: PlacementConfig,

    pub monitor: MonitorConfig,

    pub bridge: BridgeConfig,

    pub paper: PaperVenueConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite:./signal_executor.db?mode=rwc".to_string(),
            accounts: vec![AccountConfig::default()],
            routing: RoutingConfig {
                rules: Vec::new(),
                default_accounts: vec!["paper".to_string()],
            },
            risk_policies: Vec::new(),
            placement: PlacementConfig::default(),
            monitor: MonitorConfig::default(),
            bridge: BridgeConfig::default(),
            paper: PaperVenueConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Ok(Self::default()),
        }
    }

    pub fn account(&self, name: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.name == name)
    }

    fn validate(&self) -> Result<()> {
        for account in &self.accounts {
            if account.risk_percentage <= Decimal::ZERO || account.risk_percentage > dec!(100) {
                anyhow::bail!(
                    "Account {}: risk_percentage must be in (0, 100], got {}",
                    account.name,
                    account.risk_percentage
                );
            }
            if account.base_leverage <= Decimal::ZERO {
                anyhow::bail!("Account {}: base_leverage must be positive", account.name);
            }
        }
        for policy in &self.risk_policies {
            if policy.initial_balance <= Decimal::ZERO {
                anyhow::bail!("Risk policy {}: initial_balance must be positive", policy.name);
            }
        }
        Ok(())
    }
}

/// How an account turns a signal into a quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SizingMode {
    /// Risk a percentage of balance between entry and stop
    Risk,
    /// Spend a fixed margin amount (scaled by leverage) regardless of stop distance
    FixedNotional { amount: Decimal },
}

/// Names of the environment variables holding an account's credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialsConfig {
    pub api_key_env: String,
    #[serde(default)]
    pub api_secret_env: Option<String>,
}

/// One trading account on one exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub name: String,

    /// Exchange identifier (adapter factory key)
    pub exchange: String,

    /// Percent of balance risked per trade
    pub risk_percentage: Decimal,

    /// Leverage the risk percentage is calibrated for
    #[serde(default = "default_base_leverage")]
    pub base_leverage: Decimal,

    /// Upper bound on signal leverage for this account
    #[serde(default)]
    pub max_leverage: Option<Decimal>,

    /// Use the fixed simulation balance instead of the venue's
    #[serde(default)]
    pub simulation: bool,

    #[serde(default)]
    pub credentials: Option<CredentialsConfig>,

    #[serde(default = "default_sizing")]
    pub sizing: SizingMode,
}

fn default_base_leverage() -> Decimal {
    Decimal::ONE
}

fn default_sizing() -> SizingMode {
    SizingMode::Risk
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            name: "paper".to_string(),
            exchange: "simulated".to_string(),
            risk_percentage: dec!(1),
            base_leverage: Decimal::ONE,
            max_leverage: None,
            simulation: true,
            credentials: None,
            sizing: SizingMode::Risk,
        }
    }
}

impl AccountConfig {
    /// Resolve credentials from the environment.
    ///
    /// Simulated accounts without a credentials section get empty ones;
    /// anything else without a resolvable key returns `None`.
    pub fn resolve_credentials(&self) -> Option<Credentials> {
        let Some(names) = &self.credentials else {
            return self.simulation.then(Credentials::default);
        };
        let api_key = std::env::var(&names.api_key_env).ok()?;
        let api_secret = match &names.api_secret_env {
            Some(var) => Some(std::env::var(var).ok()?),
            None => None,
        };
        Some(Credentials { api_key, api_secret })
    }

    /// Clamp signal leverage to the account limit.
    pub fn effective_leverage(&self, requested: Decimal) -> Decimal {
        match self.max_leverage {
            Some(max) if requested > max => max,
            _ => requested,
        }
    }
}

/// A routing rule: signals matching every populated criterion go to `accounts`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingRule {
    /// Trading pairs this rule applies to (empty = any)
    pub trading_pairs: Vec<String>,

    /// Signal types this rule applies to (empty = any)
    pub signal_types: Vec<String>,

    pub min_leverage: Option<Decimal>,

    pub max_leverage: Option<Decimal>,

    pub accounts: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub rules: Vec<RoutingRule>,

    /// Accounts used when no rule matches
    pub default_accounts: Vec<String>,
}

/// Settings for the HTTP bridge adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Base URL per exchange identifier served by the bridge adapter
    pub base_urls: HashMap<String, String>,

    pub timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_urls: HashMap::new(),
            timeout_secs: 15,
        }
    }
}

/// The in-process paper venue registered as `simulated`.
///
/// It lives only as long as the process: `place` against it places and
/// protects in one go, but a separate `monitor` run starts from an empty venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperVenueConfig {
    /// Symbols listed with default precision and volume limits
    pub symbols: Vec<String>,
}

impl Default for PaperVenueConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "accounts": [
                    {"name": "main", "exchange": "bridge-a", "risk_percentage": "2",
                     "credentials": {"api_key_env": "MAIN_KEY"},
                     "sizing": {"mode": "fixed_notional", "amount": "50"}}
                ],
                "monitor": {"breakeven_mode": "limit"}
            }"#,
        )
        .unwrap();

        let main = config.account("main").unwrap();
        assert_eq!(main.base_leverage, Decimal::ONE);
        assert_eq!(main.sizing, SizingMode::FixedNotional { amount: dec!(50) });
        assert_eq!(config.monitor.poll_interval_ms, 5_000);
        assert_eq!(
            config.monitor.breakeven_mode,
            crate::trading::BreakevenMode::Limit
        );
        assert_eq!(config.placement.simulation_balance, dec!(10000));
    }

    #[test]
    fn test_validate_rejects_bad_risk() {
        let mut config = AppConfig::default();
        config.accounts[0].risk_percentage = dec!(150);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_leverage_clamp() {
        let account = AccountConfig {
            max_leverage: Some(dec!(20)),
            ..Default::default()
        };
        assert_eq!(account.effective_leverage(dec!(50)), dec!(20));
        assert_eq!(account.effective_leverage(dec!(5)), dec!(5));
    }

    #[test]
    fn test_simulated_account_without_credentials_resolves() {
        let account = AccountConfig::default();
        assert!(account.resolve_credentials().is_some());

        let live = AccountConfig {
            simulation: false,
            credentials: Some(CredentialsConfig {
                api_key_env: "SIGNAL_EXECUTOR_TEST_UNSET_KEY".to_string(),
                api_secret_env: None,
            }),
            ..Default::default()
        };
        assert!(live.resolve_credentials().is_none());
    }
}
