//! Venue boundary: the adapter trait, adapter factory, and built-in adapters.

mod bridge;
mod mapping;
mod retry;
mod simulated;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::config::AccountConfig;
use crate::error::ExchangeError;
use crate::models::{
    AccountInfo, LimitOrderRequest, ModifyPositionRequest, SymbolInfo, VenueOrder, VenuePosition,
};

pub use bridge::BridgeClient;
pub use retry::{observe, with_retry, RetryPolicy};
pub use simulated::SimulatedExchange;

/// API credentials resolved from the environment.
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &self.api_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Venue-specific order and position operations.
///
/// Implementations return normalized records only. Each instance is one
/// account's session; it must be safe to share across tasks.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Exchange identifier this adapter serves.
    fn exchange_id(&self) -> &str;

    async fn connect(&self) -> Result<(), ExchangeError>;

    async fn authenticate(&self) -> Result<(), ExchangeError>;

    async fn get_account_info(&self) -> Result<AccountInfo, ExchangeError>;

    /// Constraints for `symbol`; `NotFound` if the venue does not list it.
    async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo, ExchangeError>;

    async fn get_current_price(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError>;

    /// Submit a limit order and return the venue order id.
    async fn place_limit_order(&self, request: &LimitOrderRequest) -> Result<String, ExchangeError>;

    async fn modify_position(&self, request: &ModifyPositionRequest) -> Result<(), ExchangeError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError>;

    async fn get_open_positions(&self) -> Result<Vec<VenuePosition>, ExchangeError>;

    async fn get_open_orders(&self) -> Result<Vec<VenueOrder>, ExchangeError>;

    async fn close_position(&self, position_id: &str) -> Result<(), ExchangeError>;

    async fn disconnect(&self) -> Result<(), ExchangeError>;
}

type AdapterConstructor = Arc<
    dyn Fn(&AccountConfig, Credentials) -> Result<Arc<dyn ExchangeAdapter>, ExchangeError>
        + Send
        + Sync,
>;

/// Builds adapter sessions keyed by exchange identifier.
///
/// Constructed once at startup and handed to whatever needs venue sessions.
#[derive(Clone, Default)]
pub struct AdapterFactory {
    constructors: HashMap<String, AdapterConstructor>,
}

impl AdapterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for `exchange_id`, replacing any previous one.
    pub fn register<F>(mut self, exchange_id: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&AccountConfig, Credentials) -> Result<Arc<dyn ExchangeAdapter>, ExchangeError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .insert(exchange_id.into(), Arc::new(constructor));
        self
    }

    /// Register a single shared adapter instance for `exchange_id`.
    ///
    /// Every account on that exchange gets the same session; used for the
    /// in-memory venue in simulation and tests.
    pub fn register_shared(
        self,
        exchange_id: impl Into<String>,
        adapter: Arc<dyn ExchangeAdapter>,
    ) -> Self {
        self.register(exchange_id, move |_, _| Ok(adapter.clone()))
    }

    /// Whether an adapter is registered for `exchange_id`.
    pub fn supports(&self, exchange_id: &str) -> bool {
        self.constructors.contains_key(exchange_id)
    }

    /// Create a session for `account`.
    pub fn create(
        &self,
        account: &AccountConfig,
        credentials: Credentials,
    ) -> Result<Arc<dyn ExchangeAdapter>, ExchangeError> {
        let constructor = self.constructors.get(&account.exchange).ok_or_else(|| {
            ExchangeError::Fatal(format!(
                "no adapter registered for exchange {}",
                account.exchange
            ))
        })?;
        constructor(account, credentials)
    }
}

impl std::fmt::Debug for AdapterFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.constructors.keys().collect();
        ids.sort();
        f.debug_struct("AdapterFactory").field("exchanges", &ids).finish()
    }
}

/// Open a session: create, connect, authenticate.
pub async fn open_session(
    factory: &AdapterFactory,
    account: &AccountConfig,
    credentials: Credentials,
) -> Result<Arc<dyn ExchangeAdapter>, ExchangeError> {
    let adapter = factory.create(account, credentials)?;
    adapter.connect().await?;
    adapter.authenticate().await?;
    Ok(adapter)
}
