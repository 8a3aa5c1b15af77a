//! In-memory venue used for simulated accounts, historical replay, and tests.
//!
//! Netting model: at most one position per symbol. Resting limit orders
//! fill when the price crosses them; attached stops close the position when
//! the price reaches them. Failures can be injected to exercise retry paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::error::ExchangeError;
use crate::models::{
    AccountInfo, LimitOrderRequest, ModifyPositionRequest, OrderSide, SymbolInfo, VenueOrder,
    VenueOrderStatus, VenuePosition,
};

use super::ExchangeAdapter;

#[derive(Debug, Clone)]
struct SimOrder {
    symbol: String,
    side: OrderSide,
    volume: Decimal,
    price: Decimal,
    status: VenueOrderStatus,
}

#[derive(Debug, Clone)]
struct SimPosition {
    id: String,
    symbol: String,
    side: OrderSide,
    volume: Decimal,
    avg_price: Decimal,
    stop_loss: Option<Decimal>,
    take_profit: Option<Decimal>,
}

#[derive(Debug, Default)]
struct SimState {
    balance: Decimal,
    symbols: HashMap<String, SymbolInfo>,
    prices: HashMap<String, Decimal>,
    orders: BTreeMap<String, SimOrder>,
    positions: BTreeMap<String, SimPosition>,
    closed_at: HashMap<String, Decimal>,
    next_id: u64,
    failures: VecDeque<ExchangeError>,
    call_failures: HashMap<&'static str, VecDeque<ExchangeError>>,
    report_filled_orders: bool,
    calls: HashMap<&'static str, u32>,
}

impl SimState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    fn enter(&mut self, call: &'static str) -> Result<(), ExchangeError> {
        *self.calls.entry(call).or_default() += 1;
        if let Some(err) = self.call_failures.get_mut(call).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        match self.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Apply a fill of `volume` at `price` to the symbol's net position.
    fn apply_fill(&mut self, symbol: &str, side: OrderSide, volume: Decimal, price: Decimal) {
        let existing = self
            .positions
            .values()
            .find(|p| p.symbol == symbol)
            .map(|p| p.id.clone());

        match existing {
            Some(id) => {
                let Some(pos) = self.positions.get_mut(&id) else {
                    return;
                };
                if pos.side == side {
                    let total = pos.volume + volume;
                    pos.avg_price = (pos.avg_price * pos.volume + price * volume) / total;
                    pos.volume = total;
                } else if volume < pos.volume {
                    pos.volume -= volume;
                } else {
                    let remainder = volume - pos.volume;
                    self.positions.remove(&id);
                    self.closed_at.insert(id, price);
                    if remainder > Decimal::ZERO {
                        self.open_position(symbol, side, remainder, price);
                    }
                }
            }
            None => self.open_position(symbol, side, volume, price),
        }
    }

    fn open_position(&mut self, symbol: &str, side: OrderSide, volume: Decimal, price: Decimal) {
        let id = self.next_id("pos");
        self.positions.insert(
            id.clone(),
            SimPosition {
                id,
                symbol: symbol.to_string(),
                side,
                volume,
                avg_price: price,
                stop_loss: None,
                take_profit: None,
            },
        );
    }

    /// Fill crossed resting orders, then trigger crossed stops and targets.
    fn match_symbol(&mut self, symbol: &str) {
        let Some(price) = self.prices.get(symbol).copied() else {
            return;
        };

        let crossed: Vec<String> = self
            .orders
            .iter()
            .filter(|(_, o)| o.symbol == symbol && o.status == VenueOrderStatus::Open)
            .filter(|(_, o)| match o.side {
                OrderSide::Buy => price <= o.price,
                OrderSide::Sell => price >= o.price,
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in crossed {
            let Some(order) = self.orders.get_mut(&id) else {
                continue;
            };
            order.status = VenueOrderStatus::Filled;
            let (side, volume, limit) = (order.side, order.volume, order.price);
            debug!(order_id = %id, symbol, price = %limit, "Simulated order filled");
            self.apply_fill(symbol, side, volume, limit);
        }

        let triggered: Vec<(String, Decimal)> = self
            .positions
            .values()
            .filter(|p| p.symbol == symbol)
            .filter_map(|p| {
                let stop_hit = p.stop_loss.filter(|sl| match p.side {
                    OrderSide::Buy => price <= *sl,
                    OrderSide::Sell => price >= *sl,
                });
                let target_hit = p.take_profit.filter(|tp| match p.side {
                    OrderSide::Buy => price >= *tp,
                    OrderSide::Sell => price <= *tp,
                });
                stop_hit.or(target_hit).map(|level| (p.id.clone(), level))
            })
            .collect();

        for (id, level) in triggered {
            debug!(position_id = %id, level = %level, "Simulated protective level hit");
            self.positions.remove(&id);
            self.closed_at.insert(id, level);
        }
    }
}

/// In-memory venue.
#[derive(Debug)]
pub struct SimulatedExchange {
    exchange_id: String,
    state: Mutex<SimState>,
}

impl Default for SimulatedExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedExchange {
    pub fn new() -> Self {
        Self::with_id("simulated")
    }

    pub fn with_id(exchange_id: impl Into<String>) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            state: Mutex::new(SimState {
                balance: dec!(10000),
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        // A poisoned lock only means a test panicked mid-update; the data is still usable.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_balance(&self, balance: Decimal) {
        self.state().balance = balance;
    }

    /// List a symbol with the given constraints.
    pub fn add_symbol(&self, info: SymbolInfo) {
        self.state().symbols.insert(info.symbol.clone(), info);
    }

    /// List a symbol with permissive defaults: 2 price decimals, 3 qty decimals.
    pub fn add_default_symbol(&self, symbol: &str) {
        self.add_symbol(SymbolInfo {
            symbol: symbol.to_string(),
            price_precision: 2,
            qty_precision: 3,
            tick_size: None,
            min_volume: dec!(0.001),
            max_volume: dec!(1000000),
            volume_step: dec!(0.001),
            tradeable: true,
        });
    }

    /// Move the market and run matching for that symbol.
    pub fn set_price(&self, symbol: &str, price: Decimal) {
        let mut state = self.state();
        state.prices.insert(symbol.to_string(), price);
        state.match_symbol(symbol);
    }

    /// Move the reported price without matching, as a venue whose book lags
    /// its quote (gaps, slow stop triggers).
    pub fn set_quote(&self, symbol: &str, price: Decimal) {
        self.state().prices.insert(symbol.to_string(), price);
    }

    /// The next `count` calls (any method) fail with `error`.
    pub fn inject_failures(&self, count: usize, error: ExchangeError) {
        let mut state = self.state();
        for _ in 0..count {
            state.failures.push_back(error.clone());
        }
    }

    /// The next `count` calls to `call` fail with `error`; other calls are unaffected.
    pub fn inject_call_failures(&self, call: &'static str, count: usize, error: ExchangeError) {
        let mut state = self.state();
        let queue = state.call_failures.entry(call).or_default();
        for _ in 0..count {
            queue.push_back(error.clone());
        }
    }

    /// Keep filled orders in the open-orders list with a FILLED status.
    pub fn report_filled_orders(&self, enabled: bool) {
        self.state().report_filled_orders = enabled;
    }

    /// Open a position directly, as if filled outside this process.
    pub fn open_position(&self, symbol: &str, side: OrderSide, volume: Decimal, price: Decimal) -> String {
        let mut state = self.state();
        state.apply_fill(symbol, side, volume, price);
        state
            .positions
            .values()
            .find(|p| p.symbol == symbol)
            .map(|p| p.id.clone())
            .unwrap_or_default()
    }

    /// Drop a position without a fill, as if closed outside this process.
    pub fn remove_position(&self, position_id: &str) {
        self.state().positions.remove(position_id);
    }

    pub fn call_count(&self, call: &str) -> u32 {
        self.state().calls.get(call).copied().unwrap_or(0)
    }

    pub fn position_stop(&self, position_id: &str) -> Option<Decimal> {
        self.state().positions.get(position_id).and_then(|p| p.stop_loss)
    }

    pub fn open_order_count(&self) -> usize {
        self.state()
            .orders
            .values()
            .filter(|o| o.status == VenueOrderStatus::Open)
            .count()
    }

    /// Price at which a position was closed, if it was.
    pub fn close_price(&self, position_id: &str) -> Option<Decimal> {
        self.state().closed_at.get(position_id).copied()
    }
}

#[async_trait]
impl ExchangeAdapter for SimulatedExchange {
    fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    async fn connect(&self) -> Result<(), ExchangeError> {
        self.state().enter("connect")
    }

    async fn authenticate(&self) -> Result<(), ExchangeError> {
        self.state().enter("authenticate")
    }

    async fn get_account_info(&self) -> Result<AccountInfo, ExchangeError> {
        let mut state = self.state();
        state.enter("get_account_info")?;
        Ok(AccountInfo {
            balance: state.balance,
            precision: 2,
        })
    }

    async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo, ExchangeError> {
        let mut state = self.state();
        state.enter("get_symbol_info")?;
        state
            .symbols
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::NotFound(format!("symbol {}", symbol)))
    }

    async fn get_current_price(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
        let mut state = self.state();
        state.enter("get_current_price")?;
        Ok(state.prices.get(symbol).copied())
    }

    async fn place_limit_order(&self, request: &LimitOrderRequest) -> Result<String, ExchangeError> {
        let mut state = self.state();
        state.enter("place_limit_order")?;
        if !state.symbols.contains_key(&request.symbol) {
            return Err(ExchangeError::Rejected(format!("unknown symbol {}", request.symbol)));
        }
        if request.volume <= Decimal::ZERO || request.price <= Decimal::ZERO {
            return Err(ExchangeError::Rejected("volume and price must be positive".into()));
        }

        let id = state.next_id("ord");
        state.orders.insert(
            id.clone(),
            SimOrder {
                symbol: request.symbol.clone(),
                side: request.side,
                volume: request.volume,
                price: request.price,
                status: VenueOrderStatus::Open,
            },
        );
        state.match_symbol(&request.symbol);
        Ok(id)
    }

    async fn modify_position(&self, request: &ModifyPositionRequest) -> Result<(), ExchangeError> {
        let mut state = self.state();
        state.enter("modify_position")?;
        let pos = state
            .positions
            .get_mut(&request.position_id)
            .ok_or_else(|| ExchangeError::NotFound(format!("position {}", request.position_id)))?;
        if request.stop_loss.is_some() {
            pos.stop_loss = request.stop_loss;
        }
        if request.take_profit.is_some() {
            pos.take_profit = request.take_profit;
        }
        let symbol = pos.symbol.clone();
        state.match_symbol(&symbol);
        Ok(())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        let mut state = self.state();
        state.enter("cancel_order")?;
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ExchangeError::NotFound(format!("order {}", order_id)))?;
        if order.status == VenueOrderStatus::Open {
            order.status = VenueOrderStatus::Cancelled;
        }
        Ok(())
    }

    async fn get_open_positions(&self) -> Result<Vec<VenuePosition>, ExchangeError> {
        let mut state = self.state();
        state.enter("get_open_positions")?;
        Ok(state
            .positions
            .values()
            .map(|p| VenuePosition {
                position_id: p.id.clone(),
                symbol: p.symbol.clone(),
                side: p.side,
                volume: p.volume,
                avg_price: Some(p.avg_price),
                stop_loss: p.stop_loss,
            })
            .collect())
    }

    async fn get_open_orders(&self) -> Result<Vec<VenueOrder>, ExchangeError> {
        let mut state = self.state();
        state.enter("get_open_orders")?;
        let report_filled = state.report_filled_orders;
        Ok(state
            .orders
            .iter()
            .filter(|(_, o)| {
                o.status == VenueOrderStatus::Open
                    || (report_filled && o.status == VenueOrderStatus::Filled)
            })
            .map(|(id, o)| VenueOrder {
                order_id: id.clone(),
                status: o.status,
                price: Some(o.price),
                symbol: o.symbol.clone(),
            })
            .collect())
    }

    async fn close_position(&self, position_id: &str) -> Result<(), ExchangeError> {
        let mut state = self.state();
        state.enter("close_position")?;
        let pos = state
            .positions
            .remove(position_id)
            .ok_or_else(|| ExchangeError::NotFound(format!("position {}", position_id)))?;
        let exit = state.prices.get(&pos.symbol).copied().unwrap_or(pos.avg_price);
        state.closed_at.insert(pos.id, exit);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ExchangeError> {
        self.state().enter("disconnect")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn venue() -> SimulatedExchange {
        let v = SimulatedExchange::new();
        v.add_default_symbol("BTCUSDT");
        v.set_price("BTCUSDT", dec!(100));
        v
    }

    fn buy(price: Decimal, volume: Decimal) -> LimitOrderRequest {
        LimitOrderRequest {
            symbol: "BTCUSDT".to_string(),
            volume,
            side: OrderSide::Buy,
            price,
        }
    }

    #[tokio::test]
    async fn test_resting_order_fills_when_crossed() {
        let v = venue();
        let id = v.place_limit_order(&buy(dec!(95), dec!(1))).await.unwrap();
        assert!(v.get_open_positions().await.unwrap().is_empty());
        assert_eq!(v.get_open_orders().await.unwrap()[0].order_id, id);

        v.set_price("BTCUSDT", dec!(94));
        let positions = v.get_open_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].avg_price, Some(dec!(95)));
        assert!(v.get_open_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_closes_position() {
        let v = venue();
        v.place_limit_order(&buy(dec!(100), dec!(2))).await.unwrap();
        let pos = v.get_open_positions().await.unwrap().remove(0);
        v.modify_position(&ModifyPositionRequest {
            position_id: pos.position_id.clone(),
            stop_loss: Some(dec!(95)),
            take_profit: None,
        })
        .await
        .unwrap();

        v.set_price("BTCUSDT", dec!(94.5));
        assert!(v.get_open_positions().await.unwrap().is_empty());
        assert_eq!(v.close_price(&pos.position_id), Some(dec!(95)));
    }

    #[tokio::test]
    async fn test_opposite_fill_reduces_position() {
        let v = venue();
        v.place_limit_order(&buy(dec!(100), dec!(3))).await.unwrap();
        v.place_limit_order(&LimitOrderRequest {
            side: OrderSide::Sell,
            ..buy(dec!(110), dec!(1))
        })
        .await
        .unwrap();
        v.set_price("BTCUSDT", dec!(111));
        let positions = v.get_open_positions().await.unwrap();
        assert_eq!(positions[0].volume, dec!(2));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let v = venue();
        v.inject_failures(1, ExchangeError::Transient("blip".into()));
        assert!(v.get_open_orders().await.is_err());
        assert!(v.get_open_orders().await.is_ok());
        assert_eq!(v.call_count("get_open_orders"), 2);
    }

    #[tokio::test]
    async fn test_call_failures_only_hit_that_call() {
        let v = venue();
        v.inject_call_failures("place_limit_order", 1, ExchangeError::Transient("rate limited".into()));
        assert!(v.get_open_orders().await.is_ok());
        assert!(v.place_limit_order(&buy(dec!(90), dec!(1))).await.is_err());
        assert!(v.place_limit_order(&buy(dec!(90), dec!(1))).await.is_ok());
    }

    #[tokio::test]
    async fn test_quote_does_not_match() {
        let v = venue();
        v.place_limit_order(&buy(dec!(95), dec!(1))).await.unwrap();
        v.set_quote("BTCUSDT", dec!(90));
        assert_eq!(v.get_current_price("BTCUSDT").await.unwrap(), Some(dec!(90)));
        assert_eq!(v.open_order_count(), 1);
    }
}
