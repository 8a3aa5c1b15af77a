//! Pure mapping from raw venue JSON to normalized records.
//!
//! Bridges disagree on field names (`positionId` vs `ticket`, `volume` vs
//! `size`, numbers as strings or floats). All of that is absorbed here.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;

use crate::models::{
    AccountInfo, OrderSide, SymbolInfo, VenueOrder, VenueOrderStatus, VenuePosition,
};

const POSITION_ID: &[&str] = &["positionId", "position_id", "id", "ticket"];
const ORDER_ID: &[&str] = &["orderId", "order_id", "id", "ticket"];
const SYMBOL: &[&str] = &["symbol", "symbolName", "instrument", "pair"];
const VOLUME: &[&str] = &["volume", "size", "quantity", "qty", "positionAmt"];
const AVG_PRICE: &[&str] = &["avgPrice", "averagePrice", "openPrice", "entryPrice", "price"];
const STOP_LOSS: &[&str] = &["stopLoss", "stop_loss", "sl"];
const SIDE: &[&str] = &["side", "direction", "tradeSide", "type"];
const STATUS: &[&str] = &["status", "state", "orderStatus"];
const BALANCE: &[&str] = &["balance", "equity", "availableBalance", "free"];

/// First present, non-null field among `names`.
fn field<'a>(value: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|n| value.get(*n))
        .find(|v| !v.is_null())
}

/// Decimal from a JSON number or numeric string.
pub fn to_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => {
            let s = n.to_string();
            Decimal::from_str(&s)
                .or_else(|_| Decimal::from_scientific(&s))
                .ok()
        }
        Value::String(s) => {
            let s = s.trim();
            Decimal::from_str(s)
                .or_else(|_| Decimal::from_scientific(s))
                .ok()
        }
        _ => None,
    }
}

fn decimal_field(value: &Value, names: &[&str]) -> Option<Decimal> {
    field(value, names).and_then(to_decimal)
}

fn string_field(value: &Value, names: &[&str]) -> Option<String> {
    match field(value, names)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_side(raw: &str) -> Option<OrderSide> {
    match raw.to_uppercase().as_str() {
        "BUY" | "LONG" | "0" => Some(OrderSide::Buy),
        "SELL" | "SHORT" | "1" => Some(OrderSide::Sell),
        _ => None,
    }
}

fn parse_status(raw: &str) -> VenueOrderStatus {
    match raw.to_uppercase().as_str() {
        "NEW" | "OPEN" | "PENDING" | "ACCEPTED" | "WORKING" => VenueOrderStatus::Open,
        "PARTIALLY_FILLED" | "PARTIAL" => VenueOrderStatus::PartiallyFilled,
        "FILLED" | "EXECUTED" | "CLOSED" => VenueOrderStatus::Filled,
        "CANCELED" | "CANCELLED" | "EXPIRED" | "REJECTED" => VenueOrderStatus::Cancelled,
        _ => VenueOrderStatus::Unknown,
    }
}

/// Unwrap `{"<key>": [...]}` or a bare array.
fn list<'a>(value: &'a Value, key: &str) -> Vec<&'a Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => value
            .get(key)
            .and_then(Value::as_array)
            .map(|items| items.iter().collect())
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

pub fn account_info(value: &Value) -> Result<AccountInfo, String> {
    let balance = decimal_field(value, BALANCE).ok_or("account response has no balance")?;
    let precision = field(value, &["precision", "digits", "currencyDigits"])
        .and_then(Value::as_u64)
        .unwrap_or(2) as u32;
    Ok(AccountInfo { balance, precision })
}

/// Decimal places a `Decimal` can carry.
const MAX_PRECISION: u64 = 28;

/// A precision field, rejected when it is not a whole number in `0..=28`.
fn precision(symbol: &str, value: &Value, names: &[&str]) -> Result<Option<u32>, String> {
    let Some(raw) = field(value, names) else {
        return Ok(None);
    };
    match raw.as_u64() {
        Some(p) if p <= MAX_PRECISION => Ok(Some(p as u32)),
        _ => Err(format!("symbol {} has an unusable precision {}", symbol, raw)),
    }
}

pub fn symbol_info(symbol: &str, value: &Value) -> Result<SymbolInfo, String> {
    let price_precision = precision(symbol, value, &["pricePrecision", "digits", "priceDigits"])?
        .ok_or_else(|| format!("symbol {} has no price precision", symbol))?;
    let qty_precision =
        precision(symbol, value, &["qtyPrecision", "quantityPrecision", "volumeDigits"])?.unwrap_or(0);
    let volume_step = decimal_field(value, &["volumeStep", "stepSize", "lotStep"])
        .unwrap_or_else(|| Decimal::new(1, qty_precision));
    let min_volume = decimal_field(value, &["minVolume", "minQty", "minLot"]).unwrap_or(volume_step);
    let max_volume = decimal_field(value, &["maxVolume", "maxQty", "maxLot"]).unwrap_or(Decimal::MAX);
    let tick_size = decimal_field(value, &["tickSize", "tick_size", "priceStep"]);
    let tradeable = match field(value, &["tradeable", "tradingEnabled", "status"]) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => matches!(s.to_uppercase().as_str(), "TRADING" | "OPEN" | "ENABLED"),
        _ => true,
    };

    Ok(SymbolInfo {
        symbol: string_field(value, SYMBOL).unwrap_or_else(|| symbol.to_string()),
        price_precision,
        qty_precision,
        tick_size,
        min_volume,
        max_volume,
        volume_step,
        tradeable,
    })
}

/// Current price: explicit `price`/`last`, else the bid/ask midpoint.
pub fn price(value: &Value) -> Option<Decimal> {
    if let Some(p) = decimal_field(value, &["price", "last", "lastPrice", "mark"]) {
        return Some(p);
    }
    let bid = decimal_field(value, &["bid", "bidPrice"])?;
    let ask = decimal_field(value, &["ask", "askPrice"])?;
    Some((bid + ask) / Decimal::TWO)
}

pub fn position(value: &Value) -> Option<VenuePosition> {
    let position_id = string_field(value, POSITION_ID)?;
    let symbol = string_field(value, SYMBOL)?;
    let raw_volume = decimal_field(value, VOLUME)?;

    // Some venues report shorts as negative size and omit the side.
    let side = match string_field(value, SIDE).as_deref().and_then(parse_side) {
        Some(side) => side,
        None if raw_volume < Decimal::ZERO => OrderSide::Sell,
        None => OrderSide::Buy,
    };

    Some(VenuePosition {
        position_id,
        symbol,
        side,
        volume: raw_volume.abs(),
        avg_price: decimal_field(value, AVG_PRICE).filter(|p| *p > Decimal::ZERO),
        stop_loss: decimal_field(value, STOP_LOSS).filter(|p| *p > Decimal::ZERO),
    })
}

pub fn positions(value: &Value) -> Vec<VenuePosition> {
    list(value, "positions").into_iter().filter_map(position).collect()
}

pub fn order(value: &Value) -> Option<VenueOrder> {
    Some(VenueOrder {
        order_id: string_field(value, ORDER_ID)?,
        status: string_field(value, STATUS)
            .map(|s| parse_status(&s))
            .unwrap_or(VenueOrderStatus::Open),
        price: decimal_field(value, &["price", "limitPrice"]),
        symbol: string_field(value, SYMBOL).unwrap_or_default(),
    })
}

pub fn orders(value: &Value) -> Vec<VenueOrder> {
    list(value, "orders").into_iter().filter_map(order).collect()
}

/// Order id from a placement response.
pub fn placed_order_id(value: &Value) -> Option<String> {
    string_field(value, ORDER_ID).or_else(|| value.get("order").and_then(|o| string_field(o, ORDER_ID)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_position_field_variants_normalize_the_same() {
        let a = json!({"positionId": "p1", "symbol": "BTCUSDT", "side": "BUY", "volume": "0.5", "avgPrice": 100});
        let b = json!({"ticket": 1, "instrument": "BTCUSDT", "direction": "long", "size": 0.5, "openPrice": "100"});

        let pa = position(&a).unwrap();
        let pb = position(&b).unwrap();
        assert_eq!(pa.symbol, pb.symbol);
        assert_eq!(pa.side, pb.side);
        assert_eq!(pa.volume, dec!(0.5));
        assert_eq!(pb.volume, dec!(0.5));
        assert_eq!(pa.avg_price, Some(dec!(100)));
        assert_eq!(pb.position_id, "1");
    }

    #[test]
    fn test_negative_size_means_short() {
        let p = position(&json!({"id": "x", "symbol": "ETHUSDT", "positionAmt": "-2"})).unwrap();
        assert_eq!(p.side, OrderSide::Sell);
        assert_eq!(p.volume, dec!(2));
    }

    #[test]
    fn test_wrapped_and_bare_lists() {
        let wrapped = json!({"orders": [{"orderId": "o1", "status": "NEW", "symbol": "BTCUSDT"}]});
        let bare = json!([{"id": "o2", "state": "filled"}]);
        assert_eq!(orders(&wrapped)[0].status, VenueOrderStatus::Open);
        assert_eq!(orders(&bare)[0].status, VenueOrderStatus::Filled);
    }

    #[test]
    fn test_out_of_range_precision_is_rejected() {
        let ok = symbol_info("BTCUSDT", &json!({"pricePrecision": 2, "qtyPrecision": 3})).unwrap();
        assert_eq!(ok.volume_step, dec!(0.001));

        assert!(symbol_info("BTCUSDT", &json!({"pricePrecision": 2, "qtyPrecision": 40})).is_err());
        assert!(symbol_info("BTCUSDT", &json!({"pricePrecision": 4294967298u64})).is_err());
        assert!(symbol_info("BTCUSDT", &json!({"pricePrecision": -1})).is_err());
    }

    #[test]
    fn test_price_falls_back_to_midpoint() {
        assert_eq!(price(&json!({"bid": "99", "ask": "101"})), Some(dec!(100)));
        assert_eq!(price(&json!({"last": 1e-7})), Some(dec!(0.0000001)));
        assert_eq!(price(&json!({})), None);
    }

    #[test]
    fn test_symbol_info_defaults() {
        let info = symbol_info("BTCUSDT", &json!({"digits": 2, "volumeDigits": 3})).unwrap();
        assert_eq!(info.volume_step, dec!(0.001));
        assert_eq!(info.min_volume, dec!(0.001));
        assert!(info.tradeable);

        assert!(symbol_info("BTCUSDT", &json!({})).is_err());
    }
}
