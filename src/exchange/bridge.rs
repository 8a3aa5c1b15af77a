//! REST bridge adapter.
//!
//! Talks to a per-exchange HTTP bridge that fronts the venue's native API.
//! Responses go through `mapping` so field-name differences between bridges
//! never leak past this module.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ExchangeError;
use crate::models::{
    AccountInfo, LimitOrderRequest, ModifyPositionRequest, SymbolInfo, VenueOrder, VenuePosition,
};

use super::{mapping, Credentials, ExchangeAdapter};

/// Client for one account's session on an HTTP bridge.
pub struct BridgeClient {
    exchange_id: String,
    client: Client,
    base_url: String,
    credentials: Credentials,
}

impl std::fmt::Debug for BridgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeClient")
            .field("exchange_id", &self.exchange_id)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Map an HTTP status to the venue error taxonomy.
fn classify(status: StatusCode, body: String) -> ExchangeError {
    let detail = format!("{} - {}", status, body);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ExchangeError::Fatal(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            ExchangeError::Transient(detail)
        }
        StatusCode::NOT_FOUND => ExchangeError::NotFound(detail),
        s if s.is_server_error() => ExchangeError::Transient(detail),
        _ => ExchangeError::Rejected(detail),
    }
}

fn network_error(what: &str, err: reqwest::Error) -> ExchangeError {
    ExchangeError::Transient(format!("{}: {}", what, err))
}

impl BridgeClient {
    pub fn new(
        exchange_id: impl Into<String>,
        base_url: impl Into<String>,
        credentials: Credentials,
        timeout: Duration,
    ) -> Result<Self, ExchangeError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExchangeError::Fatal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            exchange_id: exchange_id.into(),
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self
            .client
            .request(method, url)
            .header("X-API-KEY", &self.credentials.api_key);
        if let Some(secret) = &self.credentials.api_secret {
            builder = builder.header("X-API-SECRET", secret);
        }
        builder
    }

    /// Send and return the JSON body; an empty body reads as `null`.
    async fn send(&self, what: &str, builder: RequestBuilder) -> Result<Value, ExchangeError> {
        debug!(exchange = %self.exchange_id, call = what, "Bridge request");

        let response = builder.send().await.map_err(|e| network_error(what, e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| network_error(what, e))?;

        if !status.is_success() {
            return Err(classify(status, body));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body)
            .map_err(|e| ExchangeError::Rejected(format!("{}: malformed response: {}", what, e)))
    }

    async fn get(&self, what: &str, path: &str) -> Result<Value, ExchangeError> {
        self.send(what, self.request(Method::GET, path)).await
    }
}

#[async_trait]
impl ExchangeAdapter for BridgeClient {
    fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    async fn connect(&self) -> Result<(), ExchangeError> {
        self.get("connect", "/ping").await.map(|_| ())
    }

    async fn authenticate(&self) -> Result<(), ExchangeError> {
        if self.credentials.api_key.is_empty() {
            return Err(ExchangeError::Fatal("empty API key".to_string()));
        }
        self.send("authenticate", self.request(Method::POST, "/auth"))
            .await
            .map(|_| ())
    }

    async fn get_account_info(&self) -> Result<AccountInfo, ExchangeError> {
        let body = self.get("account", "/account").await?;
        mapping::account_info(&body).map_err(ExchangeError::Rejected)
    }

    async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo, ExchangeError> {
        let body = self.get("symbol", &format!("/symbols/{}", symbol)).await?;
        if body.is_null() {
            return Err(ExchangeError::NotFound(format!("symbol {}", symbol)));
        }
        mapping::symbol_info(symbol, &body).map_err(ExchangeError::Rejected)
    }

    async fn get_current_price(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
        match self.get("price", &format!("/prices/{}", symbol)).await {
            Ok(body) => Ok(mapping::price(&body)),
            Err(ExchangeError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn place_limit_order(&self, request: &LimitOrderRequest) -> Result<String, ExchangeError> {
        let payload = json!({
            "symbol": request.symbol,
            "side": request.side.as_str(),
            "type": "LIMIT",
            "volume": request.volume.to_string(),
            "price": request.price.to_string(),
        });
        let body = self
            .send("place_order", self.request(Method::POST, "/orders").json(&payload))
            .await?;
        mapping::placed_order_id(&body)
            .ok_or_else(|| ExchangeError::Rejected("placement response has no order id".to_string()))
    }

    async fn modify_position(&self, request: &ModifyPositionRequest) -> Result<(), ExchangeError> {
        let mut payload = serde_json::Map::new();
        if let Some(sl) = request.stop_loss {
            payload.insert("stopLoss".to_string(), Value::String(sl.to_string()));
        }
        if let Some(tp) = request.take_profit {
            payload.insert("takeProfit".to_string(), Value::String(tp.to_string()));
        }
        let path = format!("/positions/{}", request.position_id);
        self.send(
            "modify_position",
            self.request(Method::PATCH, &path).json(&Value::Object(payload)),
        )
        .await
        .map(|_| ())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        let path = format!("/orders/{}", order_id);
        self.send("cancel_order", self.request(Method::DELETE, &path))
            .await
            .map(|_| ())
    }

    async fn get_open_positions(&self) -> Result<Vec<VenuePosition>, ExchangeError> {
        let body = self.get("positions", "/positions").await?;
        Ok(mapping::positions(&body))
    }

    async fn get_open_orders(&self) -> Result<Vec<VenueOrder>, ExchangeError> {
        let body = self.get("orders", "/orders").await?;
        Ok(mapping::orders(&body))
    }

    async fn close_position(&self, position_id: &str) -> Result<(), ExchangeError> {
        let path = format!("/positions/{}/close", position_id);
        self.send("close_position", self.request(Method::POST, &path))
            .await
            .map(|_| ())
    }

    async fn disconnect(&self) -> Result<(), ExchangeError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OrderSide;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client(server: &MockServer) -> BridgeClient {
        BridgeClient::new(
            "bridge-a",
            server.uri(),
            Credentials {
                api_key: "key".to_string(),
                api_secret: None,
            },
            Duration::from_secs(2),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/account"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/symbols/NOPE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let c = client(&server).await;
        assert!(c.authenticate().await.unwrap_err().is_fatal());
        assert!(c.get_account_info().await.unwrap_err().is_transient());
        assert!(matches!(
            c.get_symbol_info("NOPE").await,
            Err(ExchangeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_place_order_sends_key_and_reads_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .and(header("X-API-KEY", "key"))
            .and(body_partial_json(json!({"symbol": "BTCUSDT", "side": "BUY", "price": "100"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"order": {"orderId": 42}})))
            .mount(&server)
            .await;

        let id = client(&server)
            .await
            .place_limit_order(&LimitOrderRequest {
                symbol: "BTCUSDT".to_string(),
                volume: dec!(0.5),
                side: OrderSide::Buy,
                price: dec!(100),
            })
            .await
            .unwrap();
        assert_eq!(id, "42");
    }

    #[tokio::test]
    async fn test_positions_are_normalized() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/positions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "positions": [
                    {"ticket": 7, "instrument": "ETHUSDT", "size": "-1.5", "openPrice": "2000"}
                ]
            })))
            .mount(&server)
            .await;

        let positions = client(&server).await.get_open_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].position_id, "7");
        assert_eq!(positions[0].side, OrderSide::Sell);
        assert_eq!(positions[0].volume, dec!(1.5));
    }

    #[tokio::test]
    async fn test_missing_price_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/prices/BTCUSDT"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"bid": "99", "ask": "101"})))
            .mount(&server)
            .await;

        let c = client(&server).await;
        assert_eq!(c.get_current_price("BTCUSDT").await.unwrap(), Some(dec!(100)));
        assert_eq!(c.get_current_price("ETHUSDT").await.unwrap(), None);
    }
}
