//! Live REST venue client
//!
//! Thin HTTP client over a venue's order endpoints. The wire surface is
//! deliberately small: symbol, side, quantity, price, order id and status.
//! Anything venue-specific beyond that belongs in an adapter, not here.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use super::broker::{Balance, BrokerClient, BrokerError, BrokerResult};
use super::order::{Order, OrderStatus, Side};

#[derive(Debug, Serialize)]
struct PlaceOrderRequest<'a> {
    symbol: &'a str,
    side: &'a str,
    #[serde(rename = "type")]
    order_type: &'a str,
    quantity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<String>,
    /// GTX = post-only (rest or reject), GTC otherwise
    #[serde(rename = "timeInForce")]
    time_in_force: &'a str,
}

/// Venues report ids as either strings or integers
fn id_to_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(rename = "orderId")]
    order_id: serde_json::Value,
    status: String,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    msg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    #[serde(rename = "totalBalance")]
    total: f64,
    #[serde(rename = "availableBalance")]
    available: f64,
}

fn parse_status(s: &str) -> OrderStatus {
    match s {
        "NEW" | "PARTIALLY_FILLED" => OrderStatus::New,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Canceled,
        "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
        "REJECTED" => OrderStatus::Rejected,
        _ => OrderStatus::Unknown,
    }
}

/// REST broker for a single venue
#[derive(Debug)]
pub struct RestBroker {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RestBroker {
    pub fn new(base_url: &str, api_key: &str) -> BrokerResult<Self> {
        if api_key.is_empty() {
            return Err(BrokerError::Auth("api key not configured".to_string()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        info!(%base_url, "live broker client ready");
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn submit(&self, req: PlaceOrderRequest<'_>) -> BrokerResult<OrderResponse> {
        let resp = self
            .client
            .post(self.url("/api/v1/order"))
            .header("X-API-KEY", &self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(BrokerError::Venue {
                code: status.as_u16() as i64,
                message: body,
            });
        }

        let parsed: OrderResponse = serde_json::from_str(&body)
            .map_err(|e| BrokerError::InvalidResponse(format!("{e}: {body}")))?;
        if let (Some(code), Some(msg)) = (parsed.code, parsed.msg.clone()) {
            return Err(BrokerError::Venue { code, message: msg });
        }
        Ok(parsed)
    }
}

#[async_trait]
impl BrokerClient for RestBroker {
    async fn place_limit(
        &self,
        symbol: &str,
        side: Side,
        quantity: f64,
        price: f64,
        post_only: bool,
    ) -> BrokerResult<Order> {
        let req = PlaceOrderRequest {
            symbol,
            side: if side == Side::Buy { "BUY" } else { "SELL" },
            order_type: "LIMIT",
            quantity: format!("{quantity:.6}"),
            price: Some(format!("{price:.8}")),
            time_in_force: if post_only { "GTX" } else { "GTC" },
        };
        let resp = self.submit(req).await?;

        let mut order = Order::new(id_to_string(&resp.order_id), symbol, side, quantity, price);
        order.status = parse_status(&resp.status);
        debug!(id = %order.id, %symbol, %side, quantity, price, "limit order placed");
        Ok(order)
    }

    async fn place_market(&self, symbol: &str, side: Side, quantity: f64) -> BrokerResult<Order> {
        let req = PlaceOrderRequest {
            symbol,
            side: if side == Side::Buy { "BUY" } else { "SELL" },
            order_type: "MARKET",
            quantity: format!("{quantity:.6}"),
            price: None,
            time_in_force: "GTC",
        };
        let resp = self.submit(req).await?;

        let mut order = Order::new(id_to_string(&resp.order_id), symbol, side, quantity, 0.0);
        order.status = parse_status(&resp.status);
        debug!(id = %order.id, %symbol, %side, quantity, "market order placed");
        Ok(order)
    }

    async fn cancel(&self, symbol: &str, order_id: &str) -> BrokerResult<()> {
        let resp = self
            .client
            .delete(self.url("/api/v1/order"))
            .header("X-API-KEY", &self.api_key)
            .query(&[("symbol", symbol), ("orderId", order_id)])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(BrokerError::Venue {
                code: resp.status().as_u16() as i64,
                message: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn cancel_all(&self, symbol: &str) -> BrokerResult<()> {
        let resp = self
            .client
            .delete(self.url("/api/v1/openOrders"))
            .header("X-API-KEY", &self.api_key)
            .query(&[("symbol", symbol)])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(BrokerError::Venue {
                code: resp.status().as_u16() as i64,
                message: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn order_status(&self, symbol: &str, order_id: &str) -> BrokerResult<OrderStatus> {
        let resp = self
            .client
            .get(self.url("/api/v1/order"))
            .header("X-API-KEY", &self.api_key)
            .query(&[("symbol", symbol), ("orderId", order_id)])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(BrokerError::Venue {
                code: resp.status().as_u16() as i64,
                message: resp.text().await.unwrap_or_default(),
            });
        }
        let parsed: OrderResponse = resp
            .json()
            .await
            .map_err(|e| BrokerError::InvalidResponse(e.to_string()))?;
        Ok(parse_status(&parsed.status))
    }

    async fn balance(&self) -> BrokerResult<Balance> {
        let resp = self
            .client
            .get(self.url("/api/v1/account/balance"))
            .header("X-API-KEY", &self.api_key)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(BrokerError::Venue {
                code: resp.status().as_u16() as i64,
                message: resp.text().await.unwrap_or_default(),
            });
        }
        let parsed: BalanceResponse = resp
            .json()
            .await
            .map_err(|e| BrokerError::InvalidResponse(e.to_string()))?;
        Ok(Balance {
            total: parsed.total,
            available: parsed.available,
        })
    }

    fn name(&self) -> &str {
        "rest"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(parse_status("NEW"), OrderStatus::New);
        assert_eq!(parse_status("FILLED"), OrderStatus::Filled);
        assert_eq!(parse_status("CANCELED"), OrderStatus::Canceled);
        assert_eq!(parse_status("EXPIRED"), OrderStatus::Expired);
        assert_eq!(parse_status("REJECTED"), OrderStatus::Rejected);
        assert_eq!(parse_status("whatever"), OrderStatus::Unknown);
    }

    #[test]
    fn missing_api_key_is_an_auth_error() {
        let err = RestBroker::new("https://venue.example", "").unwrap_err();
        assert!(matches!(err, BrokerError::Auth(_)));
    }
}
