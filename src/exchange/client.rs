// =============================================================================
// Exchange Client — signed REST transport + retry/backoff over the rate limiter
// =============================================================================
//
// Every mutating call is routed through the shared `AdaptiveRateLimiter` and
// retried up to five times with exponential backoff (base 2s, capped 30s,
// plus sub-second jitter). Retries apply only to transient error codes and
// transport exceptions; parameter/auth errors fail fast. See spec.md §4.A.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::error::{ExchangeError, ExchangeResult};
use crate::exchange::auth::Credentials;
use crate::exchange::rate_limit::AdaptiveRateLimiter;
use crate::symbol::SymbolInfo;
use crate::types::{OrderStatus, OrderType, PositionMode, Side};

const MAX_ATTEMPTS: u32 = 5;
const BASE_BACKOFF_SECS: f64 = 2.0;
const MAX_BACKOFF_SECS: f64 = 30.0;
const DEFAULT_RECV_WINDOW_MS: u64 = 5000;
/// Rolling window size for the `api performance` health component (spec.md
/// §4.E: "average HTTP latency vs 3s budget").
const LATENCY_WINDOW: usize = 50;

/// A single open order as reported by the exchange's HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteOrder {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Decimal,
    pub quantity: Decimal,
    pub cumulative_filled_qty: Decimal,
    pub status: OrderStatus,
    pub created_at_ms: i64,
}

/// A single position record as reported by the exchange's HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotePosition {
    pub symbol: String,
    pub position_idx: u8,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: Decimal,
    pub liquidation_price: Decimal,
}

/// Acknowledgement returned from `place_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderAck {
    pub order_id: String,
    pub client_order_id: String,
}

/// Parameters for a single order placement.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub client_order_id: String,
    pub position_idx: Option<u8>,
}

/// HTTP + streaming transport for a single exchange venue. Every mutating
/// call is gated by the shared rate limiter and retried per spec.md §4.A.
#[derive(Clone)]
pub struct ExchangeClient {
    credentials: Credentials,
    base_url: String,
    category: String,
    http: reqwest::Client,
    limiter: Arc<AdaptiveRateLimiter>,
    latencies_ms: Mutex<VecDeque<f64>>,
}

impl ExchangeClient {
    pub fn new(
        credentials: Credentials,
        base_url: impl Into<String>,
        category: impl Into<String>,
        limiter: Arc<AdaptiveRateLimiter>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            credentials,
            base_url: base_url.into(),
            category: category.into(),
            http,
            limiter,
            latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
        }
    }

    /// Average end-to-end request latency (including retries) over the last
    /// `LATENCY_WINDOW` requests, feeding the `api performance` health
    /// component. `None` until at least one request has completed.
    pub fn average_latency_ms(&self) -> Option<f64> {
        let window = self.latencies_ms.lock();
        if window.is_empty() {
            None
        } else {
            Some(window.iter().sum::<f64>() / window.len() as f64)
        }
    }

    fn record_latency(&self, elapsed: Duration) {
        let mut window = self.latencies_ms.lock();
        if window.len() >= LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(elapsed.as_secs_f64() * 1000.0);
    }

    // -------------------------------------------------------------------------
    // Public API surface (spec.md §4.A)
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "exchange::test_credentials")]
    pub async fn test_credentials(&self) -> ExchangeResult<()> {
        self.get_signed("/v5/account/wallet-balance", &[("accountType", "UNIFIED")])
            .await?;
        Ok(())
    }

    #[instrument(skip(self), name = "exchange::fetch_symbol_info")]
    pub async fn fetch_symbol_info(&self, symbol: &str) -> ExchangeResult<SymbolInfo> {
        let body = self
            .get_public(
                "/v5/market/instruments-info",
                &[("category", self.category.as_str()), ("symbol", symbol)],
            )
            .await?;

        let entry = body["result"]["list"]
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| ExchangeError::Malformed("instruments-info: empty list".into()))?;

        let price_filter = &entry["priceFilter"];
        let lot_filter = &entry["lotSizeFilter"];

        Ok(SymbolInfo {
            symbol: symbol.to_string(),
            tick_size: parse_decimal_field(price_filter, "tickSize")?,
            step_size: parse_decimal_field(lot_filter, "qtyStep")?,
            min_price: parse_decimal_field(price_filter, "minPrice")?,
            min_qty: parse_decimal_field(lot_filter, "minOrderQty")?,
            max_qty: parse_decimal_field(lot_filter, "maxOrderQty")?,
            min_notional: parse_decimal_field(lot_filter, "minNotionalValue")
                .unwrap_or(Decimal::ZERO),
        })
    }

    #[instrument(skip(self), name = "exchange::fetch_wallet_balance")]
    pub async fn fetch_wallet_balance(&self, coin: &str) -> ExchangeResult<Decimal> {
        let body = self
            .get_signed("/v5/account/wallet-balance", &[("accountType", "UNIFIED")])
            .await?;

        let coins = body["result"]["list"]
            .as_array()
            .and_then(|a| a.first())
            .and_then(|acct| acct["coin"].as_array())
            .ok_or_else(|| ExchangeError::Malformed("wallet-balance: missing coin list".into()))?;

        for entry in coins {
            if entry["coin"].as_str() == Some(coin) {
                return parse_decimal_field(entry, "availableToWithdraw")
                    .or_else(|_| parse_decimal_field(entry, "walletBalance"));
            }
        }
        Ok(Decimal::ZERO)
    }

    #[instrument(skip(self, order), name = "exchange::place_order", fields(symbol = %order.symbol, side = %order.side))]
    pub async fn place_order(&self, order: &NewOrder) -> ExchangeResult<PlaceOrderAck> {
        let mut payload = json!({
            "category": self.category,
            "symbol": order.symbol,
            "side": match order.side { Side::Buy => "Buy", Side::Sell => "Sell" },
            "orderType": match order.order_type { OrderType::Limit => "Limit", OrderType::Market => "Market" },
            "qty": order.quantity.to_string(),
            "orderLinkId": order.client_order_id,
            "timeInForce": match order.order_type { OrderType::Limit => "GTC", OrderType::Market => "IOC" },
        });
        if let Some(price) = order.price {
            payload["price"] = json!(price.to_string());
        }
        if let Some(idx) = order.position_idx {
            payload["positionIdx"] = json!(idx);
        }

        let body = self.post_signed("/v5/order/create", payload).await?;
        Ok(PlaceOrderAck {
            order_id: body["result"]["orderId"].as_str().unwrap_or_default().to_string(),
            client_order_id: body["result"]["orderLinkId"]
                .as_str()
                .unwrap_or(&order.client_order_id)
                .to_string(),
        })
    }

    #[instrument(skip(self), name = "exchange::cancel_order")]
    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()> {
        let payload = json!({
            "category": self.category,
            "symbol": symbol,
            "orderId": order_id,
        });
        match self.post_signed("/v5/order/cancel", payload).await {
            Ok(_) => Ok(()),
            // Already-filled/absent order cancellation is success-equivalent (spec.md §8).
            Err(ExchangeError::Rejected { code: Some(110001), .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), name = "exchange::cancel_all_orders")]
    pub async fn cancel_all_orders(&self, symbol: &str) -> ExchangeResult<()> {
        let payload = json!({
            "category": self.category,
            "symbol": symbol,
        });
        self.post_signed("/v5/order/cancel-all", payload).await?;
        Ok(())
    }

    #[instrument(skip(self), name = "exchange::fetch_open_orders")]
    pub async fn fetch_open_orders(&self, symbol: &str) -> ExchangeResult<Vec<RemoteOrder>> {
        let body = self
            .get_signed(
                "/v5/order/realtime",
                &[("category", self.category.as_str()), ("symbol", symbol)],
            )
            .await?;

        let list = body["result"]["list"].as_array().cloned().unwrap_or_default();
        list.iter().filter_map(|raw| parse_remote_order(raw).ok()).map(Ok).collect()
    }

    #[instrument(skip(self), name = "exchange::fetch_positions")]
    pub async fn fetch_positions(&self, symbol: &str) -> ExchangeResult<Vec<RemotePosition>> {
        let body = self
            .get_signed(
                "/v5/position/list",
                &[("category", self.category.as_str()), ("symbol", symbol)],
            )
            .await?;

        let list = body["result"]["list"].as_array().cloned().unwrap_or_default();
        list.iter()
            .filter(|raw| {
                raw["size"]
                    .as_str()
                    .and_then(|s| s.parse::<Decimal>().ok())
                    .map(|d| d > Decimal::ZERO)
                    .unwrap_or(false)
            })
            .map(parse_remote_position)
            .collect()
    }

    // -------------------------------------------------------------------------
    // Transport internals
    // -------------------------------------------------------------------------

    async fn get_public(&self, path: &str, query: &[(&str, &str)]) -> ExchangeResult<serde_json::Value> {
        let qs = build_query_string(query);
        let url = format!("{}{}?{}", self.base_url, path, qs);
        self.execute_with_retry(|| {
            let url = url.clone();
            async move {
                let resp = self.http.get(&url).send().await?;
                parse_exchange_response(resp).await
            }
        })
        .await
    }

    async fn get_signed(&self, path: &str, query: &[(&str, &str)]) -> ExchangeResult<serde_json::Value> {
        let query_str = build_query_string(query);
        self.execute_with_retry(|| {
            let path = path.to_string();
            let query_str = query_str.clone();
            async move {
                let timestamp = Credentials::now_ms();
                let signature =
                    self.credentials.sign_rest_query(timestamp, DEFAULT_RECV_WINDOW_MS, &query_str);
                let url = format!("{}{}?{}", self.base_url, path, query_str);
                let resp = self
                    .http
                    .get(&url)
                    .header("X-BAPI-API-KEY", &self.credentials.api_key)
                    .header("X-BAPI-TIMESTAMP", timestamp.to_string())
                    .header("X-BAPI-RECV-WINDOW", DEFAULT_RECV_WINDOW_MS.to_string())
                    .header("X-BAPI-SIGN", signature)
                    .send()
                    .await?;
                parse_exchange_response(resp).await
            }
        })
        .await
    }

    async fn post_signed(&self, path: &str, payload: serde_json::Value) -> ExchangeResult<serde_json::Value> {
        let body_str = payload.to_string();
        self.execute_with_retry(|| {
            let path = path.to_string();
            let body_str = body_str.clone();
            async move {
                let timestamp = Credentials::now_ms();
                let signature =
                    self.credentials.sign_rest_query(timestamp, DEFAULT_RECV_WINDOW_MS, &body_str);
                let url = format!("{}{}", self.base_url, path);
                let resp = self
                    .http
                    .post(&url)
                    .header("X-BAPI-API-KEY", &self.credentials.api_key)
                    .header("X-BAPI-TIMESTAMP", timestamp.to_string())
                    .header("X-BAPI-RECV-WINDOW", DEFAULT_RECV_WINDOW_MS.to_string())
                    .header("X-BAPI-SIGN", signature)
                    .header("Content-Type", "application/json")
                    .body(body_str.clone())
                    .send()
                    .await?;
                parse_exchange_response(resp).await
            }
        })
        .await
    }

    /// Runs `op` up to `MAX_ATTEMPTS` times, gated by the rate limiter and
    /// backing off exponentially between transient failures.
    async fn execute_with_retry<F, Fut>(&self, op: F) -> ExchangeResult<serde_json::Value>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = ExchangeResult<serde_json::Value>>,
    {
        let started = Instant::now();
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            self.limiter.acquire().await;
            match op().await {
                Ok(body) => {
                    self.limiter.record_outcome(true);
                    self.record_latency(started.elapsed());
                    return Ok(body);
                }
                Err(e) => {
                    self.limiter.record_outcome(false);
                    if !e.is_retryable() {
                        self.record_latency(started.elapsed());
                        return Err(e);
                    }
                    warn!(attempt, error = %e, "transient exchange error, will retry");
                    last_err = Some(e);
                    if attempt + 1 < MAX_ATTEMPTS {
                        let backoff = backoff_duration(attempt);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        self.record_latency(started.elapsed());
        Err(last_err.unwrap_or_else(|| ExchangeError::Transient {
            code: None,
            message: "retries exhausted".into(),
        }))
    }
}

fn backoff_duration(attempt: u32) -> Duration {
    let exp = BASE_BACKOFF_SECS * 2f64.powi(attempt as i32);
    let capped = exp.min(MAX_BACKOFF_SECS);
    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
    Duration::from_secs_f64(capped + jitter)
}

fn build_query_string(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

async fn parse_exchange_response(resp: reqwest::Response) -> ExchangeResult<serde_json::Value> {
    let status = resp.status();
    let body: serde_json::Value = resp.json().await?;

    if !status.is_success() {
        return Err(ExchangeError::Transient {
            code: Some(status.as_u16() as i64),
            message: format!("HTTP {status}"),
        });
    }

    let ret_code = body["retCode"].as_i64().unwrap_or(0);
    if ret_code != 0 {
        let msg = body["retMsg"].as_str().unwrap_or("unknown error").to_string();
        debug!(ret_code, msg = %msg, "exchange returned non-zero retCode");
        return Err(ExchangeError::from_exchange_code(ret_code, msg));
    }

    Ok(body)
}

fn parse_decimal_field(value: &serde_json::Value, field: &str) -> ExchangeResult<Decimal> {
    value[field]
        .as_str()
        .ok_or_else(|| ExchangeError::Malformed(format!("missing field '{field}'")))?
        .parse::<Decimal>()
        .map_err(|e| ExchangeError::Malformed(format!("bad decimal in '{field}': {e}")))
}

fn parse_side(raw: &serde_json::Value) -> ExchangeResult<Side> {
    match raw.as_str() {
        Some("Buy") => Ok(Side::Buy),
        Some("Sell") => Ok(Side::Sell),
        other => Err(ExchangeError::Malformed(format!("unknown side: {other:?}"))),
    }
}

fn parse_order_status(raw: &serde_json::Value) -> ExchangeResult<OrderStatus> {
    match raw.as_str() {
        Some("New") | Some("Created") => Ok(OrderStatus::New),
        Some("PartiallyFilled") => Ok(OrderStatus::PartiallyFilled),
        Some("Filled") => Ok(OrderStatus::Filled),
        Some("Cancelled") | Some("Canceled") => Ok(OrderStatus::Canceled),
        Some("Rejected") => Ok(OrderStatus::Rejected),
        Some("Deactivated") => Ok(OrderStatus::Deactivated),
        other => Err(ExchangeError::Malformed(format!("unknown order status: {other:?}"))),
    }
}

fn parse_order_type(raw: &serde_json::Value) -> ExchangeResult<OrderType> {
    match raw.as_str() {
        Some("Limit") => Ok(OrderType::Limit),
        Some("Market") => Ok(OrderType::Market),
        other => Err(ExchangeError::Malformed(format!("unknown order type: {other:?}"))),
    }
}

fn parse_remote_order(raw: &serde_json::Value) -> ExchangeResult<RemoteOrder> {
    Ok(RemoteOrder {
        order_id: raw["orderId"].as_str().unwrap_or_default().to_string(),
        client_order_id: raw["orderLinkId"].as_str().map(|s| s.to_string()),
        symbol: raw["symbol"].as_str().unwrap_or_default().to_string(),
        side: parse_side(&raw["side"])?,
        order_type: parse_order_type(&raw["orderType"])?,
        price: parse_decimal_field(raw, "price")?,
        quantity: parse_decimal_field(raw, "qty")?,
        cumulative_filled_qty: parse_decimal_field(raw, "cumExecQty").unwrap_or(Decimal::ZERO),
        status: parse_order_status(&raw["orderStatus"])?,
        created_at_ms: raw["createdTime"]
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0),
    })
}

fn parse_remote_position(raw: &serde_json::Value) -> ExchangeResult<RemotePosition> {
    Ok(RemotePosition {
        symbol: raw["symbol"].as_str().unwrap_or_default().to_string(),
        position_idx: raw["positionIdx"].as_u64().unwrap_or(0) as u8,
        side: parse_side(&raw["side"])?,
        size: parse_decimal_field(raw, "size")?,
        entry_price: parse_decimal_field(raw, "avgPrice").unwrap_or(Decimal::ZERO),
        unrealized_pnl: parse_decimal_field(raw, "unrealisedPnl").unwrap_or(Decimal::ZERO),
        leverage: parse_decimal_field(raw, "leverage").unwrap_or(Decimal::ONE),
        liquidation_price: parse_decimal_field(raw, "liqPrice").unwrap_or(Decimal::ZERO),
    })
}

/// `positionIdx` convention for hedge mode: 1 for Buy (Long), 2 for Sell (Short).
pub fn hedge_position_idx(side: Side, mode: PositionMode) -> Option<u8> {
    match mode {
        PositionMode::OneWay => None,
        PositionMode::Hedge => Some(match side {
            Side::Buy => 1,
            Side::Sell => 2,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped_and_monotone_up_to_cap() {
        let d0 = backoff_duration(0).as_secs_f64();
        let d4 = backoff_duration(4).as_secs_f64();
        assert!(d0 >= BASE_BACKOFF_SECS && d0 < BASE_BACKOFF_SECS + 1.0);
        assert!(d4 >= MAX_BACKOFF_SECS && d4 < MAX_BACKOFF_SECS + 1.0);
    }

    #[test]
    fn hedge_idx_matches_side() {
        assert_eq!(hedge_position_idx(Side::Buy, PositionMode::Hedge), Some(1));
        assert_eq!(hedge_position_idx(Side::Sell, PositionMode::Hedge), Some(2));
        assert_eq!(hedge_position_idx(Side::Buy, PositionMode::OneWay), None);
    }

    #[test]
    fn average_latency_is_none_until_first_request() {
        let client = ExchangeClient::new(
            Credentials::new("k", "s"),
            "https://example.invalid",
            "linear",
            Arc::new(AdaptiveRateLimiter::new(10.0, 10.0)),
        );
        assert_eq!(client.average_latency_ms(), None);
        client.record_latency(Duration::from_millis(100));
        client.record_latency(Duration::from_millis(300));
        assert_eq!(client.average_latency_ms(), Some(200.0));
    }

    #[test]
    fn parse_order_status_maps_known_variants() {
        assert_eq!(parse_order_status(&json!("New")).unwrap(), OrderStatus::New);
        assert_eq!(parse_order_status(&json!("Cancelled")).unwrap(), OrderStatus::Canceled);
        assert!(parse_order_status(&json!("Bogus")).is_err());
    }
}
