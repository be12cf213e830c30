// =============================================================================
// Private websocket channel — authenticated order/position/wallet stream
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::exchange::auth::Credentials;
use crate::exchange::events::{OrderUpdate, PositionUpdate, WalletUpdate, WsEvent};
use crate::types::{ConnectionState, OrderStatus, OrderType, Side};

const RECONNECT_SCHEDULE_SECS: [u64; 7] = [1, 2, 4, 8, 15, 30, 60];

fn reconnect_delay(attempt: u32) -> std::time::Duration {
    let idx = (attempt as usize).min(RECONNECT_SCHEDULE_SECS.len() - 1);
    std::time::Duration::from_secs(RECONNECT_SCHEDULE_SECS[idx])
}

/// Drives the authenticated private stream: handshake, topic subscription,
/// and dispatch of order/position/wallet events. Same reconnect discipline
/// as the public channel (spec.md §4.A).
pub struct PrivateStream {
    ws_url: String,
    credentials: Credentials,
    state: RwLock<ConnectionState>,
    reconnect_attempts: AtomicU32,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
}

impl PrivateStream {
    pub fn new(
        ws_url: impl Into<String>,
        credentials: Credentials,
        shutdown: Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            credentials,
            state: RwLock::new(ConnectionState::Disconnected),
            reconnect_attempts: AtomicU32::new(0),
            shutdown,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub async fn run(&self, tx: mpsc::Sender<WsEvent>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                *self.state.write() = ConnectionState::Disconnected;
                return;
            }

            *self.state.write() = ConnectionState::Connecting;
            match self.connect_and_read(&tx).await {
                Ok(()) => info!("private stream closed cleanly"),
                Err(e) => warn!(error = %e, "private stream error"),
            }
            *self.state.write() = ConnectionState::Disconnected;

            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
            let delay = reconnect_delay(attempt);
            debug!(attempt, delay_secs = delay.as_secs(), "scheduling private reconnect");
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_and_read(&self, tx: &mpsc::Sender<WsEvent>) -> anyhow::Result<()> {
        let (mut ws_stream, _resp) = connect_async(&self.ws_url).await?;

        let (api_key, expires, signature) = self.credentials.ws_auth_args();
        let auth = serde_json::json!({ "op": "auth", "args": [api_key, expires, signature] });
        ws_stream.send(Message::Text(auth.to_string())).await?;

        let subscribe = serde_json::json!({
            "op": "subscribe",
            "args": ["order", "position", "wallet"],
        });
        ws_stream.send(Message::Text(subscribe.to_string())).await?;

        self.reconnect_attempts.store(0, Ordering::SeqCst);
        *self.state.write() = ConnectionState::Connected;
        info!("private stream authenticated and subscribed");

        while let Some(msg) = ws_stream.next().await {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            match msg? {
                Message::Text(text) => {
                    for event in parse_private_message(&text) {
                        if tx.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Message::Ping(payload) => {
                    ws_stream.send(Message::Pong(payload)).await.ok();
                }
                Message::Close(_) => return Ok(()),
                _ => {}
            }
        }
        Ok(())
    }
}

/// A single frame may carry a batch of topic entries; this returns zero or
/// more events, applied by the caller in arrival order (spec.md §5).
fn parse_private_message(text: &str) -> Vec<WsEvent> {
    let root: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "malformed private stream payload");
            return Vec::new();
        }
    };

    if root.get("op").and_then(|v| v.as_str()) == Some("pong") {
        return vec![WsEvent::Pong];
    }

    let topic = root.get("topic").and_then(|v| v.as_str()).unwrap_or_default();
    let Some(rows) = root.get("data").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    match topic {
        "order" => rows.iter().filter_map(parse_order_row).map(WsEvent::OrderUpdate).collect(),
        "position" => rows.iter().filter_map(parse_position_row).map(WsEvent::PositionUpdate).collect(),
        "wallet" => rows
            .iter()
            .filter_map(|row| row.get("coin").and_then(|v| v.as_array()))
            .flatten()
            .filter_map(parse_wallet_row)
            .map(WsEvent::WalletUpdate)
            .collect(),
        other => {
            debug!(topic = other, "ignoring unrecognized private topic");
            Vec::new()
        }
    }
}

fn parse_side(raw: &serde_json::Value) -> Option<Side> {
    match raw.as_str()? {
        "Buy" => Some(Side::Buy),
        "Sell" => Some(Side::Sell),
        _ => None,
    }
}

fn parse_order_row(row: &serde_json::Value) -> Option<OrderUpdate> {
    let status = match row.get("orderStatus")?.as_str()? {
        "New" | "Created" => OrderStatus::New,
        "PartiallyFilled" => OrderStatus::PartiallyFilled,
        "Filled" => OrderStatus::Filled,
        "Cancelled" | "Canceled" => OrderStatus::Canceled,
        "Rejected" => OrderStatus::Rejected,
        "Deactivated" => OrderStatus::Deactivated,
        _ => return None,
    };
    let order_type = match row.get("orderType")?.as_str()? {
        "Limit" => OrderType::Limit,
        "Market" => OrderType::Market,
        _ => return None,
    };
    Some(OrderUpdate {
        order_id: row.get("orderId")?.as_str()?.to_string(),
        client_order_id: row.get("orderLinkId").and_then(|v| v.as_str()).map(|s| s.to_string()),
        symbol: row.get("symbol")?.as_str()?.to_string(),
        side: parse_side(row.get("side")?)?,
        order_type,
        price: row.get("price")?.as_str()?.parse::<Decimal>().ok()?,
        quantity: row.get("qty")?.as_str()?.parse::<Decimal>().ok()?,
        cumulative_filled_qty: row
            .get("cumExecQty")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok())
            .unwrap_or(Decimal::ZERO),
        avg_fill_price: row
            .get("avgPrice")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok())
            .unwrap_or(Decimal::ZERO),
        status,
        exchange_timestamp_ms: row
            .get("updatedTime")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0),
    })
}

fn parse_position_row(row: &serde_json::Value) -> Option<PositionUpdate> {
    Some(PositionUpdate {
        symbol: row.get("symbol")?.as_str()?.to_string(),
        position_idx: row.get("positionIdx").and_then(|v| v.as_u64()).unwrap_or(0) as u8,
        side: parse_side(row.get("side")?)?,
        size: row.get("size")?.as_str()?.parse::<Decimal>().ok()?,
        entry_price: row
            .get("entryPrice")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok())
            .unwrap_or(Decimal::ZERO),
        unrealized_pnl: row
            .get("unrealisedPnl")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok())
            .unwrap_or(Decimal::ZERO),
        exchange_timestamp_ms: row
            .get("updatedTime")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0),
    })
}

fn parse_wallet_row(row: &serde_json::Value) -> Option<WalletUpdate> {
    Some(WalletUpdate {
        coin: row.get("coin")?.as_str()?.to_string(),
        wallet_balance: row.get("walletBalance")?.as_str()?.parse::<Decimal>().ok()?,
        available_balance: row
            .get("availableToWithdraw")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Decimal>().ok())
            .unwrap_or(Decimal::ZERO),
        exchange_timestamp_ms: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_topic_batch_parses_in_order() {
        let text = serde_json::json!({
            "topic": "order",
            "data": [
                {"orderId": "1", "symbol": "BTCUSDT", "side": "Buy", "orderType": "Limit",
                 "price": "100.0", "qty": "1.0", "cumExecQty": "0", "avgPrice": "0", "orderStatus": "New"},
                {"orderId": "1", "symbol": "BTCUSDT", "side": "Buy", "orderType": "Limit",
                 "price": "100.0", "qty": "1.0", "cumExecQty": "1.0", "avgPrice": "100.05", "orderStatus": "Filled"},
            ]
        })
        .to_string();

        let events = parse_private_message(&text);
        assert_eq!(events.len(), 2);
        match (&events[0], &events[1]) {
            (WsEvent::OrderUpdate(a), WsEvent::OrderUpdate(b)) => {
                assert_eq!(a.status, OrderStatus::New);
                assert_eq!(b.status, OrderStatus::Filled);
            }
            _ => panic!("expected two OrderUpdate events"),
        }
    }

    #[test]
    fn unrecognized_topic_yields_no_events() {
        let text = serde_json::json!({"topic": "greeks", "data": [{}]}).to_string();
        assert!(parse_private_message(&text).is_empty());
    }

    #[test]
    fn reconnect_schedule_matches_bounded_steps() {
        let expected = [1, 2, 4, 8, 15, 30, 60];
        for (i, secs) in expected.iter().enumerate() {
            assert_eq!(reconnect_delay(i as u32).as_secs(), *secs);
        }
    }
}
