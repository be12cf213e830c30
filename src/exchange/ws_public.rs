// =============================================================================
// Public websocket channel — orderbook depth stream with bounded reconnect
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::exchange::events::{DepthLevel, DepthUpdate, WsEvent};
use crate::types::ConnectionState;

/// Bounded reconnect delay schedule, indexed by failed-attempt count
/// (spec.md §4.A). The last entry repeats for attempts beyond its index.
const RECONNECT_SCHEDULE_SECS: [u64; 7] = [1, 2, 4, 8, 15, 30, 60];

fn reconnect_delay(attempt: u32) -> std::time::Duration {
    let idx = (attempt as usize).min(RECONNECT_SCHEDULE_SECS.len() - 1);
    std::time::Duration::from_secs(RECONNECT_SCHEDULE_SECS[idx])
}

/// Drives the public depth stream for a single symbol, reconnecting per the
/// bounded schedule and forwarding parsed events through `tx`.
pub struct PublicStream {
    ws_url: String,
    symbol: String,
    depth_levels: u32,
    state: RwLock<ConnectionState>,
    reconnect_attempts: AtomicU32,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
}

impl PublicStream {
    pub fn new(
        ws_url: impl Into<String>,
        symbol: impl Into<String>,
        depth_levels: u32,
        shutdown: Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            symbol: symbol.into(),
            depth_levels,
            state: RwLock::new(ConnectionState::Disconnected),
            reconnect_attempts: AtomicU32::new(0),
            shutdown,
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Runs forever (until shutdown is requested), maintaining the connection
    /// and pushing parsed `WsEvent`s onto `tx`. At most one instance of this
    /// task is ever spawned per channel.
    pub async fn run(&self, tx: mpsc::Sender<WsEvent>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                *self.state.write() = ConnectionState::Disconnected;
                return;
            }

            *self.state.write() = ConnectionState::Connecting;
            match self.connect_and_read(&tx).await {
                Ok(()) => {
                    info!(symbol = %self.symbol, "public stream closed cleanly");
                }
                Err(e) => {
                    warn!(symbol = %self.symbol, error = %e, "public stream error");
                }
            }
            *self.state.write() = ConnectionState::Disconnected;

            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
            let delay = reconnect_delay(attempt);
            debug!(symbol = %self.symbol, attempt, delay_secs = delay.as_secs(), "scheduling public reconnect");
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_and_read(&self, tx: &mpsc::Sender<WsEvent>) -> anyhow::Result<()> {
        let (mut ws_stream, _resp) = connect_async(&self.ws_url).await?;
        let topic = format!("orderbook.{}.{}", self.depth_levels, self.symbol);
        let subscribe = serde_json::json!({ "op": "subscribe", "args": [topic] });
        ws_stream.send(Message::Text(subscribe.to_string())).await?;

        // A successful subscribe acknowledgment resets the reconnect counter.
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        *self.state.write() = ConnectionState::Connected;
        info!(symbol = %self.symbol, "public stream connected and subscribed");

        while let Some(msg) = ws_stream.next().await {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(());
            }
            match msg? {
                Message::Text(text) => {
                    if let Some(event) = parse_public_message(&text) {
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

/// Parses a single depth-stream text frame. Rows with non-positive price or
/// quantity are rejected per spec.md §4.C; a frame that yields no usable
/// levels is logged and skipped (returns `None`) rather than tearing down
/// the stream.
fn parse_public_message(text: &str) -> Option<WsEvent> {
    let root: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "malformed public stream payload");
            return None;
        }
    };

    if root.get("op").and_then(|v| v.as_str()) == Some("pong") {
        return Some(WsEvent::Pong);
    }

    let data = root.get("data")?;
    let symbol = data.get("s").and_then(|v| v.as_str())?.to_string();
    let is_snapshot = root.get("type").and_then(|v| v.as_str()) == Some("snapshot");
    let sequence = data.get("seq").and_then(|v| v.as_u64()).unwrap_or(0);
    let timestamp = root.get("ts").and_then(|v| v.as_i64()).unwrap_or(0);

    let bids = parse_levels(data.get("b"));
    let asks = parse_levels(data.get("a"));
    if bids.is_empty() && asks.is_empty() {
        return None;
    }

    Some(WsEvent::OrderbookDepth(DepthUpdate {
        symbol,
        bids,
        asks,
        is_snapshot,
        sequence,
        exchange_timestamp_ms: timestamp,
    }))
}

fn parse_levels(raw: Option<&serde_json::Value>) -> Vec<DepthLevel> {
    let Some(rows) = raw.and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(|row| {
            let arr = row.as_array()?;
            let price: Decimal = arr.first()?.as_str()?.parse().ok()?;
            let quantity: Decimal = arr.get(1)?.as_str()?.parse().ok()?;
            if price <= Decimal::ZERO || quantity <= Decimal::ZERO {
                return None;
            }
            Some(DepthLevel { price, quantity })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_schedule_caps_at_sixty_seconds() {
        assert_eq!(reconnect_delay(0).as_secs(), 1);
        assert_eq!(reconnect_delay(6).as_secs(), 60);
        assert_eq!(reconnect_delay(100).as_secs(), 60);
    }

    #[test]
    fn non_positive_levels_are_rejected() {
        let text = serde_json::json!({
            "type": "snapshot",
            "ts": 123,
            "data": {
                "s": "BTCUSDT",
                "seq": 1,
                "b": [["0", "1.0"], ["100.0", "-1.0"], ["99.5", "2.0"]],
                "a": [["101.0", "1.5"]],
            }
        })
        .to_string();

        let event = parse_public_message(&text).unwrap();
        match event {
            WsEvent::OrderbookDepth(update) => {
                assert_eq!(update.bids.len(), 1);
                assert_eq!(update.asks.len(), 1);
            }
            _ => panic!("expected OrderbookDepth"),
        }
    }

    #[test]
    fn malformed_json_returns_none() {
        assert!(parse_public_message("not json").is_none());
    }
}
