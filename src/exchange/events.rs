// =============================================================================
// Websocket event taxonomy
// =============================================================================
//
// Replaces dynamic string-topic dispatch with a tagged enum: every inbound
// websocket frame is parsed once into a `WsEvent`, then matched exhaustively
// by whichever subsystem owns that topic. See spec.md §9.
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{OrderStatus, OrderType, Side};

/// One price/quantity level in an orderbook depth update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// A depth snapshot or delta for the public orderbook stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthUpdate {
    pub symbol: String,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub is_snapshot: bool,
    pub sequence: u64,
    pub exchange_timestamp_ms: i64,
}

/// A private order-state transition pushed over the authenticated stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Decimal,
    pub quantity: Decimal,
    pub cumulative_filled_qty: Decimal,
    /// Exchange-reported average fill price across all executions so far
    /// (Bybit's `avgPrice`). Zero until the first partial fill. Used to
    /// compute realized slippage against the originally submitted `price`.
    pub avg_fill_price: Decimal,
    pub status: OrderStatus,
    pub exchange_timestamp_ms: i64,
}

/// A private position-size/PnL update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub symbol: String,
    pub position_idx: u8,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub exchange_timestamp_ms: i64,
}

/// A private wallet-balance update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletUpdate {
    pub coin: String,
    pub wallet_balance: Decimal,
    pub available_balance: Decimal,
    pub exchange_timestamp_ms: i64,
}

/// Every kind of message this bot can receive over either websocket
/// channel, parsed once at the stream boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WsEvent {
    OrderbookDepth(DepthUpdate),
    OrderUpdate(OrderUpdate),
    PositionUpdate(PositionUpdate),
    WalletUpdate(WalletUpdate),
    Ping,
    Pong,
}
