// =============================================================================
// Order Lifecycle Manager (spec.md §4.D)
// =============================================================================
//
// Two input paths feed the open-orders map: the private stream (preferred)
// and periodic HTTP reconciliation (fallback). Events are idempotent — the
// same terminal status applied twice is a no-op. HTTP reconciliation is a
// declarative replacement of the whole map, never a merge, because the
// exchange is the source of truth.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, warn};

/// How many recently-terminated order ids to remember purely for duplicate
/// detection. An order that leaves the open map (spec.md §3) still needs to
/// be recognized if the same terminal event is replayed — unbounded memory
/// for this would leak over a long-lived process, so only the most recent
/// ids are kept.
const TERMINAL_DEDUP_CAPACITY: usize = 4096;

/// Window size for the realized-slippage rolling average that feeds the
/// pricing loop's market-impact sub-multiplier (spec.md §4.G).
const RECENT_SLIPPAGE_WINDOW: usize = 5;

use crate::exchange::client::RemoteOrder;
use crate::exchange::events::OrderUpdate;
use crate::orders::position::PositionManager;
use crate::types::{OrderStatus, OrderType, Side};

/// A locally-tracked order, keyed by exchange order id.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub side: Side,
    pub order_type: OrderType,
    pub price: Decimal,
    pub quantity: Decimal,
    pub cumulative_filled_qty: Decimal,
    pub status: OrderStatus,
    pub created_at_ms: i64,
}

impl OrderRecord {
    fn from_update(update: &OrderUpdate) -> Self {
        Self {
            order_id: update.order_id.clone(),
            client_order_id: update.client_order_id.clone(),
            side: update.side,
            order_type: update.order_type,
            price: update.price,
            quantity: update.quantity,
            cumulative_filled_qty: update.cumulative_filled_qty,
            status: update.status,
            created_at_ms: update.exchange_timestamp_ms,
        }
    }

    fn from_remote(remote: &RemoteOrder) -> Self {
        Self {
            order_id: remote.order_id.clone(),
            client_order_id: remote.client_order_id.clone(),
            side: remote.side,
            order_type: remote.order_type,
            price: remote.price,
            quantity: remote.quantity,
            cumulative_filled_qty: remote.cumulative_filled_qty,
            status: remote.status,
            created_at_ms: remote.created_at_ms,
        }
    }
}

/// A completed fill, emitted for the trade journal (spec.md §6).
#[derive(Debug, Clone)]
pub struct FillEvent {
    pub order_id: String,
    pub client_order_id: Option<String>,
    pub side: Side,
    pub fill_price: Decimal,
    pub fill_quantity: Decimal,
    pub realized_slippage_fraction: f64,
}

/// Owns the open-orders map for the configured symbol.
pub struct OrderLifecycleManager {
    max_slippage_fraction: f64,
    orders: RwLock<HashMap<String, OrderRecord>>,
    /// Ids that have already left the open map via a terminal event, kept
    /// around (bounded, FIFO-evicted) so a replayed terminal message for the
    /// same id is recognized as a no-op rather than a brand-new fill.
    terminal_seen: RwLock<HashSet<String>>,
    terminal_seen_order: RwLock<VecDeque<String>>,
    /// Last `RECENT_SLIPPAGE_WINDOW` realized-slippage fractions, newest at
    /// the back, feeding the pricing loop's market-impact multiplier.
    recent_slippage: RwLock<VecDeque<f64>>,
}

impl OrderLifecycleManager {
    pub fn new(max_slippage_fraction: f64) -> Self {
        Self {
            max_slippage_fraction,
            orders: RwLock::new(HashMap::new()),
            terminal_seen: RwLock::new(HashSet::new()),
            terminal_seen_order: RwLock::new(VecDeque::new()),
            recent_slippage: RwLock::new(VecDeque::new()),
        }
    }

    /// Mean of the last `RECENT_SLIPPAGE_WINDOW` realized-slippage samples,
    /// or 0.0 with no fills yet.
    pub fn avg_recent_slippage(&self) -> f64 {
        let samples = self.recent_slippage.read();
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().sum::<f64>() / samples.len() as f64
    }

    fn mark_terminal_seen(&self, order_id: &str) {
        let mut seen = self.terminal_seen.write();
        if seen.insert(order_id.to_string()) {
            let mut order = self.terminal_seen_order.write();
            order.push_back(order_id.to_string());
            if order.len() > TERMINAL_DEDUP_CAPACITY {
                if let Some(evicted) = order.pop_front() {
                    seen.remove(&evicted);
                }
            }
        }
    }

    fn was_terminal_seen(&self, order_id: &str) -> bool {
        self.terminal_seen.read().contains(order_id)
    }

    /// Registers a freshly-placed order before any private event arrives,
    /// so that the open-orders map reflects it immediately.
    pub fn register_new_order(&self, order_id: String, client_order_id: String, side: Side, order_type: OrderType, price: Decimal, quantity: Decimal, created_at_ms: i64) {
        self.orders.write().insert(
            order_id.clone(),
            OrderRecord {
                order_id,
                client_order_id: Some(client_order_id),
                side,
                order_type,
                price,
                quantity,
                cumulative_filled_qty: Decimal::ZERO,
                status: OrderStatus::New,
                created_at_ms,
            },
        );
    }

    /// Applies a single private-stream order event. Idempotent: reapplying
    /// the same terminal status is a no-op. Returns a `FillEvent` when the
    /// update represents (or completes) a fill, for the trade journal and
    /// slippage-counter bookkeeping.
    pub fn apply_private_event(&self, update: &OrderUpdate, position_mgr: &PositionManager) -> Option<FillEvent> {
        let mut orders = self.orders.write();

        let known = orders.contains_key(&update.order_id);
        if !known {
            drop(orders);
            if self.was_terminal_seen(&update.order_id) {
                // Replay of a terminal event already applied and removed.
                debug!(order_id = %update.order_id, "ignoring duplicate terminal event for already-removed order");
                return None;
            }
            if update.status.is_terminal() {
                // A terminal message for an id this manager never tracked
                // (not open locally, not previously seen terminal here).
                debug!(order_id = %update.order_id, "ignoring terminal event for unknown order id");
                return None;
            }
            orders = self.orders.write();
        }

        let previously_filled = orders
            .get(&update.order_id)
            .map(|o| o.cumulative_filled_qty)
            .unwrap_or(Decimal::ZERO);
        let new_fill_qty = update.cumulative_filled_qty - previously_filled;

        let record = OrderRecord::from_update(update);
        let is_fill = update.status == OrderStatus::Filled && new_fill_qty > Decimal::ZERO;

        if update.status.is_terminal() {
            orders.remove(&update.order_id);
            drop(orders);
            self.mark_terminal_seen(&update.order_id);
        } else {
            orders.insert(update.order_id.clone(), record.clone());
            drop(orders);
        }

        if update.status == OrderStatus::Rejected {
            position_mgr.with_counters_mut(|c| c.orders_rejected += 1);
        }
        if update.status == OrderStatus::Canceled {
            position_mgr.with_counters_mut(|c| c.orders_canceled += 1);
        }

        if !is_fill {
            return None;
        }

        let expected = record.price;
        // Prefer the exchange-reported average fill price; some exchange
        // messages omit it on the final terminal frame of a single-fill
        // order, in which case the submitted price is the best estimate.
        let fill_price = if update.avg_fill_price.is_zero() {
            record.price
        } else {
            update.avg_fill_price
        };
        let raw_slippage = if expected.is_zero() {
            0.0
        } else {
            let diff = (fill_price - expected) / expected;
            let signed = match record.side {
                Side::Buy => diff,
                Side::Sell => -diff,
            };
            rust_decimal::prelude::ToPrimitive::to_f64(&signed).unwrap_or(0.0)
        };

        position_mgr.with_counters_mut(|c| {
            c.orders_filled += 1;
            c.cumulative_volume += new_fill_qty;
            if raw_slippage.abs() > self.max_slippage_fraction {
                c.slippage_events += 1;
            }
        });

        {
            let mut samples = self.recent_slippage.write();
            samples.push_back(raw_slippage);
            if samples.len() > RECENT_SLIPPAGE_WINDOW {
                samples.pop_front();
            }
        }

        Some(FillEvent {
            order_id: record.order_id.clone(),
            client_order_id: record.client_order_id.clone(),
            side: record.side,
            fill_price,
            fill_quantity: new_fill_qty,
            realized_slippage_fraction: raw_slippage,
        })
    }

    /// Declarative replacement of the open-orders map from an authoritative
    /// HTTP poll. A terminal status observed here overrides any local
    /// belief of "still open" (spec.md §5).
    pub fn reconcile_from_http(&self, remote: &[RemoteOrder]) {
        let mut orders = self.orders.write();
        orders.clear();
        for order in remote {
            if order.status.is_terminal() {
                continue;
            }
            orders.insert(order.order_id.clone(), OrderRecord::from_remote(order));
        }
        debug!(open_count = orders.len(), "orders reconciled from HTTP poll");
    }

    /// Marks an order as canceled locally (used after a successful
    /// `cancel_order` call, ahead of the private-stream confirmation).
    pub fn mark_canceled_locally(&self, order_id: &str) {
        self.orders.write().remove(order_id);
    }

    pub fn open_orders(&self) -> Vec<OrderRecord> {
        self.orders.read().values().cloned().collect()
    }

    pub fn has_open_order(&self, side: Side) -> bool {
        self.orders.read().values().any(|o| o.side == side)
    }

    pub fn open_count(&self) -> usize {
        self.orders.read().len()
    }

    pub fn get(&self, order_id: &str) -> Option<OrderRecord> {
        self.orders.read().get(order_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn update(order_id: &str, status: OrderStatus, cum_fill: Decimal) -> OrderUpdate {
        update_with_avg_price(order_id, status, cum_fill, Decimal::ZERO)
    }

    fn update_with_avg_price(order_id: &str, status: OrderStatus, cum_fill: Decimal, avg_fill_price: Decimal) -> OrderUpdate {
        OrderUpdate {
            order_id: order_id.to_string(),
            client_order_id: Some("link-1".into()),
            symbol: "BTCUSDT".into(),
            side: Side::Buy,
            order_type: OrderType::Limit,
            price: dec!(100.0),
            quantity: dec!(1.0),
            cumulative_filled_qty: cum_fill,
            avg_fill_price,
            status,
            exchange_timestamp_ms: 0,
        }
    }

    #[test]
    fn terminal_status_removes_from_open_map() {
        let mgr = OrderLifecycleManager::new(0.01);
        let positions = PositionManager::new();
        mgr.apply_private_event(&update("1", OrderStatus::New, dec!(0)), &positions);
        assert_eq!(mgr.open_count(), 1);
        mgr.apply_private_event(&update("1", OrderStatus::Filled, dec!(1.0)), &positions);
        assert_eq!(mgr.open_count(), 0);
    }

    #[test]
    fn reapplying_terminal_status_is_idempotent() {
        let mgr = OrderLifecycleManager::new(0.01);
        let positions = PositionManager::new();
        mgr.apply_private_event(&update("1", OrderStatus::New, dec!(0)), &positions);
        let fill1 = mgr.apply_private_event(&update("1", OrderStatus::Filled, dec!(1.0)), &positions);
        assert!(fill1.is_some());
        let fill2 = mgr.apply_private_event(&update("1", OrderStatus::Filled, dec!(1.0)), &positions);
        assert!(fill2.is_none());
        assert_eq!(positions.counters().orders_filled, 1);
    }

    #[test]
    fn unknown_terminal_event_is_ignored_without_panic() {
        let mgr = OrderLifecycleManager::new(0.01);
        let positions = PositionManager::new();
        let result = mgr.apply_private_event(&update("ghost", OrderStatus::Canceled, dec!(0)), &positions);
        assert!(result.is_none());
        assert_eq!(mgr.open_count(), 0);
    }

    #[test]
    fn avg_recent_slippage_is_zero_with_no_fills() {
        let mgr = OrderLifecycleManager::new(0.01);
        assert_eq!(mgr.avg_recent_slippage(), 0.0);
    }

    #[test]
    fn avg_recent_slippage_reflects_adverse_fill_vs_submitted_price() {
        let mgr = OrderLifecycleManager::new(0.01);
        let positions = PositionManager::new();
        // Buy order submitted at 100.0, actually filled at 100.5 (worse for
        // the buyer) -> positive (adverse) slippage of 0.005.
        mgr.apply_private_event(&update("1", OrderStatus::New, dec!(0)), &positions);
        let fill = mgr
            .apply_private_event(&update_with_avg_price("1", OrderStatus::Filled, dec!(1.0), dec!(100.5)), &positions)
            .expect("fill event expected");
        assert!((fill.realized_slippage_fraction - 0.005).abs() < 1e-9);
        assert!((mgr.avg_recent_slippage() - 0.005).abs() < 1e-9);
    }

    #[test]
    fn avg_recent_slippage_window_is_bounded() {
        let mgr = OrderLifecycleManager::new(0.01);
        let positions = PositionManager::new();
        // Six fills, all adverse by a distinct amount; only the last
        // RECENT_SLIPPAGE_WINDOW (5) should count toward the average.
        for i in 0..6u32 {
            let id = format!("ord-{i}");
            let avg_price = dec!(100.0) + Decimal::from(i);
            mgr.apply_private_event(&update(&id, OrderStatus::New, dec!(0)), &positions);
            mgr.apply_private_event(&update_with_avg_price(&id, OrderStatus::Filled, dec!(1.0), avg_price), &positions);
        }
        // Slippage fractions are (100+i - 100)/100 = i/100 for i in 1..=5
        // after the first (i=0, slippage 0.0) falls out of the window.
        let expected = (1..=5).map(|i| i as f64 / 100.0).sum::<f64>() / 5.0;
        assert!((mgr.avg_recent_slippage() - expected).abs() < 1e-9);
    }

    #[test]
    fn http_reconciliation_is_declarative_replacement() {
        let mgr = OrderLifecycleManager::new(0.01);
        let positions = PositionManager::new();
        mgr.apply_private_event(&update("stale", OrderStatus::New, dec!(0)), &positions);
        assert_eq!(mgr.open_count(), 1);

        mgr.reconcile_from_http(&[RemoteOrder {
            order_id: "live".into(),
            client_order_id: None,
            symbol: "BTCUSDT".into(),
            side: Side::Sell,
            order_type: OrderType::Limit,
            price: dec!(200.0),
            quantity: dec!(1.0),
            cumulative_filled_qty: dec!(0),
            status: OrderStatus::New,
            created_at_ms: 0,
        }]);

        assert_eq!(mgr.open_count(), 1);
        assert!(mgr.get("stale").is_none());
        assert!(mgr.get("live").is_some());
    }
}
