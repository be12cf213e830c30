// =============================================================================
// Position records, wallet snapshot, and session counters (spec.md §3)
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::exchange::client::RemotePosition;
use crate::exchange::events::PositionUpdate;
use crate::types::Side;

/// A single position record, keyed by side under hedge mode (or a single
/// `Side::Buy`-keyed record under one-way mode by convention).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: Decimal,
    pub liquidation_price: Decimal,
}

/// Available balance in the quote asset, with a last-update timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletSnapshot {
    pub available_balance: Decimal,
    pub last_update_ms: i64,
}

impl Default for WalletSnapshot {
    fn default() -> Self {
        Self {
            available_balance: Decimal::ZERO,
            last_update_ms: 0,
        }
    }
}

/// Monotonic counters tracked for the lifetime of the process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionCounters {
    pub orders_placed: u64,
    pub orders_filled: u64,
    pub orders_canceled: u64,
    pub orders_rejected: u64,
    pub rebalances_executed: u64,
    pub circuit_breaker_activations: u64,
    pub slippage_events: u64,
    pub cumulative_volume: Decimal,
    pub peak_pnl: Decimal,
    pub max_drawdown_fraction: f64,
}

impl SessionCounters {
    /// Records a fresh realized-PnL data point, updating peak PnL and the
    /// running max-drawdown fraction (spec.md §4.D).
    pub fn record_pnl(&mut self, unrealized_pnl: Decimal) {
        if unrealized_pnl > self.peak_pnl {
            self.peak_pnl = unrealized_pnl;
        }
        if self.peak_pnl > Decimal::ZERO {
            let drawdown = (self.peak_pnl - unrealized_pnl) / self.peak_pnl;
            let drawdown_f: f64 = rust_decimal::prelude::ToPrimitive::to_f64(&drawdown).unwrap_or(0.0);
            if drawdown_f > self.max_drawdown_fraction {
                self.max_drawdown_fraction = drawdown_f;
            }
        }
    }
}

/// Thread-safe owner of the symbol's position map, wallet snapshot, and
/// session counters. Size = 0 removes the record (spec.md §3 invariant).
pub struct PositionManager {
    positions: RwLock<HashMap<Side, PositionRecord>>,
    wallet: RwLock<WalletSnapshot>,
    counters: RwLock<SessionCounters>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            wallet: RwLock::new(WalletSnapshot::default()),
            counters: RwLock::new(SessionCounters::default()),
        }
    }

    /// Apply a private-feed position event, replacing the record for that
    /// side (or removing it if size is zero). After replacement, sums
    /// unrealized PnL across sides and publishes it to session stats.
    pub fn apply_position_update(&self, update: &PositionUpdate) {
        let mut positions = self.positions.write();
        if update.size.is_zero() {
            positions.remove(&update.side);
        } else {
            positions.insert(
                update.side,
                PositionRecord {
                    side: update.side,
                    size: update.size,
                    entry_price: update.entry_price,
                    unrealized_pnl: update.unrealized_pnl,
                    leverage: Decimal::ONE,
                    liquidation_price: Decimal::ZERO,
                },
            );
        }
        let total_pnl: Decimal = positions.values().map(|p| p.unrealized_pnl).sum();
        drop(positions);
        self.counters.write().record_pnl(total_pnl);
    }

    /// Declarative replacement of the position map from an authoritative
    /// HTTP poll (spec.md §4.D) — not a merge.
    pub fn reconcile_from_http(&self, remote: &[RemotePosition]) {
        let mut positions = self.positions.write();
        positions.clear();
        for pos in remote {
            if pos.size.is_zero() {
                continue;
            }
            positions.insert(
                pos.side,
                PositionRecord {
                    side: pos.side,
                    size: pos.size,
                    entry_price: pos.entry_price,
                    unrealized_pnl: pos.unrealized_pnl,
                    leverage: pos.leverage,
                    liquidation_price: pos.liquidation_price,
                },
            );
        }
        let total_pnl: Decimal = positions.values().map(|p| p.unrealized_pnl).sum();
        drop(positions);
        self.counters.write().record_pnl(total_pnl);
        debug!("positions reconciled from HTTP poll");
    }

    pub fn get(&self, side: Side) -> Option<PositionRecord> {
        self.positions.read().get(&side).cloned()
    }

    pub fn all(&self) -> Vec<PositionRecord> {
        self.positions.read().values().cloned().collect()
    }

    /// `long_size - short_size`, used by the inventory-rebalance rule.
    pub fn net_size(&self) -> Decimal {
        let positions = self.positions.read();
        let long = positions.get(&Side::Buy).map(|p| p.size).unwrap_or(Decimal::ZERO);
        let short = positions.get(&Side::Sell).map(|p| p.size).unwrap_or(Decimal::ZERO);
        long - short
    }

    pub fn update_wallet(&self, available_balance: Decimal, last_update_ms: i64) {
        *self.wallet.write() = WalletSnapshot {
            available_balance,
            last_update_ms,
        };
    }

    pub fn wallet(&self) -> WalletSnapshot {
        self.wallet.read().clone()
    }

    pub fn counters(&self) -> SessionCounters {
        self.counters.read().clone()
    }

    pub fn with_counters_mut<R>(&self, f: impl FnOnce(&mut SessionCounters) -> R) -> R {
        f(&mut self.counters.write())
    }
}

impl Default for PositionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn zero_size_update_removes_record() {
        let mgr = PositionManager::new();
        mgr.apply_position_update(&PositionUpdate {
            symbol: "BTCUSDT".into(),
            position_idx: 1,
            side: Side::Buy,
            size: dec!(1.0),
            entry_price: dec!(100),
            unrealized_pnl: dec!(5),
            exchange_timestamp_ms: 0,
        });
        assert!(mgr.get(Side::Buy).is_some());

        mgr.apply_position_update(&PositionUpdate {
            symbol: "BTCUSDT".into(),
            position_idx: 1,
            side: Side::Buy,
            size: dec!(0),
            entry_price: dec!(100),
            unrealized_pnl: dec!(0),
            exchange_timestamp_ms: 1,
        });
        assert!(mgr.get(Side::Buy).is_none());
    }

    #[test]
    fn net_size_is_long_minus_short() {
        let mgr = PositionManager::new();
        mgr.apply_position_update(&PositionUpdate {
            symbol: "BTCUSDT".into(),
            position_idx: 1,
            side: Side::Buy,
            size: dec!(3.0),
            entry_price: dec!(100),
            unrealized_pnl: dec!(0),
            exchange_timestamp_ms: 0,
        });
        mgr.apply_position_update(&PositionUpdate {
            symbol: "BTCUSDT".into(),
            position_idx: 2,
            side: Side::Sell,
            size: dec!(1.0),
            entry_price: dec!(100),
            unrealized_pnl: dec!(0),
            exchange_timestamp_ms: 0,
        });
        assert_eq!(mgr.net_size(), dec!(2.0));
    }

    #[test]
    fn reconcile_replaces_rather_than_merges() {
        let mgr = PositionManager::new();
        mgr.apply_position_update(&PositionUpdate {
            symbol: "BTCUSDT".into(),
            position_idx: 1,
            side: Side::Buy,
            size: dec!(3.0),
            entry_price: dec!(100),
            unrealized_pnl: dec!(0),
            exchange_timestamp_ms: 0,
        });
        mgr.reconcile_from_http(&[]);
        assert!(mgr.get(Side::Buy).is_none());
    }
}
