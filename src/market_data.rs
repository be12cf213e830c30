// =============================================================================
// Market-Data Ingestor — top-of-book, depth ladder, freshness (spec.md §4.C)
// =============================================================================

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::exchange::events::DepthUpdate;

/// Bounded ring buffer capacity for price/spread history (spec.md §3).
const HISTORY_CAPACITY: usize = 200;

/// One recorded (timestamp, mid, bid, ask, relative-spread) sample.
#[derive(Debug, Clone, Copy)]
pub struct PriceHistorySample {
    pub at: Instant,
    pub mid: f64,
    pub bid: f64,
    pub ask: f64,
    pub relative_spread: f64,
}

#[derive(Debug, Clone)]
struct DepthLevelF {
    price: f64,
    quantity: f64,
}

struct Snapshot {
    symbol: String,
    best_bid: f64,
    best_ask: f64,
    mid: f64,
    bids: Vec<DepthLevelF>,
    asks: Vec<DepthLevelF>,
    last_update: Instant,
    data_quality: f64,
}

impl Snapshot {
    fn empty(symbol: String) -> Self {
        Self {
            symbol,
            best_bid: 0.0,
            best_ask: 0.0,
            mid: 0.0,
            bids: Vec::new(),
            asks: Vec::new(),
            last_update: Instant::now(),
            data_quality: 1.0,
        }
    }
}

/// Maintains the single-symbol orderbook top-of-book and depth ladder,
/// driven exclusively by the public-stream reader. Readers accept
/// eventually-consistent reads and never block the writer.
pub struct MarketDataIngestor {
    depth_levels: usize,
    abnormal_spread_threshold: f64,
    snapshot: RwLock<Snapshot>,
    price_history: RwLock<VecDeque<PriceHistorySample>>,
    spread_degraded: RwLock<bool>,
}

impl MarketDataIngestor {
    pub fn new(symbol: impl Into<String>, depth_levels: usize, abnormal_spread_threshold: f64) -> Self {
        Self {
            depth_levels,
            abnormal_spread_threshold,
            snapshot: RwLock::new(Snapshot::empty(symbol.into())),
            price_history: RwLock::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
            spread_degraded: RwLock::new(false),
        }
    }

    /// Consume a single depth update from the public stream. Levels were
    /// already filtered for non-positive price/quantity by the transport
    /// layer; here we re-sort, truncate to the configured depth, and derive
    /// best-bid/ask/mid. Malformed shapes (empty both sides) are rejected.
    pub fn handle_depth_update(&self, update: &DepthUpdate) {
        if update.bids.is_empty() && update.asks.is_empty() {
            warn!(symbol = %update.symbol, "empty depth update, skipping");
            return;
        }

        let mut bids: Vec<DepthLevelF> = update
            .bids
            .iter()
            .map(|l| DepthLevelF {
                price: decimal_to_f64(l.price),
                quantity: decimal_to_f64(l.quantity),
            })
            .collect();
        bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        bids.truncate(self.depth_levels);

        let mut asks: Vec<DepthLevelF> = update
            .asks
            .iter()
            .map(|l| DepthLevelF {
                price: decimal_to_f64(l.price),
                quantity: decimal_to_f64(l.quantity),
            })
            .collect();
        asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        asks.truncate(self.depth_levels);

        let mut snap = self.snapshot.write();
        if let Some(b) = bids.first() {
            snap.best_bid = b.price;
        }
        if let Some(a) = asks.first() {
            snap.best_ask = a.price;
        }
        if !bids.is_empty() {
            snap.bids = bids;
        }
        if !asks.is_empty() {
            snap.asks = asks;
        }

        if snap.best_bid > 0.0 && snap.best_ask > 0.0 && snap.best_bid < snap.best_ask {
            snap.mid = (snap.best_bid + snap.best_ask) / 2.0;
        }
        snap.last_update = Instant::now();

        let relative_spread = if snap.mid > 0.0 {
            (snap.best_ask - snap.best_bid) / snap.mid
        } else {
            0.0
        };
        *self.spread_degraded.write() = relative_spread > self.abnormal_spread_threshold;

        if snap.mid > 0.0 {
            snap.data_quality = (snap.data_quality + 0.01).min(1.0);
        }

        let sample = PriceHistorySample {
            at: snap.last_update,
            mid: snap.mid,
            bid: snap.best_bid,
            ask: snap.best_ask,
            relative_spread,
        };
        drop(snap);

        let mut history = self.price_history.write();
        if history.len() >= HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(sample);

        debug!(symbol = %update.symbol, relative_spread, "depth update applied");
    }

    /// `true` iff mid > 0 and the snapshot is no older than `max_age`.
    /// Simultaneously nudges the decaying data-quality score: +0.01 fresh,
    /// -0.05 stale, clamped to [0,1] (spec.md §4.C).
    pub fn is_fresh(&self, max_age: std::time::Duration) -> bool {
        let mut snap = self.snapshot.write();
        let fresh = snap.mid > 0.0 && snap.last_update.elapsed() <= max_age;
        snap.data_quality = if fresh {
            (snap.data_quality + 0.01).min(1.0)
        } else {
            (snap.data_quality - 0.05).max(0.0)
        };
        fresh
    }

    pub fn data_quality(&self) -> f64 {
        self.snapshot.read().data_quality
    }

    pub fn spread_degraded(&self) -> bool {
        *self.spread_degraded.read()
    }

    pub fn best_bid(&self) -> f64 {
        self.snapshot.read().best_bid
    }

    pub fn best_ask(&self) -> f64 {
        self.snapshot.read().best_ask
    }

    pub fn mid(&self) -> f64 {
        self.snapshot.read().mid
    }

    pub fn last_update_age(&self) -> std::time::Duration {
        self.snapshot.read().last_update.elapsed()
    }

    /// Total bid volume / total ask volume over the current depth ladder.
    /// +inf if only bids, 0 if only asks, 1 if empty (spec.md §4.C).
    pub fn depth_ratio(&self) -> f64 {
        let snap = self.snapshot.read();
        let bid_vol: f64 = snap.bids.iter().map(|l| l.quantity).sum();
        let ask_vol: f64 = snap.asks.iter().map(|l| l.quantity).sum();
        if bid_vol == 0.0 && ask_vol == 0.0 {
            1.0
        } else if ask_vol == 0.0 {
            f64::INFINITY
        } else {
            bid_vol / ask_vol
        }
    }

    /// Book imbalance over top-K depth: `|bids - asks| / (bids + asks)`.
    pub fn book_imbalance(&self) -> f64 {
        let snap = self.snapshot.read();
        let bid_vol: f64 = snap.bids.iter().map(|l| l.quantity).sum();
        let ask_vol: f64 = snap.asks.iter().map(|l| l.quantity).sum();
        let total = bid_vol + ask_vol;
        if total == 0.0 {
            0.0
        } else {
            (bid_vol - ask_vol).abs() / total
        }
    }

    /// Walks the matching side of the depth ladder and returns the relative
    /// deviation of the volume-weighted average fill price from the best
    /// price on that side. Returns `1.0` (sentinel for "exhausted") if the
    /// ladder cannot absorb the full quantity.
    pub fn estimate_slippage(&self, side: crate::types::Side, quantity: f64) -> f64 {
        let snap = self.snapshot.read();
        let (levels, best) = match side {
            crate::types::Side::Buy => (&snap.asks, snap.best_ask),
            crate::types::Side::Sell => (&snap.bids, snap.best_bid),
        };
        if best <= 0.0 || quantity <= 0.0 {
            return 0.0;
        }

        let mut remaining = quantity;
        let mut notional = 0.0;
        let mut filled = 0.0;
        for level in levels {
            if remaining <= 0.0 {
                break;
            }
            let take = remaining.min(level.quantity);
            notional += take * level.price;
            filled += take;
            remaining -= take;
        }

        if remaining > 1e-12 {
            return 1.0;
        }
        let vwap = notional / filled;
        (vwap - best).abs() / best
    }

    /// Recent-mid standard deviation over the last `n` price-history
    /// samples, used by the strategy's volatility sub-multiplier.
    pub fn mid_price_stddev(&self, n: usize) -> f64 {
        let history = self.price_history.read();
        let len = history.len();
        if len < 2 {
            return 0.0;
        }
        let take = n.min(len);
        let samples: Vec<f64> = history.iter().rev().take(take).map(|s| s.mid).collect();
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / samples.len() as f64;
        variance.sqrt()
    }

    pub fn symbol(&self) -> String {
        self.snapshot.read().symbol.clone()
    }
}

fn decimal_to_f64(d: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    d.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::events::DepthLevel;
    use rust_decimal_macros::dec;

    fn update(bids: Vec<(f64, f64)>, asks: Vec<(f64, f64)>) -> DepthUpdate {
        DepthUpdate {
            symbol: "BTCUSDT".into(),
            bids: bids
                .into_iter()
                .map(|(p, q)| DepthLevel {
                    price: Decimal::try_from(p).unwrap(),
                    quantity: Decimal::try_from(q).unwrap(),
                })
                .collect(),
            asks: asks
                .into_iter()
                .map(|(p, q)| DepthLevel {
                    price: Decimal::try_from(p).unwrap(),
                    quantity: Decimal::try_from(q).unwrap(),
                })
                .collect(),
            is_snapshot: true,
            sequence: 1,
            exchange_timestamp_ms: 0,
        }
    }

    #[test]
    fn mid_and_bid_lt_ask_invariant_holds() {
        let ingestor = MarketDataIngestor::new("BTCUSDT", 5, 0.01);
        ingestor.handle_depth_update(&update(vec![(100.0, 1.0)], vec![(101.0, 1.0)]));
        assert!(ingestor.best_bid() < ingestor.best_ask());
        assert_eq!(ingestor.mid(), 100.5);
    }

    #[test]
    fn freshness_decays_data_quality_when_stale() {
        let ingestor = MarketDataIngestor::new("BTCUSDT", 5, 0.01);
        ingestor.handle_depth_update(&update(vec![(100.0, 1.0)], vec![(101.0, 1.0)]));
        assert!(ingestor.is_fresh(std::time::Duration::from_secs(60)));
        assert!(!ingestor.is_fresh(std::time::Duration::from_nanos(0)));
    }

    #[test]
    fn estimate_slippage_returns_one_when_exhausted() {
        let ingestor = MarketDataIngestor::new("BTCUSDT", 5, 0.01);
        ingestor.handle_depth_update(&update(vec![(100.0, 1.0)], vec![(101.0, 1.0)]));
        let slip = ingestor.estimate_slippage(crate::types::Side::Buy, 100.0);
        assert_eq!(slip, 1.0);
    }

    #[test]
    fn depth_ratio_handles_one_sided_books() {
        let ingestor = MarketDataIngestor::new("BTCUSDT", 5, 0.01);
        ingestor.handle_depth_update(&update(vec![(100.0, 1.0)], vec![]));
        assert!(ingestor.depth_ratio().is_infinite());
    }
}
