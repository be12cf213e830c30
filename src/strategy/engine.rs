// =============================================================================
// Strategy Engine — the tick loop and PnL-stop monitor (spec.md §4.G)
// =============================================================================
//
// Each tick runs, in order: stale-order reaping, inventory rebalance, and
// new-quote placement. Every step returns through the caller rather than
// raising: a rejected order or a suppressed quote is ordinary tick output,
// not an exceptional condition. The PnL-stop monitor runs as a separate task
// on its own interval and can escalate the circuit breaker directly when a
// closing order fails to submit.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Timelike, Utc};
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::BotConfig;
use crate::exchange::auth::Credentials;
use crate::exchange::client::{hedge_position_idx, ExchangeClient, NewOrder};
use crate::exchange::rate_limit::AdaptiveRateLimiter;
use crate::health::{component, HealthScorer};
use crate::journal::{JournalEventType, JournalRecord, TradeJournal};
use crate::market_data::MarketDataIngestor;
use crate::notify::{fire_and_forget, Notifier};
use crate::orders::{OrderLifecycleManager, PositionManager};
use crate::strategy::plugin::{PluginRegistry, QuoteHook, StrategyView};
use crate::strategy::pricing::{
    compute_quote_prices, compute_quote_quantity, effective_spread, spread_multiplier, QuantityInputs,
    VolatilityInputs,
};
use crate::symbol::SymbolInfo;
use crate::types::{BreakerState, OrderType, PositionMode, Severity, Side};

/// How many recent mid-price samples feed the volatility sub-multiplier
/// (spec.md §4.G / §8 scenario 2: "20 mid-price samples").
const VOLATILITY_SAMPLE_WINDOW: usize = 20;
/// Minimum time between two rebalancing closes, to avoid thrashing in and
/// out of a threshold on noisy position updates (spec.md §4.G).
const REBALANCE_COOLDOWN: Duration = Duration::from_secs(30);
/// Pause inserted between the best-effort cancel-all and the rebalancing
/// close, giving in-flight fills a chance to land first.
const REBALANCE_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// What a single tick actually did, for the caller to log or ignore. Nothing
/// here is an error path — a gated or suppressed tick is a normal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Quotes were attempted; records which side(s) were actually placed.
    Quoted { buy_placed: bool, sell_placed: bool },
    /// No quotes were attempted because the breaker does not allow new
    /// quotes at its current severity.
    BreakerGated(BreakerState),
    /// No quotes were attempted because trading hours exclude this UTC hour.
    OutsideTradingHours,
    /// Market data was not fresh enough / mid was not available.
    NoValidQuote,
}

/// Owns everything the tick loop touches. Constructed once by the
/// coordinator and shared behind an `Arc`.
pub struct StrategyEngine {
    config: Arc<RwLock<BotConfig>>,
    symbol_info: SymbolInfo,
    client: Arc<ExchangeClient>,
    limiter: Arc<AdaptiveRateLimiter>,
    market_data: Arc<MarketDataIngestor>,
    orders: Arc<OrderLifecycleManager>,
    positions: Arc<PositionManager>,
    health: Arc<HealthScorer>,
    breaker: Arc<CircuitBreaker>,
    journal: Arc<TradeJournal>,
    notifier: Arc<dyn Notifier>,
    plugins: RwLock<PluginRegistry>,
    position_mode: PositionMode,
    last_rebalance: RwLock<Option<Instant>>,
    tick_count: AtomicU64,
}

impl StrategyEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RwLock<BotConfig>>,
        symbol_info: SymbolInfo,
        client: Arc<ExchangeClient>,
        limiter: Arc<AdaptiveRateLimiter>,
        market_data: Arc<MarketDataIngestor>,
        orders: Arc<OrderLifecycleManager>,
        positions: Arc<PositionManager>,
        health: Arc<HealthScorer>,
        breaker: Arc<CircuitBreaker>,
        journal: Arc<TradeJournal>,
        notifier: Arc<dyn Notifier>,
        position_mode: PositionMode,
    ) -> Self {
        Self {
            config,
            symbol_info,
            client,
            limiter,
            market_data,
            orders,
            positions,
            health,
            breaker,
            journal,
            notifier,
            plugins: RwLock::new(PluginRegistry::new()),
            position_mode,
            last_rebalance: RwLock::new(None),
            tick_count: AtomicU64::new(0),
        }
    }

    pub fn register_plugin(&self, hook: Box<dyn QuoteHook>) {
        self.plugins.write().register(hook);
    }

    fn config_snapshot(&self) -> BotConfig {
        self.config.read().clone()
    }

    /// Runs one full tick: reap stale orders, rebalance inventory if needed,
    /// then attempt new-quote placement. Never panics on a gated/suppressed
    /// outcome — those are ordinary results, not errors.
    #[instrument(skip(self), name = "strategy::tick")]
    pub async fn tick(&self) -> TickOutcome {
        let cfg = self.config_snapshot();
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        self.health.set_named(component::BOT_STATE, 1.0, "running");

        let reaped = self.reap_stale_orders(&cfg).await;
        if reaped > 0 {
            info!(reaped, "reaped stale orders");
        }

        if self.maybe_rebalance(&cfg).await {
            info!("inventory rebalance submitted");
        }

        self.place_quotes(&cfg).await
    }

    // -------------------------------------------------------------------------
    // Stale-order reaping
    // -------------------------------------------------------------------------

    async fn reap_stale_orders(&self, cfg: &BotConfig) -> usize {
        let now_ms = Credentials::now_ms() as i64;
        let mid = self.market_data.mid();
        let mut reaped = 0usize;

        for order in self.orders.open_orders() {
            let age_secs = (now_ms - order.created_at_ms).max(0) / 1000;
            let price_f = order.price.to_f64().unwrap_or(0.0);
            let deviates = mid > 0.0 && price_f > 0.0 && ((price_f - mid).abs() / mid) > cfg.price_threshold_fraction;
            let expired = age_secs as u64 > cfg.order_lifespan_seconds;

            if !expired && !deviates {
                continue;
            }

            match self.client.cancel_order(&cfg.symbol, &order.order_id).await {
                Ok(()) => {
                    self.orders.mark_canceled_locally(&order.order_id);
                    self.positions.with_counters_mut(|c| c.orders_canceled += 1);
                    reaped += 1;
                }
                Err(e) => {
                    warn!(order_id = %order.order_id, error = %e, "stale-order cancel failed, will retry via reconciliation");
                }
            }
        }
        reaped
    }

    // -------------------------------------------------------------------------
    // Inventory rebalance
    // -------------------------------------------------------------------------

    async fn maybe_rebalance(&self, cfg: &BotConfig) -> bool {
        let net = self.positions.net_size();
        if net.abs() <= cfg.rebalance_threshold {
            return false;
        }

        {
            let last = *self.last_rebalance.read();
            if let Some(at) = last {
                if at.elapsed() < REBALANCE_COOLDOWN {
                    return false;
                }
            }
        }

        let side = if net > Decimal::ZERO { Side::Sell } else { Side::Buy };
        let quantity = self.symbol_info.quantize_qty_down(net.abs());
        if quantity <= Decimal::ZERO {
            return false;
        }

        self.client.cancel_all_orders(&cfg.symbol).await.ok();
        tokio::time::sleep(REBALANCE_SETTLE_DELAY).await;

        let price = match cfg.rebalance_order_type {
            OrderType::Market => None,
            OrderType::Limit => {
                let best = match side {
                    Side::Buy => self.market_data.best_ask(),
                    Side::Sell => self.market_data.best_bid(),
                };
                Decimal::try_from(best * (1.0 + cfg.rebalance_offset)).ok()
            }
        };

        let order = NewOrder {
            symbol: cfg.symbol.clone(),
            side,
            order_type: cfg.rebalance_order_type,
            quantity,
            price,
            client_order_id: Uuid::new_v4().to_string(),
            position_idx: hedge_position_idx(side, self.position_mode),
        };

        match self.client.place_order(&order).await {
            Ok(ack) => {
                *self.last_rebalance.write() = Some(Instant::now());
                self.positions.with_counters_mut(|c| c.rebalances_executed += 1);
                self.journal_record(
                    ack.order_id,
                    Some(ack.client_order_id),
                    side,
                    price.unwrap_or_default(),
                    quantity,
                    0.0,
                    JournalEventType::Placed,
                );
                true
            }
            Err(e) => {
                warn!(error = %e, net_size = %net, "inventory rebalance order failed");
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // New-quote placement
    // -------------------------------------------------------------------------

    async fn place_quotes(&self, cfg: &BotConfig) -> TickOutcome {
        if !self.breaker.allows_new_quotes() {
            return TickOutcome::BreakerGated(self.breaker.state());
        }

        if cfg.trading_hours.enabled && !within_trading_hours(&cfg.trading_hours) {
            return TickOutcome::OutsideTradingHours;
        }

        let mid = self.market_data.mid();
        if mid <= 0.0 || !self.market_data.is_fresh(Duration::from_secs(cfg.circuit_breaker.stale_data_timeout_secs)) {
            return TickOutcome::NoValidQuote;
        }

        let best_bid = self.market_data.best_bid();
        let best_ask = self.market_data.best_ask();
        let mid_dec = match Decimal::try_from(mid) {
            Ok(d) => d,
            Err(_) => return TickOutcome::NoValidQuote,
        };
        let best_bid_dec = Decimal::try_from(best_bid).unwrap_or(Decimal::ZERO);
        let best_ask_dec = Decimal::try_from(best_ask).unwrap_or(Decimal::ZERO);

        let vol_inputs = VolatilityInputs {
            mid_stddev: self.market_data.mid_price_stddev(VOLATILITY_SAMPLE_WINDOW),
            mid,
            book_imbalance: self.market_data.book_imbalance(),
            api_success_fraction: self.limiter.success_fraction(),
            avg_recent_slippage: self.orders.avg_recent_slippage(),
        };
        let multiplier = spread_multiplier(&vol_inputs, cfg.volatility_adjustment_enabled);
        let spread = effective_spread(cfg.base_spread_fraction, multiplier, self.symbol_info.tick_size, mid);

        let Some(prices) = compute_quote_prices(&self.symbol_info, mid_dec, spread, best_bid_dec, best_ask_dec) else {
            return TickOutcome::NoValidQuote;
        };

        let view = StrategyView {
            symbol: cfg.symbol.clone(),
            mid,
            best_bid,
            best_ask,
            net_position: self.positions.net_size(),
            health_aggregate: self.health.aggregate(),
        };
        let prices = self.plugins.read().apply_prices(&view, prices);

        let wallet = self.positions.wallet();
        let unrealized_pnl: Decimal = self.positions.all().iter().map(|p| p.unrealized_pnl).sum();
        let ws_connectivity_score = self.health.get(component::WEBSOCKET_CONNECTIVITY).unwrap_or(1.0);
        let recent_api_success = self.limiter.success_fraction().unwrap_or(1.0);

        let mut buy_placed = false;
        let mut sell_placed = false;

        if self.should_quote_side(cfg, Side::Buy) {
            let qty_inputs = QuantityInputs {
                configured_quantity: cfg.base_quantity,
                balance: wallet.available_balance,
                mid: mid_dec,
                capital_allocation_fraction: cfg.capital_allocation_fraction,
                max_position_fraction: cfg.max_position_fraction,
                adaptive_quantity_enabled: cfg.adaptive_quantity_enabled,
                avg_recent_pnl: unrealized_pnl,
                performance_factor: cfg.performance_factor,
                ws_connectivity_score,
                recent_api_success,
            };
            let mut qty = compute_quote_quantity(
                &self.symbol_info,
                Side::Buy,
                prices.bid,
                &qty_inputs,
                |s, q| self.market_data.estimate_slippage(s, q),
                cfg.max_slippage_fraction,
            );
            qty = self.plugins.read().apply_quantity(&view, Side::Buy, qty);
            buy_placed = self.submit_quote(cfg, Side::Buy, prices.bid, qty).await;
        }

        if self.should_quote_side(cfg, Side::Sell) {
            let qty_inputs = QuantityInputs {
                configured_quantity: cfg.base_quantity,
                balance: wallet.available_balance,
                mid: mid_dec,
                capital_allocation_fraction: cfg.capital_allocation_fraction,
                max_position_fraction: cfg.max_position_fraction,
                adaptive_quantity_enabled: cfg.adaptive_quantity_enabled,
                avg_recent_pnl: unrealized_pnl,
                performance_factor: cfg.performance_factor,
                ws_connectivity_score,
                recent_api_success,
            };
            let mut qty = compute_quote_quantity(
                &self.symbol_info,
                Side::Sell,
                prices.ask,
                &qty_inputs,
                |s, q| self.market_data.estimate_slippage(s, q),
                cfg.max_slippage_fraction,
            );
            qty = self.plugins.read().apply_quantity(&view, Side::Sell, qty);
            sell_placed = self.submit_quote(cfg, Side::Sell, prices.ask, qty).await;
        }

        TickOutcome::Quoted { buy_placed, sell_placed }
    }

    fn should_quote_side(&self, cfg: &BotConfig, side: Side) -> bool {
        !self.orders.has_open_order(side) && (self.orders.open_count() as u32) < cfg.max_open_orders
    }

    async fn submit_quote(&self, cfg: &BotConfig, side: Side, price: Decimal, quantity: Decimal) -> bool {
        if quantity <= Decimal::ZERO {
            return false;
        }
        let client_order_id = Uuid::new_v4().to_string();
        let order = NewOrder {
            symbol: cfg.symbol.clone(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            client_order_id: client_order_id.clone(),
            position_idx: hedge_position_idx(side, self.position_mode),
        };

        match self.client.place_order(&order).await {
            Ok(ack) => {
                let now_ms = Credentials::now_ms() as i64;
                self.orders.register_new_order(
                    ack.order_id.clone(),
                    ack.client_order_id.clone(),
                    side,
                    OrderType::Limit,
                    price,
                    quantity,
                    now_ms,
                );
                self.positions.with_counters_mut(|c| c.orders_placed += 1);
                self.journal_record(ack.order_id, Some(ack.client_order_id), side, price, quantity, 0.0, JournalEventType::Placed);
                true
            }
            Err(e) => {
                self.positions.with_counters_mut(|c| c.orders_rejected += 1);
                warn!(side = %side, error = %e, "quote placement rejected");
                fire_and_forget(self.notifier.clone(), format!("order rejected ({side}): {e}"), Severity::Warning);
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn journal_record(
        &self,
        order_id: String,
        client_order_id: Option<String>,
        side: Side,
        price: Decimal,
        quantity: Decimal,
        realized_slippage_fraction: f64,
        event_type: JournalEventType,
    ) {
        let (monotonic_ns, wall_clock_ms) = self.journal.stamp();
        let record = JournalRecord {
            monotonic_ns,
            wall_clock_ms,
            order_id,
            client_order_id,
            symbol: self.symbol_info.symbol.clone(),
            side,
            fill_price: price,
            fill_quantity: quantity,
            realized_slippage_fraction,
            latency_ms: self.client.average_latency_ms().unwrap_or(0.0) as u64,
            event_type,
        };
        if let Err(e) = self.journal.append(&record) {
            warn!(error = %e, "failed to append trade journal record");
        }
    }

    // -------------------------------------------------------------------------
    // PnL-stop monitor (spec.md §4.G, §9 resolved PnL-percentage definition)
    // -------------------------------------------------------------------------

    /// Polls open positions on `pnl_monitor_interval_seconds` and force-closes
    /// any position that has crossed its stop-loss or profit-take fraction.
    /// A failed closing-order submission escalates the circuit breaker
    /// straight to `MajorCancel` rather than leaving the position unguarded.
    pub async fn run_pnl_monitor(self: Arc<Self>, shutdown: Arc<std::sync::atomic::AtomicBool>) {
        loop {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            let cfg = self.config_snapshot();
            if !cfg.circuit_breaker.trigger_pnl_stop {
                tokio::time::sleep(Duration::from_secs(cfg.pnl_monitor_interval_seconds.max(1))).await;
                continue;
            }

            let mid = self.market_data.mid();
            if mid > 0.0 {
                for position in self.positions.all() {
                    let entry = position.entry_price.to_f64().unwrap_or(0.0);
                    if entry <= 0.0 {
                        continue;
                    }
                    let pnl_fraction = match position.side {
                        Side::Buy => (mid - entry) / entry,
                        Side::Sell => (entry - mid) / entry,
                    };

                    let breached = pnl_fraction <= -cfg.stop_loss_fraction || pnl_fraction >= cfg.profit_take_fraction;
                    if !breached {
                        continue;
                    }

                    self.close_position_on_pnl_stop(&cfg, position.side, position.size, pnl_fraction).await;
                }
            }

            tokio::time::sleep(Duration::from_secs(cfg.pnl_monitor_interval_seconds.max(1))).await;
        }
    }

    async fn close_position_on_pnl_stop(&self, cfg: &BotConfig, position_side: Side, size: Decimal, pnl_fraction: f64) {
        warn!(side = %position_side, pnl_fraction, "pnl stop triggered, closing position");
        fire_and_forget(
            self.notifier.clone(),
            format!("pnl stop triggered on {position_side}: {pnl_fraction:.4}"),
            Severity::Warning,
        );

        self.client.cancel_all_orders(&cfg.symbol).await.ok();

        let closing_side = position_side.opposite();
        let order = NewOrder {
            symbol: cfg.symbol.clone(),
            side: closing_side,
            order_type: OrderType::Market,
            quantity: size,
            price: None,
            client_order_id: Uuid::new_v4().to_string(),
            position_idx: hedge_position_idx(position_side, self.position_mode),
        };

        match self.client.place_order(&order).await {
            Ok(ack) => {
                self.journal_record(
                    ack.order_id,
                    Some(ack.client_order_id),
                    closing_side,
                    Decimal::ZERO,
                    size,
                    pnl_fraction,
                    JournalEventType::Placed,
                );
            }
            Err(e) => {
                warn!(error = %e, "pnl-stop closing order failed to submit");
                self.breaker.force_major_cancel("pnl-stop closing order submission failed");
                fire_and_forget(
                    self.notifier.clone(),
                    format!("pnl stop close failed, breaker escalated: {e}"),
                    Severity::Critical,
                );
            }
        }
    }
}

/// `true` if the current UTC hour falls within `[start, end]`, wrapping
/// across midnight when `start > end` (e.g. 22..=6).
fn within_trading_hours(hours: &crate::config::TradingHoursConfig) -> bool {
    hour_in_range(Utc::now().hour() as u8, hours.start_hour_utc, hours.end_hour_utc)
}

/// Pure predicate behind [`within_trading_hours`], split out so the
/// wraparound logic can be tested without a clock seam.
fn hour_in_range(hour: u8, start: u8, end: u8) -> bool {
    if start <= end {
        hour >= start && hour <= end
    } else {
        hour >= start || hour <= end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_range_excludes_hours_outside_window() {
        assert!(hour_in_range(9, 9, 17));
        assert!(hour_in_range(17, 9, 17));
        assert!(hour_in_range(13, 9, 17));
        assert!(!hour_in_range(8, 9, 17));
        assert!(!hour_in_range(18, 9, 17));
    }

    #[test]
    fn wrap_around_range_spans_midnight() {
        assert!(hour_in_range(23, 22, 6));
        assert!(hour_in_range(0, 22, 6));
        assert!(hour_in_range(6, 22, 6));
        assert!(!hour_in_range(12, 22, 6));
    }
}
