// Literal scenario tests covering the market-making strategy's pricing,
// order-lifecycle, rebalance, and circuit-breaker behavior end to end
// against the public library surface (no live exchange connection).

use aurora_perp_nexus::circuit_breaker::{BreakerThresholds, CircuitBreaker};
use aurora_perp_nexus::exchange::events::{DepthLevel, DepthUpdate};
use aurora_perp_nexus::market_data::MarketDataIngestor;
use aurora_perp_nexus::orders::{OrderLifecycleManager, PositionManager};
use aurora_perp_nexus::strategy::pricing::{
    compute_quote_prices, compute_quote_quantity, effective_spread, spread_multiplier, QuantityInputs,
    VolatilityInputs,
};
use aurora_perp_nexus::symbol::SymbolInfo;
use aurora_perp_nexus::types::{BreakerState, OrderType, Side};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn perp_symbol() -> SymbolInfo {
    SymbolInfo {
        symbol: "BTCUSDT".into(),
        tick_size: dec!(0.1),
        step_size: dec!(0.001),
        min_price: dec!(0.1),
        min_qty: dec!(0.001),
        max_qty: dec!(100),
        min_notional: dec!(10),
    }
}

fn depth_update(bid: (f64, f64), ask: (f64, f64)) -> DepthUpdate {
    DepthUpdate {
        symbol: "BTCUSDT".into(),
        bids: vec![DepthLevel {
            price: Decimal::try_from(bid.0).unwrap(),
            quantity: Decimal::try_from(bid.1).unwrap(),
        }],
        asks: vec![DepthLevel {
            price: Decimal::try_from(ask.0).unwrap(),
            quantity: Decimal::try_from(ask.1).unwrap(),
        }],
        is_snapshot: true,
        sequence: 1,
        exchange_timestamp_ms: 0,
    }
}

/// Scenario 1: basic two-sided quote.
#[test]
fn scenario_basic_two_sided_quote() {
    let symbol = perp_symbol();
    let ingestor = MarketDataIngestor::new(symbol.symbol.clone(), 50, 0.05);
    ingestor.handle_depth_update(&depth_update((50000.0, 10.0), (50001.0, 10.0)));

    let mid = ingestor.mid();
    let mid_dec = Decimal::try_from(mid).unwrap();
    let best_bid = Decimal::try_from(ingestor.best_bid()).unwrap();
    let best_ask = Decimal::try_from(ingestor.best_ask()).unwrap();

    let spread = effective_spread(0.001, 1.0, symbol.tick_size, mid);
    let prices = compute_quote_prices(&symbol, mid_dec, spread, best_bid, best_ask).expect("quote should not suppress");

    assert_eq!(prices.bid, dec!(50000.1));
    assert_eq!(prices.ask, dec!(50000.9));

    let qty_inputs = QuantityInputs {
        configured_quantity: dec!(0.01),
        balance: dec!(10000),
        mid: mid_dec,
        capital_allocation_fraction: dec!(1),
        max_position_fraction: dec!(1),
        adaptive_quantity_enabled: false,
        avg_recent_pnl: dec!(0),
        performance_factor: dec!(1),
        ws_connectivity_score: 1.0,
        recent_api_success: 1.0,
    };
    let buy_qty = compute_quote_quantity(&symbol, Side::Buy, prices.bid, &qty_inputs, |_, _| 0.0, 0.01);
    let sell_qty = compute_quote_quantity(&symbol, Side::Sell, prices.ask, &qty_inputs, |_, _| 0.0, 0.01);
    assert_eq!(buy_qty, dec!(0.01));
    assert_eq!(sell_qty, dec!(0.01));
}

/// Scenario 2: spread widening under volatility.
#[test]
fn scenario_spread_widening_under_volatility() {
    let symbol = perp_symbol();
    let mid = 50000.0;

    let inputs = VolatilityInputs {
        mid_stddev: 2000.0,
        mid,
        book_imbalance: 0.0,
        api_success_fraction: None,
        avg_recent_slippage: 0.0,
    };
    let multiplier = spread_multiplier(&inputs, true);
    assert!((multiplier - 2.0).abs() < 1e-9);

    let spread = effective_spread(0.001, multiplier, symbol.tick_size, mid);
    assert!((spread - 0.002).abs() < 1e-9);

    let mid_dec = dec!(50000);
    let prices = compute_quote_prices(&symbol, mid_dec, spread, dec!(50000.0), dec!(50200.0))
        .expect("quote should not suppress");
    // Target bid (49900.0) is further from mid than best_bid + tick (50000.1),
    // so tightening pulls it in to one tick inside the best bid.
    assert_eq!(prices.bid, dec!(50000.1));
    // Target ask (50100.0) is inside best_ask - tick (50199.9), so it is
    // unaffected by the opposing-side tightening.
    assert_eq!(prices.ask, dec!(50100.0));
}

/// Scenario 3: stale-order reap.
#[test]
fn scenario_stale_order_reap() {
    let manager = OrderLifecycleManager::new(0.01);
    manager.register_new_order("ord-1".into(), "cli-1".into(), Side::Buy, OrderType::Limit, dec!(49990), dec!(0.01), 0);
    assert_eq!(manager.open_count(), 1);

    let order = manager.get("ord-1").unwrap();
    let lifespan_seconds: i64 = 30;
    let now_ms: i64 = 31_000;
    let age_secs = (now_ms - order.created_at_ms) / 1000;
    assert!(age_secs > lifespan_seconds, "order must be past its lifespan");

    manager.mark_canceled_locally("ord-1");
    assert_eq!(manager.open_count(), 0);
}

/// Scenario 4: inventory rebalance.
#[test]
fn scenario_inventory_rebalance() {
    let symbol = perp_symbol();
    let positions = PositionManager::new();
    positions.apply_position_update(&aurora_perp_nexus::exchange::events::PositionUpdate {
        symbol: symbol.symbol.clone(),
        position_idx: 1,
        side: Side::Buy,
        size: dec!(0.003),
        entry_price: dec!(50000),
        unrealized_pnl: dec!(0),
        exchange_timestamp_ms: 0,
    });
    positions.apply_position_update(&aurora_perp_nexus::exchange::events::PositionUpdate {
        symbol: symbol.symbol.clone(),
        position_idx: 2,
        side: Side::Sell,
        size: dec!(0.001),
        entry_price: dec!(50000),
        unrealized_pnl: dec!(0),
        exchange_timestamp_ms: 0,
    });

    let net = positions.net_size();
    assert_eq!(net, dec!(0.002));

    let rebalance_threshold = dec!(0.0001);
    assert!(net.abs() > rebalance_threshold);

    let side = if net > Decimal::ZERO { Side::Sell } else { Side::Buy };
    let quantity = symbol.quantize_qty_down(net.abs());
    assert_eq!(side, Side::Sell);
    assert_eq!(quantity, dec!(0.002));

    positions.with_counters_mut(|c| c.rebalances_executed += 1);
    assert_eq!(positions.counters().rebalances_executed, 1);
}

/// Scenario 5: circuit breaker escalation and recovery.
#[test]
fn scenario_circuit_breaker_escalation_and_recovery() {
    let breaker = CircuitBreaker::new(BreakerThresholds::default());

    let t1 = breaker.evaluate(0.35);
    assert_eq!(t1.to, BreakerState::MajorCancel);
    assert!(t1.entered_major_cancel);
    assert_eq!(breaker.activations(), 1);

    let t2 = breaker.evaluate(0.65);
    assert_eq!(t2.to, BreakerState::Normal);
}

/// Scenario 6: private-stream disconnect and HTTP reconciliation.
#[test]
fn scenario_private_stream_disconnect_and_reconcile() {
    let manager = OrderLifecycleManager::new(0.01);
    manager.register_new_order("ord-9".into(), "cli-9".into(), Side::Sell, OrderType::Limit, dec!(50100), dec!(0.01), 0);
    assert_eq!(manager.open_count(), 1);

    // Private stream is down; HTTP reconciliation reports no open orders.
    manager.reconcile_from_http(&[]);

    assert_eq!(manager.open_count(), 0);
    assert!(manager.get("ord-9").is_none());
}
