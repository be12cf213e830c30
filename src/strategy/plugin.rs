// =============================================================================
// Plug-in hook — read-only world view + pure price/quantity decorators
// =============================================================================
//
// Plug-ins never receive a reference to the strategy itself, avoiding cyclic
// references (spec.md §9). Every hook is assumed pure with respect to time
// and market state; any misbehavior must not corrupt world state.
// =============================================================================

use rust_decimal::Decimal;

use crate::strategy::pricing::QuotePrices;
use crate::types::Side;

/// Read-only snapshot handed to plug-ins. Cloned cheaply per tick; plug-ins
/// cannot mutate anything through it.
#[derive(Debug, Clone)]
pub struct StrategyView {
    pub symbol: String,
    pub mid: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub net_position: Decimal,
    pub health_aggregate: f64,
}

/// A quote hook may replace or decorate the computed quote price and/or
/// quantity before submission. The default implementation is a no-op.
pub trait QuoteHook: Send + Sync {
    /// Optionally override the computed quote prices.
    fn adjust_prices(&self, _view: &StrategyView, prices: QuotePrices) -> QuotePrices {
        prices
    }

    /// Optionally override the computed quote quantity for one side.
    fn adjust_quantity(&self, _view: &StrategyView, _side: Side, quantity: Decimal) -> Decimal {
        quantity
    }
}

/// Holds zero or more registered hooks, applied in registration order.
#[derive(Default)]
pub struct PluginRegistry {
    hooks: Vec<Box<dyn QuoteHook>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn register(&mut self, hook: Box<dyn QuoteHook>) {
        self.hooks.push(hook);
    }

    pub fn apply_prices(&self, view: &StrategyView, mut prices: QuotePrices) -> QuotePrices {
        for hook in &self.hooks {
            prices = hook.adjust_prices(view, prices);
        }
        prices
    }

    pub fn apply_quantity(&self, view: &StrategyView, side: Side, mut quantity: Decimal) -> Decimal {
        for hook in &self.hooks {
            quantity = hook.adjust_quantity(view, side, quantity);
        }
        quantity
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    struct WidenHook;
    impl QuoteHook for WidenHook {
        fn adjust_prices(&self, _view: &StrategyView, prices: QuotePrices) -> QuotePrices {
            QuotePrices {
                bid: prices.bid - dec!(1.0),
                ask: prices.ask + dec!(1.0),
            }
        }
    }

    #[test]
    fn empty_registry_is_identity() {
        let registry = PluginRegistry::new();
        let view = StrategyView {
            symbol: "BTCUSDT".into(),
            mid: 100.0,
            best_bid: 99.9,
            best_ask: 100.1,
            net_position: dec!(0),
            health_aggregate: 1.0,
        };
        let prices = QuotePrices { bid: dec!(99.0), ask: dec!(101.0) };
        let out = registry.apply_prices(&view, prices);
        assert_eq!(out.bid, prices.bid);
        assert_eq!(out.ask, prices.ask);
    }

    #[test]
    fn registered_hook_decorates_prices() {
        let mut registry = PluginRegistry::new();
        registry.register(Box::new(WidenHook));
        let view = StrategyView {
            symbol: "BTCUSDT".into(),
            mid: 100.0,
            best_bid: 99.9,
            best_ask: 100.1,
            net_position: dec!(0),
            health_aggregate: 1.0,
        };
        let prices = QuotePrices { bid: dec!(99.0), ask: dec!(101.0) };
        let out = registry.apply_prices(&view, prices);
        assert_eq!(out.bid, dec!(98.0));
        assert_eq!(out.ask, dec!(102.0));
    }
}
