// =============================================================================
// Symbol metadata — immutable once loaded (spec.md §3)
// =============================================================================
//
// Every submitted price must be a non-negative integer multiple of the tick
// size; every quantity a multiple of the step size within [min_qty, max_qty];
// every order's notional (price * quantity) must be >= min_notional.
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Immutable exchange-provided metadata for the single symbol this bot
/// trades. Loaded once at startup via `fetch_symbol_info` and replaced
/// wholesale (never partially mutated) if the bot is ever restarted against
/// a different venue snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_price: Decimal,
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub min_notional: Decimal,
}

impl SymbolInfo {
    /// Round `price` down to the nearest multiple of `tick_size` that is
    /// still >= `min_price`.
    pub fn quantize_price_down(&self, price: Decimal) -> Decimal {
        let q = quantize_down(price, self.tick_size);
        q.max(self.min_price)
    }

    /// Round `price` up to the nearest multiple of `tick_size`.
    pub fn quantize_price_up(&self, price: Decimal) -> Decimal {
        quantize_up(price, self.tick_size).max(self.min_price)
    }

    /// Round `qty` down to the nearest multiple of `step_size`.
    pub fn quantize_qty_down(&self, qty: Decimal) -> Decimal {
        quantize_down(qty, self.step_size)
    }

    /// Round `qty` up to the nearest multiple of `step_size`.
    pub fn quantize_qty_up(&self, qty: Decimal) -> Decimal {
        quantize_up(qty, self.step_size)
    }

    /// `true` iff `price` is a non-negative integer multiple of the tick size.
    pub fn is_valid_price(&self, price: Decimal) -> bool {
        price >= Decimal::ZERO && is_multiple_of(price, self.tick_size)
    }

    /// `true` iff `qty` is a multiple of the step size and within bounds.
    pub fn is_valid_qty(&self, qty: Decimal) -> bool {
        is_multiple_of(qty, self.step_size) && qty >= self.min_qty && qty <= self.max_qty
    }

    /// `true` iff `price * qty >= min_notional`.
    pub fn meets_min_notional(&self, price: Decimal, qty: Decimal) -> bool {
        price * qty >= self.min_notional
    }

    /// Raise `qty` (quantized up to the step size) until the notional
    /// floor is met, per spec.md §4.G quantity rule #5 (ROUND_UP at the
    /// notional boundary).
    pub fn enforce_min_notional(&self, price: Decimal, qty: Decimal) -> Decimal {
        let mut qty = qty.max(self.min_qty);
        if price <= Decimal::ZERO {
            return qty;
        }
        if !self.meets_min_notional(price, qty) {
            let required = self.min_notional / price;
            qty = self.quantize_qty_up(required);
        }
        qty
    }
}

fn quantize_down(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}

fn quantize_up(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).ceil() * step
}

fn is_multiple_of(value: Decimal, step: Decimal) -> bool {
    if step <= Decimal::ZERO {
        return true;
    }
    let ratio = value / step;
    ratio == ratio.round()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn btc_perp() -> SymbolInfo {
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

    #[test]
    fn quantize_price_down_rounds_to_tick() {
        let s = btc_perp();
        assert_eq!(s.quantize_price_down(dec!(50000.37)), dec!(50000.3));
    }

    #[test]
    fn quantize_price_up_rounds_to_tick() {
        let s = btc_perp();
        assert_eq!(s.quantize_price_up(dec!(50000.31)), dec!(50000.4));
    }

    #[test]
    fn valid_price_multiple_of_tick() {
        let s = btc_perp();
        assert!(s.is_valid_price(dec!(50000.1)));
        assert!(!s.is_valid_price(dec!(50000.15)));
    }

    #[test]
    fn valid_qty_bounds_and_step() {
        let s = btc_perp();
        assert!(s.is_valid_qty(dec!(0.01)));
        assert!(!s.is_valid_qty(dec!(0.0001)));
        assert!(!s.is_valid_qty(dec!(0.0105)));
        assert!(!s.is_valid_qty(dec!(200)));
    }

    #[test]
    fn enforce_min_notional_raises_quantity_and_stays_on_step() {
        let s = btc_perp();
        // price 50000, qty 0.0001 -> notional 5 < 10, must raise.
        let raised = s.enforce_min_notional(dec!(50000), dec!(0.0001));
        assert!(s.meets_min_notional(dec!(50000), raised));
        assert!(is_multiple_of(raised, s.step_size));
    }

    #[test]
    fn enforce_min_notional_leaves_sufficient_qty_untouched() {
        let s = btc_perp();
        let qty = dec!(0.01);
        let raised = s.enforce_min_notional(dec!(50000), qty);
        assert_eq!(raised, qty);
    }
}
