//! Per-symbol exchange filters: tick size, lot size, minimum notional
//!
//! Filters are fetched from the exchange once and cached; when the fetch
//! fails we fall back to a previously cached set or conservative defaults,
//! and record where the values came from.

use crate::core::types::{Side, Symbol};
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a filter set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterSource {
    Fetched,
    Cached,
    Default,
}

/// Reason a place/amend was refused by pre-trade filter checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterViolation {
    TickSize,
    LotSize,
    MinNotional,
}

impl FilterViolation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TickSize => "tick_size",
            Self::LotSize => "lot_size",
            Self::MinNotional => "min_notional",
        }
    }
}

impl fmt::Display for FilterViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Static trading constraints for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub tick_size: Decimal,
    pub lot_size: Decimal,
    pub min_notional: Decimal,
    pub source: FilterSource,
}

impl SymbolFilters {
    /// Conservative fallback used when the exchange cannot be queried.
    pub fn default_for(_symbol: &Symbol) -> Self {
        Self {
            tick_size: dec!(0.01),
            lot_size: dec!(0.001),
            min_notional: dec!(10),
            source: FilterSource::Default,
        }
    }

    /// Round a price onto the tick grid, biased in our favor: buy prices
    /// round down, sell prices round up.
    pub fn round_price(&self, side: Side, price: Decimal) -> Decimal {
        let ticks = price / self.tick_size;
        let ticks = match side {
            Side::Buy => ticks.floor(),
            Side::Sell => ticks.ceil(),
        };
        ticks * self.tick_size
    }

    /// Round a quantity down onto the lot grid.
    pub fn round_qty(&self, qty: Decimal) -> Decimal {
        (qty / self.lot_size).floor() * self.lot_size
    }

    /// Smallest lot-aligned quantity meeting `min_notional` at `price`.
    pub fn min_qty_for_notional(&self, price: Decimal) -> Option<Decimal> {
        if price <= Decimal::ZERO {
            return None;
        }
        let raw = self.min_notional / price;
        Some((raw / self.lot_size).ceil() * self.lot_size)
    }

    fn on_grid(value: Decimal, step: Decimal) -> bool {
        if step <= Decimal::ZERO {
            return true;
        }
        (value / step).fract().is_zero()
    }

    /// Validate an already-rounded `(price, qty)` pair.
    pub fn validate(&self, price: Decimal, qty: Decimal) -> Result<(), FilterViolation> {
        if !Self::on_grid(price, self.tick_size) {
            return Err(FilterViolation::TickSize);
        }
        if qty <= Decimal::ZERO || !Self::on_grid(qty, self.lot_size) {
            return Err(FilterViolation::LotSize);
        }
        if price * qty < self.min_notional {
            return Err(FilterViolation::MinNotional);
        }
        Ok(())
    }
}

/// Cache of per-symbol filters, shared between pipeline and writer.
#[derive(Default)]
pub struct FilterRegistry {
    inner: DashMap<Symbol, SymbolFilters>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, symbol: Symbol, filters: SymbolFilters) {
        self.inner.insert(symbol, filters);
    }

    /// Filters for `symbol`, falling back to defaults when never fetched.
    pub fn get(&self, symbol: &Symbol) -> SymbolFilters {
        self.inner
            .get(symbol)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| SymbolFilters::default_for(symbol))
    }

    pub fn source(&self, symbol: &Symbol) -> FilterSource {
        self.get(symbol).source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters() -> SymbolFilters {
        SymbolFilters {
            tick_size: dec!(0.01),
            lot_size: dec!(0.001),
            min_notional: dec!(10),
            source: FilterSource::Fetched,
        }
    }

    #[test]
    fn buy_prices_round_down_sell_prices_round_up() {
        let f = filters();
        assert_eq!(f.round_price(Side::Buy, dec!(99.999)), dec!(99.99));
        assert_eq!(f.round_price(Side::Sell, dec!(99.991)), dec!(100.00));
        // Already on grid: unchanged either way.
        assert_eq!(f.round_price(Side::Buy, dec!(100.00)), dec!(100.00));
        assert_eq!(f.round_price(Side::Sell, dec!(100.00)), dec!(100.00));
    }

    #[test]
    fn sizes_round_down() {
        let f = filters();
        assert_eq!(f.round_qty(dec!(0.0019)), dec!(0.001));
        assert_eq!(f.round_qty(dec!(1.2345)), dec!(1.234));
    }

    #[test]
    fn min_qty_for_notional_is_lot_aligned() {
        let f = filters();
        // 10 / 99.99 = 0.100010..., ceil to lot -> 0.101
        let qty = f.min_qty_for_notional(dec!(99.99)).unwrap();
        assert_eq!(qty, dec!(0.101));
        assert!(qty * dec!(99.99) >= f.min_notional);
    }

    #[test]
    fn validate_categorizes_refusals() {
        let f = filters();
        assert_eq!(f.validate(dec!(99.995), dec!(1.0)), Err(FilterViolation::TickSize));
        assert_eq!(f.validate(dec!(99.99), dec!(0.0005)), Err(FilterViolation::LotSize));
        assert_eq!(f.validate(dec!(99.99), dec!(0.001)), Err(FilterViolation::MinNotional));
        assert_eq!(f.validate(dec!(99.99), dec!(1.0)), Ok(()));
    }

    #[test]
    fn registry_falls_back_to_defaults() {
        let reg = FilterRegistry::new();
        let sym = Symbol::from("ETHUSDT");
        assert_eq!(reg.source(&sym), FilterSource::Default);

        reg.insert(sym.clone(), filters());
        assert_eq!(reg.source(&sym), FilterSource::Fetched);
    }
}
