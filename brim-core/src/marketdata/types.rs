//! Book snapshot types and cache access modes.

use crate::core::types::Symbol;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One price level of depth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: Decimal,
    pub qty: Decimal,
}

/// Per-symbol view of the book at a moment in time.
///
/// `ts_recv` is when the feed produced the event; `ts_cached` is set by the
/// cache when the snapshot is stored. Staleness is measured against
/// `ts_cached`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub symbol: Symbol,
    /// Best-first bid levels.
    pub bids: Vec<DepthLevel>,
    /// Best-first ask levels.
    pub asks: Vec<DepthLevel>,
    pub seq: u64,
    pub ts_recv: u64,
    pub ts_cached: u64,
}

impl BookSnapshot {
    pub fn best_bid(&self) -> Option<DepthLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<DepthLevel> {
        self.asks.first().copied()
    }

    /// Midpoint of best bid and ask; `None` when the book is one-sided.
    pub fn mid(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b.price + a.price) / Decimal::TWO),
            _ => None,
        }
    }

    /// Resting quantity ahead of `price` on `side`, i.e. at levels with
    /// equal or better priority.
    pub fn depth_ahead(&self, side: crate::core::types::Side, price: Decimal) -> Decimal {
        use crate::core::types::Side;
        let levels = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        levels
            .iter()
            .filter(|l| match side {
                Side::Buy => l.price >= price,
                Side::Sell => l.price <= price,
            })
            .map(|l| l.qty)
            .sum()
    }
}

/// How fresh a snapshot the caller needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Block (bounded) for a synchronous refresh when stale.
    FreshOnly,
    /// Accept snapshots younger than `fresh_ms_for_pricing`.
    FreshForPricing,
    /// Take whatever is cached; refresh happens in the background.
    StaleOk,
}

/// How the cache satisfied a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheHit {
    FreshHit,
    StaleHit,
    MissRefresh,
}

impl CacheHit {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FreshHit => "fresh_hit",
            Self::StaleHit => "stale_hit",
            Self::MissRefresh => "miss_refresh",
        }
    }
}

/// A snapshot handed to a consumer, tagged with its freshness.
#[derive(Debug, Clone)]
pub struct CacheResult {
    pub snapshot: BookSnapshot,
    pub age_ms: u64,
    pub hit: CacheHit,
    pub used_stale: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Side;
    use rust_decimal_macros::dec;

    fn book() -> BookSnapshot {
        BookSnapshot {
            symbol: Symbol::from("X"),
            bids: vec![
                DepthLevel { price: dec!(99.99), qty: dec!(2) },
                DepthLevel { price: dec!(99.98), qty: dec!(5) },
            ],
            asks: vec![
                DepthLevel { price: dec!(100.01), qty: dec!(3) },
                DepthLevel { price: dec!(100.02), qty: dec!(4) },
            ],
            seq: 7,
            ts_recv: 0,
            ts_cached: 0,
        }
    }

    #[test]
    fn mid_requires_both_sides() {
        let mut b = book();
        assert_eq!(b.mid(), Some(dec!(100.00)));
        b.asks.clear();
        assert_eq!(b.mid(), None);
    }

    #[test]
    fn depth_ahead_counts_equal_or_better_levels() {
        let b = book();
        assert_eq!(b.depth_ahead(Side::Buy, dec!(99.99)), dec!(2));
        assert_eq!(b.depth_ahead(Side::Buy, dec!(99.98)), dec!(7));
        assert_eq!(b.depth_ahead(Side::Sell, dec!(100.02)), dec!(7));
    }
}
