//! Short-window market statistics: realized volatility and queue absorption
//!
//! Volatility is an EWMA of squared mid returns, reported in basis points.
//! Queue absorption is traded quantity per second over a short rolling
//! window, fed from the trade stream and consumed by the queue-aware stage.

use crate::core::types::Symbol;
use crate::risk::signals::Ema;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// EWMA realized volatility over mid-price returns.
pub struct EwmaVolatility {
    last_price: Option<f64>,
    variance: Ema,
}

impl EwmaVolatility {
    pub fn new(alpha: f64) -> Self {
        Self {
            last_price: None,
            variance: Ema::new(alpha),
        }
    }

    pub fn push(&mut self, price: f64) {
        if price <= 0.0 {
            return;
        }
        if let Some(prev) = self.last_price {
            let ret_bps = (price - prev) / prev * 10_000.0;
            self.variance.push(ret_bps * ret_bps);
        }
        self.last_price = Some(price);
    }

    /// Volatility in bps (sqrt of the return-variance EWMA).
    pub fn vol_bps(&self) -> f64 {
        self.variance.value().sqrt()
    }
}

/// Per-symbol volatility, updated by FetchMD each tick.
#[derive(Default)]
pub struct VolTracker {
    inner: DashMap<Symbol, EwmaVolatility>,
}

impl VolTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_mid(&self, symbol: &Symbol, mid: Decimal) {
        let Some(mid) = mid.to_f64() else { return };
        self.inner
            .entry(symbol.clone())
            .or_insert_with(|| EwmaVolatility::new(0.1))
            .push(mid);
    }

    pub fn vol_bps(&self, symbol: &Symbol) -> f64 {
        self.inner.get(symbol).map(|v| v.vol_bps()).unwrap_or(0.0)
    }

    pub fn max_vol_bps(&self) -> f64 {
        self.inner
            .iter()
            .map(|e| e.vol_bps())
            .fold(0.0, f64::max)
    }
}

/// Rolling traded-quantity-per-second, per symbol.
pub struct QueueTracker {
    window: Duration,
    inner: DashMap<Symbol, Mutex<VecDeque<(Instant, f64)>>>,
}

impl QueueTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: DashMap::new(),
        }
    }

    pub fn record_trade(&self, symbol: &Symbol, qty: Decimal) {
        let Some(qty) = qty.to_f64() else { return };
        let entry = self
            .inner
            .entry(symbol.clone())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut window = entry.lock();
        let now = Instant::now();
        window.push_back((now, qty));
        let cutoff = now - self.window;
        while window.front().map(|(t, _)| *t < cutoff).unwrap_or(false) {
            window.pop_front();
        }
    }

    /// Average traded quantity per second over the window; 0 when no trades
    /// were seen, which consumers must treat as "no estimate".
    pub fn absorption_per_s(&self, symbol: &Symbol) -> f64 {
        let Some(entry) = self.inner.get(symbol) else { return 0.0 };
        let window = entry.lock();
        let total: f64 = window.iter().map(|(_, q)| q).sum();
        total / self.window.as_secs_f64().max(1.0)
    }
}
