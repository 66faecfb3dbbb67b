//! Signal hub: aggregates the live inputs the guard engine evaluates
//!
//! Components push observations here (tick latency, fills, marks, clock
//! drift); `collect` assembles one `GuardSignals` view per evaluation. PnL
//! accounting follows the net convention `net = gross + fees + slippage +
//! inventory` with fees and inventory entering non-positive; the inventory
//! cost term is the `|avg_inv| / avg_notional` proxy.

use crate::core::types::{Fill, Side, Symbol};
use crate::risk::guards::GuardSignals;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Exponential moving average with a fixed smoothing factor.
#[derive(Debug, Clone, Copy)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn push(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            Some(prev) => prev + self.alpha * (sample - prev),
            None => sample,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

#[derive(Default)]
struct BookKeeping {
    position: f64,
    cash: f64,
    last_mid: f64,
    fees: f64,
    notional_traded: f64,
    fill_count: u64,
    abs_inventory_sum: f64,
}

struct PnlState {
    books: HashMap<Symbol, BookKeeping>,
    day_open_equity: f64,
    high_water: f64,
    target_pnl: f64,
}

/// Shared mutable signal state; cheap to lock, written from several tasks.
pub struct SignalHub {
    latency_ms: Mutex<Ema>,
    clock_drift_ms: Mutex<f64>,
    pnl: Mutex<PnlState>,
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalHub {
    pub fn new() -> Self {
        Self {
            latency_ms: Mutex::new(Ema::new(0.2)),
            clock_drift_ms: Mutex::new(0.0),
            pnl: Mutex::new(PnlState {
                books: HashMap::new(),
                day_open_equity: 0.0,
                high_water: 0.0,
                target_pnl: 0.0,
            }),
        }
    }

    pub fn record_tick_latency(&self, ms: f64) {
        self.latency_ms.lock().push(ms);
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency_ms.lock().value()
    }

    pub fn set_clock_drift_ms(&self, drift: f64) {
        *self.clock_drift_ms.lock() = drift.abs();
    }

    pub fn set_target_pnl(&self, target: f64) {
        self.pnl.lock().target_pnl = target;
    }

    pub fn on_fill(&self, fill: &Fill) {
        let mut pnl = self.pnl.lock();
        let book = pnl.books.entry(fill.symbol.clone()).or_default();
        let qty = fill.qty.to_f64().unwrap_or(0.0);
        let price = fill.price.to_f64().unwrap_or(0.0);
        let fee = fill.fee.to_f64().unwrap_or(0.0);
        match fill.side {
            Side::Buy => {
                book.position += qty;
                book.cash -= price * qty;
            }
            Side::Sell => {
                book.position -= qty;
                book.cash += price * qty;
            }
        }
        // Fee costs enter negative; rebates (negative fee) enter positive.
        book.fees -= fee;
        book.notional_traded += price * qty;
        book.fill_count += 1;
        book.abs_inventory_sum += book.position.abs() * price;
    }

    /// Mark a symbol to its current mid so unrealized PnL stays honest.
    pub fn mark(&self, symbol: &Symbol, mid: Decimal) {
        let mut pnl = self.pnl.lock();
        let book = pnl.books.entry(symbol.clone()).or_default();
        book.last_mid = mid.to_f64().unwrap_or(book.last_mid);
        let equity = Self::equity_locked(&pnl);
        if equity > pnl.high_water {
            pnl.high_water = equity;
        }
    }

    fn equity_locked(state: &PnlState) -> f64 {
        state
            .books
            .values()
            .map(|b| b.cash + b.position * b.last_mid + b.fees - Self::inventory_cost(b))
            .sum()
    }

    /// Inventory carry proxy: `|avg_inv| / avg_notional`, scaled by traded
    /// notional. Kept as the source convention; not a true funding model.
    fn inventory_cost(b: &BookKeeping) -> f64 {
        if b.fill_count == 0 || b.notional_traded <= 0.0 {
            return 0.0;
        }
        let avg_inv = b.abs_inventory_sum / b.fill_count as f64;
        let avg_notional = b.notional_traded / b.fill_count as f64;
        if avg_notional <= 0.0 {
            return 0.0;
        }
        (avg_inv / avg_notional).min(1.0) * avg_notional * 0.0001
    }

    pub fn equity(&self) -> f64 {
        Self::equity_locked(&self.pnl.lock())
    }

    /// Start-of-day baseline for the daily-loss guard.
    pub fn roll_day(&self) {
        let mut pnl = self.pnl.lock();
        let equity = Self::equity_locked(&pnl);
        pnl.day_open_equity = equity;
        pnl.high_water = equity;
    }

    /// Assemble the guard inputs from everything observed so far.
    pub fn collect(
        &self,
        inventory_skew: f64,
        realized_vol_bps: f64,
        err_rate: f64,
    ) -> GuardSignals {
        let pnl = self.pnl.lock();
        let equity = Self::equity_locked(&pnl);
        let drawdown = if pnl.high_water > 0.0 {
            ((pnl.high_water - equity) / pnl.high_water).max(0.0)
        } else {
            0.0
        };
        let daily_loss = (pnl.day_open_equity - equity).max(0.0);
        let pnl_deviation = equity - pnl.target_pnl;

        GuardSignals {
            inventory_skew,
            realized_vol_bps,
            latency_p95_ms: self.latency_ms.lock().value(),
            err_rate,
            drawdown,
            daily_loss,
            pnl_deviation,
            clock_drift_ms: *self.clock_drift_ms.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ClientOrderId;
    use rust_decimal_macros::dec;

    fn fill(side: Side, price: Decimal, qty: Decimal) -> Fill {
        Fill {
            client_order_id: ClientOrderId::from("a"),
            symbol: Symbol::from("X"),
            side,
            price,
            qty,
            fee: Decimal::ZERO,
            exchange_event_seq: 1,
            ts: 0,
        }
    }

    #[test]
    fn ema_converges_toward_samples() {
        let mut ema = Ema::new(0.5);
        ema.push(100.0);
        ema.push(0.0);
        approx::assert_relative_eq!(ema.value(), 50.0);
    }

    #[test]
    fn round_trip_profit_shows_in_equity() {
        let hub = SignalHub::new();
        let sym = Symbol::from("X");
        hub.on_fill(&fill(Side::Buy, dec!(100), dec!(1)));
        hub.on_fill(&fill(Side::Sell, dec!(101), dec!(1)));
        hub.mark(&sym, dec!(101));
        assert!(hub.equity() > 0.9, "equity {}", hub.equity());
    }

    #[test]
    fn daily_loss_tracks_day_open() {
        let hub = SignalHub::new();
        let sym = Symbol::from("X");
        hub.roll_day();
        hub.on_fill(&fill(Side::Buy, dec!(100), dec!(1)));
        hub.mark(&sym, dec!(90)); // mark down: ~10 under water
        let signals = hub.collect(0.0, 0.0, 0.0);
        assert!(signals.daily_loss > 9.0, "daily_loss {}", signals.daily_loss);
    }

    #[test]
    fn latency_ema_feeds_signals() {
        let hub = SignalHub::new();
        hub.record_tick_latency(100.0);
        hub.record_tick_latency(100.0);
        let signals = hub.collect(0.0, 0.0, 0.0);
        assert!(signals.latency_p95_ms > 99.0);
    }
}
