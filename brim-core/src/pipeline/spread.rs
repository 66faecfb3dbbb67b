//! Spread stage: compose the quoted spread and produce centered targets
//!
//! `spread_bps` is a bounded weighted sum of four signal scores (volatility,
//! liquidity, latency, PnL deviation) on top of a base spread, clamped to
//! `[min_spread_bps, max_spread_bps]`. Targets are centered on mid and
//! rounded in our favor. A one-sided book produces a single-sided quote with
//! a widened spread and never crosses.

use crate::core::filters::FilterRegistry;
use crate::core::types::{QuoteTarget, Side};
use crate::pipeline::volatility::VolTracker;
use crate::pipeline::{SharedConfig, Stage, StageOutcome, TickContext, TickDeadline};
use crate::risk::signals::SignalHub;
use async_trait::async_trait;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::sync::Arc;

pub struct SpreadStage {
    cfg: SharedConfig,
    filters: Arc<FilterRegistry>,
    vol: Arc<VolTracker>,
    hub: Arc<SignalHub>,
}

impl SpreadStage {
    pub fn new(
        cfg: SharedConfig,
        filters: Arc<FilterRegistry>,
        vol: Arc<VolTracker>,
        hub: Arc<SignalHub>,
    ) -> Self {
        Self { cfg, filters, vol, hub }
    }

    fn compose_spread_bps(&self, cx: &TickContext) -> f64 {
        let cfg = self.cfg.read();
        let s = &cfg.strategy;

        let vol_score = s.k_vol_sensitivity * self.vol.vol_bps(&cx.symbol);

        let top_depth = cx
            .book
            .as_ref()
            .and_then(|b| {
                let bid = b.snapshot.best_bid().map(|l| l.qty);
                let ask = b.snapshot.best_ask().map(|l| l.qty);
                match (bid, ask) {
                    (Some(b), Some(a)) => Some(b.min(a)),
                    (Some(one), None) | (None, Some(one)) => Some(one),
                    (None, None) => None,
                }
            })
            .and_then(|d| d.to_f64())
            .unwrap_or(0.0);
        let reference = s.reference_depth.to_f64().unwrap_or(1.0);
        let liquidity_score = if top_depth > 0.0 {
            s.k_liquidity_sensitivity * (reference / top_depth).min(10.0)
        } else {
            s.k_liquidity_sensitivity * 10.0
        };

        let latency_score = s.k_latency_sensitivity * self.hub.latency_ms();

        let signals = self.hub.collect(0.0, 0.0, 0.0);
        let pnl_score = s.k_pnl_sensitivity * (-signals.pnl_deviation).max(0.0) / 100.0;

        let spread = s.base_spread_bps + vol_score + liquidity_score + latency_score + pnl_score;
        spread.clamp(s.min_spread_bps, s.max_spread_bps)
    }

    fn bps_factor(bps: f64) -> Decimal {
        Decimal::from_f64(bps / 10_000.0).unwrap_or(Decimal::ZERO)
    }

    /// Quote size meeting lot and min-notional filters, or `None` to skip
    /// the side.
    fn sized_qty(
        filters: &crate::core::filters::SymbolFilters,
        configured: Decimal,
        price: Decimal,
    ) -> Option<Decimal> {
        if price <= Decimal::ZERO {
            return None;
        }
        let mut qty = filters.round_qty(configured);
        if qty <= Decimal::ZERO {
            return None;
        }
        if price * qty < filters.min_notional {
            qty = filters.min_qty_for_notional(price)?;
        }
        Some(qty)
    }
}

#[async_trait]
impl Stage for SpreadStage {
    fn name(&self) -> &'static str {
        "spread"
    }

    async fn run(&self, cx: &mut TickContext, _deadline: &TickDeadline) -> StageOutcome {
        let Some(book) = cx.book.as_ref() else {
            return StageOutcome::GuardBlocked;
        };
        let snapshot = book.snapshot.clone();
        let filters = self.filters.get(&cx.symbol);
        let spread_bps = self.compose_spread_bps(cx);
        let (quote_qty, widen_factor) = {
            let cfg = self.cfg.read();
            (cfg.strategy.quote_qty, cfg.strategy.one_sided_widen_factor)
        };
        cx.spread_bps = spread_bps;

        let best_bid = snapshot.best_bid().map(|l| l.price);
        let best_ask = snapshot.best_ask().map(|l| l.price);

        match cx.mid {
            Some(mid) => {
                let half = Self::bps_factor(spread_bps / 2.0);
                let mut bid_price = filters.round_price(Side::Buy, mid * (Decimal::ONE - half));
                let mut ask_price = filters.round_price(Side::Sell, mid * (Decimal::ONE + half));

                // Same-tick collapse would self-cross; widen by one tick.
                if bid_price >= ask_price {
                    ask_price = bid_price + filters.tick_size;
                }
                // Never cross the live book.
                if let Some(ba) = best_ask {
                    if bid_price >= ba {
                        bid_price = ba - filters.tick_size;
                    }
                }
                if let Some(bb) = best_bid {
                    if ask_price <= bb {
                        ask_price = bb + filters.tick_size;
                    }
                }

                cx.bid = Self::sized_qty(&filters, quote_qty, bid_price).map(|qty| QuoteTarget {
                    symbol: cx.symbol.clone(),
                    side: Side::Buy,
                    price: bid_price,
                    qty,
                });
                cx.ask = Self::sized_qty(&filters, quote_qty, ask_price).map(|qty| QuoteTarget {
                    symbol: cx.symbol.clone(),
                    side: Side::Sell,
                    price: ask_price,
                    qty,
                });
            }
            None => {
                // One-sided book: quote only the defined side, wider.
                let widened = Self::bps_factor(spread_bps * widen_factor);
                cx.bid = None;
                cx.ask = None;
                if let Some(bb) = best_bid {
                    let price = filters.round_price(Side::Buy, bb * (Decimal::ONE - widened));
                    cx.bid = Self::sized_qty(&filters, quote_qty, price).map(|qty| QuoteTarget {
                        symbol: cx.symbol.clone(),
                        side: Side::Buy,
                        price,
                        qty,
                    });
                } else if let Some(ba) = best_ask {
                    let price = filters.round_price(Side::Sell, ba * (Decimal::ONE + widened));
                    cx.ask = Self::sized_qty(&filters, quote_qty, price).map(|qty| QuoteTarget {
                        symbol: cx.symbol.clone(),
                        side: Side::Sell,
                        price,
                        qty,
                    });
                }
            }
        }

        StageOutcome::Ok
    }
}
