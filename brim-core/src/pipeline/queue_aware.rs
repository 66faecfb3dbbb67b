//! Queue-aware stage
//!
//! Estimates our queue position at the target price from visible depth and
//! the short-window absorption rate; when the fill ETA is statistically
//! unfavorable, the price is improved by one tick. The nudge is bounded to
//! one tick per tick cycle and never crosses the pair or the book.

use crate::core::filters::FilterRegistry;
use crate::pipeline::volatility::QueueTracker;
use crate::pipeline::{SharedConfig, Stage, StageOutcome, TickContext, TickDeadline};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::Arc;

pub struct QueueAwareStage {
    cfg: SharedConfig,
    tracker: Arc<QueueTracker>,
    filters: Arc<FilterRegistry>,
}

impl QueueAwareStage {
    pub fn new(cfg: SharedConfig, tracker: Arc<QueueTracker>, filters: Arc<FilterRegistry>) -> Self {
        Self { cfg, tracker, filters }
    }

    fn eta_s(queue_ahead: Decimal, absorption_per_s: f64) -> Option<f64> {
        if absorption_per_s <= 0.0 {
            return None; // no estimate without observed flow
        }
        Some(queue_ahead.to_f64().unwrap_or(0.0) / absorption_per_s)
    }
}

#[async_trait]
impl Stage for QueueAwareStage {
    fn name(&self) -> &'static str {
        "queue_aware"
    }

    async fn run(&self, cx: &mut TickContext, _deadline: &TickDeadline) -> StageOutcome {
        let Some(book) = cx.book.as_ref().map(|b| b.snapshot.clone()) else {
            return StageOutcome::Ok;
        };
        let eta_max_s = self.cfg.read().strategy.queue_eta_max_s;
        let filters = self.filters.get(&cx.symbol);
        let tick = filters.tick_size;
        let absorption = self.tracker.absorption_per_s(&cx.symbol);

        let best_ask = book.best_ask().map(|l| l.price);
        let best_bid = book.best_bid().map(|l| l.price);
        let ask_price = cx.ask.as_ref().map(|a| a.price);
        let bid_price = cx.bid.as_ref().map(|b| b.price);

        if let Some(bid) = cx.bid.as_mut() {
            let queue_ahead = book.depth_ahead(bid.side, bid.price);
            if let Some(eta) = Self::eta_s(queue_ahead, absorption) {
                if eta > eta_max_s {
                    let nudged = bid.price + tick;
                    let crosses_pair = ask_price.map(|a| nudged >= a).unwrap_or(false);
                    let crosses_book = best_ask.map(|a| nudged >= a).unwrap_or(false);
                    if !crosses_pair && !crosses_book {
                        bid.price = nudged;
                    }
                }
            }
        }

        if let Some(ask) = cx.ask.as_mut() {
            let queue_ahead = book.depth_ahead(ask.side, ask.price);
            if let Some(eta) = Self::eta_s(queue_ahead, absorption) {
                if eta > eta_max_s {
                    let nudged = ask.price - tick;
                    let crosses_pair = bid_price.map(|b| nudged <= b).unwrap_or(false);
                    let crosses_book = best_bid.map(|b| nudged <= b).unwrap_or(false);
                    if !crosses_pair && !crosses_book {
                        ask.price = nudged;
                    }
                }
            }
        }

        StageOutcome::Ok
    }
}
