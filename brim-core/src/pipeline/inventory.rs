//! Inventory skew stage
//!
//! Shifts the quote pair to bias rebalancing: for normalized signed
//! inventory `I`, shift `clamp(k_inv * I, +-max_skew_bps)` basis points.
//! Long inventory pushes both quotes down (sell faster, buy slower); short
//! pushes both up. A pure shift keeps the pair width, so one side is never
//! widened without narrowing the other.

use crate::core::filters::FilterRegistry;
use crate::core::types::Side;
use crate::pipeline::{SharedConfig, Stage, StageOutcome, TickContext, TickDeadline};
use crate::store::OrderStore;
use async_trait::async_trait;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::sync::Arc;

pub struct InventoryStage {
    cfg: SharedConfig,
    store: Arc<OrderStore>,
    filters: Arc<FilterRegistry>,
}

impl InventoryStage {
    pub fn new(cfg: SharedConfig, store: Arc<OrderStore>, filters: Arc<FilterRegistry>) -> Self {
        Self { cfg, store, filters }
    }
}

#[async_trait]
impl Stage for InventoryStage {
    fn name(&self) -> &'static str {
        "inventory"
    }

    async fn run(&self, cx: &mut TickContext, _deadline: &TickDeadline) -> StageOutcome {
        let (k_inv, max_skew_bps, normalizer) = {
            let cfg = self.cfg.read();
            (
                cfg.strategy.k_inv,
                cfg.strategy.max_skew_bps,
                cfg.strategy.inventory_normalizer,
            )
        };

        let position = self.store.inventory(&cx.symbol).position;
        if position == Decimal::ZERO {
            return StageOutcome::Ok;
        }
        let normalizer = normalizer.to_f64().unwrap_or(1.0);
        if normalizer <= 0.0 {
            return StageOutcome::Ok;
        }
        let normalized = position.to_f64().unwrap_or(0.0) / normalizer;
        let skew_bps = (k_inv * normalized).clamp(-max_skew_bps, max_skew_bps);
        let filters = self.filters.get(&cx.symbol);

        // Long (skew > 0): shift both prices down. Short: both up.
        if skew_bps != 0.0 {
            let factor = Decimal::ONE
                - Decimal::from_f64(skew_bps / 10_000.0).unwrap_or(Decimal::ZERO);
            if let Some(bid) = cx.bid.as_mut() {
                bid.price = filters.round_price(Side::Buy, bid.price * factor);
            }
            if let Some(ask) = cx.ask.as_mut() {
                ask.price = filters.round_price(Side::Sell, ask.price * factor);
            }
        }

        // Shrink the exposure-increasing side by the inventory already held;
        // a side that cannot meet the filters anymore is dropped.
        if position > Decimal::ZERO {
            if let Some(bid) = cx.bid.as_mut() {
                bid.qty = filters.round_qty((bid.qty - position).max(Decimal::ZERO));
            }
            if cx
                .bid
                .as_ref()
                .map(|b| filters.validate(b.price, b.qty).is_err())
                .unwrap_or(false)
            {
                cx.bid = None;
            }
        } else {
            if let Some(ask) = cx.ask.as_mut() {
                ask.qty = filters.round_qty((ask.qty - position.abs()).max(Decimal::ZERO));
            }
            if cx
                .ask
                .as_ref()
                .map(|a| filters.validate(a.price, a.qty).is_err())
                .unwrap_or(false)
            {
                cx.ask = None;
            }
        }
        // Rounding in opposite directions cannot collapse the pair, but a
        // large shift could; keep the invariant explicit.
        if let (Some(bid), Some(ask)) = (cx.bid.as_ref(), cx.ask.as_ref()) {
            if bid.price >= ask.price {
                let tick = filters.tick_size;
                if let Some(ask) = cx.ask.as_mut() {
                    ask.price = ask.price + tick;
                }
            }
        }

        StageOutcome::Ok
    }
}
