//! Guards stage: evaluate operational risk and short-circuit on HARD.

use crate::config::Config;
use crate::exchange::circuit::CircuitGate;
use crate::monitoring::metrics::BrimMetrics;
use crate::pipeline::volatility::VolTracker;
use crate::pipeline::{SharedConfig, Stage, StageOutcome, TickContext, TickDeadline};
use crate::risk::guards::{GuardEngine, GuardLevel};
use crate::risk::signals::SignalHub;
use crate::store::OrderStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;

pub struct GuardStage {
    cfg: SharedConfig,
    guards: Arc<GuardEngine>,
    hub: Arc<SignalHub>,
    store: Arc<OrderStore>,
    vol: Arc<VolTracker>,
    gate: Arc<CircuitGate>,
    metrics: Arc<BrimMetrics>,
    last_level: Mutex<GuardLevel>,
}

impl GuardStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: SharedConfig,
        guards: Arc<GuardEngine>,
        hub: Arc<SignalHub>,
        store: Arc<OrderStore>,
        vol: Arc<VolTracker>,
        gate: Arc<CircuitGate>,
        metrics: Arc<BrimMetrics>,
    ) -> Self {
        Self {
            cfg,
            guards,
            hub,
            store,
            vol,
            gate,
            metrics,
            last_level: Mutex::new(GuardLevel::Ok),
        }
    }

    fn inventory_skew(&self, cfg: &Config, cx: &TickContext) -> f64 {
        let inv = self.store.inventory(&cx.symbol);
        let normalizer = cfg.strategy.inventory_normalizer.to_f64().unwrap_or(1.0);
        if normalizer <= 0.0 {
            return 0.0;
        }
        (inv.position.to_f64().unwrap_or(0.0) / normalizer).abs()
    }
}

#[async_trait]
impl Stage for GuardStage {
    fn name(&self) -> &'static str {
        "guards"
    }

    async fn run(&self, cx: &mut TickContext, _deadline: &TickDeadline) -> StageOutcome {
        if let Some(mid) = cx.mid {
            self.hub.mark(&cx.symbol, mid);
        }

        let skew = {
            let cfg = self.cfg.read();
            self.inventory_skew(&cfg, cx)
        };
        let signals = self.hub.collect(
            skew,
            self.vol.vol_bps(&cx.symbol),
            self.gate.err_rate(),
        );
        let state = self.guards.evaluate(&signals);
        cx.guard_level = state.level;

        self.metrics.guards.level.set(state.level.rank());
        {
            let mut last = self.last_level.lock();
            if *last != state.level {
                self.metrics
                    .guards
                    .transitions_total
                    .with_label_values(&[state.level.as_str()])
                    .inc();
                *last = state.level;
            }
        }

        if state.level == GuardLevel::Hard {
            cx.bid = None;
            cx.ask = None;
            cx.cancel_all_required = true;
            return StageOutcome::GuardBlocked;
        }
        StageOutcome::Ok
    }
}
