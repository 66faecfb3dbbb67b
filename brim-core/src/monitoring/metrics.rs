//! Prometheus metrics for the trading core
//!
//! One registry per application object; tests build their own so nothing is
//! global. Groups mirror the components: tick pipeline, market data, orders,
//! exchange adapter, reconciler, store, guards.

use prometheus::{
    Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry,
};
use std::sync::Arc;

#[derive(Clone)]
pub struct BrimMetrics {
    registry: Arc<Registry>,
    pub tick: Arc<TickMetrics>,
    pub md: Arc<MarketDataMetrics>,
    pub orders: Arc<OrderMetrics>,
    pub exchange: Arc<ExchangeMetrics>,
    pub reconcile: Arc<ReconcileMetrics>,
    pub store: Arc<StoreMetrics>,
    pub guards: Arc<GuardMetrics>,
}

impl BrimMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Arc::new(Registry::new());
        Ok(Self {
            tick: Arc::new(TickMetrics::new(&registry)?),
            md: Arc::new(MarketDataMetrics::new(&registry)?),
            orders: Arc::new(OrderMetrics::new(&registry)?),
            exchange: Arc::new(ExchangeMetrics::new(&registry)?),
            reconcile: Arc::new(ReconcileMetrics::new(&registry)?),
            store: Arc::new(StoreMetrics::new(&registry)?),
            guards: Arc::new(GuardMetrics::new(&registry)?),
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

pub struct TickMetrics {
    pub ticks_total: IntCounter,
    pub ticks_skipped_total: IntCounter,
    pub deadline_miss_total: IntCounter,
    pub guard_blocked_total: IntCounter,
    pub tick_duration_ms: Histogram,
    pub stage_duration_ms: HistogramVec,
}

impl TickMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let ticks_total = IntCounter::with_opts(
            Opts::new("tick_total", "Ticks started").namespace("brim"),
        )?;
        registry.register(Box::new(ticks_total.clone()))?;

        let ticks_skipped_total = IntCounter::with_opts(
            Opts::new("tick_skipped_total", "Ticks skipped because the previous one was still running")
                .namespace("brim"),
        )?;
        registry.register(Box::new(ticks_skipped_total.clone()))?;

        let deadline_miss_total = IntCounter::with_opts(
            Opts::new("tick_deadline_miss_total", "Ticks aborted on budget exhaustion")
                .namespace("brim"),
        )?;
        registry.register(Box::new(deadline_miss_total.clone()))?;

        let guard_blocked_total = IntCounter::with_opts(
            Opts::new("tick_guard_blocked_total", "Ticks short-circuited by guards")
                .namespace("brim"),
        )?;
        registry.register(Box::new(guard_blocked_total.clone()))?;

        let tick_duration_ms = Histogram::with_opts(
            HistogramOpts::new("tick_duration_ms", "Wall-clock tick duration")
                .namespace("brim")
                .buckets(vec![1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 200.0, 500.0, 1000.0]),
        )?;
        registry.register(Box::new(tick_duration_ms.clone()))?;

        let stage_duration_ms = HistogramVec::new(
            HistogramOpts::new("stage_duration_ms", "Per-stage latency")
                .namespace("brim")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0]),
            &["stage"],
        )?;
        registry.register(Box::new(stage_duration_ms.clone()))?;

        Ok(Self {
            ticks_total,
            ticks_skipped_total,
            deadline_miss_total,
            guard_blocked_total,
            tick_duration_ms,
            stage_duration_ms,
        })
    }
}

pub struct MarketDataMetrics {
    pub cache_requests_total: IntCounterVec,
    pub cache_age_ms: Histogram,
    pub cache_serve_ms: Histogram,
    pub stream_gaps_total: IntCounter,
}

impl MarketDataMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let cache_requests_total = IntCounterVec::new(
            Opts::new("md_cache_requests_total", "Cache requests by result").namespace("brim"),
            &["hit"],
        )?;
        registry.register(Box::new(cache_requests_total.clone()))?;

        let cache_age_ms = Histogram::with_opts(
            HistogramOpts::new("md_cache_age_ms", "Snapshot age at serve time")
                .namespace("brim")
                .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 1000.0]),
        )?;
        registry.register(Box::new(cache_age_ms.clone()))?;

        let cache_serve_ms = Histogram::with_opts(
            HistogramOpts::new("md_cache_serve_ms", "Cache serve latency")
                .namespace("brim")
                .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 35.0, 50.0]),
        )?;
        registry.register(Box::new(cache_serve_ms.clone()))?;

        let stream_gaps_total = IntCounter::with_opts(
            Opts::new("md_stream_gaps_total", "Invalidating stream gaps").namespace("brim"),
        )?;
        registry.register(Box::new(stream_gaps_total.clone()))?;

        Ok(Self {
            cache_requests_total,
            cache_age_ms,
            cache_serve_ms,
            stream_gaps_total,
        })
    }
}

pub struct OrderMetrics {
    pub placed_total: IntCounterVec,
    pub amended_total: IntCounterVec,
    pub canceled_total: IntCounterVec,
    pub cancel_all_total: IntCounter,
    pub amend_fallback_total: IntCounter,
    pub pretrade_reject_total: IntCounterVec,
    pub crossing_refused_total: IntCounter,
    pub fills_total: IntCounterVec,
    pub inventory_position: GaugeVec,
}

impl OrderMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let placed_total = IntCounterVec::new(
            Opts::new("orders_placed_total", "Orders placed").namespace("brim"),
            &["symbol", "side"],
        )?;
        registry.register(Box::new(placed_total.clone()))?;

        let amended_total = IntCounterVec::new(
            Opts::new("orders_amended_total", "Orders amended in place").namespace("brim"),
            &["symbol", "side"],
        )?;
        registry.register(Box::new(amended_total.clone()))?;

        let canceled_total = IntCounterVec::new(
            Opts::new("orders_canceled_total", "Orders canceled").namespace("brim"),
            &["symbol", "side"],
        )?;
        registry.register(Box::new(canceled_total.clone()))?;

        let cancel_all_total = IntCounter::with_opts(
            Opts::new("orders_cancel_all_total", "Cancel-all sweeps issued").namespace("brim"),
        )?;
        registry.register(Box::new(cancel_all_total.clone()))?;

        let amend_fallback_total = IntCounter::with_opts(
            Opts::new("orders_amend_fallback_total", "Amends answered with fallback_required")
                .namespace("brim"),
        )?;
        registry.register(Box::new(amend_fallback_total.clone()))?;

        let pretrade_reject_total = IntCounterVec::new(
            Opts::new("orders_pretrade_reject_total", "Placements refused by filters")
                .namespace("brim"),
            &["reason"],
        )?;
        registry.register(Box::new(pretrade_reject_total.clone()))?;

        let crossing_refused_total = IntCounter::with_opts(
            Opts::new("orders_crossing_refused_total", "Quotes refused by the crossing guard")
                .namespace("brim"),
        )?;
        registry.register(Box::new(crossing_refused_total.clone()))?;

        let fills_total = IntCounterVec::new(
            Opts::new("fills_total", "Fills applied to the store").namespace("brim"),
            &["symbol", "side"],
        )?;
        registry.register(Box::new(fills_total.clone()))?;

        let inventory_position = GaugeVec::new(
            Opts::new("inventory_position", "Signed base position").namespace("brim"),
            &["symbol"],
        )?;
        registry.register(Box::new(inventory_position.clone()))?;

        Ok(Self {
            placed_total,
            amended_total,
            canceled_total,
            cancel_all_total,
            amend_fallback_total,
            pretrade_reject_total,
            crossing_refused_total,
            fills_total,
            inventory_position,
        })
    }
}

pub struct ExchangeMetrics {
    pub calls_total: IntCounterVec,
    pub errors_total: IntCounterVec,
    pub circuit_state: IntGauge,
    pub limiter_rejections_total: IntCounterVec,
    pub idem_hits_total: IntCounter,
}

impl ExchangeMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let calls_total = IntCounterVec::new(
            Opts::new("exchange_calls_total", "Adapter capability calls").namespace("brim"),
            &["op"],
        )?;
        registry.register(Box::new(calls_total.clone()))?;

        let errors_total = IntCounterVec::new(
            Opts::new("exchange_errors_total", "Adapter errors by class").namespace("brim"),
            &["class"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let circuit_state = IntGauge::with_opts(
            Opts::new("circuit_state", "0=open 1=tripped 2=half_open").namespace("brim"),
        )?;
        registry.register(Box::new(circuit_state.clone()))?;

        let limiter_rejections_total = IntCounterVec::new(
            Opts::new("rate_limiter_rejections_total", "Non-blocking limiter refusals")
                .namespace("brim"),
            &["class"],
        )?;
        registry.register(Box::new(limiter_rejections_total.clone()))?;

        let idem_hits_total = IntCounter::with_opts(
            Opts::new("exchange_idem_hits_total", "Mutations answered from the idempotency cache")
                .namespace("brim"),
        )?;
        registry.register(Box::new(idem_hits_total.clone()))?;

        Ok(Self {
            calls_total,
            errors_total,
            circuit_state,
            limiter_rejections_total,
            idem_hits_total,
        })
    }
}

pub struct ReconcileMetrics {
    pub runs_total: IntCounter,
    pub failures_total: IntCounter,
    pub divergence_ratio: Gauge,
    pub orphans_canceled_total: IntCounter,
    pub store_only_resolved_total: IntCounter,
    pub hard_desync_total: IntCounter,
}

impl ReconcileMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let runs_total = IntCounter::with_opts(
            Opts::new("reconcile_runs_total", "Reconcile cycles completed").namespace("brim"),
        )?;
        registry.register(Box::new(runs_total.clone()))?;

        let failures_total = IntCounter::with_opts(
            Opts::new("reconcile_failures_total", "Reconcile cycles failed").namespace("brim"),
        )?;
        registry.register(Box::new(failures_total.clone()))?;

        let divergence_ratio = Gauge::with_opts(
            Opts::new("reconcile_divergence_ratio", "Last observed divergence ratio")
                .namespace("brim"),
        )?;
        registry.register(Box::new(divergence_ratio.clone()))?;

        let orphans_canceled_total = IntCounter::with_opts(
            Opts::new("reconcile_orphans_canceled_total", "Exchange-only orders canceled")
                .namespace("brim"),
        )?;
        registry.register(Box::new(orphans_canceled_total.clone()))?;

        let store_only_resolved_total = IntCounter::with_opts(
            Opts::new("reconcile_store_only_resolved_total", "Store-only orders resolved from history")
                .namespace("brim"),
        )?;
        registry.register(Box::new(store_only_resolved_total.clone()))?;

        let hard_desync_total = IntCounter::with_opts(
            Opts::new("reconcile_hard_desync_total", "Hard desync escalations").namespace("brim"),
        )?;
        registry.register(Box::new(hard_desync_total.clone()))?;

        Ok(Self {
            runs_total,
            failures_total,
            divergence_ratio,
            orphans_canceled_total,
            store_only_resolved_total,
            hard_desync_total,
        })
    }
}

pub struct StoreMetrics {
    pub snapshots_total: IntCounter,
    pub idem_hits_total: IntCounter,
    pub recovered_orders: IntGauge,
    pub open_orders: IntGauge,
}

impl StoreMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let snapshots_total = IntCounter::with_opts(
            Opts::new("store_snapshots_total", "Durable snapshots written").namespace("brim"),
        )?;
        registry.register(Box::new(snapshots_total.clone()))?;

        let idem_hits_total = IntCounter::with_opts(
            Opts::new("store_idem_hits_total", "Store mutations answered from the idempotency cache")
                .namespace("brim"),
        )?;
        registry.register(Box::new(idem_hits_total.clone()))?;

        let recovered_orders = IntGauge::with_opts(
            Opts::new("store_recovered_orders", "Non-terminal orders loaded at recovery")
                .namespace("brim"),
        )?;
        registry.register(Box::new(recovered_orders.clone()))?;

        let open_orders = IntGauge::with_opts(
            Opts::new("store_open_orders", "Currently open orders").namespace("brim"),
        )?;
        registry.register(Box::new(open_orders.clone()))?;

        Ok(Self {
            snapshots_total,
            idem_hits_total,
            recovered_orders,
            open_orders,
        })
    }
}

pub struct GuardMetrics {
    pub level: IntGauge,
    pub transitions_total: IntCounterVec,
}

impl GuardMetrics {
    fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let level = IntGauge::with_opts(
            Opts::new("guard_level", "0=ok 1=soft 2=hard").namespace("brim"),
        )?;
        registry.register(Box::new(level.clone()))?;

        let transitions_total = IntCounterVec::new(
            Opts::new("guard_transitions_total", "Guard level transitions").namespace("brim"),
            &["to"],
        )?;
        registry.register(Box::new(transitions_total.clone()))?;

        Ok(Self { level, transitions_total })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_builds_and_registers_families() {
        let metrics = BrimMetrics::new().unwrap();
        metrics.tick.ticks_total.inc();
        metrics.orders.placed_total.with_label_values(&["BTCUSDT", "buy"]).inc();
        let families = metrics.registry().gather();
        assert!(!families.is_empty());
    }

    #[test]
    fn two_registries_are_independent() {
        let a = BrimMetrics::new().unwrap();
        let b = BrimMetrics::new().unwrap();
        a.tick.ticks_total.inc();
        assert_eq!(a.tick.ticks_total.get(), 1);
        assert_eq!(b.tick.ticks_total.get(), 0);
    }
}
