//! Circuit-gate and hard-desync behavior against the paper venue.

use brim_core::config::{
    CircuitConfig, ExchangeConfig, GuardsConfig, RateLimiterConfig, ReconcileConfig, StoreConfig,
};
use brim_core::core::errors::ExchangeError;
use brim_core::core::types::{ClientOrderId, OrderIntent, OrderState, Side, Symbol};
use brim_core::exchange::circuit::{CircuitGate, CircuitState};
use brim_core::exchange::guarded::GuardedExchange;
use brim_core::exchange::rate_limit::RateLimiter;
use brim_core::exchange::{ExchangeApi, PaperExchange};
use brim_core::monitoring::metrics::BrimMetrics;
use brim_core::reconcile::{Reconciler, REASON_HARD_DESYNC};
use brim_core::risk::guards::{GuardEngine, GuardLevel, GuardSignals};
use brim_core::store::OrderStore;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

fn symbol() -> Symbol {
    Symbol::from("BTCUSDT")
}

fn intent(cid: &str, side: Side, price: Decimal) -> OrderIntent {
    OrderIntent {
        client_order_id: ClientOrderId::from(cid),
        symbol: symbol(),
        side,
        price,
        qty: dec!(1.0),
    }
}

fn circuit_cfg(cooldown_s: u64) -> CircuitConfig {
    CircuitConfig {
        window_s: 300,
        max_err_rate_ratio: 0.30,
        cooldown_s,
        min_closed_s: 0,
        probe_count: 1,
        min_dwell_s: 0,
        max_log_lines_per_sec: 5,
        min_samples: 5,
    }
}

fn guarded(
    paper: &Arc<PaperExchange>,
    cooldown_s: u64,
) -> (GuardedExchange, Arc<CircuitGate>, Arc<BrimMetrics>) {
    let gate = Arc::new(CircuitGate::new(circuit_cfg(cooldown_s)));
    let limiter = Arc::new(RateLimiter::new(&RateLimiterConfig {
        capacity_per_s: 10_000.0,
        burst: 10_000,
        endpoint_overrides: Default::default(),
    }));
    let metrics = Arc::new(BrimMetrics::new().unwrap());
    let exchange_cfg = ExchangeConfig {
        rest_timeout_ms: 1_000,
        retry_base_ms: 1,
        retry_max_ms: 2,
        retry_max_attempts: 1,
        ..ExchangeConfig::default()
    };
    let guarded = GuardedExchange::new(
        paper.clone() as Arc<dyn ExchangeApi>,
        Arc::clone(&gate),
        limiter,
        &exchange_cfg,
        Arc::clone(&metrics),
    );
    (guarded, gate, metrics)
}

#[tokio::test]
async fn sustained_errors_trip_the_gate_and_allowlist_survives() {
    let paper = Arc::new(PaperExchange::new());
    let (guarded, gate, _metrics) = guarded(&paper, 3_600);

    // One resting order so cancel_all has something to do later.
    let xid = guarded
        .place(&intent("seed", Side::Buy, dec!(99.95)), "seed")
        .await
        .unwrap();
    assert!(!xid.is_empty());

    // Sustained failures push the windowed error rate over the threshold;
    // once tripped, further attempts see the gate, not the venue.
    paper.fail_next_calls(10);
    let mut saw_refusal = false;
    for i in 0..10 {
        match guarded
            .place(&intent(&format!("o{i}"), Side::Buy, dec!(99.90)), &format!("k{i}"))
            .await
        {
            Err(e) if e.is_transient() => {}
            Err(ExchangeError::CircuitOpen) => {
                saw_refusal = true;
                break;
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert!(saw_refusal, "gate should have tripped inside the error burst");
    assert_eq!(gate.state(), CircuitState::Tripped);
    paper.fail_next_calls(0);

    // Mutations are refused without touching the venue.
    let err = guarded
        .place(&intent("blocked", Side::Buy, dec!(99.90)), "blocked")
        .await
        .unwrap_err();
    assert!(matches!(err, ExchangeError::CircuitOpen));
    assert_eq!(paper.open_order_count(), 1);

    // Allowlisted operations still work: reads and the safety sweep.
    assert_eq!(guarded.fetch_open_orders(None).await.unwrap().len(), 1);
    let swept = guarded.cancel_all(None, "sweep:1").await.unwrap();
    assert_eq!(swept.len(), 1);
    assert_eq!(paper.open_order_count(), 0);
}

#[tokio::test]
async fn cooldown_probe_reopens_traffic() {
    let paper = Arc::new(PaperExchange::new());
    let (guarded, gate, _metrics) = guarded(&paper, 0);

    gate.force_trip("test");
    assert_eq!(gate.state(), CircuitState::Tripped);

    // Health probe bypasses the gate, succeeds, and closes the loop:
    // TRIPPED -> HALF_OPEN (cooldown 0) on the next check, then one probe
    // success re-opens.
    assert!(gate.check());
    assert_eq!(gate.state(), CircuitState::HalfOpen);
    guarded.ping().await.unwrap();
    assert_eq!(gate.state(), CircuitState::Open);

    // Traffic flows again.
    guarded
        .place(&intent("after", Side::Buy, dec!(99.95)), "after")
        .await
        .unwrap();
    assert_eq!(paper.open_order_count(), 1);
}

#[tokio::test]
async fn idempotent_place_replays_cached_result_through_the_stack() {
    let paper = Arc::new(PaperExchange::new());
    let (guarded, _gate, metrics) = guarded(&paper, 3_600);

    let i = intent("a", Side::Buy, dec!(99.95));
    let x1 = guarded.place(&i, "k1").await.unwrap();
    let x2 = guarded.place(&i, "k1").await.unwrap();
    assert_eq!(x1, x2);
    assert_eq!(paper.open_order_count(), 1);
    assert_eq!(metrics.exchange.idem_hits_total.get(), 1);
}

struct DesyncFixture {
    paper: Arc<PaperExchange>,
    store: Arc<OrderStore>,
    guards: Arc<GuardEngine>,
    reconciler: Arc<Reconciler>,
    _dir: tempfile::TempDir,
}

fn desync_fixture(hard_t_exit_s: f64) -> DesyncFixture {
    let dir = tempfile::tempdir().unwrap();
    let paper = Arc::new(PaperExchange::new());
    let store = Arc::new(OrderStore::new(StoreConfig {
        snapshot_dir: dir.path().to_path_buf(),
        ..StoreConfig::default()
    }));
    let mut gcfg = GuardsConfig::default();
    gcfg.hard.t_exit_s = hard_t_exit_s;
    gcfg.min_dwell_s = 0.0;
    let guards = Arc::new(GuardEngine::new(gcfg));
    let metrics = Arc::new(BrimMetrics::new().unwrap());
    let reconciler = Arc::new(Reconciler::new(
        ReconcileConfig::default(),
        paper.clone() as Arc<dyn ExchangeApi>,
        Arc::clone(&store),
        Arc::clone(&guards),
        metrics,
    ));
    DesyncFixture {
        paper,
        store,
        guards,
        reconciler,
        _dir: dir,
    }
}

/// Scenario: store believes ten orders are open; the exchange has four of
/// them plus one orphan; history explains five cancels and one downtime
/// fill. Divergence is far above threshold.
#[tokio::test]
async fn hard_desync_forces_hard_and_recovers_after_clean_cycle() {
    let f = desync_fixture(0.05);

    for i in 0..10 {
        let cid = format!("o{i}");
        let it = intent(&cid, Side::Buy, dec!(99.00) - Decimal::from(i));
        f.store.place(it.clone(), &cid).unwrap();
        let cid = ClientOrderId::from(cid.as_str());
        if i < 4 {
            // Still open on the exchange.
            let xid = f.paper.place(&it, &format!("px{i}")).await.unwrap();
            f.store.record_ack(&cid, &xid, &format!("ack{i}")).unwrap();
        } else if i < 9 {
            // Canceled exchange-side without us hearing it.
            let xid = f.paper.place(&it, &format!("px{i}")).await.unwrap();
            f.store.record_ack(&cid, &xid, &format!("ack{i}")).unwrap();
            f.paper.silently_drop(&cid, OrderState::Canceled);
        } else {
            // Filled during the gap.
            let xid = f.paper.place(&it, &format!("px{i}")).await.unwrap();
            f.store.record_ack(&cid, &xid, &format!("ack{i}")).unwrap();
            f.paper.silently_drop(&cid, OrderState::Filled);
        }
    }
    // And one orphan the store never placed.
    let orphan = brim_core::core::types::Order::new(
        intent("orphan", Side::Sell, dec!(101.00)),
        0,
    );
    f.paper.inject_orphan(orphan);
    assert_eq!(f.paper.open_order_count(), 5);

    let report = f.reconciler.run_once().await.unwrap();
    assert!(report.divergence_ratio > 0.10, "ratio {}", report.divergence_ratio);

    // HARD with the desync reason; everything swept.
    let state = f.guards.snapshot();
    assert_eq!(state.level, GuardLevel::Hard);
    assert!(state.reasons.contains(REASON_HARD_DESYNC));
    assert_eq!(f.paper.open_order_count(), 0);
    assert!(f.store.list_open(None).is_empty());

    // History resolved the silent closures.
    assert_eq!(f.store.get(&ClientOrderId::from("o5")).unwrap().state, OrderState::Canceled);
    let filled = f.store.get(&ClientOrderId::from("o9")).unwrap();
    assert_eq!(filled.state, OrderState::Filled);
    // The discovered fill moved inventory.
    assert_eq!(f.store.inventory(&symbol()).position, dec!(1.0));

    // A clean cycle plus the exit dwell releases HARD.
    let report = f.reconciler.run_once().await.unwrap();
    assert!(report.clean);
    tokio::time::sleep(Duration::from_millis(80)).await;
    let state = f.guards.evaluate(&GuardSignals::default());
    assert_eq!(state.level, GuardLevel::Ok);
}

#[tokio::test]
async fn orphan_cancel_is_idempotent_across_cycles() {
    let f = desync_fixture(3_600.0);

    // One store order matching the exchange keeps the ratio meaningful.
    let it = intent("keep", Side::Buy, dec!(99.00));
    f.store.place(it.clone(), "keep").unwrap();
    let xid = f.paper.place(&it, "keep").await.unwrap();
    f.store
        .record_ack(&ClientOrderId::from("keep"), &xid, "ack:keep")
        .unwrap();

    let orphan = brim_core::core::types::Order::new(intent("orphan", Side::Sell, dec!(101.00)), 0);
    let orphan_xid = f.paper.inject_orphan(orphan);

    let report = f.reconciler.run_once().await.unwrap();
    assert_eq!(report.exchange_only, 1);

    // The orphan is gone; a direct replay of the same recon key cannot act
    // twice, and a fresh key reports it as already done.
    let again = f
        .paper
        .cancel(&orphan_xid, &format!("recon:{orphan_xid}"))
        .await
        .unwrap();
    assert_eq!(again, brim_core::exchange::CancelOutcome::Canceled);
    let fresh = f.paper.cancel(&orphan_xid, "other-key").await.unwrap();
    assert_eq!(fresh, brim_core::exchange::CancelOutcome::AlreadyDone);
}
