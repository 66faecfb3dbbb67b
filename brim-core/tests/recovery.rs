//! Restart recovery: durable snapshot -> store -> startup reconcile.

use brim_core::config::{GuardsConfig, ReconcileConfig, StoreConfig};
use brim_core::core::types::{ClientOrderId, Order, OrderIntent, OrderState, Side, Symbol};
use brim_core::exchange::{ExchangeApi, PaperExchange};
use brim_core::monitoring::metrics::BrimMetrics;
use brim_core::reconcile::Reconciler;
use brim_core::risk::guards::{GuardEngine, GuardLevel};
use brim_core::store::OrderStore;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

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

fn store_in(dir: &std::path::Path) -> OrderStore {
    OrderStore::new(StoreConfig {
        snapshot_dir: dir.to_path_buf(),
        ..StoreConfig::default()
    })
}

/// Scenario: restart with eight non-terminal orders in the snapshot. Six
/// are still live on the exchange, one filled during downtime, one has no
/// trace exchange-side; an unrelated orphan also rests on the exchange.
/// Startup reconcile corrects everything without escalating to HARD.
#[tokio::test]
async fn recovery_reconciles_to_steady_state() {
    let dir = tempfile::tempdir().unwrap();
    let paper = Arc::new(PaperExchange::new());

    // Session one: eight acked orders, snapshot, gone.
    {
        let store = store_in(dir.path());
        for i in 0..8 {
            let cid = format!("o{i}");
            let it = intent(&cid, Side::Buy, dec!(99.00) - Decimal::from(i));
            store.place(it.clone(), &cid).unwrap();
            let cid = ClientOrderId::from(cid.as_str());
            if i < 7 {
                let xid = paper.place(&it, &format!("px{i}")).await.unwrap();
                store.record_ack(&cid, &xid, &format!("ack{i}")).unwrap();
            } else {
                // Acked locally but the exchange has no trace of it.
                store.record_ack(&cid, "X-ghost", &format!("ack{i}")).unwrap();
            }
        }
        store.snapshot_blocking().unwrap();
    }

    // Meanwhile: one order filled during downtime, plus an orphan appears.
    paper.silently_drop(&ClientOrderId::from("o6"), OrderState::Filled);
    let orphan = Order::new(intent("orphan", Side::Sell, dec!(101.00)), 0);
    paper.inject_orphan(orphan);
    assert_eq!(paper.open_order_count(), 7); // o0..o5 + orphan

    // Session two: recover and reconcile.
    let store = Arc::new(store_in(dir.path()));
    let recovered = store.recover().unwrap();
    assert_eq!(recovered.len(), 8);
    assert!(dir.path().join("recover.marker").exists());

    let guards = Arc::new(GuardEngine::new(GuardsConfig::default()));
    let metrics = Arc::new(BrimMetrics::new().unwrap());
    let reconciler = Reconciler::new(
        ReconcileConfig::default(),
        paper.clone() as Arc<dyn ExchangeApi>,
        Arc::clone(&store),
        Arc::clone(&guards),
        metrics,
    );

    let report = reconciler.run_startup().await.unwrap();
    assert_eq!(report.exchange_only, 1, "the orphan");
    assert_eq!(report.store_only, 2, "downtime fill and the ghost");

    // Six still open, the downtime fill applied with inventory, the ghost
    // retired, the orphan canceled exchange-side.
    let open = store.list_open(None);
    assert_eq!(open.len(), 6);
    let filled = store.get(&ClientOrderId::from("o6")).unwrap();
    assert_eq!(filled.state, OrderState::Filled);
    assert_eq!(store.inventory(&symbol()).position, dec!(1.0));
    assert_eq!(
        store.get(&ClientOrderId::from("o7")).unwrap().state,
        OrderState::Canceled
    );
    assert_eq!(paper.open_order_count(), 6);

    // Startup divergence does not pause quoting.
    assert_eq!(guards.level(), GuardLevel::Ok);
}

#[tokio::test]
async fn snapshot_is_byte_stable_across_rewrites() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = store_in(dir.path());
        for i in 0..3 {
            let cid = format!("o{i}");
            store
                .place(intent(&cid, Side::Sell, dec!(101.00)), &cid)
                .unwrap();
        }
        store.snapshot_blocking().unwrap();
    }
    let first = std::fs::read_to_string(dir.path().join("orders.jsonl")).unwrap();

    // Recover into a fresh store and write again: identical bytes.
    {
        let store = store_in(dir.path());
        store.recover().unwrap();
        store.snapshot_blocking().unwrap();
    }
    let second = std::fs::read_to_string(dir.path().join("orders.jsonl")).unwrap();
    assert_eq!(first, second);
}
