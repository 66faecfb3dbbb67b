//! Durable order store
//!
//! The authoritative local view of intended and live orders. This is the
//! only place orders mutate; the lifecycle manager and the streaming-event
//! ingest both write through it. Every mutation takes an idempotency key and
//! the first result is cached for a TTL, which is what makes retries safe
//! across the whole write path.
//!
//! All mutations serialize on one lock; reads copy out and never block a
//! writer for long. Inventory is maintained here, from fills only.

use crate::config::StoreConfig;
use crate::core::errors::StoreError;
use crate::core::types::{
    epoch_ms, ClientOrderId, Inventory, Order, OrderIntent, OrderState, Symbol,
};
use crate::exchange::idempotency::IdemCache;
use crate::store::snapshot::{
    decode_orders, encode_orders, write_atomic, SnapshotWriter, ORDERS_FILE, RECOVER_MARKER,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Cached result of an idempotent mutation.
#[derive(Debug, Clone)]
enum StoreReply {
    Unit,
    CancelAll(Vec<ClientOrderId>),
}

struct StoreInner {
    orders: HashMap<ClientOrderId, Order>,
    inventory: HashMap<Symbol, Inventory>,
}

pub struct OrderStore {
    cfg: StoreConfig,
    inner: Mutex<StoreInner>,
    idem: IdemCache<StoreReply>,
    writer: SnapshotWriter,
}

impl OrderStore {
    pub fn new(cfg: StoreConfig) -> Self {
        let idem_ttl = Duration::from_millis(cfg.idem_ttl_ms);
        Self {
            cfg,
            inner: Mutex::new(StoreInner {
                orders: HashMap::new(),
                inventory: HashMap::new(),
            }),
            idem: IdemCache::new(idem_ttl),
            writer: SnapshotWriter::spawn(),
        }
    }

    fn orders_path(&self) -> PathBuf {
        self.cfg.snapshot_dir.join(ORDERS_FILE)
    }

    fn marker_path(&self) -> PathBuf {
        self.cfg.snapshot_dir.join(RECOVER_MARKER)
    }

    // ---- mutations ------------------------------------------------------

    /// Record a new intended order in `pending` state.
    pub fn place(&self, intent: OrderIntent, idem_key: &str) -> Result<(), StoreError> {
        if self.idem.get(idem_key).is_some() {
            return Ok(());
        }
        let now = epoch_ms();
        {
            let mut inner = self.inner.lock();
            if inner.orders.contains_key(&intent.client_order_id) {
                return Err(StoreError::DuplicateOrder(intent.client_order_id));
            }
            let order = Order::new(intent, now);
            inner.orders.insert(order.client_order_id.clone(), order);
        }
        self.idem.put(idem_key, StoreReply::Unit);
        Ok(())
    }

    /// Attach the exchange id returned by a successful place and move the
    /// order to `open`.
    pub fn record_ack(
        &self,
        cid: &ClientOrderId,
        exchange_order_id: &str,
        idem_key: &str,
    ) -> Result<(), StoreError> {
        if self.idem.get(idem_key).is_some() {
            return Ok(());
        }
        let now = epoch_ms();
        {
            let mut inner = self.inner.lock();
            let order = inner
                .orders
                .get_mut(cid)
                .ok_or_else(|| StoreError::UnknownOrder(cid.clone()))?;
            order.exchange_order_id = Some(exchange_order_id.to_string());
            if order.state == OrderState::Pending {
                order.state = OrderState::Open;
            }
            order.touch(now);
        }
        self.idem.put(idem_key, StoreReply::Unit);
        Ok(())
    }

    /// Drive an order to `state`, enforcing lifecycle legality. Re-asserting
    /// the state an order is already in is a no-op, which keeps exchange
    /// re-confirmations and reconciler retries harmless.
    pub fn update_state(
        &self,
        cid: &ClientOrderId,
        state: OrderState,
        idem_key: &str,
    ) -> Result<(), StoreError> {
        if self.idem.get(idem_key).is_some() {
            return Ok(());
        }
        let now = epoch_ms();
        {
            let mut inner = self.inner.lock();
            let order = inner
                .orders
                .get_mut(cid)
                .ok_or_else(|| StoreError::UnknownOrder(cid.clone()))?;
            if order.state == state {
                // Idempotent re-assertion.
            } else if order.state.can_transition_to(state) {
                order.state = state;
                order.touch(now);
            } else {
                return Err(StoreError::IllegalTransition {
                    cid: cid.clone(),
                    from: order.state.as_str(),
                    to: state.as_str(),
                });
            }
        }
        self.idem.put(idem_key, StoreReply::Unit);
        Ok(())
    }

    /// Amend the resting price/qty of an open order after the exchange
    /// accepted the amend.
    pub fn apply_amend(
        &self,
        cid: &ClientOrderId,
        new_price: Option<Decimal>,
        new_qty: Option<Decimal>,
        idem_key: &str,
    ) -> Result<(), StoreError> {
        if self.idem.get(idem_key).is_some() {
            return Ok(());
        }
        let now = epoch_ms();
        {
            let mut inner = self.inner.lock();
            let order = inner
                .orders
                .get_mut(cid)
                .ok_or_else(|| StoreError::UnknownOrder(cid.clone()))?;
            if let Some(price) = new_price {
                order.price = price;
            }
            if let Some(qty) = new_qty {
                order.qty = qty.max(order.filled_qty);
            }
            order.touch(now);
        }
        self.idem.put(idem_key, StoreReply::Unit);
        Ok(())
    }

    /// Apply a fill: order quantity/average/state plus inventory, together
    /// under the store lock so the two can never diverge.
    pub fn apply_fill(
        &self,
        cid: &ClientOrderId,
        fill_qty: Decimal,
        fill_price: Decimal,
        idem_key: &str,
    ) -> Result<(), StoreError> {
        if self.idem.get(idem_key).is_some() {
            return Ok(());
        }
        let now = epoch_ms();
        {
            let mut inner = self.inner.lock();
            let order = inner
                .orders
                .get_mut(cid)
                .ok_or_else(|| StoreError::UnknownOrder(cid.clone()))?;
            if fill_qty <= Decimal::ZERO || order.filled_qty + fill_qty > order.qty {
                return Err(StoreError::Overfill {
                    cid: cid.clone(),
                    fill_qty,
                    qty: order.qty,
                });
            }
            order.apply_fill(fill_qty, fill_price, now);
            let symbol = order.symbol.clone();
            let side = order.side;
            let entry = inner.inventory.entry(symbol.clone()).or_default();
            entry.apply(&crate::core::types::Fill {
                client_order_id: cid.clone(),
                symbol,
                side,
                price: fill_price,
                qty: fill_qty,
                fee: Decimal::ZERO,
                exchange_event_seq: 0,
                ts: now,
            });
        }
        self.idem.put(idem_key, StoreReply::Unit);
        Ok(())
    }

    /// Mark every non-terminal order canceled; returns the affected ids.
    /// Used for guard-forced sweeps; exchange truth catches up via events
    /// and the reconciler.
    pub fn cancel_all_open(&self, idem_key: &str) -> Result<Vec<ClientOrderId>, StoreError> {
        if let Some(StoreReply::CancelAll(cids)) = self.idem.get(idem_key) {
            return Ok(cids);
        }
        let now = epoch_ms();
        let cids: Vec<ClientOrderId> = {
            let mut inner = self.inner.lock();
            let mut cids = Vec::new();
            for (cid, order) in inner.orders.iter_mut() {
                if !order.state.is_terminal() {
                    order.state = OrderState::Canceled;
                    order.touch(now);
                    cids.push(cid.clone());
                }
            }
            cids
        };
        self.idem.put(idem_key, StoreReply::CancelAll(cids.clone()));
        Ok(cids)
    }

    /// Drop terminal orders that aged out of the history window.
    pub fn prune(&self) {
        let cutoff = epoch_ms().saturating_sub(self.cfg.history_window_ms);
        let mut inner = self.inner.lock();
        inner
            .orders
            .retain(|_, o| !o.state.is_terminal() || o.updated_ts >= cutoff);
    }

    // ---- reads ----------------------------------------------------------

    pub fn get(&self, cid: &ClientOrderId) -> Option<Order> {
        self.inner.lock().orders.get(cid).cloned()
    }

    pub fn list_open(&self, symbol: Option<&Symbol>) -> Vec<Order> {
        let inner = self.inner.lock();
        inner
            .orders
            .values()
            .filter(|o| o.is_open())
            .filter(|o| symbol.map(|s| &o.symbol == s).unwrap_or(true))
            .cloned()
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().orders.values().filter(|o| o.is_open()).count()
    }

    pub fn inventory(&self, symbol: &Symbol) -> Inventory {
        self.inner
            .lock()
            .inventory
            .get(symbol)
            .cloned()
            .unwrap_or_default()
    }

    // ---- persistence ----------------------------------------------------

    /// Queue an asynchronous durable snapshot of all retained orders.
    pub fn snapshot(&self) -> Result<(), StoreError> {
        let payload = self.encode_current()?;
        self.writer.enqueue(self.orders_path(), payload);
        Ok(())
    }

    /// Synchronous snapshot; used on graceful shutdown and by the CLI.
    pub fn snapshot_blocking(&self) -> Result<(), StoreError> {
        let payload = self.encode_current()?;
        write_atomic(&self.orders_path(), &payload)?;
        Ok(())
    }

    fn encode_current(&self) -> Result<String, StoreError> {
        let orders: Vec<Order> = {
            let inner = self.inner.lock();
            inner.orders.values().cloned().collect()
        };
        encode_orders(&orders)
    }

    /// Reload the latest snapshot. Non-terminal orders are returned for the
    /// lifecycle manager to reconcile against the exchange; terminal ones
    /// re-enter the bounded history. A recovery marker is written on
    /// success.
    pub fn recover(&self) -> Result<Vec<Order>, StoreError> {
        let path = self.orders_path();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no snapshot to recover");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let orders = decode_orders(&content)?;

        let non_terminal: Vec<Order> = {
            let mut inner = self.inner.lock();
            for order in &orders {
                inner
                    .orders
                    .insert(order.client_order_id.clone(), order.clone());
            }
            orders.iter().filter(|o| o.is_open()).cloned().collect()
        };

        write_atomic(
            &self.marker_path(),
            &format!("recovered_ts_ms={}\n", epoch_ms()),
        )?;
        info!(
            total = orders.len(),
            open = non_terminal.len(),
            "recovered order snapshot"
        );
        if non_terminal.is_empty() && !orders.is_empty() {
            warn!("snapshot contained only terminal orders");
        }
        Ok(non_terminal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn store_in(dir: &std::path::Path) -> OrderStore {
        OrderStore::new(StoreConfig {
            snapshot_dir: dir.to_path_buf(),
            ..StoreConfig::default()
        })
    }

    fn intent(cid: &str) -> OrderIntent {
        OrderIntent {
            client_order_id: ClientOrderId::from(cid),
            symbol: Symbol::from("BTCUSDT"),
            side: crate::core::types::Side::Buy,
            price: dec!(99.95),
            qty: dec!(1.0),
        }
    }

    #[test]
    fn place_twice_same_key_is_one_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.place(intent("a"), "k1").unwrap();
        store.place(intent("a"), "k1").unwrap();
        assert_eq!(store.list_open(None).len(), 1);
    }

    #[test]
    fn duplicate_cid_with_new_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.place(intent("a"), "k1").unwrap();
        assert!(matches!(
            store.place(intent("a"), "k2"),
            Err(StoreError::DuplicateOrder(_))
        ));
    }

    #[test]
    fn fill_updates_order_and_inventory_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let cid = ClientOrderId::from("a");
        store.place(intent("a"), "k1").unwrap();
        store.record_ack(&cid, "X-1", "ack:a").unwrap();

        store.apply_fill(&cid, dec!(0.4), dec!(99.95), "fill:a:1").unwrap();
        let order = store.get(&cid).unwrap();
        assert_eq!(order.state, OrderState::PartiallyFilled);
        assert_eq!(order.filled_qty, dec!(0.4));
        assert_eq!(store.inventory(&Symbol::from("BTCUSDT")).position, dec!(0.4));

        // Re-applying the same fill key is a no-op.
        store.apply_fill(&cid, dec!(0.4), dec!(99.95), "fill:a:1").unwrap();
        assert_eq!(store.get(&cid).unwrap().filled_qty, dec!(0.4));
        assert_eq!(store.inventory(&Symbol::from("BTCUSDT")).position, dec!(0.4));
    }

    #[test]
    fn overfill_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let cid = ClientOrderId::from("a");
        store.place(intent("a"), "k1").unwrap();
        store.record_ack(&cid, "X-1", "ack:a").unwrap();
        assert!(matches!(
            store.apply_fill(&cid, dec!(1.5), dec!(99.95), "fill:a:1"),
            Err(StoreError::Overfill { .. })
        ));
    }

    #[test]
    fn terminal_states_are_sticky_in_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let cid = ClientOrderId::from("a");
        store.place(intent("a"), "k1").unwrap();
        store.record_ack(&cid, "X-1", "ack:a").unwrap();
        store.update_state(&cid, OrderState::Canceled, "cancel:a").unwrap();

        // Re-asserting the terminal state is fine.
        store.update_state(&cid, OrderState::Canceled, "cancel:a:2").unwrap();
        // Reviving it is not.
        assert!(matches!(
            store.update_state(&cid, OrderState::Open, "oops"),
            Err(StoreError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn cancel_all_open_is_idempotent_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store.place(intent("a"), "k1").unwrap();
        store.place(intent("b"), "k2").unwrap();

        let first = store.cancel_all_open("sweep:1").unwrap();
        assert_eq!(first.len(), 2);
        // Same key replays the original result; nothing new is canceled.
        let replay = store.cancel_all_open("sweep:1").unwrap();
        assert_eq!(replay, first);
        // A later sweep with a fresh key finds nothing open.
        assert!(store.cancel_all_open("sweep:2").unwrap().is_empty());
    }

    #[test]
    fn snapshot_recover_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cid = ClientOrderId::from("a");
        {
            let store = store_in(dir.path());
            store.place(intent("a"), "k1").unwrap();
            store.record_ack(&cid, "X-1", "ack:a").unwrap();
            store.place(intent("b"), "k2").unwrap();
            store.update_state(&ClientOrderId::from("b"), OrderState::Canceled, "c:b").unwrap();
            store.snapshot_blocking().unwrap();
        }

        let store = store_in(dir.path());
        let recovered = store.recover().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].client_order_id, cid);
        assert_eq!(store.get(&cid).unwrap().state, OrderState::Open);
        // Terminal order retained in history but not open.
        assert_eq!(store.list_open(None).len(), 1);
        assert!(dir.path().join(RECOVER_MARKER).exists());
    }

    #[test]
    fn recover_without_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        assert!(store.recover().unwrap().is_empty());
    }

    #[test]
    fn prune_drops_old_terminal_orders_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = StoreConfig::default();
        cfg.snapshot_dir = dir.path().to_path_buf();
        cfg.history_window_ms = 0;
        let store = OrderStore::new(cfg);
        store.place(intent("a"), "k1").unwrap();
        store.place(intent("b"), "k2").unwrap();
        store.update_state(&ClientOrderId::from("b"), OrderState::Rejected, "r:b").unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        store.prune();
        assert!(store.get(&ClientOrderId::from("a")).is_some());
        assert!(store.get(&ClientOrderId::from("b")).is_none());
    }
}
