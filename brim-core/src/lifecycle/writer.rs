//! Order lifecycle manager
//!
//! Translates the pipeline's target quote set into concrete exchange
//! operations with amend-first semantics. This is the writer side of the
//! durable store and the only caller of the adapter's mutating capabilities.
//!
//! Per `(symbol, side)` the decision is: place when nothing rests, cancel
//! when the target is gone, amend when the deltas are small and the order
//! has rested long enough, cancel+place otherwise (with a propagation gap).
//! Client order ids are `{symbol}-{side}-{monotonic_ms}-{random4}`; derived
//! keys (`cancel:<cid>`, `amend:<cid>:<rev>`) make every retry idempotent.

use crate::core::filters::FilterRegistry;
use crate::core::types::{
    epoch_ms, ClientOrderId, Order, OrderIntent, OrderState, QuoteTarget, Side, Symbol,
};
use crate::exchange::api::{AmendOutcome, CancelOutcome, ExchangeApi};
use crate::pipeline::SharedConfig;
use crate::monitoring::metrics::BrimMetrics;
use crate::pipeline::TickDeadline;
use crate::risk::guards::GuardEngine;
use crate::store::OrderStore;
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Latest coalesced target for a side while a mutation is in flight.
type PendingTargets = (Option<Option<QuoteTarget>>, Option<Option<QuoteTarget>>);

pub struct LifecycleWriter {
    cfg: SharedConfig,
    store: Arc<OrderStore>,
    exchange: Arc<dyn ExchangeApi>,
    filters: Arc<FilterRegistry>,
    guards: Arc<GuardEngine>,
    metrics: Arc<BrimMetrics>,
    symbol_locks: DashMap<Symbol, Arc<AsyncMutex<()>>>,
    pending: DashMap<Symbol, PendingTargets>,
    amend_revs: DashMap<ClientOrderId, u32>,
    last_cid_ms: AtomicU64,
}

impl LifecycleWriter {
    pub fn new(
        cfg: SharedConfig,
        store: Arc<OrderStore>,
        exchange: Arc<dyn ExchangeApi>,
        filters: Arc<FilterRegistry>,
        guards: Arc<GuardEngine>,
        metrics: Arc<BrimMetrics>,
    ) -> Self {
        Self {
            cfg,
            store,
            exchange,
            filters,
            guards,
            metrics,
            symbol_locks: DashMap::new(),
            pending: DashMap::new(),
            amend_revs: DashMap::new(),
            last_cid_ms: AtomicU64::new(0),
        }
    }

    fn symbol_lock(&self, symbol: &Symbol) -> Arc<AsyncMutex<()>> {
        self.symbol_locks
            .entry(symbol.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Unique, sortable client order id.
    fn next_cid(&self, symbol: &Symbol, side: Side) -> ClientOrderId {
        let now = epoch_ms();
        // Strictly increasing ms component keeps ids sortable even when two
        // orders land in the same wall-clock millisecond.
        let ms = loop {
            let last = self.last_cid_ms.load(Ordering::SeqCst);
            let candidate = now.max(last + 1);
            if self
                .last_cid_ms
                .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break candidate;
            }
        };
        let rand4: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(4)
            .map(char::from)
            .collect();
        ClientOrderId::new(format!("{symbol}-{}-{ms}-{rand4}", side.tag()))
    }

    /// Apply a tick's target set for one symbol. Mutations for a symbol are
    /// totally ordered behind its lock; targets arriving while one is in
    /// flight coalesce to the latest.
    pub async fn apply(
        &self,
        symbol: &Symbol,
        tick_index: u64,
        mid: Option<Decimal>,
        bid: Option<QuoteTarget>,
        ask: Option<QuoteTarget>,
        cancel_all_required: bool,
        deadline: &TickDeadline,
    ) {
        if cancel_all_required {
            self.cancel_all(symbol, tick_index).await;
            return;
        }

        let (bid, ask) = self.crossing_guard(mid, bid, ask);

        let lock = self.symbol_lock(symbol);
        let guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                // A mutation is in flight; coalesce to the latest target.
                self.pending.insert(symbol.clone(), (Some(bid), Some(ask)));
                debug!(symbol = %symbol, "targets coalesced behind in-flight mutation");
                return;
            }
        };

        self.reconcile_side(symbol, Side::Buy, bid, deadline).await;
        self.reconcile_side(symbol, Side::Sell, ask, deadline).await;

        // Drain anything that coalesced while we were working.
        while let Some((_, (pending_bid, pending_ask))) = self.pending.remove(symbol) {
            if deadline.expired() {
                break;
            }
            if let Some(bid) = pending_bid {
                self.reconcile_side(symbol, Side::Buy, bid, deadline).await;
            }
            if let Some(ask) = pending_ask {
                self.reconcile_side(symbol, Side::Sell, ask, deadline).await;
            }
        }
        drop(guard);
    }

    /// Guard-forced sweep: cancel everything for the symbol on the exchange
    /// and in the store under one idempotency key per tick.
    pub async fn cancel_all(&self, symbol: &Symbol, tick_index: u64) {
        let key = format!("cancel-all:{symbol}:{tick_index}");
        self.metrics.orders.cancel_all_total.inc();
        match self.exchange.cancel_all(Some(symbol), &key).await {
            Ok(xids) => {
                info!(symbol = %symbol, count = xids.len(), "cancel-all issued");
            }
            Err(e) => warn!(symbol = %symbol, error = %e, "cancel-all failed"),
        }
        if let Err(e) = self.store.cancel_all_open(&key) {
            warn!(symbol = %symbol, error = %e, "store cancel-all failed");
        }
    }

    /// Refuse targets that would cross each other or quote through the mid.
    fn crossing_guard(
        &self,
        mid: Option<Decimal>,
        bid: Option<QuoteTarget>,
        ask: Option<QuoteTarget>,
    ) -> (Option<QuoteTarget>, Option<QuoteTarget>) {
        if let (Some(b), Some(a)) = (bid.as_ref(), ask.as_ref()) {
            if b.price >= a.price {
                self.metrics.orders.crossing_refused_total.inc();
                warn!(bid = %b.price, ask = %a.price, "refusing crossed quote pair");
                return (None, None);
            }
        }
        let mut bid = bid;
        let mut ask = ask;
        if let Some(mid) = mid {
            if bid.as_ref().map(|b| b.price >= mid).unwrap_or(false) {
                self.metrics.orders.crossing_refused_total.inc();
                bid = None;
            }
            if ask.as_ref().map(|a| a.price <= mid).unwrap_or(false) {
                self.metrics.orders.crossing_refused_total.inc();
                ask = None;
            }
        }
        (bid, ask)
    }

    fn current_order(&self, symbol: &Symbol, side: Side) -> Option<Order> {
        let mut open: Vec<Order> = self
            .store
            .list_open(Some(symbol))
            .into_iter()
            .filter(|o| o.side == side)
            .collect();
        open.sort_by_key(|o| o.created_ts);
        open.pop()
    }

    async fn reconcile_side(
        &self,
        symbol: &Symbol,
        side: Side,
        target: Option<QuoteTarget>,
        deadline: &TickDeadline,
    ) {
        if deadline.expired() {
            debug!(symbol = %symbol, side = %side, "deadline passed; discarding target");
            return;
        }
        let current = self.current_order(symbol, side);
        match (current, target) {
            (None, None) => {}
            (None, Some(target)) => self.place(symbol, side, target, deadline).await,
            (Some(order), None) => {
                self.cancel(&order).await;
            }
            (Some(order), Some(target)) => {
                self.amend_or_replace(symbol, side, order, target, deadline).await
            }
        }
    }

    async fn place(
        &self,
        symbol: &Symbol,
        side: Side,
        target: QuoteTarget,
        deadline: &TickDeadline,
    ) {
        if !self.guards.allow_place() {
            debug!(symbol = %symbol, side = %side, "placement suppressed by guards");
            return;
        }
        let filters = self.filters.get(symbol);
        if let Err(violation) = filters.validate(target.price, target.qty) {
            self.metrics
                .orders
                .pretrade_reject_total
                .with_label_values(&[violation.as_str()])
                .inc();
            warn!(symbol = %symbol, side = %side, reason = %violation, "pre-trade filter refusal");
            return;
        }
        if deadline.expired() {
            return;
        }

        let cid = self.next_cid(symbol, side);
        let intent = OrderIntent {
            client_order_id: cid.clone(),
            symbol: symbol.clone(),
            side,
            price: target.price,
            qty: target.qty,
        };
        if let Err(e) = self.store.place(intent.clone(), cid.as_str()) {
            warn!(cid = %cid, error = %e, "store refused placement");
            return;
        }

        match self.exchange.place(&intent, cid.as_str()).await {
            Ok(xid) => {
                let _ = self.store.record_ack(&cid, &xid, &format!("ack:{cid}"));
                self.metrics
                    .orders
                    .placed_total
                    .with_label_values(&[symbol.as_str(), side.tag()])
                    .inc();
            }
            Err(e) if e.is_transient() => {
                // Left pending; the reconciler resolves it either way.
                warn!(cid = %cid, error = %e, "place unresolved after retries");
            }
            Err(e) => {
                warn!(cid = %cid, error = %e, "place rejected");
                let _ = self
                    .store
                    .update_state(&cid, OrderState::Rejected, &format!("reject:{cid}"));
            }
        }
    }

    async fn cancel(&self, order: &Order) -> bool {
        let cid = &order.client_order_id;
        let Some(xid) = order.exchange_order_id.as_deref() else {
            // Never acknowledged; retire it locally.
            let _ = self
                .store
                .update_state(cid, OrderState::Canceled, &format!("cancel:{cid}"));
            return true;
        };
        let key = format!("cancel:{cid}");
        match self.exchange.cancel(xid, &key).await {
            Ok(CancelOutcome::Canceled) => {
                let _ = self.store.update_state(cid, OrderState::Canceled, &key);
                self.metrics
                    .orders
                    .canceled_total
                    .with_label_values(&[order.symbol.as_str(), order.side.tag()])
                    .inc();
                true
            }
            Ok(CancelOutcome::AlreadyDone) => {
                // Fill or cancel already landed exchange-side; events or the
                // reconciler will settle the store.
                debug!(cid = %cid, "cancel: already done on exchange");
                true
            }
            Err(e) => {
                warn!(cid = %cid, error = %e, "cancel failed");
                false
            }
        }
    }

    fn reduces_exposure(order: &Order, target: &QuoteTarget) -> bool {
        let qty_reduced = target.qty < order.remaining_qty();
        let away_from_touch = match order.side {
            Side::Buy => target.price < order.price,
            Side::Sell => target.price > order.price,
        };
        qty_reduced || away_from_touch
    }

    async fn amend_or_replace(
        &self,
        symbol: &Symbol,
        side: Side,
        order: Order,
        target: QuoteTarget,
        deadline: &TickDeadline,
    ) {
        // Targets express the quantity we want resting, so deltas compare
        // against the order's remaining quantity.
        let remaining = order.remaining_qty();
        if order.price == target.price && remaining == target.qty {
            return;
        }
        let filters = self.filters.get(symbol);
        if let Err(violation) = filters.validate(target.price, target.qty) {
            self.metrics
                .orders
                .pretrade_reject_total
                .with_label_values(&[violation.as_str()])
                .inc();
            return;
        }

        let (min_time_in_book_ms, price_threshold_bps, size_threshold, gap_ms) = {
            let cfg = self.cfg.read();
            let s = &cfg.strategy;
            (
                s.min_time_in_book_ms,
                s.amend_price_threshold_bps,
                s.amend_size_threshold,
                s.cancel_place_gap_ms,
            )
        };

        let price_delta_bps = ((target.price - order.price).abs() / order.price)
            .to_f64()
            .unwrap_or(f64::MAX)
            * 10_000.0;
        let size_delta = if remaining > Decimal::ZERO {
            ((target.qty - remaining).abs() / remaining)
                .to_f64()
                .unwrap_or(f64::MAX)
        } else {
            f64::MAX
        };
        let rested = order.time_in_book(epoch_ms()) >= min_time_in_book_ms;
        let amendable = rested
            && price_delta_bps <= price_threshold_bps
            && size_delta <= size_threshold
            && self.exchange.supports_amend();

        if amendable {
            if !self.guards.allow_amend(Self::reduces_exposure(&order, &target)) {
                debug!(cid = %order.client_order_id, "amend suppressed by guards");
                return;
            }
            let cid = order.client_order_id.clone();
            let rev = {
                let mut entry = self.amend_revs.entry(cid.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            let key = format!("amend:{cid}:{rev}");
            let xid = order.exchange_order_id.clone().unwrap_or_default();
            // New total keeps already-filled quantity and rests the target.
            let new_total = order.filled_qty + target.qty;
            match self
                .exchange
                .amend(&xid, Some(target.price), Some(new_total), &key)
                .await
            {
                Ok(AmendOutcome::Amended) => {
                    let _ = self
                        .store
                        .apply_amend(&cid, Some(target.price), Some(new_total), &key);
                    self.metrics
                        .orders
                        .amended_total
                        .with_label_values(&[symbol.as_str(), side.tag()])
                        .inc();
                    return;
                }
                Ok(AmendOutcome::FallbackRequired) => {
                    self.metrics.orders.amend_fallback_total.inc();
                    debug!(cid = %cid, "amend fallback; replacing");
                }
                Err(e) => {
                    warn!(cid = %cid, error = %e, "amend failed; replacing");
                }
            }
        }

        // Cancel + place, in that order, with a gap for the cancel to
        // propagate. Placement is a new order, so guards must allow it.
        if !self.guards.allow_place() {
            if Self::reduces_exposure(&order, &target) {
                // At SOFT the best we can do without placing is pull the
                // stale quote.
                self.cancel(&order).await;
            }
            return;
        }
        if !self.cancel(&order).await {
            return;
        }
        let gap = Duration::from_millis(gap_ms);
        if deadline.remaining() > gap {
            tokio::time::sleep(gap).await;
        }
        if deadline.expired() {
            // Next tick will place against an empty side.
            return;
        }
        self.place(symbol, side, target, deadline).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, GuardsConfig, StoreConfig};
    use crate::core::filters::{FilterSource, SymbolFilters};
    use crate::exchange::paper::PaperExchange;
    use parking_lot::RwLock;
    use rust_decimal_macros::dec;

    struct Fixture {
        writer: LifecycleWriter,
        paper: Arc<PaperExchange>,
        store: Arc<OrderStore>,
        guards: Arc<GuardEngine>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(OrderStore::new(StoreConfig {
            snapshot_dir: dir.path().to_path_buf(),
            ..StoreConfig::default()
        }));
        let paper = Arc::new(PaperExchange::new());
        let mut cfg = Config::for_symbols(vec!["X".into()]);
        cfg.strategy.min_time_in_book_ms = 0;
        cfg.strategy.cancel_place_gap_ms = 0;
        let shared: SharedConfig = Arc::new(RwLock::new(cfg));
        let filters = Arc::new(FilterRegistry::new());
        filters.insert(
            Symbol::from("X"),
            SymbolFilters {
                tick_size: dec!(0.01),
                lot_size: dec!(0.001),
                min_notional: dec!(10),
                source: FilterSource::Fetched,
            },
        );
        let mut gcfg = GuardsConfig::default();
        gcfg.min_dwell_s = 0.0;
        let guards = Arc::new(GuardEngine::new(gcfg));
        let metrics = Arc::new(BrimMetrics::new().unwrap());
        let writer = LifecycleWriter::new(
            shared,
            Arc::clone(&store),
            paper.clone() as Arc<dyn ExchangeApi>,
            filters,
            Arc::clone(&guards),
            metrics,
        );
        Fixture { writer, paper, store, guards, _dir: dir }
    }

    fn target(side: Side, price: Decimal) -> QuoteTarget {
        QuoteTarget {
            symbol: Symbol::from("X"),
            side,
            price,
            qty: dec!(1.0),
        }
    }

    fn deadline() -> TickDeadline {
        TickDeadline::new(Duration::from_millis(500), Duration::from_millis(1))
    }

    #[tokio::test]
    async fn places_both_sides_once() {
        let f = fixture();
        let sym = Symbol::from("X");
        f.writer
            .apply(
                &sym,
                1,
                Some(dec!(100.00)),
                Some(target(Side::Buy, dec!(99.95))),
                Some(target(Side::Sell, dec!(100.05))),
                false,
                &deadline(),
            )
            .await;

        assert_eq!(f.paper.open_order_count(), 2);
        let open = f.store.list_open(None);
        assert_eq!(open.len(), 2);
        assert!(open.iter().all(|o| o.state == OrderState::Open));
    }

    #[tokio::test]
    async fn one_order_per_side_across_ticks() {
        let f = fixture();
        let sym = Symbol::from("X");
        let d = deadline();
        for tick in 0..3 {
            f.writer
                .apply(
                    &sym,
                    tick,
                    Some(dec!(100.00)),
                    Some(target(Side::Buy, dec!(99.95))),
                    Some(target(Side::Sell, dec!(100.05))),
                    false,
                    &d,
                )
                .await;
        }
        // Identical targets: nothing new placed or amended.
        assert_eq!(f.paper.open_order_count(), 2);
        assert_eq!(f.store.list_open(None).len(), 2);
    }

    #[tokio::test]
    async fn small_delta_amends_in_place() {
        let f = fixture();
        let sym = Symbol::from("X");
        let d = deadline();
        f.writer
            .apply(&sym, 1, Some(dec!(100.00)), Some(target(Side::Buy, dec!(99.95))), None, false, &d)
            .await;
        let cid_before = f.store.list_open(None)[0].client_order_id.clone();

        // 2 bps move, within the 3 bps threshold.
        f.writer
            .apply(&sym, 2, Some(dec!(100.00)), Some(target(Side::Buy, dec!(99.93))), None, false, &d)
            .await;

        let open = f.store.list_open(None);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].client_order_id, cid_before, "amended, not replaced");
        assert_eq!(open[0].price, dec!(99.93));
        assert_eq!(f.paper.open_order_count(), 1);
    }

    #[tokio::test]
    async fn large_delta_cancels_and_replaces() {
        let f = fixture();
        let sym = Symbol::from("X");
        let d = deadline();
        f.writer
            .apply(&sym, 1, Some(dec!(100.00)), Some(target(Side::Buy, dec!(99.95))), None, false, &d)
            .await;
        let cid_before = f.store.list_open(None)[0].client_order_id.clone();

        // 45 bps move: beyond the amend threshold.
        f.writer
            .apply(&sym, 2, Some(dec!(100.00)), Some(target(Side::Buy, dec!(99.50))), None, false, &d)
            .await;

        let open = f.store.list_open(None);
        assert_eq!(open.len(), 1);
        assert_ne!(open[0].client_order_id, cid_before, "replaced with a fresh cid");
        assert_eq!(open[0].price, dec!(99.50));
        assert_eq!(f.paper.open_order_count(), 1);
    }

    #[tokio::test]
    async fn amend_fallback_turns_into_cancel_place() {
        let f = fixture();
        f.paper.set_supports_amend(false);
        let sym = Symbol::from("X");
        let d = deadline();
        f.writer
            .apply(&sym, 1, Some(dec!(100.00)), Some(target(Side::Buy, dec!(99.95))), None, false, &d)
            .await;
        let cid_before = f.store.list_open(None)[0].client_order_id.clone();

        f.writer
            .apply(&sym, 2, Some(dec!(100.00)), Some(target(Side::Buy, dec!(99.93))), None, false, &d)
            .await;

        let open = f.store.list_open(None);
        assert_eq!(open.len(), 1);
        assert_ne!(open[0].client_order_id, cid_before);
        assert_eq!(open[0].price, dec!(99.93));
    }

    #[tokio::test]
    async fn crossed_pair_is_refused() {
        let f = fixture();
        let sym = Symbol::from("X");
        f.writer
            .apply(
                &sym,
                1,
                Some(dec!(100.00)),
                Some(target(Side::Buy, dec!(100.10))),
                Some(target(Side::Sell, dec!(100.05))),
                false,
                &deadline(),
            )
            .await;
        assert_eq!(f.paper.open_order_count(), 0);
    }

    #[tokio::test]
    async fn bid_through_mid_is_refused() {
        let f = fixture();
        let sym = Symbol::from("X");
        f.writer
            .apply(
                &sym,
                1,
                Some(dec!(100.00)),
                Some(target(Side::Buy, dec!(100.01))),
                Some(target(Side::Sell, dec!(100.40))),
                false,
                &deadline(),
            )
            .await;
        // Only the sane ask went out.
        let open = f.store.list_open(None);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].side, Side::Sell);
    }

    #[tokio::test]
    async fn pretrade_filters_refuse_bad_qty() {
        let f = fixture();
        let sym = Symbol::from("X");
        let mut t = target(Side::Buy, dec!(99.95));
        t.qty = dec!(0.0001); // below lot size
        f.writer
            .apply(&sym, 1, Some(dec!(100.00)), Some(t), None, false, &deadline())
            .await;
        assert_eq!(f.paper.open_order_count(), 0);
    }

    #[tokio::test]
    async fn cancel_all_sweeps_store_and_exchange() {
        let f = fixture();
        let sym = Symbol::from("X");
        let d = deadline();
        f.writer
            .apply(
                &sym,
                1,
                Some(dec!(100.00)),
                Some(target(Side::Buy, dec!(99.95))),
                Some(target(Side::Sell, dec!(100.05))),
                false,
                &d,
            )
            .await;
        f.writer.apply(&sym, 2, None, None, None, true, &d).await;

        assert_eq!(f.paper.open_order_count(), 0);
        assert!(f.store.list_open(None).is_empty());
    }

    #[tokio::test]
    async fn hard_guard_blocks_placement() {
        let f = fixture();
        f.guards.force_hard("test");
        let sym = Symbol::from("X");
        f.writer
            .apply(
                &sym,
                1,
                Some(dec!(100.00)),
                Some(target(Side::Buy, dec!(99.95))),
                None,
                false,
                &deadline(),
            )
            .await;
        assert_eq!(f.paper.open_order_count(), 0);
    }

    #[tokio::test]
    async fn partial_fill_then_amend_to_remaining() {
        let f = fixture();
        let sym = Symbol::from("X");
        let d = deadline();
        f.writer
            .apply(&sym, 1, Some(dec!(100.00)), Some(target(Side::Buy, dec!(99.95))), None, false, &d)
            .await;
        let cid = f.store.list_open(None)[0].client_order_id.clone();
        // Fill 0.4 in the store (as the ingest would on a fill event).
        f.store.apply_fill(&cid, dec!(0.4), dec!(99.95), "fill:t:1").unwrap();

        // Remaining is 0.6; targeting 0.55 is a 8.3% size delta, inside the
        // 20% threshold, so this amends in place to a total of 0.95.
        let mut t = target(Side::Buy, dec!(99.95));
        t.qty = dec!(0.55);
        f.writer.apply(&sym, 2, Some(dec!(100.00)), Some(t), None, false, &d).await;
        let open = f.store.list_open(None);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].client_order_id, cid, "small size delta amends in place");
        assert_eq!(open[0].qty, dec!(0.95));
        assert_eq!(open[0].remaining_qty(), dec!(0.55));
    }
}
