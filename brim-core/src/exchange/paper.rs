//! In-process paper exchange
//!
//! A conforming `ExchangeApi` with no network: orders rest in a map, trades
//! cross them, acks and fills go out on the user-event stream. Paper mode
//! runs against this adapter, and the integration tests drive it directly
//! (fill injection, amend capability toggling, transient-failure injection).

use crate::core::errors::ExchangeError;
use crate::core::filters::{FilterSource, SymbolFilters};
use crate::core::types::{
    epoch_ms, ClientOrderId, Fill, Order, OrderIntent, OrderState, Side, Symbol,
};
use crate::exchange::api::{
    AmendOutcome, CancelOutcome, ExchangeApi, MarketEvent, UserEvent,
};
use crate::marketdata::types::BookSnapshot;
use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
enum PaperReply {
    Place(String),
    Cancel(CancelOutcome),
    CancelAll(Vec<String>),
}

struct PaperState {
    open: HashMap<String, Order>,
    history: Vec<Order>,
    books: HashMap<Symbol, BookSnapshot>,
    filters: HashMap<Symbol, SymbolFilters>,
    idem: HashMap<String, PaperReply>,
    next_id: u64,
    next_seq: u64,
}

pub struct PaperExchange {
    state: Mutex<PaperState>,
    user_subs: Mutex<Vec<mpsc::UnboundedSender<UserEvent>>>,
    market_subs: Mutex<Vec<mpsc::UnboundedSender<MarketEvent>>>,
    supports_amend: AtomicBool,
    /// Transient failures to inject into the next mutating calls.
    fail_next: AtomicU32,
    maker_rebate_bps: Decimal,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PaperState {
                open: HashMap::new(),
                history: Vec::new(),
                books: HashMap::new(),
                filters: HashMap::new(),
                idem: HashMap::new(),
                next_id: 1,
                next_seq: 1,
            }),
            user_subs: Mutex::new(Vec::new()),
            market_subs: Mutex::new(Vec::new()),
            supports_amend: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            maker_rebate_bps: dec!(-0.2),
        }
    }

    // ---- simulation & test controls -------------------------------------

    pub fn set_supports_amend(&self, supported: bool) {
        self.supports_amend.store(supported, Ordering::SeqCst);
    }

    /// The next `n` mutating calls fail with a transient error.
    pub fn fail_next_calls(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_filters(&self, symbol: Symbol, filters: SymbolFilters) {
        self.state.lock().filters.insert(symbol, filters);
    }

    /// Publish a book snapshot to market subscribers and the query path.
    pub fn set_book(&self, snapshot: BookSnapshot) {
        self.state.lock().books.insert(snapshot.symbol.clone(), snapshot.clone());
        self.broadcast_market(MarketEvent::Book(snapshot));
    }

    /// Print a trade: broadcast it and cross any resting paper orders.
    pub fn emit_trade(&self, symbol: &Symbol, price: Decimal, qty: Decimal) {
        self.broadcast_market(MarketEvent::Trade {
            symbol: symbol.clone(),
            price,
            qty,
            ts: epoch_ms(),
        });
        self.cross_orders(symbol, price, qty);
    }

    /// Fill a resting order directly by client order id.
    pub fn fill_order(&self, cid: &ClientOrderId, qty: Decimal, price: Decimal) {
        let xid = {
            let state = self.state.lock();
            state
                .open
                .iter()
                .find(|(_, o)| &o.client_order_id == cid)
                .map(|(xid, _)| xid.clone())
        };
        if let Some(xid) = xid {
            self.apply_fill(&xid, qty, price);
        }
    }

    pub fn open_order_count(&self) -> usize {
        self.state.lock().open.len()
    }

    /// Drop an order from the paper book without any user event, simulating
    /// state the bot never heard about. Test hook for desync scenarios.
    pub fn silently_drop(&self, cid: &ClientOrderId, terminal: OrderState) {
        let mut state = self.state.lock();
        let xid = state
            .open
            .iter()
            .find(|(_, o)| &o.client_order_id == cid)
            .map(|(xid, _)| xid.clone());
        if let Some(xid) = xid {
            if let Some(mut order) = state.open.remove(&xid) {
                order.state = terminal;
                if terminal == OrderState::Filled {
                    order.filled_qty = order.qty;
                    order.avg_fill_price = Some(order.price);
                }
                order.updated_ts = epoch_ms();
                state.history.push(order);
            }
        }
    }

    /// Insert an exchange-side order the store never placed (an orphan).
    pub fn inject_orphan(&self, order: Order) -> String {
        let mut state = self.state.lock();
        let xid = format!("X-{}", state.next_id);
        state.next_id += 1;
        let mut order = order;
        order.exchange_order_id = Some(xid.clone());
        state.open.insert(xid.clone(), order);
        xid
    }

    // ---- internals ------------------------------------------------------

    fn take_injected_failure(&self) -> Option<ExchangeError> {
        let mut remaining = self.fail_next.load(Ordering::SeqCst);
        loop {
            if remaining == 0 {
                return None;
            }
            match self.fail_next.compare_exchange(
                remaining,
                remaining - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Some(ExchangeError::Unavailable("injected".to_string())),
                Err(actual) => remaining = actual,
            }
        }
    }

    fn broadcast_user(&self, event: UserEvent) {
        self.user_subs.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn broadcast_market(&self, event: MarketEvent) {
        self.market_subs.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn next_seq(&self) -> u64 {
        let mut state = self.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        seq
    }

    fn order_update_event(&self, order: &Order, seq: u64) -> UserEvent {
        UserEvent::OrderUpdate {
            client_order_id: order.client_order_id.clone(),
            exchange_order_id: order.exchange_order_id.clone().unwrap_or_default(),
            state: order.state,
            filled_qty: order.filled_qty,
            avg_fill_price: order.avg_fill_price,
            exchange_event_seq: seq,
            ts: epoch_ms(),
        }
    }

    fn apply_fill(&self, xid: &str, qty: Decimal, price: Decimal) {
        let now = epoch_ms();
        let (order, fill) = {
            let mut state = self.state.lock();
            let Some(order) = state.open.get_mut(xid) else { return };
            let fill_qty = qty.min(order.remaining_qty());
            if fill_qty <= Decimal::ZERO {
                return;
            }
            order.apply_fill(fill_qty, price, now);
            let fee = -(price * fill_qty * self.maker_rebate_bps.abs() / dec!(10000));
            let fill = Fill {
                client_order_id: order.client_order_id.clone(),
                symbol: order.symbol.clone(),
                side: order.side,
                price,
                qty: fill_qty,
                fee,
                exchange_event_seq: 0, // assigned below
                ts: now,
            };
            let order = order.clone();
            if order.state == OrderState::Filled {
                state.open.remove(xid);
                state.history.push(order.clone());
            }
            (order, fill)
        };

        let mut fill = fill;
        fill.exchange_event_seq = self.next_seq();
        self.broadcast_user(UserEvent::Fill(fill));
        let seq = self.next_seq();
        self.broadcast_user(self.order_update_event(&order, seq));
    }

    fn cross_orders(&self, symbol: &Symbol, price: Decimal, qty: Decimal) {
        let crossed: Vec<String> = {
            let state = self.state.lock();
            state
                .open
                .iter()
                .filter(|(_, o)| {
                    &o.symbol == symbol
                        && match o.side {
                            Side::Buy => price <= o.price,
                            Side::Sell => price >= o.price,
                        }
                })
                .map(|(xid, _)| xid.clone())
                .collect()
        };
        for xid in crossed {
            self.apply_fill(&xid, qty, price);
        }
    }
}

#[async_trait]
impl ExchangeApi for PaperExchange {
    async fn place(&self, intent: &OrderIntent, idem_key: &str) -> Result<String, ExchangeError> {
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }
        {
            let state = self.state.lock();
            if let Some(PaperReply::Place(xid)) = state.idem.get(idem_key) {
                return Ok(xid.clone());
            }
        }

        let now = epoch_ms();
        let (order, xid) = {
            let mut state = self.state.lock();
            let xid = format!("X-{}", state.next_id);
            state.next_id += 1;
            let mut order = Order::new(intent.clone(), now);
            order.exchange_order_id = Some(xid.clone());
            order.state = OrderState::Open;
            state.open.insert(xid.clone(), order.clone());
            state
                .idem
                .insert(idem_key.to_string(), PaperReply::Place(xid.clone()));
            (order, xid)
        };

        let seq = self.next_seq();
        self.broadcast_user(self.order_update_event(&order, seq));
        Ok(xid)
    }

    async fn amend(
        &self,
        exchange_order_id: &str,
        new_price: Option<Decimal>,
        new_qty: Option<Decimal>,
        _idem_key: &str,
    ) -> Result<AmendOutcome, ExchangeError> {
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }
        if !self.supports_amend.load(Ordering::SeqCst) {
            return Ok(AmendOutcome::FallbackRequired);
        }

        let order = {
            let mut state = self.state.lock();
            let order = state
                .open
                .get_mut(exchange_order_id)
                .ok_or_else(|| ExchangeError::UnknownOrder(exchange_order_id.to_string()))?;
            if let Some(price) = new_price {
                order.price = price;
            }
            if let Some(qty) = new_qty {
                order.qty = qty;
            }
            order.updated_ts = epoch_ms();
            order.clone()
        };

        let seq = self.next_seq();
        self.broadcast_user(self.order_update_event(&order, seq));
        Ok(AmendOutcome::Amended)
    }

    async fn cancel(
        &self,
        exchange_order_id: &str,
        idem_key: &str,
    ) -> Result<CancelOutcome, ExchangeError> {
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }
        {
            let state = self.state.lock();
            if let Some(PaperReply::Cancel(outcome)) = state.idem.get(idem_key) {
                return Ok(*outcome);
            }
        }

        let now = epoch_ms();
        let canceled = {
            let mut state = self.state.lock();
            match state.open.remove(exchange_order_id) {
                Some(mut order) => {
                    order.state = OrderState::Canceled;
                    order.updated_ts = now;
                    state.history.push(order.clone());
                    state
                        .idem
                        .insert(idem_key.to_string(), PaperReply::Cancel(CancelOutcome::Canceled));
                    Some(order)
                }
                None => {
                    let done = state
                        .history
                        .iter()
                        .any(|o| o.exchange_order_id.as_deref() == Some(exchange_order_id));
                    if done {
                        state.idem.insert(
                            idem_key.to_string(),
                            PaperReply::Cancel(CancelOutcome::AlreadyDone),
                        );
                        None
                    } else {
                        return Err(ExchangeError::UnknownOrder(exchange_order_id.to_string()));
                    }
                }
            }
        };

        match canceled {
            Some(order) => {
                let seq = self.next_seq();
                self.broadcast_user(self.order_update_event(&order, seq));
                Ok(CancelOutcome::Canceled)
            }
            None => Ok(CancelOutcome::AlreadyDone),
        }
    }

    async fn cancel_all(
        &self,
        symbol: Option<&Symbol>,
        idem_key: &str,
    ) -> Result<Vec<String>, ExchangeError> {
        {
            let state = self.state.lock();
            if let Some(PaperReply::CancelAll(xids)) = state.idem.get(idem_key) {
                return Ok(xids.clone());
            }
        }

        let now = epoch_ms();
        let canceled: Vec<Order> = {
            let mut state = self.state.lock();
            let xids: Vec<String> = state
                .open
                .iter()
                .filter(|(_, o)| symbol.map(|s| &o.symbol == s).unwrap_or(true))
                .map(|(xid, _)| xid.clone())
                .collect();
            let mut canceled = Vec::with_capacity(xids.len());
            for xid in &xids {
                if let Some(mut order) = state.open.remove(xid) {
                    order.state = OrderState::Canceled;
                    order.updated_ts = now;
                    state.history.push(order.clone());
                    canceled.push(order);
                }
            }
            state
                .idem
                .insert(idem_key.to_string(), PaperReply::CancelAll(xids));
            canceled
        };

        let xids = canceled
            .iter()
            .filter_map(|o| o.exchange_order_id.clone())
            .collect();
        for order in canceled {
            let seq = self.next_seq();
            self.broadcast_user(self.order_update_event(&order, seq));
        }
        Ok(xids)
    }

    async fn fetch_open_orders(&self, symbol: Option<&Symbol>) -> Result<Vec<Order>, ExchangeError> {
        let state = self.state.lock();
        Ok(state
            .open
            .values()
            .filter(|o| symbol.map(|s| &o.symbol == s).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn fetch_recent_history(
        &self,
        symbol: Option<&Symbol>,
        since_ts: u64,
        limit: usize,
    ) -> Result<Vec<Order>, ExchangeError> {
        let state = self.state.lock();
        Ok(state
            .history
            .iter()
            .rev()
            .filter(|o| o.updated_ts >= since_ts)
            .filter(|o| symbol.map(|s| &o.symbol == s).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn fetch_book(&self, symbol: &Symbol) -> Result<BookSnapshot, ExchangeError> {
        let state = self.state.lock();
        state
            .books
            .get(symbol)
            .cloned()
            .ok_or_else(|| ExchangeError::Unavailable(format!("no book for {symbol}")))
    }

    async fn fetch_symbol_filters(&self, symbol: &Symbol) -> Result<SymbolFilters, ExchangeError> {
        let state = self.state.lock();
        Ok(state.filters.get(symbol).cloned().unwrap_or(SymbolFilters {
            source: FilterSource::Fetched,
            ..SymbolFilters::default_for(symbol)
        }))
    }

    fn stream_user_events(&self) -> mpsc::UnboundedReceiver<UserEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.user_subs.lock().push(tx);
        rx
    }

    fn stream_market_events(&self, _symbols: &[Symbol]) -> mpsc::UnboundedReceiver<MarketEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.market_subs.lock().push(tx);
        rx
    }

    fn supports_amend(&self) -> bool {
        self.supports_amend.load(Ordering::SeqCst)
    }

    async fn ping(&self) -> Result<(), ExchangeError> {
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn intent(cid: &str, side: Side, price: Decimal) -> OrderIntent {
        OrderIntent {
            client_order_id: ClientOrderId::from(cid),
            symbol: Symbol::from("BTCUSDT"),
            side,
            price,
            qty: dec!(1.0),
        }
    }

    #[tokio::test]
    async fn place_is_idempotent_per_key() {
        let ex = PaperExchange::new();
        let i = intent("a", Side::Buy, dec!(99.95));
        let x1 = ex.place(&i, "k1").await.unwrap();
        let x2 = ex.place(&i, "k1").await.unwrap();
        assert_eq!(x1, x2);
        assert_eq!(ex.open_order_count(), 1);
    }

    #[tokio::test]
    async fn cancel_twice_with_same_key_is_one_cancel() {
        let ex = PaperExchange::new();
        let xid = ex.place(&intent("a", Side::Buy, dec!(99.95)), "k1").await.unwrap();
        assert_eq!(ex.cancel(&xid, "c1").await.unwrap(), CancelOutcome::Canceled);
        assert_eq!(ex.cancel(&xid, "c1").await.unwrap(), CancelOutcome::Canceled);
        // A different key on an already-done order reports AlreadyDone.
        assert_eq!(ex.cancel(&xid, "c2").await.unwrap(), CancelOutcome::AlreadyDone);
    }

    #[tokio::test]
    async fn trade_crossing_fills_resting_buy() {
        let ex = PaperExchange::new();
        let mut user_rx = ex.stream_user_events();
        let sym = Symbol::from("BTCUSDT");
        ex.place(&intent("a", Side::Buy, dec!(99.95)), "k1").await.unwrap();
        user_rx.try_recv().unwrap(); // ack

        ex.emit_trade(&sym, dec!(99.90), dec!(0.4));
        match user_rx.try_recv().unwrap() {
            UserEvent::Fill(f) => {
                assert_eq!(f.qty, dec!(0.4));
                assert_eq!(f.price, dec!(99.90));
                assert!(f.fee < Decimal::ZERO, "maker rebate expected");
            }
            other => panic!("expected fill, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn amend_fallback_when_unsupported() {
        let ex = PaperExchange::new();
        let xid = ex.place(&intent("a", Side::Sell, dec!(100.05)), "k1").await.unwrap();
        ex.set_supports_amend(false);
        let out = ex.amend(&xid, Some(dec!(100.07)), None, "a1").await.unwrap();
        assert_eq!(out, AmendOutcome::FallbackRequired);
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let ex = PaperExchange::new();
        ex.fail_next_calls(1);
        let err = ex.place(&intent("a", Side::Buy, dec!(99.95)), "k1").await.unwrap_err();
        assert!(err.is_transient());
        // Next call goes through.
        ex.place(&intent("a", Side::Buy, dec!(99.95)), "k1").await.unwrap();
    }
}
