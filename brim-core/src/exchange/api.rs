//! Exchange capability interface
//!
//! All communication with an exchange goes through this trait; concrete
//! REST/WS wiring is an implementation detail behind it. The lifecycle
//! manager consumes the trait, which breaks any dependency cycle between
//! order management and transport.
//!
//! Every mutating call carries an `idem_key`; conforming adapters must
//! de-duplicate retries within their configured window by returning the
//! cached result of the first successful attempt.

use crate::core::errors::ExchangeError;
use crate::core::filters::SymbolFilters;
use crate::core::types::{ClientOrderId, Fill, Order, OrderIntent, OrderState, Symbol};
use crate::marketdata::types::BookSnapshot;
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

/// Outcome of an amend attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmendOutcome {
    Amended,
    /// The exchange (or this order's venue) cannot amend in place; the
    /// caller must fall back to cancel+place.
    FallbackRequired,
}

/// Outcome of a cancel attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    /// The order was already filled or canceled on the exchange.
    AlreadyDone,
}

/// Endpoint classes for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Orders,
    Queries,
    Stream,
}

impl EndpointClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Orders => "orders",
            Self::Queries => "queries",
            Self::Stream => "stream",
        }
    }
}

/// Streaming account events: order acknowledgements, state changes, fills.
#[derive(Debug, Clone)]
pub enum UserEvent {
    OrderUpdate {
        client_order_id: ClientOrderId,
        exchange_order_id: String,
        state: OrderState,
        filled_qty: Decimal,
        avg_fill_price: Option<Decimal>,
        exchange_event_seq: u64,
        ts: u64,
    },
    Fill(Fill),
}

impl UserEvent {
    pub fn seq(&self) -> u64 {
        match self {
            Self::OrderUpdate { exchange_event_seq, .. } => *exchange_event_seq,
            Self::Fill(f) => f.exchange_event_seq,
        }
    }
}

/// Streaming market events.
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Book(BookSnapshot),
    Trade {
        symbol: Symbol,
        price: Decimal,
        qty: Decimal,
        ts: u64,
    },
}

/// The capability set a conforming exchange adapter implements.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn place(&self, intent: &OrderIntent, idem_key: &str) -> Result<String, ExchangeError>;

    async fn amend(
        &self,
        exchange_order_id: &str,
        new_price: Option<Decimal>,
        new_qty: Option<Decimal>,
        idem_key: &str,
    ) -> Result<AmendOutcome, ExchangeError>;

    async fn cancel(&self, exchange_order_id: &str, idem_key: &str)
        -> Result<CancelOutcome, ExchangeError>;

    /// Cancel every open order, optionally scoped to one symbol. Returns the
    /// exchange ids that were canceled.
    async fn cancel_all(
        &self,
        symbol: Option<&Symbol>,
        idem_key: &str,
    ) -> Result<Vec<String>, ExchangeError>;

    async fn fetch_open_orders(&self, symbol: Option<&Symbol>) -> Result<Vec<Order>, ExchangeError>;

    async fn fetch_recent_history(
        &self,
        symbol: Option<&Symbol>,
        since_ts: u64,
        limit: usize,
    ) -> Result<Vec<Order>, ExchangeError>;

    /// Full book snapshot; used by the market-data cache for resync.
    async fn fetch_book(&self, symbol: &Symbol) -> Result<BookSnapshot, ExchangeError>;

    async fn fetch_symbol_filters(&self, symbol: &Symbol) -> Result<SymbolFilters, ExchangeError>;

    /// Subscribe to the account event stream. The adapter owns reconnection;
    /// the returned channel never closes short of shutdown.
    fn stream_user_events(&self) -> mpsc::UnboundedReceiver<UserEvent>;

    /// Subscribe to book/trade events for `symbols`; same lifetime contract
    /// as `stream_user_events`.
    fn stream_market_events(&self, symbols: &[Symbol]) -> mpsc::UnboundedReceiver<MarketEvent>;

    /// Whether in-place amend is supported at all.
    fn supports_amend(&self) -> bool;

    /// Health probe; bypasses the circuit gate.
    async fn ping(&self) -> Result<(), ExchangeError>;
}
