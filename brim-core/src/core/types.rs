//! Core domain types shared by every component
//!
//! Prices and quantities are exact decimals; all rounding is explicit and
//! biased so that rounding never makes a quote worse for us (buy prices round
//! down, sell prices round up, sizes round down).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

/// Wall-clock milliseconds since the Unix epoch.
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

/// A trading pair identifier, e.g. "BTCUSDT". Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Order side (Buy or Sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Short tag used in client order ids and metric labels.
    pub fn tag(self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Client-assigned order identifier; unique per order and the idempotency key
/// for the entire write path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientOrderId(String);

impl ClientOrderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientOrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Order lifecycle state.
///
/// Transitions follow `pending -> open -> (partially_filled)* -> filled |
/// canceled | rejected`. Terminal states are sticky: once an order is filled,
/// canceled or rejected no further transition is legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Rejected)
    }

    /// Whether `self -> next` is a legal lifecycle transition.
    ///
    /// A transition to the same state is legal for non-terminal states (an
    /// exchange may re-confirm `open`); terminal states accept nothing, which
    /// makes them sticky.
    pub fn can_transition_to(self, next: OrderState) -> bool {
        use OrderState::*;
        match self {
            Pending => matches!(next, Pending | Open | PartiallyFilled | Filled | Canceled | Rejected),
            Open => matches!(next, Open | PartiallyFilled | Filled | Canceled | Rejected),
            PartiallyFilled => matches!(next, PartiallyFilled | Filled | Canceled),
            Filled | Canceled | Rejected => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Open => "open",
            Self::PartiallyFilled => "partially_filled",
            Self::Filled => "filled",
            Self::Canceled => "canceled",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The canonical local record of an intended or live order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub client_order_id: ClientOrderId,
    pub exchange_order_id: Option<String>,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub state: OrderState,
    pub created_ts: u64,
    pub updated_ts: u64,
    /// Milliseconds this order has rested in the book; maintained on update.
    pub time_in_book_ms: u64,
}

impl Order {
    /// Create a fresh `pending` order from an intent.
    pub fn new(intent: OrderIntent, now_ms: u64) -> Self {
        Self {
            client_order_id: intent.client_order_id,
            exchange_order_id: None,
            symbol: intent.symbol,
            side: intent.side,
            price: intent.price,
            qty: intent.qty,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            state: OrderState::Pending,
            created_ts: now_ms,
            updated_ts: now_ms,
            time_in_book_ms: 0,
        }
    }

    pub fn remaining_qty(&self) -> Decimal {
        self.qty - self.filled_qty
    }

    pub fn is_open(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Time this order has been resting, measured from creation.
    pub fn time_in_book(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.created_ts)
    }

    /// Fold a fill into this order: quantity, weighted average price, and the
    /// resulting state. The caller has already validated the fill quantity.
    pub fn apply_fill(&mut self, fill_qty: Decimal, fill_price: Decimal, now_ms: u64) {
        let prev_notional = self.avg_fill_price.unwrap_or(Decimal::ZERO) * self.filled_qty;
        self.filled_qty += fill_qty;
        if self.filled_qty > Decimal::ZERO {
            self.avg_fill_price =
                Some((prev_notional + fill_price * fill_qty) / self.filled_qty);
        }
        self.state = if self.filled_qty >= self.qty {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        self.touch(now_ms);
    }

    pub fn touch(&mut self, now_ms: u64) {
        self.updated_ts = now_ms;
        self.time_in_book_ms = self.time_in_book(now_ms);
    }
}

/// Parameters of a new order before the store has accepted it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub client_order_id: ClientOrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
}

/// A trade execution against one of our orders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub client_order_id: ClientOrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    /// Fee paid; negative values are maker rebates.
    pub fee: Decimal,
    /// Exchange-assigned event sequence, used to reorder late deliveries.
    pub exchange_event_seq: u64,
    pub ts: u64,
}

impl Fill {
    /// Signed position change: buys increase, sells decrease.
    pub fn position_change(&self) -> Decimal {
        match self.side {
            Side::Buy => self.qty,
            Side::Sell => -self.qty,
        }
    }

    pub fn notional(&self) -> Decimal {
        self.price * self.qty
    }
}

/// A desired resting quote the pipeline wants live this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteTarget {
    pub symbol: Symbol,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
}

/// Signed per-symbol position plus aggregated notional; updated only from
/// fills.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    /// Base units; positive = long, negative = short.
    pub position: Decimal,
    /// Signed notional of all fills (buys negative cash flow).
    pub notional: Decimal,
}

impl Inventory {
    pub fn apply(&mut self, fill: &Fill) {
        self.position += fill.position_change();
        match fill.side {
            Side::Buy => self.notional -= fill.notional(),
            Side::Sell => self.notional += fill.notional(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn intent(cid: &str, side: Side) -> OrderIntent {
        OrderIntent {
            client_order_id: ClientOrderId::from(cid),
            symbol: Symbol::from("BTCUSDT"),
            side,
            price: dec!(100.00),
            qty: dec!(1.0),
        }
    }

    #[test]
    fn state_machine_accepts_lifecycle_path() {
        use OrderState::*;
        assert!(Pending.can_transition_to(Open));
        assert!(Open.can_transition_to(PartiallyFilled));
        assert!(PartiallyFilled.can_transition_to(PartiallyFilled));
        assert!(PartiallyFilled.can_transition_to(Filled));
        assert!(Open.can_transition_to(Canceled));
        assert!(Pending.can_transition_to(Rejected));
    }

    #[test]
    fn terminal_states_are_sticky() {
        use OrderState::*;
        for terminal in [Filled, Canceled, Rejected] {
            for next in [Pending, Open, PartiallyFilled, Filled, Canceled, Rejected] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn fill_updates_weighted_average() {
        let mut order = Order::new(intent("a", Side::Buy), 1_000);
        order.state = OrderState::Open;

        order.apply_fill(dec!(0.4), dec!(99.95), 1_100);
        assert_eq!(order.state, OrderState::PartiallyFilled);
        assert_eq!(order.filled_qty, dec!(0.4));
        assert_eq!(order.avg_fill_price, Some(dec!(99.95)));

        order.apply_fill(dec!(0.6), dec!(100.05), 1_200);
        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.filled_qty, dec!(1.0));
        // (0.4 * 99.95 + 0.6 * 100.05) / 1.0
        assert_eq!(order.avg_fill_price, Some(dec!(100.01)));
    }

    #[test]
    fn inventory_tracks_signed_fills() {
        let mut inv = Inventory::default();
        let buy = Fill {
            client_order_id: ClientOrderId::from("a"),
            symbol: Symbol::from("BTCUSDT"),
            side: Side::Buy,
            price: dec!(100),
            qty: dec!(0.4),
            fee: Decimal::ZERO,
            exchange_event_seq: 1,
            ts: 0,
        };
        inv.apply(&buy);
        assert_eq!(inv.position, dec!(0.4));
        assert_eq!(inv.notional, dec!(-40));

        let sell = Fill { side: Side::Sell, qty: dec!(0.4), ..buy };
        inv.apply(&sell);
        assert_eq!(inv.position, Decimal::ZERO);
        assert_eq!(inv.notional, Decimal::ZERO);
    }

    #[test]
    fn time_in_book_measured_from_creation() {
        let order = Order::new(intent("a", Side::Sell), 5_000);
        assert_eq!(order.time_in_book(5_700), 700);
        assert_eq!(order.time_in_book(4_000), 0);
    }
}
