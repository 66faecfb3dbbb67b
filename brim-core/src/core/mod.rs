//! Core domain types, symbol filters and the error taxonomy.

pub mod errors;
pub mod filters;
pub mod types;

pub use errors::{ConfigError, ExchangeError, SecretError, StoreError};
pub use filters::{FilterRegistry, FilterSource, FilterViolation, SymbolFilters};
pub use types::{
    epoch_ms, ClientOrderId, Fill, Inventory, Order, OrderIntent, OrderState, QuoteTarget, Side,
    Symbol,
};
