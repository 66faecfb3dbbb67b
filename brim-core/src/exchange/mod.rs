//! Exchange adapter: capability interface, resilience decorators, and the
//! in-process paper venue.

pub mod api;
pub mod circuit;
pub mod guarded;
pub mod idempotency;
pub mod paper;
pub mod rate_limit;
pub mod retry;

pub use api::{
    AmendOutcome, CancelOutcome, EndpointClass, ExchangeApi, MarketEvent, UserEvent,
};
pub use circuit::{CircuitGate, CircuitSnapshot, CircuitState};
pub use guarded::GuardedExchange;
pub use idempotency::IdemCache;
pub use paper::PaperExchange;
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;
