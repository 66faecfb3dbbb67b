//! Error taxonomy for the trading core
//!
//! Recoverable failures are modeled as typed errors and converted to tagged
//! outcomes at component boundaries; only truly unexpected faults bubble as
//! `anyhow` in the binaries. Exchange errors carry their retry class so the
//! adapter, circuit gate and reconciler agree on what is transient.

use crate::core::types::ClientOrderId;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the exchange adapter capability set.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    // Transient: retried with backoff, feeds the circuit gate.
    #[error("rate limited by exchange")]
    RateLimited,
    #[error("exchange unavailable: {0}")]
    Unavailable(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("exchange reports system busy")]
    Busy,

    // Fatal: surfaced to the caller, never retried.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("invalid signature or API key")]
    InvalidCredentials,
    #[error("unknown order: {0}")]
    UnknownOrder(String),

    // Local refusals: not exchange faults, never retried, never counted
    // against the error-rate window.
    #[error("circuit open; call refused")]
    CircuitOpen,
    #[error("rate limiter exhausted for {0}")]
    LimiterExhausted(&'static str),
}

impl ExchangeError {
    /// Whether the error may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited
                | Self::Unavailable(_)
                | Self::Timeout(_)
                | Self::Connection(_)
                | Self::Busy
        )
    }

    /// Whether the error should count against the circuit error-rate window.
    /// Local refusals do not: a tripped circuit must not feed itself.
    pub fn counts_against_circuit(&self) -> bool {
        !matches!(self, Self::CircuitOpen | Self::LimiterExhausted(_))
    }

    /// Metric label for the error class.
    pub fn class(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Unavailable(_) => "unavailable",
            Self::Timeout(_) => "timeout",
            Self::Connection(_) => "connection",
            Self::Busy => "busy",
            Self::InvalidParameter(_) => "invalid_parameter",
            Self::InvalidCredentials => "invalid_credentials",
            Self::UnknownOrder(_) => "unknown_order",
            Self::CircuitOpen => "circuit_open",
            Self::LimiterExhausted(_) => "limiter_exhausted",
        }
    }
}

/// Errors from the durable order store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown order {0}")]
    UnknownOrder(ClientOrderId),
    #[error("illegal state transition {from} -> {to} for {cid}")]
    IllegalTransition {
        cid: ClientOrderId,
        from: &'static str,
        to: &'static str,
    },
    #[error("fill of {fill_qty} would exceed order qty {qty} for {cid}")]
    Overfill {
        cid: ClientOrderId,
        fill_qty: rust_decimal::Decimal,
        qty: rust_decimal::Decimal,
    },
    #[error("duplicate client order id {0}")]
    DuplicateOrder(ClientOrderId),
    #[error("snapshot corrupt at line {line}: {reason}")]
    SnapshotCorrupt { line: usize, reason: String },
    #[error("snapshot io: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Configuration validation failures. Fatal at startup; at runtime an invalid
/// update is rejected atomically and the previous configuration stays live.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("config key {0} is not runtime-mutable; restart required")]
    NotRuntimeMutable(String),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors from credential resolution.
#[derive(Debug, Error)]
pub enum SecretError {
    #[error("credential source unavailable: {0}")]
    Unavailable(String),
    #[error("credential io: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_matches_taxonomy() {
        assert!(ExchangeError::RateLimited.is_transient());
        assert!(ExchangeError::Busy.is_transient());
        assert!(ExchangeError::Timeout(Duration::from_secs(10)).is_transient());
        assert!(!ExchangeError::InvalidCredentials.is_transient());
        assert!(!ExchangeError::UnknownOrder("x".into()).is_transient());
        assert!(!ExchangeError::CircuitOpen.is_transient());
    }

    #[test]
    fn local_refusals_do_not_feed_the_circuit() {
        assert!(!ExchangeError::CircuitOpen.counts_against_circuit());
        assert!(!ExchangeError::LimiterExhausted("orders").counts_against_circuit());
        assert!(ExchangeError::Timeout(Duration::from_secs(1)).counts_against_circuit());
        assert!(ExchangeError::InvalidParameter("p".into()).counts_against_circuit());
    }
}
