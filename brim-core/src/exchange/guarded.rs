//! Guarded exchange adapter
//!
//! Decorates a concrete `ExchangeApi` with the operational machinery every
//! venue gets: per-REST-call timeout, transient-error retry with
//! deterministic jitter, the token-bucket rate limiter, the circuit gate,
//! and idempotency de-duplication of mutations.
//!
//! Gate allowlist: health probes, `cancel_all` and reconciliation reads go
//! through even when the circuit is tripped. Everything still reports
//! success/failure to the gate so probes can close it again.

use crate::config::ExchangeConfig;
use crate::core::errors::ExchangeError;
use crate::core::filters::SymbolFilters;
use crate::core::types::{Order, OrderIntent, Symbol};
use crate::exchange::api::{
    AmendOutcome, CancelOutcome, EndpointClass, ExchangeApi, MarketEvent, UserEvent,
};
use crate::exchange::circuit::CircuitGate;
use crate::exchange::idempotency::IdemCache;
use crate::exchange::rate_limit::RateLimiter;
use crate::exchange::retry::RetryPolicy;
use crate::marketdata::types::BookSnapshot;
use crate::monitoring::metrics::BrimMetrics;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct GuardedExchange {
    inner: Arc<dyn ExchangeApi>,
    gate: Arc<CircuitGate>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    rest_timeout: Duration,
    metrics: Arc<BrimMetrics>,
    place_cache: IdemCache<String>,
    amend_cache: IdemCache<AmendOutcome>,
    cancel_cache: IdemCache<CancelOutcome>,
    cancel_all_cache: IdemCache<Vec<String>>,
}

impl GuardedExchange {
    pub fn new(
        inner: Arc<dyn ExchangeApi>,
        gate: Arc<CircuitGate>,
        limiter: Arc<RateLimiter>,
        cfg: &ExchangeConfig,
        metrics: Arc<BrimMetrics>,
    ) -> Self {
        let idem_ttl = Duration::from_millis(cfg.idem_window_ms);
        Self {
            inner,
            gate,
            limiter,
            retry: RetryPolicy::new(
                Duration::from_millis(cfg.retry_base_ms),
                Duration::from_millis(cfg.retry_max_ms),
                cfg.retry_max_attempts,
            ),
            rest_timeout: Duration::from_millis(cfg.rest_timeout_ms),
            metrics,
            place_cache: IdemCache::new(idem_ttl),
            amend_cache: IdemCache::new(idem_ttl),
            cancel_cache: IdemCache::new(idem_ttl),
            cancel_all_cache: IdemCache::new(idem_ttl),
        }
    }

    pub fn gate(&self) -> &Arc<CircuitGate> {
        &self.gate
    }

    async fn with_timeout<T>(
        &self,
        fut: impl Future<Output = Result<T, ExchangeError>>,
    ) -> Result<T, ExchangeError> {
        match tokio::time::timeout(self.rest_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Timeout(self.rest_timeout)),
        }
    }

    /// Shared call path: optional gate, rate limit, retry loop with timeout,
    /// gate feedback and metrics.
    async fn call<T, F, Fut>(
        &self,
        op: &'static str,
        class: EndpointClass,
        gated: bool,
        idem_key: &str,
        mut attempt_fn: F,
    ) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        self.metrics.exchange.calls_total.with_label_values(&[op]).inc();

        if gated && !self.gate.check() {
            self.metrics
                .exchange
                .errors_total
                .with_label_values(&["circuit_open"])
                .inc();
            return Err(ExchangeError::CircuitOpen);
        }

        self.limiter.acquire(class).await;

        let gate = Arc::clone(&self.gate);
        let metrics = Arc::clone(&self.metrics);
        let result = self
            .retry
            .run(
                idem_key,
                |_| self.with_timeout(attempt_fn()),
                move |outcome| match outcome {
                    Ok(_) => gate.record_success(),
                    Err(err) if err.counts_against_circuit() => {
                        metrics.exchange.errors_total.with_label_values(&[err.class()]).inc();
                        gate.record_failure();
                    }
                    Err(_) => {}
                },
            )
            .await;

        result
    }
}

#[async_trait]
impl ExchangeApi for GuardedExchange {
    async fn place(&self, intent: &OrderIntent, idem_key: &str) -> Result<String, ExchangeError> {
        if let Some(cached) = self.place_cache.get(idem_key) {
            self.metrics.exchange.idem_hits_total.inc();
            return Ok(cached);
        }
        let inner = &self.inner;
        let result = self
            .call("place", EndpointClass::Orders, true, idem_key, || {
                inner.place(intent, idem_key)
            })
            .await?;
        self.place_cache.put(idem_key, result.clone());
        Ok(result)
    }

    async fn amend(
        &self,
        exchange_order_id: &str,
        new_price: Option<Decimal>,
        new_qty: Option<Decimal>,
        idem_key: &str,
    ) -> Result<AmendOutcome, ExchangeError> {
        if let Some(cached) = self.amend_cache.get(idem_key) {
            self.metrics.exchange.idem_hits_total.inc();
            return Ok(cached);
        }
        let inner = &self.inner;
        let result = self
            .call("amend", EndpointClass::Orders, true, idem_key, || {
                inner.amend(exchange_order_id, new_price, new_qty, idem_key)
            })
            .await?;
        self.amend_cache.put(idem_key, result);
        Ok(result)
    }

    async fn cancel(
        &self,
        exchange_order_id: &str,
        idem_key: &str,
    ) -> Result<CancelOutcome, ExchangeError> {
        if let Some(cached) = self.cancel_cache.get(idem_key) {
            self.metrics.exchange.idem_hits_total.inc();
            return Ok(cached);
        }
        let inner = &self.inner;
        let result = self
            .call("cancel", EndpointClass::Orders, true, idem_key, || {
                inner.cancel(exchange_order_id, idem_key)
            })
            .await?;
        self.cancel_cache.put(idem_key, result);
        Ok(result)
    }

    async fn cancel_all(
        &self,
        symbol: Option<&Symbol>,
        idem_key: &str,
    ) -> Result<Vec<String>, ExchangeError> {
        if let Some(cached) = self.cancel_all_cache.get(idem_key) {
            self.metrics.exchange.idem_hits_total.inc();
            return Ok(cached);
        }
        // Allowlisted: a safety sweep must work while the circuit is tripped.
        let inner = &self.inner;
        let result = self
            .call("cancel_all", EndpointClass::Orders, false, idem_key, || {
                inner.cancel_all(symbol, idem_key)
            })
            .await?;
        self.cancel_all_cache.put(idem_key, result.clone());
        Ok(result)
    }

    async fn fetch_open_orders(&self, symbol: Option<&Symbol>) -> Result<Vec<Order>, ExchangeError> {
        let inner = &self.inner;
        self.call("fetch_open_orders", EndpointClass::Queries, false, "fetch_open_orders", || {
            inner.fetch_open_orders(symbol)
        })
        .await
    }

    async fn fetch_recent_history(
        &self,
        symbol: Option<&Symbol>,
        since_ts: u64,
        limit: usize,
    ) -> Result<Vec<Order>, ExchangeError> {
        let inner = &self.inner;
        self.call("fetch_recent_history", EndpointClass::Queries, false, "fetch_recent_history", || {
            inner.fetch_recent_history(symbol, since_ts, limit)
        })
        .await
    }

    async fn fetch_book(&self, symbol: &Symbol) -> Result<BookSnapshot, ExchangeError> {
        let inner = &self.inner;
        self.call("fetch_book", EndpointClass::Queries, false, "fetch_book", || {
            inner.fetch_book(symbol)
        })
        .await
    }

    async fn fetch_symbol_filters(&self, symbol: &Symbol) -> Result<SymbolFilters, ExchangeError> {
        let inner = &self.inner;
        self.call("fetch_symbol_filters", EndpointClass::Queries, false, "fetch_symbol_filters", || {
            inner.fetch_symbol_filters(symbol)
        })
        .await
    }

    fn stream_user_events(&self) -> mpsc::UnboundedReceiver<UserEvent> {
        self.inner.stream_user_events()
    }

    fn stream_market_events(&self, symbols: &[Symbol]) -> mpsc::UnboundedReceiver<MarketEvent> {
        self.inner.stream_market_events(symbols)
    }

    fn supports_amend(&self) -> bool {
        self.inner.supports_amend()
    }

    async fn ping(&self) -> Result<(), ExchangeError> {
        // Health probe: bypasses the gate but reports into it, which is what
        // drives HALF_OPEN probing while quoting is paused.
        let inner = &self.inner;
        self.call("ping", EndpointClass::Queries, false, "ping", || inner.ping())
            .await
    }
}
