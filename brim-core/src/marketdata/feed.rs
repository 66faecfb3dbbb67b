//! Market-data stream consumers
//!
//! One dispatcher task per stream: market events fan into the cache and the
//! queue tracker; a refresh worker services the cache's resync requests via
//! the adapter's book fetch. Gap detection is time-based: when no event
//! arrives within the invalidation window the cache is told the stream
//! gapped.

use crate::config::MdCacheConfig;
use crate::core::types::Symbol;
use crate::exchange::api::{ExchangeApi, MarketEvent};
use crate::marketdata::cache::MdCache;
use crate::monitoring::metrics::BrimMetrics;
use crate::pipeline::volatility::QueueTracker;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Shared view of stream liveness for the health endpoint.
#[derive(Clone)]
pub struct FeedStatus {
    last_event: Arc<Mutex<Instant>>,
}

impl Default for FeedStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedStatus {
    pub fn new() -> Self {
        Self {
            last_event: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn mark(&self) {
        *self.last_event.lock() = Instant::now();
    }

    pub fn silence(&self) -> Duration {
        self.last_event.lock().elapsed()
    }
}

/// Consume market events until shutdown; detects gaps by silence.
pub async fn run_market_dispatcher(
    cfg: MdCacheConfig,
    mut events: mpsc::UnboundedReceiver<MarketEvent>,
    cache: Arc<MdCache>,
    queues: Arc<QueueTracker>,
    status: FeedStatus,
    metrics: Arc<BrimMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let gap = Duration::from_millis(cfg.invalidate_on_ws_gap_ms);
    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(MarketEvent::Book(snapshot)) => {
                        status.mark();
                        cache.apply_snapshot(snapshot);
                    }
                    Some(MarketEvent::Trade { symbol, qty, .. }) => {
                        status.mark();
                        queues.record_trade(&symbol, qty);
                    }
                    None => {
                        warn!("market event stream closed");
                        return;
                    }
                }
            }
            _ = tokio::time::sleep(gap) => {
                let silence = status.silence();
                if silence >= gap {
                    metrics.md.stream_gaps_total.inc();
                    cache.note_stream_gap(silence);
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Service the cache's resync requests through the adapter.
pub async fn run_refresh_worker(
    mut requests: mpsc::UnboundedReceiver<Symbol>,
    exchange: Arc<dyn ExchangeApi>,
    cache: Arc<MdCache>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            request = requests.recv() => {
                match request {
                    Some(symbol) => match exchange.fetch_book(&symbol).await {
                        Ok(snapshot) => cache.apply_snapshot(snapshot),
                        Err(e) => debug!(symbol = %symbol, error = %e, "book resync failed"),
                    },
                    None => return,
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
