//! Freshness-aware market-data cache
//!
//! The cache exclusively owns book snapshots; consumers get copies tagged
//! with `age_ms` and how the request was satisfied. Streaming gaps and
//! sequence regressions invalidate a symbol and schedule a resync through
//! the adapter (the refresh worker in `feed.rs`).

use crate::config::MdCacheConfig;
use crate::core::types::{epoch_ms, Symbol};
use crate::marketdata::types::{BookSnapshot, CacheHit, CacheMode, CacheResult};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct CachedBook {
    snapshot: BookSnapshot,
    cached_at: Instant,
    stale: bool,
}

#[derive(Default)]
struct CacheStats {
    fresh_hits: AtomicU64,
    stale_hits: AtomicU64,
    miss_refresh: AtomicU64,
}

pub struct MdCache {
    cfg: MdCacheConfig,
    books: DashMap<Symbol, CachedBook>,
    refresh_tx: mpsc::UnboundedSender<Symbol>,
    stats: CacheStats,
}

impl MdCache {
    /// Returns the cache plus the receiver of resync requests; the feed's
    /// refresh worker consumes the receiver.
    pub fn new(cfg: MdCacheConfig) -> (Self, mpsc::UnboundedReceiver<Symbol>) {
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        (
            Self {
                cfg,
                books: DashMap::new(),
                refresh_tx,
                stats: CacheStats::default(),
            },
            refresh_rx,
        )
    }

    /// Store a snapshot arriving from the feed or a resync.
    ///
    /// A sequence regression means the upstream connection was rebuilt or
    /// delivered out of order; the symbol is marked stale and a resync is
    /// requested rather than serving a book that may have gone backwards.
    pub fn apply_snapshot(&self, mut snapshot: BookSnapshot) {
        snapshot.ts_cached = epoch_ms();
        let symbol = snapshot.symbol.clone();

        if let Some(mut entry) = self.books.get_mut(&symbol) {
            if snapshot.seq < entry.snapshot.seq {
                warn!(
                    symbol = %symbol,
                    have = entry.snapshot.seq,
                    got = snapshot.seq,
                    "sequence regression; invalidating cached book"
                );
                entry.stale = true;
                self.request_refresh(&symbol);
                return;
            }
            entry.snapshot = snapshot;
            entry.cached_at = Instant::now();
            entry.stale = false;
            return;
        }

        self.books.insert(
            symbol,
            CachedBook {
                snapshot,
                cached_at: Instant::now(),
                stale: false,
            },
        );
    }

    /// Called by the feed when no stream event arrived for `gap`.
    pub fn note_stream_gap(&self, gap: Duration) {
        if gap < Duration::from_millis(self.cfg.invalidate_on_ws_gap_ms) {
            return;
        }
        warn!(gap_ms = gap.as_millis() as u64, "stream gap; invalidating all cached books");
        for mut entry in self.books.iter_mut() {
            entry.stale = true;
        }
        let symbols: Vec<Symbol> = self.books.iter().map(|e| e.key().clone()).collect();
        for symbol in symbols {
            self.request_refresh(&symbol);
        }
    }

    fn request_refresh(&self, symbol: &Symbol) {
        // Receiver gone only during shutdown.
        let _ = self.refresh_tx.send(symbol.clone());
    }

    fn read(&self, symbol: &Symbol) -> Option<(BookSnapshot, u64, bool)> {
        self.books.get(symbol).map(|entry| {
            let age_ms = entry.cached_at.elapsed().as_millis() as u64;
            (entry.snapshot.clone(), age_ms, entry.stale)
        })
    }

    fn is_fresh(&self, age_ms: u64, stale: bool) -> bool {
        !stale && age_ms <= self.cfg.ttl_ms
    }

    /// Serve a snapshot for `symbol` under the given freshness mode.
    pub async fn get(&self, symbol: &Symbol, mode: CacheMode) -> Option<CacheResult> {
        match mode {
            CacheMode::FreshForPricing => {
                let (snapshot, age_ms, stale) = self.read(symbol)?;
                if !stale && age_ms <= self.cfg.fresh_ms_for_pricing {
                    self.stats.fresh_hits.fetch_add(1, Ordering::Relaxed);
                    return Some(CacheResult {
                        snapshot,
                        age_ms,
                        hit: CacheHit::FreshHit,
                        used_stale: false,
                    });
                }
                // Too old for pricing: serve what we have with downgraded
                // confidence and resync in the background.
                self.request_refresh(symbol);
                self.stats.stale_hits.fetch_add(1, Ordering::Relaxed);
                Some(CacheResult {
                    snapshot,
                    age_ms,
                    hit: CacheHit::StaleHit,
                    used_stale: true,
                })
            }
            CacheMode::StaleOk => {
                let (snapshot, age_ms, stale) = self.read(symbol)?;
                let fresh = self.is_fresh(age_ms, stale);
                if !fresh {
                    self.request_refresh(symbol);
                    self.stats.stale_hits.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.stats.fresh_hits.fetch_add(1, Ordering::Relaxed);
                }
                Some(CacheResult {
                    snapshot,
                    age_ms,
                    hit: if fresh { CacheHit::FreshHit } else { CacheHit::StaleHit },
                    used_stale: !fresh,
                })
            }
            CacheMode::FreshOnly => {
                if let Some((snapshot, age_ms, stale)) = self.read(symbol) {
                    if self.is_fresh(age_ms, stale) {
                        self.stats.fresh_hits.fetch_add(1, Ordering::Relaxed);
                        return Some(CacheResult {
                            snapshot,
                            age_ms,
                            hit: CacheHit::FreshHit,
                            used_stale: false,
                        });
                    }
                }
                // Stale or missing: request a refresh and wait, bounded.
                self.request_refresh(symbol);
                let waited = Instant::now();
                let budget = Duration::from_millis(self.cfg.fresh_only_wait_ms);
                while waited.elapsed() < budget {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    if let Some((snapshot, age_ms, stale)) = self.read(symbol) {
                        if self.is_fresh(age_ms, stale) {
                            self.stats.miss_refresh.fetch_add(1, Ordering::Relaxed);
                            return Some(CacheResult {
                                snapshot,
                                age_ms,
                                hit: CacheHit::MissRefresh,
                                used_stale: false,
                            });
                        }
                    }
                }
                // Refresh did not land in time; hand back the latest view.
                debug!(symbol = %symbol, "fresh_only refresh missed its budget");
                let (snapshot, age_ms, _) = self.read(symbol)?;
                self.stats.stale_hits.fetch_add(1, Ordering::Relaxed);
                Some(CacheResult {
                    snapshot,
                    age_ms,
                    hit: CacheHit::StaleHit,
                    used_stale: true,
                })
            }
        }
    }

    /// Fraction of requests served fresh; a testable target, not a rule.
    pub fn hit_ratio(&self) -> f64 {
        let fresh = self.stats.fresh_hits.load(Ordering::Relaxed)
            + self.stats.miss_refresh.load(Ordering::Relaxed);
        let total = fresh + self.stats.stale_hits.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        fresh as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marketdata::types::DepthLevel;
    use rust_decimal_macros::dec;

    fn snapshot(symbol: &str, seq: u64) -> BookSnapshot {
        BookSnapshot {
            symbol: Symbol::from(symbol),
            bids: vec![DepthLevel { price: dec!(99.99), qty: dec!(1) }],
            asks: vec![DepthLevel { price: dec!(100.01), qty: dec!(1) }],
            seq,
            ts_recv: epoch_ms(),
            ts_cached: 0,
        }
    }

    fn cache() -> (MdCache, mpsc::UnboundedReceiver<Symbol>) {
        MdCache::new(MdCacheConfig::default())
    }

    #[tokio::test]
    async fn fresh_snapshot_served_for_pricing() {
        let (cache, _rx) = cache();
        cache.apply_snapshot(snapshot("X", 1));

        let res = cache.get(&Symbol::from("X"), CacheMode::FreshForPricing).await.unwrap();
        assert_eq!(res.hit, CacheHit::FreshHit);
        assert!(!res.used_stale);
        assert!(res.age_ms <= 60);
    }

    #[tokio::test]
    async fn missing_symbol_returns_none() {
        let (cache, _rx) = cache();
        assert!(cache.get(&Symbol::from("Y"), CacheMode::StaleOk).await.is_none());
    }

    #[tokio::test]
    async fn sequence_regression_marks_stale_and_requests_resync() {
        let (cache, mut rx) = cache();
        cache.apply_snapshot(snapshot("X", 10));
        cache.apply_snapshot(snapshot("X", 4));

        assert_eq!(rx.try_recv().unwrap(), Symbol::from("X"));
        let res = cache.get(&Symbol::from("X"), CacheMode::StaleOk).await.unwrap();
        assert!(res.used_stale);
        // The regressed snapshot was not applied.
        assert_eq!(res.snapshot.seq, 10);
    }

    #[tokio::test]
    async fn stream_gap_invalidates_all_symbols() {
        let (cache, mut rx) = cache();
        cache.apply_snapshot(snapshot("X", 1));
        cache.apply_snapshot(snapshot("Y", 1));

        cache.note_stream_gap(Duration::from_millis(301));
        let res = cache.get(&Symbol::from("X"), CacheMode::StaleOk).await.unwrap();
        assert_eq!(res.hit, CacheHit::StaleHit);
        // Both symbols requested a resync.
        let mut requested = vec![rx.try_recv().unwrap(), rx.try_recv().unwrap()];
        requested.sort();
        assert_eq!(requested, vec![Symbol::from("X"), Symbol::from("Y")]);
    }

    #[tokio::test]
    async fn short_gap_is_ignored() {
        let (cache, mut rx) = cache();
        cache.apply_snapshot(snapshot("X", 1));
        cache.note_stream_gap(Duration::from_millis(100));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn hit_ratio_reflects_staleness() {
        let (cache, _rx) = cache();
        cache.apply_snapshot(snapshot("X", 1));
        let sym = Symbol::from("X");
        cache.get(&sym, CacheMode::FreshForPricing).await.unwrap();
        assert!((cache.hit_ratio() - 1.0).abs() < f64::EPSILON);
    }
}
