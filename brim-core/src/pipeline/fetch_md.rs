//! FetchMD stage: pull the pricing snapshot from the MD-cache.

use crate::marketdata::cache::MdCache;
use crate::marketdata::types::CacheMode;
use crate::monitoring::metrics::BrimMetrics;
use crate::pipeline::volatility::VolTracker;
use crate::pipeline::{Stage, StageOutcome, TickContext, TickDeadline};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

pub struct FetchMdStage {
    cache: Arc<MdCache>,
    vol: Arc<VolTracker>,
    metrics: Arc<BrimMetrics>,
}

impl FetchMdStage {
    pub fn new(cache: Arc<MdCache>, vol: Arc<VolTracker>, metrics: Arc<BrimMetrics>) -> Self {
        Self { cache, vol, metrics }
    }
}

#[async_trait]
impl Stage for FetchMdStage {
    fn name(&self) -> &'static str {
        "fetch_md"
    }

    async fn run(&self, cx: &mut TickContext, _deadline: &TickDeadline) -> StageOutcome {
        let serve_started = Instant::now();
        let result = self.cache.get(&cx.symbol, CacheMode::FreshForPricing).await;
        self.metrics
            .md
            .cache_serve_ms
            .observe(serve_started.elapsed().as_secs_f64() * 1_000.0);

        let Some(result) = result else {
            // Never seen a book for this symbol; nothing to price against.
            debug!(symbol = %cx.symbol, "no cached book; skipping pricing");
            return StageOutcome::GuardBlocked;
        };

        self.metrics
            .md
            .cache_requests_total
            .with_label_values(&[result.hit.as_str()])
            .inc();
        self.metrics.md.cache_age_ms.observe(result.age_ms as f64);

        cx.mid = result.snapshot.mid();
        if let Some(mid) = cx.mid {
            self.vol.observe_mid(&cx.symbol, mid);
        }
        cx.book = Some(result);
        StageOutcome::Ok
    }
}
