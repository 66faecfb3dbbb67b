//! The per-tick quote pipeline
//!
//! Ordered stages transform a `TickContext` from market snapshot to a
//! desired quote set: FetchMD -> Spread -> Guards -> InventorySkew ->
//! QueueAware -> Emit. Stages return tagged outcomes instead of raising;
//! the runner enforces the tick deadline at stage boundaries and jumps
//! straight to Emit when guards block pricing (so a HARD level still turns
//! into a cancel-all).

pub mod emit;
pub mod fetch_md;
pub mod guard_stage;
pub mod inventory;
pub mod queue_aware;
pub mod spread;
pub mod volatility;

pub use volatility::{QueueTracker, VolTracker};

use crate::config::Config;
use crate::core::types::{QuoteTarget, Symbol};
use crate::marketdata::types::CacheResult;
use crate::monitoring::metrics::BrimMetrics;
use crate::risk::guards::GuardLevel;
use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Config shared between the app and the stages; replaced atomically on a
/// validated hot reload.
pub type SharedConfig = Arc<RwLock<Config>>;

/// Deadline context threaded through every stage; checked at stage
/// boundaries and I/O suspension points.
#[derive(Debug, Clone, Copy)]
pub struct TickDeadline {
    started: Instant,
    deadline: Instant,
    min_emit_budget: Duration,
}

impl TickDeadline {
    pub fn new(budget: Duration, min_emit_budget: Duration) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started + budget,
            min_emit_budget,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// True when what remains cannot cover even a minimal Emit.
    pub fn emit_budget_exhausted(&self) -> bool {
        self.remaining() < self.min_emit_budget
    }
}

/// Per-symbol working state for one tick.
pub struct TickContext {
    pub symbol: Symbol,
    pub tick_index: u64,
    pub book: Option<CacheResult>,
    pub mid: Option<Decimal>,
    pub spread_bps: f64,
    pub bid: Option<QuoteTarget>,
    pub ask: Option<QuoteTarget>,
    pub guard_level: GuardLevel,
    pub cancel_all_required: bool,
    pub stage_latencies: Vec<(&'static str, Duration)>,
}

impl TickContext {
    pub fn new(symbol: Symbol, tick_index: u64) -> Self {
        Self {
            symbol,
            tick_index,
            book: None,
            mid: None,
            spread_bps: 0.0,
            bid: None,
            ask: None,
            guard_level: GuardLevel::Ok,
            cancel_all_required: false,
            stage_latencies: Vec::with_capacity(6),
        }
    }
}

/// Tagged stage result; only truly unexpected faults use `Err` paths
/// elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Ok,
    /// Pricing is pointless this tick; jump to Emit (which may cancel-all).
    GuardBlocked,
    DeadlineMissed,
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run(&self, cx: &mut TickContext, deadline: &TickDeadline) -> StageOutcome;
}

/// Result of one pipeline execution for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickResult {
    Completed { guard_blocked: bool },
    DeadlineMiss,
}

pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    metrics: Arc<BrimMetrics>,
}

impl Pipeline {
    /// `stages` must end with the Emit stage.
    pub fn new(stages: Vec<Arc<dyn Stage>>, metrics: Arc<BrimMetrics>) -> Self {
        Self { stages, metrics }
    }

    pub async fn run_tick(
        &self,
        symbol: Symbol,
        tick_index: u64,
        deadline: TickDeadline,
    ) -> TickResult {
        let mut cx = TickContext::new(symbol, tick_index);
        let last = self.stages.len() - 1;
        let mut idx = 0;
        let mut guard_blocked = false;

        while idx <= last {
            let is_emit = idx == last;
            if deadline.emit_budget_exhausted() {
                debug!(
                    symbol = %cx.symbol,
                    stage = self.stages[idx].name(),
                    elapsed_ms = deadline.elapsed().as_millis() as u64,
                    "tick aborted: emit budget exhausted"
                );
                self.metrics.tick.deadline_miss_total.inc();
                return TickResult::DeadlineMiss;
            }

            let stage = &self.stages[idx];
            let started = Instant::now();
            let outcome = stage.run(&mut cx, &deadline).await;
            let took = started.elapsed();
            cx.stage_latencies.push((stage.name(), took));
            self.metrics
                .tick
                .stage_duration_ms
                .with_label_values(&[stage.name()])
                .observe(took.as_secs_f64() * 1_000.0);

            match outcome {
                StageOutcome::Ok => idx += 1,
                StageOutcome::GuardBlocked => {
                    guard_blocked = true;
                    self.metrics.tick.guard_blocked_total.inc();
                    idx = if is_emit { last + 1 } else { last };
                }
                StageOutcome::DeadlineMissed => {
                    self.metrics.tick.deadline_miss_total.inc();
                    return TickResult::DeadlineMiss;
                }
            }
        }

        TickResult::Completed { guard_blocked }
    }
}
