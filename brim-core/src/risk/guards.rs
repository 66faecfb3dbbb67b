//! Tri-state operational guards with hysteresis
//!
//! Eight live signals feed two threshold sets (soft, hard). A predicate must
//! hold for `t_enter_s` before its level engages and stay clear for
//! `t_exit_s` (strictly longer) before it releases, so the level cannot
//! chatter on a noisy signal. The composite level is the max over all
//! predicates; reasons are the union.
//!
//! HARD can also be forced externally (hard desync, sustained reconcile
//! failure). A forced reason releases only after its originator clears it
//! and the hard `t_exit_s` has elapsed.

use crate::config::GuardsConfig;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GuardLevel {
    Ok,
    Soft,
    Hard,
}

impl GuardLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Soft => "soft",
            Self::Hard => "hard",
        }
    }

    pub fn rank(self) -> i64 {
        match self {
            Self::Ok => 0,
            Self::Soft => 1,
            Self::Hard => 2,
        }
    }
}

/// Live inputs, all normalized to plain numbers by the signal hub.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardSignals {
    pub inventory_skew: f64,
    pub realized_vol_bps: f64,
    pub latency_p95_ms: f64,
    pub err_rate: f64,
    pub drawdown: f64,
    pub daily_loss: f64,
    pub pnl_deviation: f64,
    pub clock_drift_ms: f64,
}

const PREDICATES: [&str; 8] = [
    "inventory_skew",
    "realized_vol",
    "latency",
    "err_rate",
    "drawdown",
    "daily_loss",
    "pnl_deviation",
    "clock_drift",
];

#[derive(Debug, Clone)]
pub struct GuardState {
    pub level: GuardLevel,
    pub reasons: BTreeSet<String>,
    pub since: Instant,
}

impl GuardState {
    fn ok() -> Self {
        Self {
            level: GuardLevel::Ok,
            reasons: BTreeSet::new(),
            since: Instant::now(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Hysteresis {
    above_since: Option<Instant>,
    below_since: Option<Instant>,
    active: bool,
}

impl Hysteresis {
    fn update(&mut self, breached: bool, now: Instant, t_enter: Duration, t_exit: Duration) -> bool {
        if breached {
            self.below_since = None;
            let since = *self.above_since.get_or_insert(now);
            if now.duration_since(since) >= t_enter {
                self.active = true;
            }
        } else {
            self.above_since = None;
            let since = *self.below_since.get_or_insert(now);
            if self.active && now.duration_since(since) >= t_exit {
                self.active = false;
            }
        }
        self.active
    }
}

#[derive(Default)]
struct LevelTrackers {
    trackers: [Hysteresis; 8],
}

impl LevelTrackers {
    fn evaluate(
        &mut self,
        signals: &GuardSignals,
        thresholds: &crate::config::GuardThresholds,
        now: Instant,
    ) -> BTreeSet<String> {
        let breaches = [
            signals.inventory_skew >= thresholds.max_inventory_skew,
            signals.realized_vol_bps >= thresholds.max_realized_vol_bps,
            signals.latency_p95_ms >= thresholds.max_latency_p95_ms,
            signals.err_rate >= thresholds.max_err_rate_ratio,
            signals.drawdown >= thresholds.max_drawdown,
            signals.daily_loss >= thresholds.max_daily_loss,
            signals.pnl_deviation.abs() >= thresholds.max_pnl_deviation,
            signals.clock_drift_ms >= thresholds.max_clock_drift_ms,
        ];
        let t_enter = Duration::from_secs_f64(thresholds.t_enter_s);
        let t_exit = Duration::from_secs_f64(thresholds.t_exit_s);

        let mut reasons = BTreeSet::new();
        for (idx, breached) in breaches.into_iter().enumerate() {
            if self.trackers[idx].update(breached, now, t_enter, t_exit) {
                reasons.insert(PREDICATES[idx].to_string());
            }
        }
        reasons
    }
}

#[derive(Debug, Clone, Copy)]
struct Forced {
    cleared_at: Option<Instant>,
}

struct EngineInner {
    soft: LevelTrackers,
    hard: LevelTrackers,
    forced: BTreeMap<String, Forced>,
    state: GuardState,
    hard_entered: Option<Instant>,
}

pub struct GuardEngine {
    cfg: GuardsConfig,
    inner: Mutex<EngineInner>,
}

impl GuardEngine {
    pub fn new(cfg: GuardsConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(EngineInner {
                soft: LevelTrackers::default(),
                hard: LevelTrackers::default(),
                forced: BTreeMap::new(),
                state: GuardState::ok(),
                hard_entered: None,
            }),
        }
    }

    /// Re-evaluate all predicates against fresh signals.
    pub fn evaluate(&self, signals: &GuardSignals) -> GuardState {
        self.evaluate_at(signals, Instant::now())
    }

    pub fn evaluate_at(&self, signals: &GuardSignals, now: Instant) -> GuardState {
        let mut inner = self.inner.lock();

        let hard_exit = Duration::from_secs_f64(self.cfg.hard.t_exit_s);
        inner.forced.retain(|_, f| match f.cleared_at {
            Some(at) => now.duration_since(at) < hard_exit,
            None => true,
        });

        let mut hard_reasons = inner.hard.evaluate(signals, &self.cfg.hard, now);
        for reason in inner.forced.keys() {
            hard_reasons.insert(reason.clone());
        }
        let soft_reasons = inner.soft.evaluate(signals, &self.cfg.soft, now);

        let min_dwell = Duration::from_secs_f64(self.cfg.min_dwell_s);
        let dwell_holds = matches!(
            (inner.state.level, inner.hard_entered),
            (GuardLevel::Hard, Some(at)) if now.duration_since(at) < min_dwell
        );

        let (level, reasons) = if !hard_reasons.is_empty() {
            (GuardLevel::Hard, hard_reasons)
        } else if dwell_holds {
            let mut reasons = BTreeSet::new();
            reasons.insert("min_dwell".to_string());
            (GuardLevel::Hard, reasons)
        } else if !soft_reasons.is_empty() {
            (GuardLevel::Soft, soft_reasons)
        } else {
            (GuardLevel::Ok, BTreeSet::new())
        };

        if level != inner.state.level {
            match level {
                GuardLevel::Hard => warn!(reasons = ?reasons, "guard level -> HARD"),
                GuardLevel::Soft => warn!(reasons = ?reasons, "guard level -> SOFT"),
                GuardLevel::Ok => info!("guard level -> OK"),
            }
            if level == GuardLevel::Hard {
                inner.hard_entered = Some(now);
            }
            inner.state = GuardState {
                level,
                reasons,
                since: now,
            };
        } else {
            inner.state.reasons = reasons;
        }

        inner.state.clone()
    }

    /// Force HARD with `reason` until cleared; used by the reconciler for
    /// `hard_desync` and sustained failure escalation.
    pub fn force_hard(&self, reason: &str) {
        let mut inner = self.inner.lock();
        warn!(reason, "guard HARD forced");
        inner.forced.insert(reason.to_string(), Forced { cleared_at: None });
        inner.hard_entered = Some(Instant::now());
        let mut reasons = inner.state.reasons.clone();
        reasons.insert(reason.to_string());
        inner.state = GuardState {
            level: GuardLevel::Hard,
            reasons,
            since: Instant::now(),
        };
    }

    /// Start releasing a forced reason; it drops out of the reason set after
    /// the hard `t_exit_s` has elapsed with the condition clean.
    pub fn clear_forced(&self, reason: &str) {
        let mut inner = self.inner.lock();
        if let Some(forced) = inner.forced.get_mut(reason) {
            if forced.cleared_at.is_none() {
                info!(reason, "guard forced reason clearing");
                forced.cleared_at = Some(Instant::now());
            }
        }
    }

    pub fn snapshot(&self) -> GuardState {
        self.inner.lock().state.clone()
    }

    pub fn level(&self) -> GuardLevel {
        self.inner.lock().state.level
    }

    /// Placement is allowed only at OK.
    pub fn allow_place(&self) -> bool {
        self.level() == GuardLevel::Ok
    }

    /// Amends are allowed at OK; at SOFT only when the amend reduces
    /// exposure; never at HARD.
    pub fn allow_amend(&self, reduces_exposure: bool) -> bool {
        match self.level() {
            GuardLevel::Ok => true,
            GuardLevel::Soft => reduces_exposure,
            GuardLevel::Hard => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardsConfig;

    fn fast_cfg() -> GuardsConfig {
        let mut cfg = GuardsConfig::default();
        cfg.soft.t_enter_s = 0.0;
        cfg.soft.t_exit_s = 0.05;
        cfg.hard.t_enter_s = 0.0;
        cfg.hard.t_exit_s = 0.05;
        cfg.min_dwell_s = 0.0;
        cfg
    }

    fn breach_soft() -> GuardSignals {
        GuardSignals {
            err_rate: 0.15, // above soft 0.10, below hard 0.30
            ..Default::default()
        }
    }

    fn breach_hard() -> GuardSignals {
        GuardSignals {
            err_rate: 0.5,
            ..Default::default()
        }
    }

    #[test]
    fn ok_by_default() {
        let engine = GuardEngine::new(fast_cfg());
        let state = engine.evaluate(&GuardSignals::default());
        assert_eq!(state.level, GuardLevel::Ok);
        assert!(state.reasons.is_empty());
    }

    #[test]
    fn soft_breach_yields_soft_with_reason() {
        let engine = GuardEngine::new(fast_cfg());
        let state = engine.evaluate(&breach_soft());
        assert_eq!(state.level, GuardLevel::Soft);
        assert!(state.reasons.contains("err_rate"));
    }

    #[test]
    fn hard_dominates_soft() {
        let engine = GuardEngine::new(fast_cfg());
        let state = engine.evaluate(&breach_hard());
        assert_eq!(state.level, GuardLevel::Hard);
    }

    #[test]
    fn t_enter_delays_engagement() {
        let mut cfg = fast_cfg();
        cfg.soft.t_enter_s = 60.0;
        cfg.soft.t_exit_s = 120.0;
        let engine = GuardEngine::new(cfg);
        // Breached, but not held long enough.
        let state = engine.evaluate(&breach_soft());
        assert_eq!(state.level, GuardLevel::Ok);
    }

    #[test]
    fn t_exit_delays_release() {
        let mut cfg = fast_cfg();
        cfg.soft.t_exit_s = 3_600.0;
        let engine = GuardEngine::new(cfg);
        assert_eq!(engine.evaluate(&breach_soft()).level, GuardLevel::Soft);
        // Signal back to normal, but exit dwell not served.
        assert_eq!(engine.evaluate(&GuardSignals::default()).level, GuardLevel::Soft);
    }

    #[test]
    fn hysteresis_releases_after_t_exit() {
        let engine = GuardEngine::new(fast_cfg());
        assert_eq!(engine.evaluate(&breach_soft()).level, GuardLevel::Soft);
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(engine.evaluate(&GuardSignals::default()).level, GuardLevel::Ok);
    }

    #[test]
    fn forced_hard_persists_until_cleared_plus_exit() {
        let engine = GuardEngine::new(fast_cfg());
        engine.force_hard("hard_desync");
        assert_eq!(engine.level(), GuardLevel::Hard);
        assert!(engine.snapshot().reasons.contains("hard_desync"));

        // Still hard right after clearing.
        engine.clear_forced("hard_desync");
        assert_eq!(engine.evaluate(&GuardSignals::default()).level, GuardLevel::Hard);

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(engine.evaluate(&GuardSignals::default()).level, GuardLevel::Ok);
    }

    #[test]
    fn min_dwell_pins_hard() {
        let mut cfg = fast_cfg();
        cfg.min_dwell_s = 3_600.0;
        let engine = GuardEngine::new(cfg);
        engine.evaluate(&breach_hard());
        std::thread::sleep(Duration::from_millis(80));
        let state = engine.evaluate(&GuardSignals::default());
        assert_eq!(state.level, GuardLevel::Hard);
        assert!(state.reasons.contains("min_dwell"));
    }

    #[test]
    fn amend_policy_by_level() {
        let engine = GuardEngine::new(fast_cfg());
        assert!(engine.allow_place());
        assert!(engine.allow_amend(false));

        engine.evaluate(&breach_soft());
        assert!(!engine.allow_place());
        assert!(engine.allow_amend(true));
        assert!(!engine.allow_amend(false));

        engine.force_hard("test");
        assert!(!engine.allow_amend(true));
    }
}
