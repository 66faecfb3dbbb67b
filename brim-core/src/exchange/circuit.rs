//! Circuit gate over the exchange error stream
//!
//! ```text
//!     OPEN ──err-rate > max──→ TRIPPED ──cooldown──→ HALF_OPEN
//!       ▲                          ▲                     │
//!       │     probe_count oks      │   any probe failure │
//!       └──────────────────────────┴─────────────────────┘
//! ```
//!
//! Naming is historical and deliberate: OPEN means traffic is allowed,
//! TRIPPED means refused, HALF_OPEN means probing. Error/success events are
//! coalesced into per-second buckets, the error rate is evaluated over a
//! rolling window, and `min_dwell_s` suppresses flapping. A forced trip
//! (scheduler fault escalation) is a safety transition and ignores dwell.

use crate::config::CircuitConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Open,
    Tripped,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Tripped => "tripped",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Read-only view published to guards, health and metrics.
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub err_rate: f64,
    pub since_transition_s: f64,
}

struct SecondBucket {
    second: u64,
    ok: u64,
    err: u64,
}

struct LogLimiter {
    second: u64,
    emitted: u32,
    max_per_sec: u32,
}

impl LogLimiter {
    fn permit(&mut self, now_s: u64) -> bool {
        if now_s != self.second {
            self.second = now_s;
            self.emitted = 0;
        }
        if self.emitted < self.max_per_sec {
            self.emitted += 1;
            true
        } else {
            false
        }
    }
}

struct Inner {
    state: CircuitState,
    last_transition: Instant,
    buckets: VecDeque<SecondBucket>,
    probe_successes: u32,
    log_limiter: LogLimiter,
}

pub struct CircuitGate {
    cfg: CircuitConfig,
    started: Instant,
    inner: Mutex<Inner>,
}

impl CircuitGate {
    pub fn new(cfg: CircuitConfig) -> Self {
        let max_per_sec = cfg.max_log_lines_per_sec;
        Self {
            cfg,
            started: Instant::now(),
            inner: Mutex::new(Inner {
                state: CircuitState::Open,
                last_transition: Instant::now(),
                buckets: VecDeque::new(),
                probe_successes: 0,
                log_limiter: LogLimiter { second: 0, emitted: 0, max_per_sec },
            }),
        }
    }

    fn now_s(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// Whether a gated call may proceed. Performs the TRIPPED -> HALF_OPEN
    /// transition when the cooldown has elapsed.
    pub fn check(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Open | CircuitState::HalfOpen => true,
            CircuitState::Tripped => {
                let dwell = inner.last_transition.elapsed().as_secs();
                if dwell >= self.cfg.cooldown_s && dwell >= self.cfg.min_dwell_s {
                    self.transition(&mut inner, CircuitState::HalfOpen, "cooldown elapsed");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let now_s = self.now_s();
        let mut inner = self.inner.lock();
        Self::bucket_mut(&mut inner.buckets, now_s).ok += 1;

        if inner.state == CircuitState::HalfOpen {
            inner.probe_successes += 1;
            if inner.probe_successes >= self.cfg.probe_count {
                self.transition(&mut inner, CircuitState::Open, "probes succeeded");
            }
        }
    }

    pub fn record_failure(&self) {
        let now_s = self.now_s();
        let mut inner = self.inner.lock();
        Self::bucket_mut(&mut inner.buckets, now_s).err += 1;
        self.prune(&mut inner, now_s);

        match inner.state {
            CircuitState::HalfOpen => {
                // Any failure during probing re-trips immediately.
                self.transition(&mut inner, CircuitState::Tripped, "probe failed");
            }
            CircuitState::Open => {
                let dwell = inner.last_transition.elapsed().as_secs();
                let dwell_ok = dwell >= self.cfg.min_closed_s && dwell >= self.cfg.min_dwell_s;
                let (total, rate) = Self::window_rate(&inner.buckets);
                if dwell_ok && total >= self.cfg.min_samples && rate >= self.cfg.max_err_rate_ratio {
                    self.transition(&mut inner, CircuitState::Tripped, "error rate exceeded");
                }
            }
            CircuitState::Tripped => {}
        }
    }

    /// Safety trip, e.g. sustained scheduler faults. Ignores dwell.
    pub fn force_trip(&self, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Tripped {
            self.transition(&mut inner, CircuitState::Tripped, reason);
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        let (_, err_rate) = Self::window_rate(&inner.buckets);
        CircuitSnapshot {
            state: inner.state,
            err_rate,
            since_transition_s: inner.last_transition.elapsed().as_secs_f64(),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Error rate over the rolling window; exposed to the guard engine.
    pub fn err_rate(&self) -> f64 {
        let inner = self.inner.lock();
        Self::window_rate(&inner.buckets).1
    }

    fn bucket_mut(buckets: &mut VecDeque<SecondBucket>, second: u64) -> &mut SecondBucket {
        let needs_new = buckets.back().map(|b| b.second != second).unwrap_or(true);
        if needs_new {
            buckets.push_back(SecondBucket { second, ok: 0, err: 0 });
        }
        buckets.back_mut().expect("bucket just ensured")
    }

    fn prune(&self, inner: &mut Inner, now_s: u64) {
        let cutoff = now_s.saturating_sub(self.cfg.window_s);
        while inner.buckets.front().map(|b| b.second < cutoff).unwrap_or(false) {
            inner.buckets.pop_front();
        }
    }

    fn window_rate(buckets: &VecDeque<SecondBucket>) -> (u64, f64) {
        let (mut ok, mut err) = (0u64, 0u64);
        for b in buckets {
            ok += b.ok;
            err += b.err;
        }
        let total = ok + err;
        if total == 0 {
            (0, 0.0)
        } else {
            (total, err as f64 / total as f64)
        }
    }

    /// Single transition point: exactly one state change and at most one log
    /// line per trigger, subject to the log rate limit.
    fn transition(&self, inner: &mut Inner, to: CircuitState, why: &str) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.last_transition = Instant::now();
        if to == CircuitState::HalfOpen {
            inner.probe_successes = 0;
        }

        let now_s = self.now_s();
        if inner.log_limiter.permit(now_s) {
            match to {
                CircuitState::Tripped => {
                    warn!(from = from.as_str(), to = to.as_str(), why, "circuit transition")
                }
                _ => info!(from = from.as_str(), to = to.as_str(), why, "circuit transition"),
            }
        }
    }
}
