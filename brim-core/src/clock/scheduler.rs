//! Tick scheduler
//!
//! Drives the quote pipeline on a fixed monotonic cadence. The tick phase is
//! `tick_index * tick_interval`; a tick that fires while the previous one is
//! still running is skipped, never queued. Each tick runs under a deadline
//! context the pipeline checks at stage boundaries. Consecutive scheduler
//! faults beyond a threshold trip the circuit with `scheduler_fault`.

use crate::exchange::circuit::CircuitGate;
use crate::monitoring::metrics::BrimMetrics;
use crate::pipeline::{TickDeadline, TickResult};
use crate::risk::signals::SignalHub;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant as TokioInstant, MissedTickBehavior};
use tracing::{error, warn};

pub struct TickScheduler {
    interval: Duration,
    deadline: Duration,
    min_emit_budget: Duration,
    fault_threshold: u32,
    gate: Arc<CircuitGate>,
    metrics: Arc<BrimMetrics>,
    hub: Arc<SignalHub>,
}

impl TickScheduler {
    pub fn new(
        interval: Duration,
        deadline: Duration,
        min_emit_budget: Duration,
        fault_threshold: u32,
        gate: Arc<CircuitGate>,
        metrics: Arc<BrimMetrics>,
        hub: Arc<SignalHub>,
    ) -> Self {
        Self {
            interval,
            deadline,
            min_emit_budget,
            fault_threshold,
            gate,
            metrics,
            hub,
        }
    }

    /// Run until `shutdown` flips. `on_tick` executes one pipeline pass for
    /// all symbols in the group; ticks are strictly sequential here, which
    /// is what guarantees a single execution at a time per symbol group.
    pub async fn run<F, Fut>(&self, mut on_tick: F, mut shutdown: watch::Receiver<bool>)
    where
        F: FnMut(u64, TickDeadline) -> Fut,
        Fut: Future<Output = anyhow::Result<Vec<TickResult>>>,
    {
        let start = TokioInstant::now();
        let mut timer = interval_at(start + self.interval, self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last_index: Option<u64> = None;
        let mut consecutive_faults: u32 = 0;

        loop {
            let scheduled = tokio::select! {
                scheduled = timer.tick() => scheduled,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            };

            // Phase is tick_index * interval from scheduler start.
            let since_start = scheduled.duration_since(start);
            let index = (since_start.as_nanos() / self.interval.as_nanos()).max(1) as u64 - 1;
            if let Some(last) = last_index {
                let skipped = index.saturating_sub(last + 1);
                if skipped > 0 {
                    self.metrics.tick.ticks_skipped_total.inc_by(skipped);
                    self.metrics.tick.deadline_miss_total.inc_by(skipped);
                    warn!(skipped, "ticks skipped; previous tick overran its slot");
                }
            }
            last_index = Some(index);

            // Late wake-up against the monotonic phase is our clock drift.
            let drift = TokioInstant::now().duration_since(scheduled);
            self.hub.set_clock_drift_ms(drift.as_secs_f64() * 1_000.0);

            self.metrics.tick.ticks_total.inc();
            let deadline = TickDeadline::new(self.deadline, self.min_emit_budget);
            let started = std::time::Instant::now();
            match on_tick(index, deadline).await {
                Ok(_) => {
                    consecutive_faults = 0;
                }
                Err(e) => {
                    consecutive_faults += 1;
                    error!(error = %e, consecutive_faults, "tick execution fault");
                    if consecutive_faults >= self.fault_threshold {
                        self.gate.force_trip("scheduler_fault");
                        consecutive_faults = 0;
                    }
                }
            }
            let took = started.elapsed();
            self.metrics
                .tick
                .tick_duration_ms
                .observe(took.as_secs_f64() * 1_000.0);
            self.hub.record_tick_latency(took.as_secs_f64() * 1_000.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn scheduler(interval_ms: u64) -> TickScheduler {
        TickScheduler::new(
            Duration::from_millis(interval_ms),
            Duration::from_millis(interval_ms),
            Duration::from_millis(1),
            3,
            Arc::new(CircuitGate::new(CircuitConfig::default())),
            Arc::new(BrimMetrics::new().unwrap()),
            Arc::new(SignalHub::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn fires_on_cadence_until_shutdown() {
        let sched = scheduler(100);
        let (tx, rx) = watch::channel(false);
        let fired = Arc::new(AtomicU32::new(0));
        let fired_clone = Arc::clone(&fired);

        let handle = tokio::spawn(async move {
            sched
                .run(
                    move |_, _| {
                        fired_clone.fetch_add(1, Ordering::SeqCst);
                        async { Ok(vec![TickResult::Completed { guard_blocked: false }]) }
                    },
                    rx,
                )
                .await;
        });

        tokio::time::sleep(Duration::from_millis(550)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        let n = fired.load(Ordering::SeqCst);
        assert!((4..=6).contains(&n), "expected ~5 ticks, got {n}");
    }

    #[tokio::test(start_paused = true)]
    async fn faults_trip_the_circuit_after_threshold() {
        let sched = scheduler(10);
        let gate = Arc::clone(&sched.gate);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            sched
                .run(|_, _| async { anyhow::bail!("boom") }, rx)
                .await;
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(
            gate.state(),
            crate::exchange::circuit::CircuitState::Tripped
        );
    }
}
