//! Reconciler: drives the local store toward exchange truth
//!
//! Periodic three-way diff between exchange open orders, store open orders
//! and recent exchange history. Store-only orders are resolved from history
//! (they usually filled or canceled while we were not looking), orphans on
//! the exchange are canceled with a `recon:` idempotency key, and mismatched
//! states are driven to what the exchange reports. A divergence ratio beyond
//! the configured threshold escalates to a HARD guard with `hard_desync` and
//! a protective cancel-all; only a clean cycle starts the re-entry clock.

use crate::config::ReconcileConfig;
use crate::core::errors::ExchangeError;
use crate::core::types::{epoch_ms, ClientOrderId, Order, OrderState};
use crate::exchange::api::ExchangeApi;
use crate::monitoring::metrics::BrimMetrics;
use crate::risk::guards::GuardEngine;
use crate::store::OrderStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

pub const REASON_HARD_DESYNC: &str = "hard_desync";
pub const REASON_RECONCILE_FAILED: &str = "reconcile_failed";

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub store_only: usize,
    pub exchange_only: usize,
    pub mismatched: usize,
    pub open_total: usize,
    pub divergence_ratio: f64,
    pub clean: bool,
}

pub struct Reconciler {
    cfg: ReconcileConfig,
    exchange: Arc<dyn ExchangeApi>,
    store: Arc<OrderStore>,
    guards: Arc<GuardEngine>,
    metrics: Arc<BrimMetrics>,
    consecutive_failures: AtomicU32,
    cycle: AtomicU64,
    last_success: Mutex<Option<Instant>>,
    wakeup: Notify,
}

impl Reconciler {
    pub fn new(
        cfg: ReconcileConfig,
        exchange: Arc<dyn ExchangeApi>,
        store: Arc<OrderStore>,
        guards: Arc<GuardEngine>,
        metrics: Arc<BrimMetrics>,
    ) -> Self {
        Self {
            cfg,
            exchange,
            store,
            guards,
            metrics,
            consecutive_failures: AtomicU32::new(0),
            cycle: AtomicU64::new(0),
            last_success: Mutex::new(None),
            wakeup: Notify::new(),
        }
    }

    /// Request an out-of-cadence run (after transient exchange errors).
    pub fn request_run(&self) {
        self.wakeup.notify_one();
    }

    /// Age of the last successful cycle; health reports on this.
    pub fn last_success_age(&self) -> Option<Duration> {
        self.last_success.lock().map(|at| at.elapsed())
    }

    pub async fn run_loop(self: Arc<Self>, shutdown: tokio::sync::watch::Receiver<bool>) {
        let interval = Duration::from_millis(self.cfg.reconcile_interval_ms);
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.wakeup.notified() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            match self.run_once().await {
                Ok(report) => {
                    debug!(
                        store_only = report.store_only,
                        exchange_only = report.exchange_only,
                        mismatched = report.mismatched,
                        divergence = report.divergence_ratio,
                        "reconcile cycle complete"
                    );
                }
                Err(e) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    self.metrics.reconcile.failures_total.inc();
                    warn!(error = %e, failures, "reconcile cycle failed");
                    if failures >= self.cfg.max_consecutive_failures {
                        self.guards.force_hard(REASON_RECONCILE_FAILED);
                    }
                    // Retry soon rather than waiting a full interval.
                    tokio::time::sleep(Duration::from_millis(
                        (self.cfg.reconcile_interval_ms / 4).max(250),
                    ))
                    .await;
                }
            }
        }
    }

    pub async fn run_once(&self) -> Result<ReconcileReport, ExchangeError> {
        self.run_cycle(true).await
    }

    /// Startup variant: after recovery the first cycle is expected to
    /// diverge, so it corrects without escalating to `hard_desync`.
    pub async fn run_startup(&self) -> Result<ReconcileReport, ExchangeError> {
        self.run_cycle(false).await
    }

    async fn run_cycle(&self, escalate: bool) -> Result<ReconcileReport, ExchangeError> {
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst);
        let exchange_open = self.exchange.fetch_open_orders(None).await?;
        let store_open = self.store.list_open(None);

        let exchange_by_cid: HashMap<ClientOrderId, &Order> = exchange_open
            .iter()
            .map(|o| (o.client_order_id.clone(), o))
            .collect();
        let store_by_cid: HashMap<ClientOrderId, &Order> = store_open
            .iter()
            .map(|o| (o.client_order_id.clone(), o))
            .collect();

        let mut report = ReconcileReport::default();
        let mut open_union: usize = exchange_open.len();
        for order in &store_open {
            if !exchange_by_cid.contains_key(&order.client_order_id) {
                open_union += 1;
            }
        }
        report.open_total = open_union;

        // Store-only: likely already closed on the exchange.
        let store_only: Vec<&Order> = store_open
            .iter()
            .filter(|o| !exchange_by_cid.contains_key(&o.client_order_id))
            .collect();
        if !store_only.is_empty() {
            let since = epoch_ms().saturating_sub(self.cfg.history_lookback_ms);
            let history = self.exchange.fetch_recent_history(None, since, 1_000).await?;
            let history_by_cid: HashMap<ClientOrderId, &Order> = history
                .iter()
                .map(|o| (o.client_order_id.clone(), o))
                .collect();

            for order in &store_only {
                report.store_only += 1;
                let cid = &order.client_order_id;
                match history_by_cid.get(cid) {
                    Some(hist) => {
                        self.apply_exchange_truth(order, hist);
                        self.metrics.reconcile.store_only_resolved_total.inc();
                    }
                    None => {
                        // Not open and not in history: the exchange has no
                        // trace of it. Cancel exchange-side by id when we
                        // have one; either way retire it locally.
                        let gone = match order.exchange_order_id.as_deref() {
                            Some(xid) => {
                                match self.exchange.cancel(xid, &format!("recon:{xid}")).await {
                                    Ok(_) => true,
                                    Err(ExchangeError::UnknownOrder(_)) => true,
                                    Err(e) => {
                                        warn!(cid = %cid, error = %e, "stale order cancel failed");
                                        false
                                    }
                                }
                            }
                            None => true,
                        };
                        if gone {
                            let key = format!("recon:{cid}:canceled");
                            if let Err(e) =
                                self.store.update_state(cid, OrderState::Canceled, &key)
                            {
                                warn!(cid = %cid, error = %e, "stale order retire failed");
                            } else {
                                self.metrics.reconcile.store_only_resolved_total.inc();
                            }
                        }
                    }
                }
            }
        }

        // Exchange-only: orphans we no longer intend; cancel with a synthetic
        // key so a repeat cycle cannot double-cancel.
        for order in &exchange_open {
            if store_by_cid.contains_key(&order.client_order_id) {
                continue;
            }
            report.exchange_only += 1;
            if let Some(xid) = order.exchange_order_id.as_deref() {
                let key = format!("recon:{xid}");
                match self.exchange.cancel(xid, &key).await {
                    Ok(_) => {
                        self.metrics.reconcile.orphans_canceled_total.inc();
                        info!(xid, "orphan order canceled");
                    }
                    Err(e) => warn!(xid, error = %e, "orphan cancel failed"),
                }
            }
        }

        // Both sides present: drive the store to the exchange state.
        for order in &store_open {
            if let Some(exchange_order) = exchange_by_cid.get(&order.client_order_id) {
                if order.state != exchange_order.state
                    || order.filled_qty != exchange_order.filled_qty
                {
                    report.mismatched += 1;
                    self.apply_exchange_truth(order, exchange_order);
                }
            }
        }

        let divergence = report.store_only + report.exchange_only + report.mismatched;
        report.divergence_ratio = if report.open_total == 0 {
            0.0
        } else {
            divergence as f64 / report.open_total as f64
        };
        report.clean = divergence == 0;

        self.metrics.reconcile.runs_total.inc();
        self.metrics.reconcile.divergence_ratio.set(report.divergence_ratio);

        if escalate && report.divergence_ratio > self.cfg.hard_desync_ratio {
            warn!(
                ratio = report.divergence_ratio,
                threshold = self.cfg.hard_desync_ratio,
                "hard desync; pausing quoting and sweeping"
            );
            self.metrics.reconcile.hard_desync_total.inc();
            self.guards.force_hard(REASON_HARD_DESYNC);
            let key = format!("recon-sweep:{cycle}");
            if let Err(e) = self.exchange.cancel_all(None, &key).await {
                warn!(error = %e, "desync cancel-all failed");
            }
            let _ = self.store.cancel_all_open(&key);
        } else if report.clean {
            // Clean cycle: start releasing any forced reasons we own.
            self.guards.clear_forced(REASON_HARD_DESYNC);
            self.guards.clear_forced(REASON_RECONCILE_FAILED);
        }

        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.last_success.lock() = Some(Instant::now());
        Ok(report)
    }

    /// Fold an exchange-reported order into the store idempotently: missing
    /// fills first, then the state.
    fn apply_exchange_truth(&self, local: &Order, truth: &Order) {
        let cid = &local.client_order_id;
        let missing = truth.filled_qty - local.filled_qty;
        if missing > rust_decimal::Decimal::ZERO {
            let price = truth.avg_fill_price.unwrap_or(truth.price);
            let key = format!("recon-fill:{cid}:{}", truth.filled_qty);
            if let Err(e) = self.store.apply_fill(cid, missing, price, &key) {
                warn!(cid = %cid, error = %e, "reconcile fill apply failed");
            }
        }
        if truth.state != local.state && truth.state != OrderState::Filled {
            // Filled is reached through apply_fill; other targets are set
            // directly.
            let key = format!("recon:{cid}:{}", truth.state.as_str());
            if let Err(e) = self.store.update_state(cid, truth.state, &key) {
                warn!(cid = %cid, error = %e, "reconcile state update failed");
            }
        }
    }
}
