//! Application object: wiring and task supervision
//!
//! Composes the seven components around one config and one metrics registry;
//! nothing in the crate is global, so tests build as many `App`s as they
//! like. `run` owns the task set: market dispatcher, refresh worker, user
//! event ingest, reconciler, monitor server, snapshot cadence, health
//! probe, and the tick scheduler in the foreground.

use crate::clock::TickScheduler;
use crate::config::Config;
use crate::core::errors::ConfigError;
use crate::core::filters::FilterRegistry;
use crate::core::types::{OrderState, Symbol};
use crate::exchange::api::{ExchangeApi, UserEvent};
use crate::exchange::circuit::CircuitGate;
use crate::exchange::guarded::GuardedExchange;
use crate::exchange::rate_limit::RateLimiter;
use crate::lifecycle::LifecycleWriter;
use crate::marketdata::cache::MdCache;
use crate::marketdata::feed::{run_market_dispatcher, run_refresh_worker, FeedStatus};
use crate::monitoring::metrics::BrimMetrics;
use crate::monitoring::server::{HealthEvaluator, MonitorServer};
use crate::pipeline::emit::EmitStage;
use crate::pipeline::fetch_md::FetchMdStage;
use crate::pipeline::guard_stage::GuardStage;
use crate::pipeline::inventory::InventoryStage;
use crate::pipeline::queue_aware::QueueAwareStage;
use crate::pipeline::spread::SpreadStage;
use crate::pipeline::volatility::{QueueTracker, VolTracker};
use crate::pipeline::{Pipeline, SharedConfig, Stage};
use crate::reconcile::Reconciler;
use crate::risk::guards::GuardEngine;
use crate::risk::signals::SignalHub;
use crate::store::OrderStore;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub struct App {
    cfg: SharedConfig,
    symbols: Vec<Symbol>,
    metrics: Arc<BrimMetrics>,
    exchange: Arc<dyn ExchangeApi>,
    gate: Arc<CircuitGate>,
    store: Arc<OrderStore>,
    cache: Arc<MdCache>,
    refresh_rx: Option<mpsc::UnboundedReceiver<Symbol>>,
    guards: Arc<GuardEngine>,
    hub: Arc<SignalHub>,
    queues: Arc<QueueTracker>,
    reconciler: Arc<Reconciler>,
    pipeline: Arc<Pipeline>,
    feed_status: FeedStatus,
}

impl App {
    /// Wire every component around `venue`. Symbol filters are fetched once
    /// here; failures fall back to cached/default values with the source
    /// recorded.
    pub async fn build(config: Config, venue: Arc<dyn ExchangeApi>) -> Result<App> {
        config.validate().context("startup configuration")?;
        let symbols: Vec<Symbol> = config.symbols.iter().map(Symbol::new).collect();

        let metrics = Arc::new(BrimMetrics::new().context("metrics registry")?);
        let gate = Arc::new(CircuitGate::new(config.circuit.clone()));
        let limiter = Arc::new(RateLimiter::new(&config.rate_limiter));
        let exchange: Arc<dyn ExchangeApi> = Arc::new(GuardedExchange::new(
            Arc::clone(&venue),
            Arc::clone(&gate),
            limiter,
            &config.exchange,
            Arc::clone(&metrics),
        ));

        let filters = Arc::new(FilterRegistry::new());
        for symbol in &symbols {
            match exchange.fetch_symbol_filters(symbol).await {
                Ok(f) => filters.insert(symbol.clone(), f),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "filter fetch failed; using defaults");
                }
            }
        }

        let store = Arc::new(OrderStore::new(config.store.clone()));
        let (cache, refresh_rx) = MdCache::new(config.md_cache.clone());
        let cache = Arc::new(cache);
        let guards = Arc::new(GuardEngine::new(config.risk.guards.clone()));
        let hub = Arc::new(SignalHub::new());
        let vol = Arc::new(VolTracker::new());
        let queues = Arc::new(QueueTracker::new(Duration::from_secs(
            config.strategy.queue_absorption_window_s,
        )));

        let cfg: SharedConfig = Arc::new(RwLock::new(config.clone()));

        let writer = Arc::new(LifecycleWriter::new(
            Arc::clone(&cfg),
            Arc::clone(&store),
            Arc::clone(&exchange),
            Arc::clone(&filters),
            Arc::clone(&guards),
            Arc::clone(&metrics),
        ));

        let reconciler = Arc::new(Reconciler::new(
            config.reconcile.clone(),
            Arc::clone(&exchange),
            Arc::clone(&store),
            Arc::clone(&guards),
            Arc::clone(&metrics),
        ));

        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(FetchMdStage::new(
                Arc::clone(&cache),
                Arc::clone(&vol),
                Arc::clone(&metrics),
            )),
            Arc::new(SpreadStage::new(
                Arc::clone(&cfg),
                Arc::clone(&filters),
                Arc::clone(&vol),
                Arc::clone(&hub),
            )),
            Arc::new(GuardStage::new(
                Arc::clone(&cfg),
                Arc::clone(&guards),
                Arc::clone(&hub),
                Arc::clone(&store),
                Arc::clone(&vol),
                Arc::clone(&gate),
                Arc::clone(&metrics),
            )),
            Arc::new(InventoryStage::new(
                Arc::clone(&cfg),
                Arc::clone(&store),
                Arc::clone(&filters),
            )),
            Arc::new(QueueAwareStage::new(
                Arc::clone(&cfg),
                Arc::clone(&queues),
                Arc::clone(&filters),
            )),
            Arc::new(EmitStage::new(Arc::clone(&writer))),
        ];
        let pipeline = Arc::new(Pipeline::new(stages, Arc::clone(&metrics)));

        Ok(App {
            cfg,
            symbols,
            metrics,
            exchange,
            gate,
            store,
            cache,
            refresh_rx: Some(refresh_rx),
            guards,
            hub,
            queues,
            reconciler,
            pipeline,
            feed_status: FeedStatus::new(),
        })
    }

    pub fn store(&self) -> &Arc<OrderStore> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<BrimMetrics> {
        &self.metrics
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn guards(&self) -> &Arc<GuardEngine> {
        &self.guards
    }

    /// Validated hot reload: only whitelisted paths may differ.
    pub fn apply_config_update(&self, proposed: Config) -> Result<(), ConfigError> {
        let updated = self.cfg.read().apply_update(proposed)?;
        *self.cfg.write() = updated;
        info!("runtime configuration updated");
        Ok(())
    }

    /// Load the durable snapshot and reconcile it against the exchange.
    /// Returns the number of non-terminal orders brought back.
    pub async fn recover(&self) -> Result<usize> {
        let recovered = self.store.recover().context("snapshot recovery")?;
        self.metrics
            .store
            .recovered_orders
            .set(recovered.len() as i64);
        if !recovered.is_empty() {
            info!(count = recovered.len(), "reconciling recovered orders");
            self.reconciler
                .run_startup()
                .await
                .context("startup reconcile")?;
        }
        Ok(recovered.len())
    }

    /// Run to shutdown. The scheduler lives in the foreground; everything
    /// else is a supervised background task.
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let cfg_snapshot = self.cfg.read().clone();

        // Stream consumers.
        let market_rx = self.exchange.stream_market_events(&self.symbols);
        tokio::spawn(run_market_dispatcher(
            cfg_snapshot.md_cache.clone(),
            market_rx,
            Arc::clone(&self.cache),
            Arc::clone(&self.queues),
            self.feed_status.clone(),
            Arc::clone(&self.metrics),
            shutdown.clone(),
        ));

        let refresh_rx = self.refresh_rx.take().expect("run called once");
        tokio::spawn(run_refresh_worker(
            refresh_rx,
            Arc::clone(&self.exchange),
            Arc::clone(&self.cache),
            shutdown.clone(),
        ));

        let user_rx = self.exchange.stream_user_events();
        tokio::spawn(run_user_event_ingest(
            user_rx,
            Arc::clone(&self.store),
            Arc::clone(&self.hub),
            Arc::clone(&self.metrics),
            shutdown.clone(),
        ));

        // Reconciler cadence.
        tokio::spawn(Arc::clone(&self.reconciler).run_loop(shutdown.clone()));

        // Monitor endpoint.
        let health = Arc::new(HealthEvaluator::new(
            Arc::clone(&self.gate),
            Arc::clone(&self.reconciler),
            self.feed_status.clone(),
            Duration::from_millis(cfg_snapshot.reconcile.reconcile_interval_ms * 3),
            Duration::from_millis(cfg_snapshot.md_cache.invalidate_on_ws_gap_ms * 4),
        ));
        if let Ok(addr) = cfg_snapshot.monitoring.listen_addr.parse() {
            let server = MonitorServer::new(addr, Arc::clone(&self.metrics), health);
            tokio::spawn(async move {
                if let Err(e) = server.serve().await {
                    warn!(error = %e, "monitor server stopped");
                }
            });
        } else {
            warn!(addr = %cfg_snapshot.monitoring.listen_addr, "invalid monitor listen address");
        }

        // Durable snapshot cadence and history pruning.
        {
            let store = Arc::clone(&self.store);
            let metrics = Arc::clone(&self.metrics);
            let mut shutdown = shutdown.clone();
            let interval = Duration::from_millis(cfg_snapshot.store.snapshot_interval_ms);
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(interval) => {
                            store.prune();
                            if store.snapshot().is_ok() {
                                metrics.store.snapshots_total.inc();
                            }
                            metrics.store.open_orders.set(store.open_count() as i64);
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            });
        }

        // Health probe keeps the circuit's HALF_OPEN state moving even when
        // quoting is paused.
        {
            let exchange = Arc::clone(&self.exchange);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {
                            let _ = exchange.ping().await;
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            });
        }

        // Foreground: the tick scheduler.
        let scheduler = TickScheduler::new(
            Duration::from_millis(cfg_snapshot.tick_interval_ms),
            Duration::from_millis(cfg_snapshot.tick_deadline_ms),
            Duration::from_millis(cfg_snapshot.min_emit_budget_ms),
            cfg_snapshot.scheduler_fault_threshold,
            Arc::clone(&self.gate),
            Arc::clone(&self.metrics),
            Arc::clone(&self.hub),
        );

        let pipeline = Arc::clone(&self.pipeline);
        let symbols = self.symbols.clone();
        scheduler
            .run(
                move |tick_index, deadline| {
                    let pipeline = Arc::clone(&pipeline);
                    let symbols = symbols.clone();
                    async move {
                        let mut results = Vec::with_capacity(symbols.len());
                        for symbol in symbols {
                            results
                                .push(pipeline.run_tick(symbol, tick_index, deadline).await);
                        }
                        Ok(results)
                    }
                },
                shutdown.clone(),
            )
            .await;

        // Graceful shutdown: one final durable snapshot.
        info!("shutting down; writing final snapshot");
        self.store.snapshot_blocking().context("final snapshot")?;
        Ok(())
    }
}

/// Apply user events to the store in sequence order. Out-of-order events
/// wait in a bounded buffer; when it overflows, the oldest buffered event is
/// applied and the gap is logged.
const REORDER_WINDOW: usize = 256;

pub async fn run_user_event_ingest(
    mut events: mpsc::UnboundedReceiver<UserEvent>,
    store: Arc<OrderStore>,
    hub: Arc<SignalHub>,
    metrics: Arc<BrimMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last_applied: Option<u64> = None;
    let mut buffer: BTreeMap<u64, UserEvent> = BTreeMap::new();

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
                continue;
            }
        };
        let Some(event) = event else {
            debug!("user event stream closed");
            return;
        };

        let seq = event.seq();
        match last_applied {
            Some(last) if seq <= last => {
                debug!(seq, last, "stale user event dropped");
                continue;
            }
            Some(last) if seq > last + 1 => {
                buffer.insert(seq, event);
                if buffer.len() > REORDER_WINDOW {
                    // Window exhausted: accept the gap and move on.
                    if let Some((&next_seq, _)) = buffer.iter().next() {
                        warn!(from = last, to = next_seq, "event sequence gap accepted");
                        let (next_seq, event) =
                            buffer.pop_first().expect("buffer checked non-empty");
                        apply_user_event(&event, &store, &hub, &metrics);
                        last_applied = Some(next_seq);
                        drain_in_order(&mut buffer, &mut last_applied, &store, &hub, &metrics);
                    }
                }
                continue;
            }
            _ => {}
        }

        apply_user_event(&event, &store, &hub, &metrics);
        last_applied = Some(seq);
        drain_in_order(&mut buffer, &mut last_applied, &store, &hub, &metrics);
    }
}

fn drain_in_order(
    buffer: &mut BTreeMap<u64, UserEvent>,
    last_applied: &mut Option<u64>,
    store: &Arc<OrderStore>,
    hub: &Arc<SignalHub>,
    metrics: &Arc<BrimMetrics>,
) {
    while let Some(last) = *last_applied {
        match buffer.first_key_value() {
            Some((&seq, _)) if seq == last + 1 => {
                let (seq, event) = buffer.pop_first().expect("checked non-empty");
                apply_user_event(&event, store, hub, metrics);
                *last_applied = Some(seq);
            }
            _ => return,
        }
    }
}

fn apply_user_event(
    event: &UserEvent,
    store: &Arc<OrderStore>,
    hub: &Arc<SignalHub>,
    metrics: &Arc<BrimMetrics>,
) {
    match event {
        UserEvent::Fill(fill) => {
            let key = format!("fill:{}:{}", fill.client_order_id, fill.exchange_event_seq);
            match store.apply_fill(&fill.client_order_id, fill.qty, fill.price, &key) {
                Ok(()) => {
                    hub.on_fill(fill);
                    metrics
                        .orders
                        .fills_total
                        .with_label_values(&[fill.symbol.as_str(), fill.side.tag()])
                        .inc();
                    let position = store.inventory(&fill.symbol).position;
                    metrics
                        .orders
                        .inventory_position
                        .with_label_values(&[fill.symbol.as_str()])
                        .set(position.to_f64().unwrap_or(0.0));
                }
                Err(e) => {
                    // Fills for orders we do not know are orphan activity;
                    // the reconciler owns those.
                    debug!(cid = %fill.client_order_id, error = %e, "fill not applied");
                }
            }
        }
        UserEvent::OrderUpdate {
            client_order_id,
            exchange_order_id,
            state,
            exchange_event_seq,
            ..
        } => {
            match state {
                OrderState::Open => {
                    let key = format!("ack:{client_order_id}");
                    let _ = store.record_ack(client_order_id, exchange_order_id, &key);
                }
                OrderState::Canceled | OrderState::Rejected => {
                    let key = format!("evt:{client_order_id}:{exchange_event_seq}");
                    if let Err(e) = store.update_state(client_order_id, *state, &key) {
                        debug!(cid = %client_order_id, error = %e, "state event not applied");
                    }
                }
                // Fill-driven states arrive through Fill events.
                _ => {}
            }
        }
    }
}

