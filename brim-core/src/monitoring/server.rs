//! HTTP endpoint for Prometheus metrics and health
//!
//! `/metrics` serves the registry in text format; `/health` reports
//! `ok | degraded | unhealthy` derived from circuit state, reconciler
//! freshness and streaming connectivity.

use crate::exchange::circuit::{CircuitGate, CircuitState};
use crate::marketdata::feed::FeedStatus;
use crate::monitoring::metrics::BrimMetrics;
use crate::reconcile::Reconciler;
use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Aggregates the inputs the health endpoint reports on.
pub struct HealthEvaluator {
    gate: Arc<CircuitGate>,
    reconciler: Arc<Reconciler>,
    feed: FeedStatus,
    /// Reconciler silence beyond this is unhealthy.
    pub reconcile_stale_after: Duration,
    /// Feed silence beyond this degrades; three times this is unhealthy.
    pub feed_stale_after: Duration,
}

impl HealthEvaluator {
    pub fn new(
        gate: Arc<CircuitGate>,
        reconciler: Arc<Reconciler>,
        feed: FeedStatus,
        reconcile_stale_after: Duration,
        feed_stale_after: Duration,
    ) -> Self {
        Self {
            gate,
            reconciler,
            feed,
            reconcile_stale_after,
            feed_stale_after,
        }
    }

    pub fn status(&self) -> HealthStatus {
        let circuit = self.gate.state();
        let feed_silence = self.feed.silence();
        let reconcile_stale = self
            .reconciler
            .last_success_age()
            .map(|age| age > self.reconcile_stale_after)
            .unwrap_or(false);

        if circuit == CircuitState::Tripped
            || reconcile_stale
            || feed_silence > self.feed_stale_after * 3
        {
            return HealthStatus::Unhealthy;
        }
        if circuit == CircuitState::HalfOpen || feed_silence > self.feed_stale_after {
            return HealthStatus::Degraded;
        }
        HealthStatus::Ok
    }
}

pub struct MonitorServer {
    listen_addr: SocketAddr,
    metrics: Arc<BrimMetrics>,
    health: Arc<HealthEvaluator>,
}

impl MonitorServer {
    pub fn new(
        listen_addr: SocketAddr,
        metrics: Arc<BrimMetrics>,
        health: Arc<HealthEvaluator>,
    ) -> Self {
        Self {
            listen_addr,
            metrics,
            health,
        }
    }

    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .context("bind monitor server")?;
        info!("monitor server listening on http://{}", self.listen_addr);

        loop {
            let (stream, remote) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, "monitor accept failed");
                    continue;
                }
            };
            let metrics = Arc::clone(&self.metrics);
            let health = Arc::clone(&self.health);

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let metrics = Arc::clone(&metrics);
                    let health = Arc::clone(&health);
                    async move { handle_request(req, metrics, health) }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(remote = %remote, error = %e, "monitor connection error");
                }
            });
        }
    }
}

fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<BrimMetrics>,
    health: Arc<HealthEvaluator>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    match req.uri().path() {
        "/metrics" => {
            // Refresh scrape-time gauges.
            metrics
                .exchange
                .circuit_state
                .set(match health.gate.state() {
                    CircuitState::Open => 0,
                    CircuitState::Tripped => 1,
                    CircuitState::HalfOpen => 2,
                });

            let encoder = TextEncoder::new();
            let families = metrics.registry().gather();
            let mut buffer = Vec::new();
            if encoder.encode(&families, &mut buffer).is_err() {
                return Ok(Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::from("encode error")))
                    .expect("static response"));
            }
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", encoder.format_type())
                .body(Full::new(Bytes::from(buffer)))
                .expect("static response"))
        }
        "/health" | "/healthz" => {
            let status = health.status();
            let code = match status {
                HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
                HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
            };
            let body = format!("{{\"status\":\"{}\"}}", status.as_str());
            Ok(Response::builder()
                .status(code)
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from(body)))
                .expect("static response"))
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("not found")))
            .expect("static response")),
    }
}
