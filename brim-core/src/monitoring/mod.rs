//! Observability: metrics registry and the metrics/health endpoint.

pub mod metrics;
pub mod server;

pub use metrics::BrimMetrics;
pub use server::{HealthEvaluator, HealthStatus, MonitorServer};
