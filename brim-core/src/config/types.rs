//! Declarative configuration tree
//!
//! Deserialized from JSON, validated atomically before use. Unknown keys are
//! rejected so a typo cannot silently disable a limit. A small whitelist of
//! paths may change at runtime; everything else requires a restart.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Symbols to quote.
    pub symbols: Vec<String>,

    /// Pipeline cadence.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Per-tick hard deadline.
    #[serde(default = "default_tick_deadline_ms")]
    pub tick_deadline_ms: u64,

    /// Minimum budget that must remain for the Emit stage; a tick aborts
    /// when less is left.
    #[serde(default = "default_min_emit_budget_ms")]
    pub min_emit_budget_ms: u64,

    /// Consecutive scheduler faults before the circuit trips.
    #[serde(default = "default_scheduler_fault_threshold")]
    pub scheduler_fault_threshold: u32,

    #[serde(default)]
    pub md_cache: MdCacheConfig,

    #[serde(default)]
    pub strategy: StrategyConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub circuit: CircuitConfig,

    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,

    #[serde(default)]
    pub reconcile: ReconcileConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub exchange: ExchangeConfig,

    #[serde(default)]
    pub monitoring: MonitoringConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,

    /// Reserved for the external chaos injector; carried through
    /// untouched, never interpreted by the core.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chaos: Option<serde_json::Value>,
}

/// Market-data cache tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MdCacheConfig {
    /// Age beyond which a snapshot is no longer served as fresh.
    pub ttl_ms: u64,
    /// Maximum snapshot age accepted by the pricing path.
    pub fresh_ms_for_pricing: u64,
    /// Streaming gap that invalidates cached books and forces a resync.
    pub invalidate_on_ws_gap_ms: u64,
    /// Upper bound on the synchronous refresh wait in `FreshOnly` mode.
    pub fresh_only_wait_ms: u64,
}

impl Default for MdCacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 500,
            fresh_ms_for_pricing: 60,
            invalidate_on_ws_gap_ms: 300,
            fresh_only_wait_ms: 50,
        }
    }
}

/// Spread composition, amend policy, inventory and queue-aware knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyConfig {
    pub min_spread_bps: f64,
    pub max_spread_bps: f64,
    /// Base spread before signal contributions.
    pub base_spread_bps: f64,
    pub k_vol_sensitivity: f64,
    pub k_liquidity_sensitivity: f64,
    pub k_latency_sensitivity: f64,
    pub k_pnl_sensitivity: f64,
    /// Reference top-of-book depth for the liquidity score.
    pub reference_depth: Decimal,
    /// Spread multiplier when only one book side exists.
    pub one_sided_widen_factor: f64,

    /// Quote size per side.
    pub quote_qty: Decimal,

    // Amend policy.
    pub min_time_in_book_ms: u64,
    pub amend_price_threshold_bps: f64,
    /// Relative size delta above which we cancel+place instead of amending.
    pub amend_size_threshold: f64,
    /// Delay between cancel and the replacing place.
    pub cancel_place_gap_ms: u64,

    // Inventory skew.
    pub max_skew_bps: f64,
    pub k_inv: f64,
    /// Position magnitude that normalizes inventory to 1.0.
    pub inventory_normalizer: Decimal,

    // Queue-aware nudge.
    pub queue_eta_max_s: f64,
    pub queue_absorption_window_s: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            min_spread_bps: 2.0,
            max_spread_bps: 50.0,
            base_spread_bps: 5.0,
            k_vol_sensitivity: 0.5,
            k_liquidity_sensitivity: 1.0,
            k_latency_sensitivity: 0.05,
            k_pnl_sensitivity: 0.5,
            reference_depth: dec!(1.0),
            one_sided_widen_factor: 2.0,
            quote_qty: dec!(1.0),
            min_time_in_book_ms: 500,
            amend_price_threshold_bps: 3.0,
            amend_size_threshold: 0.20,
            cancel_place_gap_ms: 100,
            max_skew_bps: 10.0,
            k_inv: 5.0,
            inventory_normalizer: dec!(1.0),
            queue_eta_max_s: 30.0,
            queue_absorption_window_s: 30,
        }
    }
}

/// Guard thresholds for one level (soft or hard).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuardThresholds {
    pub max_inventory_skew: f64,
    pub max_realized_vol_bps: f64,
    pub max_latency_p95_ms: f64,
    pub max_err_rate_ratio: f64,
    pub max_drawdown: f64,
    pub max_daily_loss: f64,
    pub max_pnl_deviation: f64,
    pub max_clock_drift_ms: f64,
    /// Seconds a breach must hold before the level engages.
    pub t_enter_s: f64,
    /// Seconds below threshold before the level releases; must exceed
    /// `t_enter_s`.
    pub t_exit_s: f64,
}

impl GuardThresholds {
    fn soft_default() -> Self {
        Self {
            max_inventory_skew: 0.5,
            max_realized_vol_bps: 40.0,
            max_latency_p95_ms: 150.0,
            max_err_rate_ratio: 0.10,
            max_drawdown: 0.03,
            max_daily_loss: 500.0,
            max_pnl_deviation: 200.0,
            max_clock_drift_ms: 250.0,
            t_enter_s: 2.0,
            t_exit_s: 10.0,
        }
    }

    fn hard_default() -> Self {
        Self {
            max_inventory_skew: 1.0,
            max_realized_vol_bps: 120.0,
            max_latency_p95_ms: 400.0,
            max_err_rate_ratio: 0.30,
            max_drawdown: 0.08,
            max_daily_loss: 2_000.0,
            max_pnl_deviation: 1_000.0,
            max_clock_drift_ms: 1_000.0,
            t_enter_s: 1.0,
            t_exit_s: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuardsConfig {
    pub soft: GuardThresholds,
    pub hard: GuardThresholds,
    /// Minimum dwell in HARD before re-entry conditions are honored.
    pub min_dwell_s: f64,
}

impl Default for GuardsConfig {
    fn default() -> Self {
        Self {
            soft: GuardThresholds::soft_default(),
            hard: GuardThresholds::hard_default(),
            min_dwell_s: 5.0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskConfig {
    #[serde(default)]
    pub guards: GuardsConfig,
}

/// Circuit gate over the exchange error stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CircuitConfig {
    /// Rolling error-rate window.
    pub window_s: u64,
    pub max_err_rate_ratio: f64,
    /// Time in TRIPPED before probing.
    pub cooldown_s: u64,
    /// Minimum time in OPEN before a trip may be considered again.
    pub min_closed_s: u64,
    /// Consecutive probe successes required to re-open traffic.
    pub probe_count: u32,
    /// Minimum dwell before any non-safety transition.
    pub min_dwell_s: u64,
    /// Rate limit on transition log lines.
    pub max_log_lines_per_sec: u32,
    /// Minimum samples in the window before the error rate is meaningful.
    pub min_samples: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            window_s: 300,
            max_err_rate_ratio: 0.30,
            cooldown_s: 30,
            min_closed_s: 10,
            probe_count: 1,
            min_dwell_s: 5,
            max_log_lines_per_sec: 5,
            min_samples: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointOverride {
    pub capacity_per_s: f64,
    pub burst: u64,
}

/// Token-bucket rate limiter defaults plus per-endpoint-class overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimiterConfig {
    pub capacity_per_s: f64,
    pub burst: u64,
    /// Keyed by endpoint class name ("orders", "queries", "stream").
    #[serde(default)]
    pub endpoint_overrides: BTreeMap<String, EndpointOverride>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity_per_s: 10.0,
            burst: 20,
            endpoint_overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconcileConfig {
    pub reconcile_interval_ms: u64,
    /// Divergence ratio beyond which the system enters HARD.
    pub hard_desync_ratio: f64,
    /// Consecutive reconcile failures before escalating to HARD.
    pub max_consecutive_failures: u32,
    /// History lookback handed to `fetch_recent_history`.
    pub history_lookback_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_ms: 25_000,
            hard_desync_ratio: 0.10,
            max_consecutive_failures: 3,
            history_lookback_ms: 3_600_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    pub snapshot_interval_ms: u64,
    pub snapshot_dir: PathBuf,
    /// Terminal orders older than this are pruned.
    pub history_window_ms: u64,
    /// TTL of the idempotency result cache.
    pub idem_ttl_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_ms: 5_000,
            snapshot_dir: PathBuf::from("state"),
            history_window_ms: 86_400_000,
            idem_ttl_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExchangeConfig {
    /// Per-REST-call timeout.
    pub rest_timeout_ms: u64,
    /// Retry backoff base and cap for transient errors.
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub retry_max_attempts: u32,
    /// Idempotency de-duplication window at the adapter.
    pub idem_window_ms: u64,
    /// Stream reconnect backoff base and cap.
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            rest_timeout_ms: 10_000,
            retry_base_ms: 1_000,
            retry_max_ms: 30_000,
            retry_max_attempts: 5,
            idem_window_ms: 600_000,
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitoringConfig {
    /// Metrics/health listen address, e.g. "127.0.0.1:9090".
    pub listen_addr: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "snake_case")]
pub enum SecretsConfig {
    /// Resolve credentials from environment variables.
    Env {
        api_key_var: String,
        api_secret_var: String,
    },
    /// Resolve credentials from a two-line file (key, secret).
    File { path: PathBuf },
    /// No credentials (paper mode).
    None,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        SecretsConfig::None
    }
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_tick_deadline_ms() -> u64 {
    1_000
}

fn default_min_emit_budget_ms() -> u64 {
    30
}

fn default_scheduler_fault_threshold() -> u32 {
    5
}
