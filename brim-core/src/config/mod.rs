//! Configuration loading, validation and the runtime-mutable whitelist.

pub mod types;

pub use types::*;

use crate::core::errors::ConfigError;
use std::collections::BTreeMap;
use std::path::Path;

/// Dotted paths that may change without a restart. Every other difference
/// between the live config and a proposed update is rejected.
pub const RUNTIME_MUTABLE: &[&str] = &[
    "strategy.min_spread_bps",
    "strategy.max_spread_bps",
    "strategy.base_spread_bps",
    "strategy.k_vol_sensitivity",
    "strategy.k_liquidity_sensitivity",
    "strategy.k_latency_sensitivity",
    "strategy.k_pnl_sensitivity",
    "strategy.max_skew_bps",
    "strategy.k_inv",
    "strategy.quote_qty",
    "strategy.amend_price_threshold_bps",
    "strategy.amend_size_threshold",
    "strategy.min_time_in_book_ms",
    "md_cache.fresh_ms_for_pricing",
    "md_cache.ttl_ms",
    "reconcile.reconcile_interval_ms",
];

impl Config {
    /// Load and validate a config file. Any failure here is fatal at startup.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: Config = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Minimal valid config for one symbol; used by `paper` mode and tests.
    pub fn for_symbols(symbols: Vec<String>) -> Self {
        let cfg = Config {
            symbols,
            tick_interval_ms: 1_000,
            tick_deadline_ms: 1_000,
            min_emit_budget_ms: 30,
            scheduler_fault_threshold: 5,
            md_cache: Default::default(),
            strategy: Default::default(),
            risk: Default::default(),
            circuit: Default::default(),
            rate_limiter: Default::default(),
            reconcile: Default::default(),
            store: Default::default(),
            exchange: Default::default(),
            monitoring: Default::default(),
            secrets: Default::default(),
            chaos: None,
        };
        debug_assert!(cfg.validate().is_ok());
        cfg
    }

    /// Validate the whole tree atomically, including cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::invalid("symbols", "at least one symbol required"));
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::invalid("tick_interval_ms", "must be > 0"));
        }
        if self.tick_deadline_ms == 0 || self.tick_deadline_ms > self.tick_interval_ms {
            return Err(ConfigError::invalid(
                "tick_deadline_ms",
                "must be in (0, tick_interval_ms]",
            ));
        }
        if self.min_emit_budget_ms >= self.tick_deadline_ms {
            return Err(ConfigError::invalid(
                "min_emit_budget_ms",
                "must be below tick_deadline_ms",
            ));
        }

        let s = &self.strategy;
        if s.max_spread_bps < s.min_spread_bps {
            return Err(ConfigError::invalid(
                "strategy.max_spread_bps",
                "max_spread_bps must be >= min_spread_bps",
            ));
        }
        if s.min_spread_bps < 0.0 {
            return Err(ConfigError::invalid("strategy.min_spread_bps", "must be >= 0"));
        }
        if !(0.0..=1.0).contains(&s.amend_size_threshold) || s.amend_size_threshold == 0.0 {
            return Err(ConfigError::invalid(
                "strategy.amend_size_threshold",
                "must be in (0, 1]",
            ));
        }
        if s.max_skew_bps < 0.0 {
            return Err(ConfigError::invalid("strategy.max_skew_bps", "must be >= 0"));
        }
        if s.quote_qty <= rust_decimal::Decimal::ZERO {
            return Err(ConfigError::invalid("strategy.quote_qty", "must be > 0"));
        }
        if s.one_sided_widen_factor < 1.0 {
            return Err(ConfigError::invalid(
                "strategy.one_sided_widen_factor",
                "must be >= 1",
            ));
        }

        for (name, g) in [
            ("risk.guards.soft", &self.risk.guards.soft),
            ("risk.guards.hard", &self.risk.guards.hard),
        ] {
            if g.t_exit_s <= g.t_enter_s {
                return Err(ConfigError::Invalid {
                    field: "risk.guards",
                    reason: format!("{name}: t_exit_s must exceed t_enter_s"),
                });
            }
        }

        let c = &self.circuit;
        if !(0.0..=1.0).contains(&c.max_err_rate_ratio) {
            return Err(ConfigError::invalid(
                "circuit.max_err_rate_ratio",
                "must be in [0, 1]",
            ));
        }
        if c.window_s == 0 || c.probe_count == 0 {
            return Err(ConfigError::invalid("circuit", "window_s and probe_count must be > 0"));
        }

        if self.rate_limiter.capacity_per_s <= 0.0 || self.rate_limiter.burst == 0 {
            return Err(ConfigError::invalid(
                "rate_limiter",
                "capacity_per_s and burst must be > 0",
            ));
        }
        for (class, o) in &self.rate_limiter.endpoint_overrides {
            if o.capacity_per_s <= 0.0 || o.burst == 0 {
                return Err(ConfigError::Invalid {
                    field: "rate_limiter.endpoint_overrides",
                    reason: format!("{class}: capacity_per_s and burst must be > 0"),
                });
            }
        }

        let r = &self.reconcile;
        if !(0.0..=1.0).contains(&r.hard_desync_ratio) || r.hard_desync_ratio == 0.0 {
            return Err(ConfigError::invalid(
                "reconcile.hard_desync_ratio",
                "must be in (0, 1]",
            ));
        }

        if self.store.snapshot_interval_ms == 0 {
            return Err(ConfigError::invalid("store.snapshot_interval_ms", "must be > 0"));
        }

        Ok(())
    }

    /// Apply a proposed replacement configuration. The update is accepted
    /// only if it validates and every changed path is runtime-mutable;
    /// otherwise the error names the offending key and `self` stays live.
    pub fn apply_update(&self, proposed: Config) -> Result<Config, ConfigError> {
        proposed.validate()?;

        let current = flatten(serde_json::to_value(self)?);
        let next = flatten(serde_json::to_value(&proposed)?);

        for (path, value) in &next {
            if current.get(path) != Some(value) && !RUNTIME_MUTABLE.contains(&path.as_str()) {
                return Err(ConfigError::NotRuntimeMutable(path.clone()));
            }
        }
        for path in current.keys() {
            if !next.contains_key(path) && !RUNTIME_MUTABLE.contains(&path.as_str()) {
                return Err(ConfigError::NotRuntimeMutable(path.clone()));
            }
        }

        Ok(proposed)
    }
}

/// Flatten a JSON tree into dotted-path leaves for whitelist comparison.
fn flatten(value: serde_json::Value) -> BTreeMap<String, serde_json::Value> {
    let mut out = BTreeMap::new();
    flatten_into(String::new(), value, &mut out);
    out
}

fn flatten_into(prefix: String, value: serde_json::Value, out: &mut BTreeMap<String, serde_json::Value>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(path, child, out);
            }
        }
        other => {
            out.insert(prefix, other);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config::for_symbols(vec!["BTCUSDT".to_string()])
    }

    #[test]
    fn default_config_validates() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn rejects_inverted_spread_bounds() {
        let mut cfg = base();
        cfg.strategy.min_spread_bps = 20.0;
        cfg.strategy.max_spread_bps = 10.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn rejects_hysteresis_without_gap() {
        let mut cfg = base();
        cfg.risk.guards.soft.t_exit_s = cfg.risk.guards.soft.t_enter_s;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_deadline_beyond_interval() {
        let mut cfg = base();
        cfg.tick_deadline_ms = cfg.tick_interval_ms + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn runtime_update_accepts_whitelisted_change() {
        let cfg = base();
        let mut proposed = cfg.clone();
        proposed.strategy.min_spread_bps = 3.0;
        let updated = cfg.apply_update(proposed).unwrap();
        assert_eq!(updated.strategy.min_spread_bps, 3.0);
    }

    #[test]
    fn runtime_update_rejects_non_whitelisted_change() {
        let cfg = base();
        let mut proposed = cfg.clone();
        proposed.tick_interval_ms = 2_000;
        proposed.tick_deadline_ms = 2_000;
        match cfg.apply_update(proposed) {
            Err(ConfigError::NotRuntimeMutable(path)) => {
                assert!(path.starts_with("tick_"), "unexpected path {path}");
            }
            other => panic!("expected NotRuntimeMutable, got {other:?}"),
        }
    }

    #[test]
    fn runtime_update_rejects_invalid_proposal_atomically() {
        let cfg = base();
        let mut proposed = cfg.clone();
        proposed.strategy.min_spread_bps = 60.0; // above max_spread_bps
        assert!(cfg.apply_update(proposed).is_err());
        // Live config untouched.
        assert_eq!(cfg.strategy.min_spread_bps, 2.0);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = r#"{"symbols":["BTCUSDT"],"no_such_key":1}"#;
        assert!(serde_json::from_str::<Config>(raw).is_err());
    }
}
