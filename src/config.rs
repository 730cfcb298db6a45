// =============================================================================
// Guard Configuration — flat tunables for the protection engine
// =============================================================================
//
// Every knob the engine consumes lives here as a named numeric/string option.
// All fields carry serde defaults so an older or partial JSON file still
// loads; persistence uses the atomic tmp + rename pattern to prevent
// corruption on crash.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_read_calls_per_second() -> f64 {
    10.0
}

fn default_order_calls_per_second() -> f64 {
    5.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_secs() -> f64 {
    1.0
}

fn default_normal_interval_secs() -> u64 {
    30
}

fn default_aggressive_interval_secs() -> u64 {
    10
}

fn default_retry_interval_secs() -> u64 {
    60
}

fn default_health_check_interval_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_atr_period() -> usize {
    14
}

fn default_atr_multiplier() -> f64 {
    2.0
}

fn default_atr_timeframe() -> String {
    "1h".to_string()
}

fn default_taker_fee_rate() -> f64 {
    0.0005
}

fn default_trailing_pct() -> f64 {
    0.01
}

fn default_tight_trailing_pct() -> f64 {
    0.003
}

fn default_min_stop_distance_pct() -> f64 {
    0.005
}

fn default_breakeven_buffer_pct() -> f64 {
    0.001
}

fn default_breakeven_threshold_pct() -> f64 {
    0.005
}

fn default_aggressive_threshold_pct() -> f64 {
    0.01
}

fn default_profit_protection_threshold_pct() -> f64 {
    0.02
}

fn default_profit_lock_fraction() -> f64 {
    0.5
}

fn default_initial_risk_fraction() -> f64 {
    0.5
}

fn default_max_initial_stop_distance_pct() -> f64 {
    0.03
}

fn default_step_profit_pct() -> f64 {
    0.005
}

fn default_position_cache_ttl_secs() -> u64 {
    30
}

fn default_price_cache_ttl_secs() -> u64 {
    5
}

fn default_atr_cache_ttl_secs() -> u64 {
    300
}

fn default_precision_cache_ttl_secs() -> u64 {
    3600
}

fn default_state_cache_ttl_secs() -> u64 {
    86_400
}

// =============================================================================
// GuardConfig
// =============================================================================

/// Top-level configuration for the Aegis protection engine.
///
/// Every field has a serde default so older JSON files missing new fields
/// still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardConfig {
    // --- API resilience ------------------------------------------------------

    /// Minimum spacing for market/position reads (calls per second).
    #[serde(default = "default_read_calls_per_second")]
    pub read_calls_per_second: f64,

    /// Minimum spacing for order placement/cancellation (calls per second).
    #[serde(default = "default_order_calls_per_second")]
    pub order_calls_per_second: f64,

    /// Additional attempts after the first failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff delay; attempt `n` sleeps `base * 2^n`.
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: f64,

    // --- Monitoring cadence --------------------------------------------------

    /// Cycle interval when no position is in profit.
    #[serde(default = "default_normal_interval_secs")]
    pub normal_interval_secs: u64,

    /// Cycle interval when at least one position is in profit.
    #[serde(default = "default_aggressive_interval_secs")]
    pub aggressive_interval_secs: u64,

    /// Back-off after a failed health check or loop-level error.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Minimum spacing between exchange health probes.
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    // --- Stop-loss strategy --------------------------------------------------

    /// Volatility-sized first stops. When off, the margin-risk and
    /// bounded-risk fallbacks cover unprotected positions instead.
    #[serde(default = "default_true")]
    pub enable_atr_stop: bool,

    /// Look-back window for the ATR estimate.
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,

    /// Initial stop distance = ATR × this multiplier.
    #[serde(default = "default_atr_multiplier")]
    pub atr_multiplier: f64,

    /// Kline interval fed into the ATR estimate.
    #[serde(default = "default_atr_timeframe")]
    pub atr_timeframe: String,

    /// Taker fee rate used for net-profit estimates (0.0005 = 0.05%).
    #[serde(default = "default_taker_fee_rate")]
    pub taker_fee_rate: f64,

    /// Moderate trailing distance from the watermark.
    #[serde(default = "default_trailing_pct")]
    pub trailing_pct: f64,

    /// Aggressive trailing distance; materially tighter than `trailing_pct`.
    #[serde(default = "default_tight_trailing_pct")]
    pub tight_trailing_pct: f64,

    /// Floor on the initial ATR stop distance, as a fraction of entry.
    #[serde(default = "default_min_stop_distance_pct")]
    pub min_stop_distance_pct: f64,

    /// Buffer added above breakeven, as a fraction of entry.
    #[serde(default = "default_breakeven_buffer_pct")]
    pub breakeven_buffer_pct: f64,

    /// Below this favorable move, only breakeven protection applies.
    #[serde(default = "default_breakeven_threshold_pct")]
    pub breakeven_threshold_pct: f64,

    /// At or above this favorable move, trailing tightens.
    #[serde(default = "default_aggressive_threshold_pct")]
    pub aggressive_threshold_pct: f64,

    /// At or above this favorable move, a fraction of the gain is locked in.
    #[serde(default = "default_profit_protection_threshold_pct")]
    pub profit_protection_threshold_pct: f64,

    /// Fraction of the realized move secured by profit protection.
    #[serde(default = "default_profit_lock_fraction")]
    pub profit_lock_fraction: f64,

    /// Fraction of margin-at-risk allowed to be lost at the initial stop.
    #[serde(default = "default_initial_risk_fraction")]
    pub initial_risk_fraction: f64,

    /// Hard cap on the adverse distance of a first stop from entry.
    #[serde(default = "default_max_initial_stop_distance_pct")]
    pub max_initial_stop_distance_pct: f64,

    /// Net-profit step (as a fraction of entry notional) that gates how often
    /// the trailing strategies may move the stop.
    #[serde(default = "default_step_profit_pct")]
    pub step_profit_pct: f64,

    // --- Cache TTLs ----------------------------------------------------------

    #[serde(default = "default_position_cache_ttl_secs")]
    pub position_cache_ttl_secs: u64,

    #[serde(default = "default_price_cache_ttl_secs")]
    pub price_cache_ttl_secs: u64,

    #[serde(default = "default_atr_cache_ttl_secs")]
    pub atr_cache_ttl_secs: u64,

    #[serde(default = "default_precision_cache_ttl_secs")]
    pub precision_cache_ttl_secs: u64,

    /// Watermark/ratchet state TTL. Day-scale on purpose: this state encodes
    /// position history and must outlive every read cache.
    #[serde(default = "default_state_cache_ttl_secs")]
    pub state_cache_ttl_secs: u64,

    // --- Notifications -------------------------------------------------------

    /// Optional webhook for stop-update and error notifications.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserialises from defaults")
    }
}

impl GuardConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read guard config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse guard config from {}", path.display()))?;

        info!(
            path = %path.display(),
            atr_period = config.atr_period,
            normal_interval_secs = config.normal_interval_secs,
            "guard config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise guard config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "guard config saved (atomic)");
        Ok(())
    }

    // --- Duration accessors --------------------------------------------------

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_base_delay_secs)
    }

    pub fn position_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.position_cache_ttl_secs)
    }

    pub fn price_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.price_cache_ttl_secs)
    }

    pub fn atr_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.atr_cache_ttl_secs)
    }

    pub fn precision_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.precision_cache_ttl_secs)
    }

    pub fn state_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.state_cache_ttl_secs)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = GuardConfig::default();
        assert!(cfg.enable_atr_stop);
        assert!((cfg.read_calls_per_second - 10.0).abs() < f64::EPSILON);
        assert!((cfg.order_calls_per_second - 5.0).abs() < f64::EPSILON);
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.atr_period, 14);
        assert_eq!(cfg.atr_timeframe, "1h");
        assert!((cfg.atr_multiplier - 2.0).abs() < f64::EPSILON);
        assert!((cfg.taker_fee_rate - 0.0005).abs() < f64::EPSILON);
        assert_eq!(cfg.normal_interval_secs, 30);
        assert_eq!(cfg.aggressive_interval_secs, 10);
        assert_eq!(cfg.state_cache_ttl_secs, 86_400);
        assert!(cfg.webhook_url.is_none());
        // The aggressive trail must actually be tighter than the moderate one.
        assert!(cfg.tight_trailing_pct < cfg.trailing_pct);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: GuardConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_retries, 3);
        assert!((cfg.retry_base_delay_secs - 1.0).abs() < f64::EPSILON);
        assert_eq!(cfg.price_cache_ttl_secs, 5);
        assert_eq!(cfg.position_cache_ttl_secs, 30);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "atr_period": 7, "webhook_url": "https://example.test/hook" }"#;
        let cfg: GuardConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.atr_period, 7);
        assert_eq!(cfg.webhook_url.as_deref(), Some("https://example.test/hook"));
        assert_eq!(cfg.max_retries, 3);
        assert!((cfg.trailing_pct - 0.01).abs() < f64::EPSILON);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = GuardConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: GuardConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.atr_period, cfg2.atr_period);
        assert_eq!(cfg.normal_interval_secs, cfg2.normal_interval_secs);
        assert!((cfg.step_profit_pct - cfg2.step_profit_pct).abs() < f64::EPSILON);
    }

    #[test]
    fn duration_accessors() {
        let cfg = GuardConfig::default();
        assert_eq!(cfg.price_cache_ttl(), Duration::from_secs(5));
        assert_eq!(cfg.state_cache_ttl(), Duration::from_secs(86_400));
        assert_eq!(cfg.retry_base_delay(), Duration::from_secs(1));
    }
}
