// =============================================================================
// Adaptive Stop-Loss Decision Engine
// =============================================================================
//
// Converts one position snapshot plus the current price into at most one
// recommended stop price. Strategies are evaluated in a fixed priority order
// and the first applicable one wins — later entries are fallbacks, never
// blended:
//
//   1. Initial ATR stop        — fresh position, volatility-sized distance
//   2. Not-in-profit hold      — underwater: fixed risk boundary only
//   3. Breakeven protection    — small profit: position can no longer lose
//   4. Moderate trailing       — watermark-anchored trail
//   5. Profit protection       — lock a fraction of the realized move
//   6. Aggressive trailing     — tighter watermark trail
//   7. Fallback trailing       — in profit, nothing else fired
//   8. Bounded-risk fallback   — unprotected position, hard 3% cap
//
// The engine does NOT apply the improvement filter — the orchestrator does,
// so the filter uniformly protects every strategy including future ones.
// Candidates leave here unrounded; precision is an order-submission concern.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::GuardConfig;
use crate::engine::position_state::PositionStateStore;
use crate::types::{Position, PositionSide};

// =============================================================================
// Candidate
// =============================================================================

/// Which strategy produced a candidate. Logged with every recommendation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopStrategy {
    InitialAtr,
    InitialRisk,
    Breakeven,
    ModerateTrail,
    ProfitProtect,
    AggressiveTrail,
    FallbackTrail,
    BoundedRisk,
}

impl std::fmt::Display for StopStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InitialAtr => write!(f, "InitialAtr"),
            Self::InitialRisk => write!(f, "InitialRisk"),
            Self::Breakeven => write!(f, "Breakeven"),
            Self::ModerateTrail => write!(f, "ModerateTrail"),
            Self::ProfitProtect => write!(f, "ProfitProtect"),
            Self::AggressiveTrail => write!(f, "AggressiveTrail"),
            Self::FallbackTrail => write!(f, "FallbackTrail"),
            Self::BoundedRisk => write!(f, "BoundedRisk"),
        }
    }
}

/// One recommended stop price, produced and consumed within a single cycle.
#[derive(Debug, Clone, Copy)]
pub struct StopCandidate {
    pub strategy: StopStrategy,
    pub price: f64,
}

// =============================================================================
// Engine
// =============================================================================

pub struct StopEngine {
    config: Arc<GuardConfig>,
    state: Arc<PositionStateStore>,
}

impl StopEngine {
    pub fn new(config: Arc<GuardConfig>, state: Arc<PositionStateStore>) -> Self {
        Self { config, state }
    }

    /// Evaluate the strategy pipeline for one position.
    ///
    /// Returns `None` when the engine declines to act this cycle: missing or
    /// degenerate inputs, an underwater position that is already protected,
    /// or a ratchet step that has not been crossed yet.
    pub fn recommend(
        &self,
        position: &Position,
        current_price: f64,
        existing_stop: Option<f64>,
        atr: Option<f64>,
    ) -> Option<StopCandidate> {
        let cfg = &self.config;
        let symbol = position.symbol.as_str();

        // ── Input guards: skip, never crash ─────────────────────────────
        let quantity = position.abs_quantity();
        if quantity == 0.0 {
            info!(symbol, "zero quantity — skipping stop evaluation");
            return None;
        }
        if !current_price.is_finite() || current_price <= 0.0 {
            info!(symbol, current_price, "invalid current price — skipping");
            return None;
        }
        let entry = position.entry_price;
        if !entry.is_finite() || entry <= 0.0 {
            info!(symbol, entry, "invalid entry price — skipping");
            return None;
        }

        let side = position.side();
        let is_long = position.is_long();
        let key = position.state_key();

        let fee = entry * quantity * cfg.taker_fee_rate;
        let fee_per_unit = fee / quantity;
        let net_profit = position.unrealized_pnl - fee;
        let profit_pct = if is_long {
            (current_price - entry) / entry
        } else {
            (entry - current_price) / entry
        };

        debug!(
            symbol,
            %side,
            entry,
            current_price,
            net_profit = format!("{net_profit:.4}"),
            profit_pct = format!("{profit_pct:.5}"),
            has_stop = existing_stop.is_some(),
            "evaluating stop strategies"
        );

        // ── 1. Initial ATR stop ─────────────────────────────────────────
        if existing_stop.is_none() && cfg.enable_atr_stop {
            return match atr {
                Some(atr) if atr.is_finite() && atr > 0.0 => {
                    let distance =
                        (atr * cfg.atr_multiplier).max(entry * cfg.min_stop_distance_pct);
                    let price = Self::loss_side(entry, distance, side);
                    Some(self.emit(symbol, StopStrategy::InitialAtr, price))
                }
                _ => {
                    // Safety gate: never size a first stop from a guessed
                    // volatility. The next cycle will have the klines.
                    info!(symbol, "ATR unavailable — deferring initial stop");
                    None
                }
            };
        }

        // ── 2. Not-in-profit hold ───────────────────────────────────────
        if net_profit <= 0.0 {
            if existing_stop.is_some() {
                // Trailing while underwater would lock in losses; the fixed
                // initial boundary already in place is the only protection.
                debug!(symbol, "not in profit — holding existing stop");
                return None;
            }
            if let Some(price) = self.initial_risk_stop(position, side) {
                return Some(self.emit(symbol, StopStrategy::InitialRisk, price));
            }
            return self.bounded_risk_fallback(position, side, existing_stop);
        }

        // ── Watermark update precedes every trailing computation ────────
        let watermark = self.state.update_watermark(&key, side, current_price);
        let anchor = watermark.favorable(side);

        // ── 3. Breakeven protection ─────────────────────────────────────
        if profit_pct < cfg.breakeven_threshold_pct {
            let price = Self::favorable_side(
                entry,
                fee_per_unit + entry * cfg.breakeven_buffer_pct,
                side,
            );
            return Some(self.emit(symbol, StopStrategy::Breakeven, price));
        }

        // ── Ratchet gate for the trailing/protection strategies ─────────
        let step_value = entry * quantity * cfg.step_profit_pct;
        let last_step = self.state.last_step(&key);
        if step_value > 0.0 && net_profit <= last_step + step_value {
            debug!(
                symbol,
                net_profit = format!("{net_profit:.4}"),
                last_step = format!("{last_step:.4}"),
                step_value = format!("{step_value:.4}"),
                "ratchet step not crossed — no trailing move"
            );
            if existing_stop.is_some() {
                return None;
            }
            return self.bounded_risk_fallback(position, side, existing_stop);
        }

        let record_step = |engine: &Self| {
            if step_value > 0.0 {
                let threshold = (net_profit / step_value).floor() * step_value;
                engine.state.record_step(&key, threshold);
            }
        };

        // ── 4. Moderate trailing ────────────────────────────────────────
        if profit_pct < cfg.aggressive_threshold_pct {
            let price = Self::trail_from(anchor, cfg.trailing_pct, side);
            if Self::strictly_better(price, existing_stop, is_long) {
                record_step(self);
                return Some(self.emit(symbol, StopStrategy::ModerateTrail, price));
            }
        }

        // ── 5. Profit protection ────────────────────────────────────────
        if profit_pct >= cfg.profit_protection_threshold_pct {
            let locked = profit_pct * cfg.profit_lock_fraction;
            let price = if is_long {
                (entry + fee_per_unit) * (1.0 + locked)
            } else {
                (entry - fee_per_unit) * (1.0 - locked)
            };
            record_step(self);
            return Some(self.emit(symbol, StopStrategy::ProfitProtect, price));
        }

        // ── 6. Aggressive trailing ──────────────────────────────────────
        if profit_pct >= cfg.aggressive_threshold_pct {
            let price = Self::trail_from(anchor, cfg.tight_trailing_pct, side);
            if Self::strictly_better(price, existing_stop, is_long) {
                record_step(self);
                return Some(self.emit(symbol, StopStrategy::AggressiveTrail, price));
            }
        }

        // ── 7. Fallback trailing ────────────────────────────────────────
        // In profit and nothing above fired: emit the moderate formula
        // unconditionally and let the improvement filter decide.
        let price = Self::trail_from(anchor, cfg.trailing_pct, side);
        record_step(self);
        Some(self.emit(symbol, StopStrategy::FallbackTrail, price))
    }

    // -------------------------------------------------------------------------
    // Strategy helpers
    // -------------------------------------------------------------------------

    /// Strategy 2: size the first stop so the loss at the trigger equals the
    /// configured fraction of margin-at-risk. `None` when leverage or
    /// notional data cannot support the division.
    fn initial_risk_stop(&self, position: &Position, side: PositionSide) -> Option<f64> {
        let cfg = &self.config;
        let quantity = position.abs_quantity();

        if position.leverage <= 0.0 || position.notional <= 0.0 {
            debug!(
                symbol = position.symbol.as_str(),
                leverage = position.leverage,
                notional = position.notional,
                "cannot size margin-risk stop"
            );
            return None;
        }

        let margin = position.notional / position.leverage;
        let max_loss = margin * cfg.initial_risk_fraction;
        let distance = max_loss / quantity;

        Some(Self::loss_side(position.entry_price, distance, side))
    }

    /// Strategy 8: hard cap on the adverse distance of a first stop.
    fn bounded_risk_fallback(
        &self,
        position: &Position,
        side: PositionSide,
        existing_stop: Option<f64>,
    ) -> Option<StopCandidate> {
        if existing_stop.is_some() {
            return None;
        }
        let distance = position.entry_price * self.config.max_initial_stop_distance_pct;
        let price = Self::loss_side(position.entry_price, distance, side);
        Some(self.emit(
            position.symbol.as_str(),
            StopStrategy::BoundedRisk,
            price,
        ))
    }

    fn emit(&self, symbol: &str, strategy: StopStrategy, price: f64) -> StopCandidate {
        info!(symbol, %strategy, price, "stop candidate");
        StopCandidate { strategy, price }
    }

    // -------------------------------------------------------------------------
    // Price arithmetic
    // -------------------------------------------------------------------------

    /// `distance` below entry for a long, above for a short.
    fn loss_side(entry: f64, distance: f64, side: PositionSide) -> f64 {
        match side {
            PositionSide::Long => entry - distance,
            PositionSide::Short => entry + distance,
        }
    }

    /// `offset` above entry for a long, below for a short.
    fn favorable_side(entry: f64, offset: f64, side: PositionSide) -> f64 {
        match side {
            PositionSide::Long => entry + offset,
            PositionSide::Short => entry - offset,
        }
    }

    /// Trail `pct` away from the watermark anchor.
    fn trail_from(anchor: f64, pct: f64, side: PositionSide) -> f64 {
        match side {
            PositionSide::Long => anchor * (1.0 - pct),
            PositionSide::Short => anchor * (1.0 + pct),
        }
    }

    /// Strictly better protection than `existing`. No existing stop means any
    /// stop is an improvement.
    fn strictly_better(candidate: f64, existing: Option<f64>, is_long: bool) -> bool {
        match existing {
            None => true,
            Some(stop) if is_long => candidate > stop,
            Some(stop) => candidate < stop,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn engine() -> StopEngine {
        engine_with(GuardConfig::default())
    }

    fn engine_with(config: GuardConfig) -> StopEngine {
        let config = Arc::new(config);
        let state = Arc::new(PositionStateStore::new(Duration::from_secs(86_400)));
        StopEngine::new(config, state)
    }

    /// Long 1 unit @ 100 on 5x leverage, uPnL as given.
    fn long_position(unrealized_pnl: f64) -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            entry_price: 100.0,
            quantity: 1.0,
            notional: 100.0,
            leverage: 5.0,
            unrealized_pnl,
        }
    }

    fn short_position(unrealized_pnl: f64) -> Position {
        Position {
            quantity: -1.0,
            ..long_position(unrealized_pnl)
        }
    }

    // ── Input guards ─────────────────────────────────────────────────────

    #[test]
    fn zero_quantity_skips() {
        let eng = engine();
        let mut pos = long_position(0.0);
        pos.quantity = 0.0;
        assert!(eng.recommend(&pos, 100.0, None, Some(1.0)).is_none());
    }

    #[test]
    fn invalid_price_skips() {
        let eng = engine();
        let pos = long_position(0.0);
        assert!(eng.recommend(&pos, f64::NAN, None, Some(1.0)).is_none());
        assert!(eng.recommend(&pos, 0.0, None, Some(1.0)).is_none());
        assert!(eng.recommend(&pos, -1.0, None, Some(1.0)).is_none());
    }

    // ── Strategy 1: initial ATR stop ─────────────────────────────────────

    #[test]
    fn initial_atr_stop_long() {
        let eng = engine();
        let pos = long_position(0.0);

        // distance = 1.0 * 2.0 = 2.0, above the 0.5 floor.
        let c = eng.recommend(&pos, 100.0, None, Some(1.0)).unwrap();
        assert_eq!(c.strategy, StopStrategy::InitialAtr);
        assert!((c.price - 98.0).abs() < 1e-9);
    }

    #[test]
    fn initial_atr_stop_short() {
        let eng = engine();
        let pos = short_position(0.0);

        let c = eng.recommend(&pos, 100.0, None, Some(1.0)).unwrap();
        assert_eq!(c.strategy, StopStrategy::InitialAtr);
        assert!((c.price - 102.0).abs() < 1e-9);
    }

    #[test]
    fn initial_atr_stop_clips_to_min_distance() {
        let eng = engine();
        let pos = long_position(0.0);

        // 0.1 * 2.0 = 0.2 < entry * 0.005 = 0.5 -> clipped.
        let c = eng.recommend(&pos, 100.0, None, Some(0.1)).unwrap();
        assert!((c.price - 99.5).abs() < 1e-9);
    }

    #[test]
    fn missing_atr_defers_initial_stop() {
        let eng = engine();
        let pos = long_position(0.0);
        assert!(eng.recommend(&pos, 100.0, None, None).is_none());
        assert!(eng.recommend(&pos, 100.0, None, Some(f64::NAN)).is_none());
    }

    // ── Strategy 2: not-in-profit hold ───────────────────────────────────

    #[test]
    fn underwater_position_with_stop_is_held() {
        let eng = engine();
        let pos = long_position(-5.0);
        // Existing protection present: no trailing, no change.
        assert!(eng.recommend(&pos, 95.0, Some(97.0), Some(1.0)).is_none());
    }

    #[test]
    fn underwater_unprotected_gets_margin_risk_stop() {
        let mut cfg = GuardConfig::default();
        cfg.enable_atr_stop = false;
        let eng = engine_with(cfg);
        let pos = long_position(-5.0);

        // margin = 100 / 5 = 20; max loss = 10; distance = 10 -> stop 90.
        let c = eng.recommend(&pos, 95.0, None, None).unwrap();
        assert_eq!(c.strategy, StopStrategy::InitialRisk);
        assert!((c.price - 90.0).abs() < 1e-9);
    }

    #[test]
    fn underwater_never_gets_trailing_recommendation() {
        let eng = engine();
        let pos = long_position(-5.0);
        // Run several cycles with rising prices; with a stop in place the
        // engine must stay silent while net profit is negative.
        for price in [95.0, 96.0, 97.0] {
            assert!(eng.recommend(&pos, price, Some(90.0), Some(1.0)).is_none());
        }
    }

    // ── Strategy 3: breakeven protection ─────────────────────────────────

    #[test]
    fn breakeven_guarantee() {
        let eng = engine();
        // Small positive net profit: uPnL 0.3, fee 0.05 -> net 0.25;
        // profit_pct 0.003 is below the 0.005 breakeven threshold.
        let pos = long_position(0.3);

        let c = eng.recommend(&pos, 100.3, Some(98.0), Some(1.0)).unwrap();
        assert_eq!(c.strategy, StopStrategy::Breakeven);
        // entry + fee_per_unit + entry * buffer = 100 + 0.05 + 0.1.
        assert!(c.price >= 100.15 - 1e-9, "stop {} below breakeven floor", c.price);
    }

    #[test]
    fn breakeven_short_is_below_entry() {
        let eng = engine();
        let pos = short_position(0.3);

        let c = eng.recommend(&pos, 99.7, Some(102.0), Some(1.0)).unwrap();
        assert_eq!(c.strategy, StopStrategy::Breakeven);
        assert!((c.price - (100.0 - 0.05 - 0.1)).abs() < 1e-9);
    }

    // ── Strategy 4: moderate trailing ────────────────────────────────────

    #[test]
    fn moderate_trailing_uses_watermark() {
        let eng = engine();
        // profit_pct 0.007 sits in the moderate band; net 0.7 - 0.05 = 0.65
        // crosses the first 0.5 step.
        let pos = long_position(0.7);

        let c = eng.recommend(&pos, 100.7, Some(98.0), Some(1.0)).unwrap();
        assert_eq!(c.strategy, StopStrategy::ModerateTrail);
        // watermark 100.7, trail 1% -> 99.693.
        assert!((c.price - 100.7 * 0.99).abs() < 1e-9);
    }

    #[test]
    fn moderate_trailing_short() {
        let eng = engine();
        let pos = short_position(0.7);

        let c = eng.recommend(&pos, 99.3, Some(102.0), Some(1.0)).unwrap();
        assert_eq!(c.strategy, StopStrategy::ModerateTrail);
        assert!((c.price - 99.3 * 1.01).abs() < 1e-9);
    }

    #[test]
    fn watermark_survives_pullback() {
        let eng = engine();
        let pos = long_position(0.7);

        // First cycle establishes the 100.7 watermark.
        let c1 = eng.recommend(&pos, 100.7, Some(98.0), Some(1.0)).unwrap();
        // Price pulls back but the anchor holds; the fallback re-emits the
        // same trail price computed from the 100.7 high.
        let pos2 = long_position(0.65);
        let c2 = eng.recommend(&pos2, 100.65, Some(98.0), Some(1.0));
        if let Some(c2) = c2 {
            assert!(c2.price <= c1.price + 1e-9);
        }
    }

    // ── Ratchet gating ───────────────────────────────────────────────────

    #[test]
    fn ratchet_blocks_repeat_of_same_boundary() {
        let eng = engine();
        let pos = long_position(0.7);

        // net 0.65 crosses the first step (0.5) and records it.
        let first = eng.recommend(&pos, 100.7, Some(98.0), Some(1.0));
        assert!(first.is_some());

        // Same net profit again: boundary already consumed, stop holds.
        let second = eng.recommend(&pos, 100.7, Some(99.693), Some(1.0));
        assert!(second.is_none());
    }

    #[test]
    fn ratchet_reopens_after_next_step() {
        let eng = engine();

        let pos = long_position(0.7);
        assert!(eng.recommend(&pos, 100.7, Some(98.0), Some(1.0)).is_some());

        // Net profit grows past last_step (0.5) + step (0.5).
        let pos = long_position(1.2);
        let c = eng.recommend(&pos, 101.2, Some(99.7), Some(1.0));
        assert!(c.is_some());
    }

    // ── Strategy 5: profit protection ────────────────────────────────────

    #[test]
    fn profit_protection_locks_half_the_move() {
        let eng = engine();
        // profit_pct 0.03 >= 0.02 threshold; net 3 - 0.05 crosses the step.
        let pos = long_position(3.0);

        let c = eng.recommend(&pos, 103.0, Some(100.2), Some(1.0)).unwrap();
        assert_eq!(c.strategy, StopStrategy::ProfitProtect);
        // (100 + 0.05) * (1 + 0.03 * 0.5) = 100.05 * 1.015.
        assert!((c.price - 100.05 * 1.015).abs() < 1e-9);
    }

    #[test]
    fn profit_protection_takes_precedence_over_tight_trail() {
        let eng = engine();
        let pos = long_position(3.0);
        let c = eng.recommend(&pos, 103.0, Some(100.2), Some(1.0)).unwrap();
        assert_ne!(c.strategy, StopStrategy::AggressiveTrail);
    }

    // ── Strategy 6: aggressive trailing ──────────────────────────────────

    #[test]
    fn aggressive_trailing_between_thresholds() {
        let eng = engine();
        // profit_pct 0.012: past aggressive (0.01), short of protection (0.02).
        let pos = long_position(1.2);

        let c = eng.recommend(&pos, 101.2, Some(99.0), Some(1.0)).unwrap();
        assert_eq!(c.strategy, StopStrategy::AggressiveTrail);
        // watermark 101.2, tight trail 0.3% -> 100.8964.
        assert!((c.price - 101.2 * 0.997).abs() < 1e-9);
    }

    #[test]
    fn aggressive_trail_is_tighter_than_moderate() {
        let cfg = GuardConfig::default();
        let anchor = 101.2;
        let moderate = anchor * (1.0 - cfg.trailing_pct);
        let tight = anchor * (1.0 - cfg.tight_trailing_pct);
        assert!(tight > moderate);
    }

    // ── Strategy 7: fallback trailing ────────────────────────────────────

    #[test]
    fn fallback_emits_when_trail_not_strictly_better() {
        let eng = engine();
        let pos = long_position(0.7);

        // Existing stop already above the moderate trail candidate (99.693):
        // strategy 4's gate fails, 5/6 are out of band, 7 emits anyway and
        // leaves the rejection to the orchestrator's improvement filter.
        let c = eng.recommend(&pos, 100.7, Some(99.9), Some(1.0)).unwrap();
        assert_eq!(c.strategy, StopStrategy::FallbackTrail);
        assert!((c.price - 100.7 * 0.99).abs() < 1e-9);
    }

    // ── Strategy 8: bounded-risk fallback ────────────────────────────────

    #[test]
    fn bounded_risk_caps_unprotected_position() {
        let mut cfg = GuardConfig::default();
        cfg.enable_atr_stop = false;
        let eng = engine_with(cfg);

        // Underwater, no stop, and no leverage data to size a margin stop.
        let mut pos = long_position(-5.0);
        pos.leverage = 0.0;

        let c = eng.recommend(&pos, 95.0, None, None).unwrap();
        assert_eq!(c.strategy, StopStrategy::BoundedRisk);
        assert!((c.price - 97.0).abs() < 1e-9);
    }

    #[test]
    fn bounded_risk_short() {
        let mut cfg = GuardConfig::default();
        cfg.enable_atr_stop = false;
        let eng = engine_with(cfg);

        let mut pos = short_position(-5.0);
        pos.leverage = 0.0;

        let c = eng.recommend(&pos, 105.0, None, None).unwrap();
        assert_eq!(c.strategy, StopStrategy::BoundedRisk);
        assert!((c.price - 103.0).abs() < 1e-9);
    }
}
