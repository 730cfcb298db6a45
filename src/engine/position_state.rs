// =============================================================================
// Position State Store — watermark and ratchet state that outlives a cycle
// =============================================================================
//
// Unlike the price/position caches, these entries encode position *history*:
// the best price seen since open and the last net-profit step at which the
// stop was advanced. They live on day-scale TTLs and are keyed by
// symbol + side, so partial adds/reduces keep the state; the orchestrator
// prunes a key once its position has fully closed (quantity through zero).
// =============================================================================

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info};

use crate::resilience::TtlCache;
use crate::types::PositionSide;

/// Highest (long) and lowest (short) price observed since the position was
/// first seen. Extends only in the favorable direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Watermark {
    pub high: f64,
    pub low: f64,
}

impl Watermark {
    /// The trailing anchor for the given side.
    pub fn favorable(&self, side: PositionSide) -> f64 {
        match side {
            PositionSide::Long => self.high,
            PositionSide::Short => self.low,
        }
    }
}

pub struct PositionStateStore {
    watermarks: TtlCache<Watermark>,
    steps: TtlCache<f64>,
    ttl: Duration,
}

impl PositionStateStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            watermarks: TtlCache::new(),
            steps: TtlCache::new(),
            ttl,
        }
    }

    /// Fold `current_price` into the watermark for `key`, extending it only
    /// in the favorable direction, and persist the result.
    pub fn update_watermark(
        &self,
        key: &str,
        side: PositionSide,
        current_price: f64,
    ) -> Watermark {
        let mut mark = self.watermarks.get(key, self.ttl).unwrap_or(Watermark {
            high: current_price,
            low: current_price,
        });

        match side {
            PositionSide::Long => mark.high = mark.high.max(current_price),
            PositionSide::Short => mark.low = mark.low.min(current_price),
        }

        self.watermarks.set(key, mark);
        debug!(key, high = mark.high, low = mark.low, "watermark updated");
        mark
    }

    /// Last net-profit threshold at which the stop was stepped (0.0 before
    /// the first step).
    pub fn last_step(&self, key: &str) -> f64 {
        self.steps.get(key, self.ttl).unwrap_or(0.0)
    }

    /// Persist a new step threshold. Never moves backwards.
    pub fn record_step(&self, key: &str, threshold: f64) {
        let current = self.last_step(key);
        if threshold > current {
            self.steps.set(key, threshold);
            debug!(key, threshold, "ratchet step recorded");
        }
    }

    /// Drop state for every key that is no longer in `open_keys` — the
    /// position behind it has fully closed.
    pub fn prune(&self, open_keys: &HashSet<String>) {
        for key in self.watermarks.keys() {
            if !open_keys.contains(&key) {
                self.watermarks.invalidate(&key);
                self.steps.invalidate(&key);
                info!(key, "position closed — watermark/ratchet state cleared");
            }
        }
        for key in self.steps.keys() {
            if !open_keys.contains(&key) {
                self.steps.invalidate(&key);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(86_400);

    #[test]
    fn watermark_extends_up_for_long() {
        let store = PositionStateStore::new(DAY);
        store.update_watermark("BTCUSDT:LONG", PositionSide::Long, 100.0);
        store.update_watermark("BTCUSDT:LONG", PositionSide::Long, 105.0);
        let mark = store.update_watermark("BTCUSDT:LONG", PositionSide::Long, 102.0);

        // Pullback to 102 must not shrink the high.
        assert_eq!(mark.favorable(PositionSide::Long), 105.0);
    }

    #[test]
    fn watermark_extends_down_for_short() {
        let store = PositionStateStore::new(DAY);
        store.update_watermark("ETHUSDT:SHORT", PositionSide::Short, 100.0);
        store.update_watermark("ETHUSDT:SHORT", PositionSide::Short, 95.0);
        let mark = store.update_watermark("ETHUSDT:SHORT", PositionSide::Short, 98.0);

        assert_eq!(mark.favorable(PositionSide::Short), 95.0);
    }

    #[test]
    fn first_observation_seeds_both_sides() {
        let store = PositionStateStore::new(DAY);
        let mark = store.update_watermark("BTCUSDT:LONG", PositionSide::Long, 100.0);
        assert_eq!(mark.high, 100.0);
        assert_eq!(mark.low, 100.0);
    }

    #[test]
    fn steps_default_to_zero_and_only_advance() {
        let store = PositionStateStore::new(DAY);
        assert_eq!(store.last_step("BTCUSDT:LONG"), 0.0);

        store.record_step("BTCUSDT:LONG", 1.5);
        assert_eq!(store.last_step("BTCUSDT:LONG"), 1.5);

        // A lower threshold is ignored.
        store.record_step("BTCUSDT:LONG", 1.0);
        assert_eq!(store.last_step("BTCUSDT:LONG"), 1.5);

        store.record_step("BTCUSDT:LONG", 2.0);
        assert_eq!(store.last_step("BTCUSDT:LONG"), 2.0);
    }

    #[test]
    fn prune_clears_closed_positions_only() {
        let store = PositionStateStore::new(DAY);
        store.update_watermark("BTCUSDT:LONG", PositionSide::Long, 100.0);
        store.record_step("BTCUSDT:LONG", 1.0);
        store.update_watermark("ETHUSDT:SHORT", PositionSide::Short, 50.0);

        let open: HashSet<String> = ["ETHUSDT:SHORT".to_string()].into_iter().collect();
        store.prune(&open);

        // Closed long is gone: the next observation re-seeds from scratch.
        let mark = store.update_watermark("BTCUSDT:LONG", PositionSide::Long, 90.0);
        assert_eq!(mark.high, 90.0);
        assert_eq!(store.last_step("BTCUSDT:LONG"), 0.0);

        // Still-open short survives.
        let mark = store.update_watermark("ETHUSDT:SHORT", PositionSide::Short, 60.0);
        assert_eq!(mark.favorable(PositionSide::Short), 50.0);
    }

    #[test]
    fn sides_do_not_share_state() {
        let store = PositionStateStore::new(DAY);
        store.update_watermark("BTCUSDT:LONG", PositionSide::Long, 100.0);
        let mark = store.update_watermark("BTCUSDT:SHORT", PositionSide::Short, 90.0);
        assert_eq!(mark.low, 90.0);
        assert_eq!(mark.high, 90.0);
    }
}
