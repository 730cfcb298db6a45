// =============================================================================
// Protection Orchestrator — one protect-all-positions pass per cycle
// =============================================================================
//
// Per cycle: list open positions (cached), fetch the current price and the
// existing stop per position, ask the decision engine for a candidate, apply
// the improvement filter, and cancel-then-place when it passes. Every remote
// call goes through the fixed resilience pipeline: rate limiter, then retry,
// then the underlying call. Reads and order writes pace through separate
// limiters.
//
// `run_cycle` never raises: per-symbol failures are contained, logged, and
// counted; the cycle always completes for the whole position list.
//
// Cancel-then-place is deliberately non-transactional — a crash between the
// two calls leaves a brief unprotected window, accepted and logged rather
// than masked.
// =============================================================================

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::GuardConfig;
use crate::engine::{PositionStateStore, StopCandidate, StopEngine};
use crate::exchange::ExchangeApi;
use crate::indicators::average_true_range;
use crate::resilience::{RateLimiter, RetryPolicy, TtlCache};
use crate::types::{round_to_decimals, Kline, Position, SymbolPrecision};

/// Housekeeping horizon for the end-of-cycle cache sweep.
const SWEEP_HORIZON: Duration = Duration::from_secs(300);

/// Fallback instrument precision when exchange info is unavailable.
const DEFAULT_PRECISION: SymbolPrecision = SymbolPrecision {
    price_decimals: 2,
    quantity_decimals: 3,
};

const POSITIONS_KEY: &str = "open_positions";

// =============================================================================
// Cycle report
// =============================================================================

/// Outcome summary of one monitoring cycle, for logs and notifications.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub started_at: String,
    pub evaluated: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    /// "SYMBOL: error" lines for the failures above.
    pub failures: Vec<String>,
}

enum ProtectOutcome {
    Updated,
    Skipped,
    Failed(String),
}

// =============================================================================
// Orchestrator
// =============================================================================

pub struct ProtectionOrchestrator<E: ExchangeApi> {
    exchange: Arc<E>,
    config: Arc<GuardConfig>,
    engine: StopEngine,
    state: Arc<PositionStateStore>,

    positions: TtlCache<Vec<Position>>,
    prices: TtlCache<f64>,
    klines: TtlCache<Vec<Kline>>,
    atr_values: TtlCache<f64>,
    precisions: TtlCache<SymbolPrecision>,

    read_gate: RateLimiter,
    order_gate: RateLimiter,
    retry: RetryPolicy,

    last_health_check: parking_lot::Mutex<Option<Instant>>,
}

impl<E: ExchangeApi> ProtectionOrchestrator<E> {
    pub fn new(exchange: Arc<E>, config: Arc<GuardConfig>) -> Self {
        let state = Arc::new(PositionStateStore::new(config.state_cache_ttl()));
        let engine = StopEngine::new(Arc::clone(&config), Arc::clone(&state));

        let read_gate = RateLimiter::new(config.read_calls_per_second);
        let order_gate = RateLimiter::new(config.order_calls_per_second);
        let retry = RetryPolicy::new(config.max_retries, config.retry_base_delay());

        Self {
            exchange,
            config,
            engine,
            state,
            positions: TtlCache::new(),
            prices: TtlCache::new(),
            klines: TtlCache::new(),
            atr_values: TtlCache::new(),
            precisions: TtlCache::new(),
            read_gate,
            order_gate,
            retry,
            last_health_check: parking_lot::Mutex::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Cycle entry point
    // -------------------------------------------------------------------------

    /// Execute one full protect-all-positions pass. Never returns an error;
    /// per-symbol failures are contained and reported in the cycle report.
    pub async fn run_cycle(&self) -> CycleReport {
        let cycle_id = Uuid::new_v4().to_string();
        let started_at = Utc::now().to_rfc3339();

        let mut report = CycleReport {
            cycle_id: cycle_id.clone(),
            started_at,
            evaluated: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            failures: Vec::new(),
        };

        let positions = match self.open_positions().await {
            Ok(positions) => positions,
            Err(err) => {
                error!(cycle_id = %cycle_id, error = %err, "failed to list open positions");
                report.failed = 1;
                report.failures.push(format!("positions: {err:#}"));
                return report;
            }
        };

        info!(cycle_id = %cycle_id, count = positions.len(), "monitoring cycle started");

        for position in &positions {
            report.evaluated += 1;
            match self.protect_position(position).await {
                ProtectOutcome::Updated => report.updated += 1,
                ProtectOutcome::Skipped => report.skipped += 1,
                ProtectOutcome::Failed(reason) => {
                    report.failed += 1;
                    report.failures.push(format!("{}: {}", position.symbol, reason));
                }
            }
        }

        // Positions that disappeared from the open list have fully closed;
        // their watermark/ratchet state must not leak into a reopened trade.
        let open_keys: HashSet<String> = positions.iter().map(|p| p.state_key()).collect();
        self.state.prune(&open_keys);

        self.sweep_caches();

        info!(
            cycle_id = %cycle_id,
            evaluated = report.evaluated,
            updated = report.updated,
            skipped = report.skipped,
            failed = report.failed,
            "monitoring cycle complete"
        );

        report
    }

    /// Evaluate and, when warranted, re-protect a single position.
    async fn protect_position(&self, position: &Position) -> ProtectOutcome {
        let symbol = position.symbol.as_str();

        info!(
            symbol,
            quantity = position.quantity,
            entry_price = position.entry_price,
            unrealized_pnl = position.unrealized_pnl,
            "position under watch"
        );

        let current_price = match self.price(symbol).await {
            Ok(price) => price,
            Err(err) => {
                error!(symbol, error = %err, "price unavailable — symbol failed this cycle");
                return ProtectOutcome::Failed(format!("price: {err:#}"));
            }
        };

        let existing_stop = match self.existing_stop(symbol).await {
            Ok(stop) => stop,
            Err(err) => {
                error!(symbol, error = %err, "stop order lookup failed");
                return ProtectOutcome::Failed(format!("stop lookup: {err:#}"));
            }
        };

        // ATR only matters for a first stop; skip the kline fetch otherwise.
        let atr = if existing_stop.is_none() {
            self.atr(symbol).await
        } else {
            None
        };

        let candidate = match self
            .engine
            .recommend(position, current_price, existing_stop, atr)
        {
            Some(candidate) => candidate,
            None => {
                debug!(symbol, "no recommendation this cycle");
                return ProtectOutcome::Skipped;
            }
        };

        // ── Improvement filter (hard invariant) ─────────────────────────
        // Applied here, not inside the strategies, so it uniformly protects
        // every strategy including future additions.
        if let Some(stop) = existing_stop {
            if !Self::improves(stop, candidate.price, position.is_long()) {
                info!(
                    symbol,
                    existing_stop = stop,
                    candidate = candidate.price,
                    strategy = %candidate.strategy,
                    "candidate would worsen protection — rejected"
                );
                return ProtectOutcome::Skipped;
            }
        }

        match self.submit_stop(position, current_price, &candidate).await {
            Ok(true) => ProtectOutcome::Updated,
            Ok(false) => ProtectOutcome::Skipped,
            Err(err) => {
                error!(symbol, error = %err, "stop update failed");
                ProtectOutcome::Failed(format!("submit: {err:#}"))
            }
        }
    }

    /// Strictly better protection: higher for a long, lower for a short.
    fn improves(existing: f64, candidate: f64, is_long: bool) -> bool {
        if is_long {
            candidate > existing
        } else {
            candidate < existing
        }
    }

    // -------------------------------------------------------------------------
    // Order submission
    // -------------------------------------------------------------------------

    /// Round, validate, cancel-then-place. `Ok(false)` means the submission
    /// was skipped by validation rather than failed.
    async fn submit_stop(
        &self,
        position: &Position,
        current_price: f64,
        candidate: &StopCandidate,
    ) -> Result<bool> {
        let symbol = position.symbol.as_str();
        let precision = self.precision_for(symbol).await;
        let stop_price = round_to_decimals(candidate.price, precision.price_decimals);

        // The trigger must sit on the protective side of the current price or
        // the exchange would fire it immediately.
        let wrong_side = if position.is_long() {
            stop_price >= current_price
        } else {
            stop_price <= current_price
        };
        if wrong_side {
            warn!(
                symbol,
                stop_price,
                current_price,
                strategy = %candidate.strategy,
                "stop would trigger immediately — submission skipped"
            );
            return Ok(false);
        }

        // Cancel-then-place; no lock spans the two calls.
        self.guarded(&self.order_gate, "cancel_all_orders", || {
            self.exchange.cancel_all_orders(symbol)
        })
        .await
        .context("cancelling existing protective orders")?;

        let side = position.side().close_order_side();
        self.guarded(&self.order_gate, "place_stop_market_order", || {
            self.exchange.place_stop_market_order(symbol, side, stop_price)
        })
        .await
        .context("placing stop market order")?;

        // The position list now carries a stale view of protection.
        self.positions.invalidate(POSITIONS_KEY);

        info!(
            symbol,
            stop_price,
            strategy = %candidate.strategy,
            "protective stop updated"
        );
        Ok(true)
    }

    // -------------------------------------------------------------------------
    // Cache-backed remote reads
    // -------------------------------------------------------------------------

    async fn open_positions(&self) -> Result<Vec<Position>> {
        if let Some(positions) = self
            .positions
            .get(POSITIONS_KEY, self.config.position_cache_ttl())
        {
            return Ok(positions);
        }

        let positions = self
            .guarded(&self.read_gate, "list_open_positions", || {
                self.exchange.list_open_positions()
            })
            .await?;

        self.positions.set(POSITIONS_KEY, positions.clone());
        Ok(positions)
    }

    async fn price(&self, symbol: &str) -> Result<f64> {
        let key = format!("price_{symbol}");
        if let Some(price) = self.prices.get(&key, self.config.price_cache_ttl()) {
            return Ok(price);
        }

        let price = self
            .guarded(&self.read_gate, "get_price", || {
                self.exchange.get_price(symbol)
            })
            .await?;

        self.prices.set(&key, price);
        Ok(price)
    }

    async fn existing_stop(&self, symbol: &str) -> Result<Option<f64>> {
        let orders = self
            .guarded(&self.read_gate, "get_open_stop_orders", || {
                self.exchange.get_open_stop_orders(symbol)
            })
            .await?;

        Ok(orders.first().map(|order| order.stop_price))
    }

    /// Cached ATR for the configured period. Unavailability (insufficient
    /// history or a failed fetch) is data-unavailable, not an error: the
    /// engine's safety gate handles `None`.
    async fn atr(&self, symbol: &str) -> Option<f64> {
        let period = self.config.atr_period;
        let atr_key = format!("atr_{symbol}_{period}");
        if let Some(atr) = self.atr_values.get(&atr_key, self.config.atr_cache_ttl()) {
            return Some(atr);
        }

        let bars = match self.klines_for(symbol, period as u32 + 1).await {
            Ok(bars) => bars,
            Err(err) => {
                warn!(symbol, error = %err, "kline fetch failed — ATR unavailable");
                return None;
            }
        };

        let atr = average_true_range(&bars, period);
        match atr {
            Some(atr) => {
                self.atr_values.set(&atr_key, atr);
                debug!(symbol, period, atr, "ATR computed");
            }
            None => {
                info!(symbol, period, bars = bars.len(), "insufficient history for ATR");
            }
        }
        atr
    }

    async fn klines_for(&self, symbol: &str, limit: u32) -> Result<Vec<Kline>> {
        let interval = self.config.atr_timeframe.as_str();
        let key = format!("klines_{symbol}_{interval}_{limit}");
        if let Some(bars) = self.klines.get(&key, self.config.atr_cache_ttl()) {
            return Ok(bars);
        }

        let bars = self
            .guarded(&self.read_gate, "get_klines", || {
                self.exchange.get_klines(symbol, interval, limit)
            })
            .await?;

        self.klines.set(&key, bars.clone());
        Ok(bars)
    }

    /// Instrument precision, with a conservative default when the exchange
    /// info cannot be fetched.
    async fn precision_for(&self, symbol: &str) -> SymbolPrecision {
        let key = format!("precision_{symbol}");
        if let Some(precision) = self.precisions.get(&key, self.config.precision_cache_ttl()) {
            return precision;
        }

        match self
            .guarded(&self.read_gate, "get_symbol_precision", || {
                self.exchange.get_symbol_precision(symbol)
            })
            .await
        {
            Ok(precision) => {
                self.precisions.set(&key, precision);
                precision
            }
            Err(err) => {
                warn!(symbol, error = %err, "precision unavailable — using defaults");
                DEFAULT_PRECISION
            }
        }
    }

    // -------------------------------------------------------------------------
    // Resilience pipeline: limiter -> retry -> underlying call
    // -------------------------------------------------------------------------

    async fn guarded<T, F, Fut>(&self, gate: &RateLimiter, op: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        gate.acquire().await;
        self.retry.run(op, f).await
    }

    // -------------------------------------------------------------------------
    // Daemon support
    // -------------------------------------------------------------------------

    /// Shorter cadence whenever any position is in profit, so trailing reacts
    /// while the move is alive.
    pub async fn recommended_interval(&self) -> Duration {
        let aggressive = match self.open_positions().await {
            Ok(positions) => positions.iter().any(|p| p.unrealized_pnl > 0.0),
            Err(err) => {
                warn!(error = %err, "interval check failed — using normal cadence");
                false
            }
        };

        if aggressive {
            Duration::from_secs(self.config.aggressive_interval_secs)
        } else {
            Duration::from_secs(self.config.normal_interval_secs)
        }
    }

    /// Probe exchange connectivity at most once per configured interval.
    /// Returns `false` only when a due probe fails.
    pub async fn health_check(&self) -> bool {
        let interval = Duration::from_secs(self.config.health_check_interval_secs);
        {
            let last = self.last_health_check.lock();
            if let Some(at) = *last {
                if at.elapsed() < interval {
                    return true;
                }
            }
        }

        match self
            .guarded(&self.read_gate, "ping", || self.exchange.ping())
            .await
        {
            Ok(()) => {
                *self.last_health_check.lock() = Some(Instant::now());
                info!("health check passed");
                true
            }
            Err(err) => {
                error!(error = %err, "health check failed");
                false
            }
        }
    }

    /// End-of-cycle housekeeping sweep over every read cache.
    pub fn sweep_caches(&self) {
        self.positions.sweep(SWEEP_HORIZON);
        self.prices.sweep(SWEEP_HORIZON);
        self.klines.sweep(SWEEP_HORIZON);
        self.atr_values.sweep(SWEEP_HORIZON);
        self.precisions.sweep(SWEEP_HORIZON);

        debug!(
            positions = self.positions.stats().entry_count,
            prices = self.prices.stats().entry_count,
            klines = self.klines.stats().entry_count,
            "cache sweep complete"
        );
    }
}
