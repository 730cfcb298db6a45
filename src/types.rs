// =============================================================================
// Shared types used across the Aegis protection engine
// =============================================================================
//
// Everything the exchange hands back is parsed into these structs at the
// client boundary; the decision engine never sees loosely-typed JSON.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of an open position, derived from the sign of its quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that closes a position of this direction.
    pub fn close_order_side(self) -> &'static str {
        match self {
            Self::Long => "SELL",
            Self::Short => "BUY",
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Read-only snapshot of an open futures position.
///
/// Owned by the exchange; the engine fetches a fresh snapshot each cycle and
/// never mutates it locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub entry_price: f64,
    /// Signed quantity: positive = long, negative = short.
    pub quantity: f64,
    /// Dollar-equivalent exposure (size × price).
    #[serde(default)]
    pub notional: f64,
    #[serde(default)]
    pub leverage: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
}

impl Position {
    pub fn side(&self) -> PositionSide {
        if self.quantity > 0.0 {
            PositionSide::Long
        } else {
            PositionSide::Short
        }
    }

    pub fn is_long(&self) -> bool {
        self.quantity > 0.0
    }

    /// Unsigned position size.
    pub fn abs_quantity(&self) -> f64 {
        self.quantity.abs()
    }

    /// Stable identity for watermark/ratchet state. Keyed by symbol + side so
    /// partial adds/reduces keep the state; a full close removes the position
    /// from the open list and the state is pruned there.
    pub fn state_key(&self) -> String {
        format!("{}:{}", self.symbol, self.side())
    }
}

/// One OHLC bar, ordered oldest-first in every sequence the engine handles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// An existing protective order on the exchange, read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopOrder {
    pub order_id: u64,
    /// "BUY" or "SELL" as reported by the exchange.
    pub side: String,
    pub stop_price: f64,
}

/// Price/quantity decimal precision reported by the instrument.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolPrecision {
    pub price_decimals: u32,
    pub quantity_decimals: u32,
}

/// Round `value` to `decimals` decimal places.
pub fn round_to_decimals(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}
