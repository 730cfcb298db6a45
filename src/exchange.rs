// =============================================================================
// Exchange boundary — the method-shaped seam the engine programs against
// =============================================================================
//
// The orchestrator only ever talks to this trait; the reqwest-backed Binance
// futures client implements it for production and the tests swap in a mock.
// The wire protocol stays inside the implementation.
// =============================================================================

use anyhow::Result;

use crate::types::{Kline, Position, StopOrder, SymbolPrecision};

pub trait ExchangeApi: Send + Sync {
    /// Connectivity probe used by the health check.
    fn ping(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// All positions with a non-zero quantity.
    fn list_open_positions(&self)
        -> impl std::future::Future<Output = Result<Vec<Position>>> + Send;

    /// Last traded price for `symbol`.
    fn get_price(&self, symbol: &str) -> impl std::future::Future<Output = Result<f64>> + Send;

    /// Historical bars, oldest first.
    fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<Kline>>> + Send;

    /// Open STOP_MARKET orders for `symbol`.
    fn get_open_stop_orders(
        &self,
        symbol: &str,
    ) -> impl std::future::Future<Output = Result<Vec<StopOrder>>> + Send;

    /// Cancel every open order for `symbol`.
    fn cancel_all_orders(&self, symbol: &str)
        -> impl std::future::Future<Output = Result<()>> + Send;

    /// Place a close-position STOP_MARKET order triggered at `stop_price`.
    fn place_stop_market_order(
        &self,
        symbol: &str,
        side: &str,
        stop_price: f64,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Price/quantity decimal precision for `symbol`.
    fn get_symbol_precision(
        &self,
        symbol: &str,
    ) -> impl std::future::Future<Output = Result<SymbolPrecision>> + Send;
}
