// =============================================================================
// Binance USD-M Futures REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. All signed requests
// include X-MBX-APIKEY as a header and a recvWindow of 5 000 ms to tolerate
// minor clock drift between the daemon and Binance servers.
//
// Responses are parsed into the typed records in `types.rs` right here; the
// rest of the engine never touches raw JSON.
// =============================================================================

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use crate::exchange::ExchangeApi;
use crate::types::{Kline, Position, StopOrder, SymbolPrecision};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Binance futures REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceFuturesClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `BinanceFuturesClient`.
    ///
    /// # Arguments
    /// * `api_key` — Binance API key (sent as a header, never in query params).
    /// * `secret`  — Binance secret key used exclusively for HMAC signing.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        // The API key header is required for all signed endpoints.
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("BinanceFuturesClient initialised (base_url=https://fapi.binance.com)");

        Self {
            api_key,
            secret,
            base_url: "https://fapi.binance.com".to_string(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Send `req`, verify the HTTP status and parse the JSON body.
    async fn expect_json(
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<serde_json::Value> {
        let resp = req
            .send()
            .await
            .with_context(|| format!("{what} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {what} response"))?;

        if !status.is_success() {
            anyhow::bail!("Binance {what} returned {status}: {body}");
        }

        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_str_f64(val: &serde_json::Value) -> Result<f64> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .with_context(|| format!("failed to parse '{s}' as f64"))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            anyhow::bail!("expected string or number, got: {val}")
        }
    }
}

// =============================================================================
// ExchangeApi implementation
// =============================================================================

impl ExchangeApi for BinanceFuturesClient {
    /// GET /fapi/v1/ping (public).
    #[instrument(skip(self), name = "binance::ping")]
    async fn ping(&self) -> Result<()> {
        let url = format!("{}/fapi/v1/ping", self.base_url);
        Self::expect_json(self.client.get(&url), "GET /fapi/v1/ping").await?;
        debug!("exchange ping ok");
        Ok(())
    }

    /// GET /fapi/v2/positionRisk (signed) — open positions only.
    #[instrument(skip(self), name = "binance::list_open_positions")]
    async fn list_open_positions(&self) -> Result<Vec<Position>> {
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v2/positionRisk?{}", self.base_url, qs);

        let body =
            Self::expect_json(self.client.get(&url), "GET /fapi/v2/positionRisk").await?;

        let raw = body
            .as_array()
            .context("positionRisk response is not an array")?;

        let mut positions = Vec::new();
        for entry in raw {
            let quantity = Self::parse_str_f64(&entry["positionAmt"])?;
            if quantity == 0.0 {
                continue;
            }

            positions.push(Position {
                symbol: entry["symbol"]
                    .as_str()
                    .context("position missing 'symbol'")?
                    .to_string(),
                entry_price: Self::parse_str_f64(&entry["entryPrice"])?,
                quantity,
                notional: Self::parse_str_f64(&entry["notional"]).unwrap_or(0.0).abs(),
                leverage: Self::parse_str_f64(&entry["leverage"]).unwrap_or(0.0),
                unrealized_pnl: Self::parse_str_f64(&entry["unRealizedProfit"])?,
            });
        }

        debug!(count = positions.len(), "open positions retrieved");
        Ok(positions)
    }

    /// GET /fapi/v1/ticker/price (public).
    #[instrument(skip(self), name = "binance::get_price")]
    async fn get_price(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/fapi/v1/ticker/price?symbol={}", self.base_url, symbol);
        let body = Self::expect_json(self.client.get(&url), "GET /fapi/v1/ticker/price").await?;

        let price = Self::parse_str_f64(&body["price"])?;
        debug!(symbol, price, "price retrieved");
        Ok(price)
    }

    /// GET /fapi/v1/klines (public — no signature required).
    ///
    /// Array indices: [0] openTime, [1] open, [2] high, [3] low, [4] close.
    #[instrument(skip(self), name = "binance::get_klines")]
    async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Kline>> {
        let url = format!(
            "{}/fapi/v1/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );

        let body = Self::expect_json(self.client.get(&url), "GET /fapi/v1/klines").await?;

        let raw = body.as_array().context("klines response is not an array")?;

        let mut bars = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;

            if arr.len() < 5 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }

            bars.push(Kline {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: Self::parse_str_f64(&arr[1])?,
                high: Self::parse_str_f64(&arr[2])?,
                low: Self::parse_str_f64(&arr[3])?,
                close: Self::parse_str_f64(&arr[4])?,
            });
        }

        debug!(symbol, interval, count = bars.len(), "klines fetched");
        Ok(bars)
    }

    /// GET /fapi/v1/openOrders (signed), filtered to STOP_MARKET triggers.
    #[instrument(skip(self), name = "binance::get_open_stop_orders")]
    async fn get_open_stop_orders(&self, symbol: &str) -> Result<Vec<StopOrder>> {
        let params = format!("symbol={symbol}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/openOrders?{}", self.base_url, qs);

        let body = Self::expect_json(self.client.get(&url), "GET /fapi/v1/openOrders").await?;

        let raw = body
            .as_array()
            .context("openOrders response is not an array")?;

        let mut stops = Vec::new();
        for order in raw {
            if order["type"].as_str() != Some("STOP_MARKET") {
                continue;
            }
            stops.push(StopOrder {
                order_id: order["orderId"].as_u64().unwrap_or(0),
                side: order["side"].as_str().unwrap_or_default().to_string(),
                stop_price: Self::parse_str_f64(&order["stopPrice"])?,
            });
        }

        debug!(symbol, count = stops.len(), "open stop orders retrieved");
        Ok(stops)
    }

    /// DELETE /fapi/v1/allOpenOrders (signed).
    #[instrument(skip(self), name = "binance::cancel_all_orders")]
    async fn cancel_all_orders(&self, symbol: &str) -> Result<()> {
        let params = format!("symbol={symbol}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/allOpenOrders?{}", self.base_url, qs);

        debug!(symbol, "cancelling all open orders");
        Self::expect_json(self.client.delete(&url), "DELETE /fapi/v1/allOpenOrders").await?;

        debug!(symbol, "open orders cancelled");
        Ok(())
    }

    /// POST /fapi/v1/order (signed) — STOP_MARKET with closePosition=true,
    /// so the trigger flattens whatever quantity remains.
    #[instrument(skip(self), name = "binance::place_stop_market_order")]
    async fn place_stop_market_order(
        &self,
        symbol: &str,
        side: &str,
        stop_price: f64,
    ) -> Result<()> {
        let params = format!(
            "symbol={symbol}&side={side}&type=STOP_MARKET&stopPrice={stop_price}&closePosition=true"
        );
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol, side, stop_price, "placing stop market order");
        Self::expect_json(self.client.post(&url), "POST /fapi/v1/order").await?;

        debug!(symbol, side, stop_price, "stop market order placed");
        Ok(())
    }

    /// GET /fapi/v1/exchangeInfo filtered by symbol.
    #[instrument(skip(self), name = "binance::get_symbol_precision")]
    async fn get_symbol_precision(&self, symbol: &str) -> Result<SymbolPrecision> {
        let url = format!("{}/fapi/v1/exchangeInfo?symbol={}", self.base_url, symbol);

        let body = Self::expect_json(self.client.get(&url), "GET /fapi/v1/exchangeInfo").await?;

        let info = body["symbols"]
            .as_array()
            .and_then(|arr| arr.first())
            .context("symbol not found in exchangeInfo response")?;

        let precision = SymbolPrecision {
            price_decimals: info["pricePrecision"].as_u64().unwrap_or(2) as u32,
            quantity_decimals: info["quantityPrecision"].as_u64().unwrap_or(3) as u32,
        };

        debug!(symbol, ?precision, "symbol precision retrieved");
        Ok(precision)
    }
}

impl std::fmt::Debug for BinanceFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
