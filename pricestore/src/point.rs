//! Price observations as they are persisted and served.
//!
//! The JSON shape of [`PricePoint`] is the wire and storage format: field
//! names follow the upstream feed (`id`, `price_usdt`, `timestamp`, ...)
//! rather than the Rust field names.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// One priced-asset observation at a point in time.
///
/// Points are created by a collector during an ingestion run or a live
/// fetch and are never modified after they have been written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    /// Asset identifier (e.g. `bitcoin`).
    #[serde(rename = "id")]
    pub asset_id: String,
    /// Ticker symbol, upper case (e.g. `BTC`).
    pub symbol: String,
    /// Price averaged across exchange quotes, in USDT.
    pub price_usdt: f64,
    /// Observation time in milliseconds since the Unix epoch.
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
    /// Price change over the last 24 hours, in percent.
    #[serde(rename = "price_change_24h")]
    pub price_change_24h_pct: f64,
    /// Market capitalisation in USD.
    #[serde(rename = "market_cap")]
    pub market_cap_usd: f64,
    /// Traded volume over the last 24 hours in USD.
    #[serde(rename = "volume_24h")]
    pub volume_24h_usd: f64,
    /// Per-exchange quotes the price was averaged from, in upstream order.
    #[serde(default)]
    pub exchanges: Vec<ExchangeQuote>,
}

/// A single exchange's quote for an asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeQuote {
    /// Display name of the exchange.
    pub name: String,
    /// Upstream exchange identifier.
    pub identifier: String,
    /// Last traded price converted to USDT.
    pub price_usdt: f64,
    /// Traded volume converted to USDT.
    pub volume_usdt: Option<f64>,
    /// Upstream trust score, when reported.
    pub trust_score: Option<String>,
    /// Last trade (or fetch) time as reported upstream.
    pub last_updated: Option<String>,
    /// Base asset of the market.
    pub base: String,
    /// Quote asset of the market.
    pub target: String,
}

/// Returns the current wall-clock time in milliseconds since the Unix epoch.
#[allow(clippy::cast_possible_truncation)] // Epoch millis fit in u64 for the next 500 million years
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
