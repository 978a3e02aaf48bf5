//! Conversion of upstream market records into price points.
//!
//! Everything here is pure: the HTTP side lives in the `coingecko` module
//! and hands the decoded records over. Every upstream field is optional in
//! these types so that one malformed record drops only itself.

use std::collections::HashMap;

use serde::Deserialize;

use crate::point::{ExchangeQuote, PricePoint};

/// One entry of the `/coins/markets` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MarketCoin {
    /// Asset id.
    pub id: Option<String>,
    /// Ticker symbol, lower case upstream.
    pub symbol: Option<String>,
    /// 24 hour price change in percent.
    pub price_change_percentage_24h: Option<f64>,
    /// Market capitalisation.
    pub market_cap: Option<f64>,
    /// 24 hour traded volume.
    pub total_volume: Option<f64>,
}

/// Body of the `/coins/{id}/tickers` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TickersResponse {
    /// Tickers across the requested exchanges.
    #[serde(default)]
    pub tickers: Vec<RawTicker>,
}

/// One exchange ticker.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTicker {
    /// Base asset of the market.
    pub base: Option<String>,
    /// Quote asset of the market.
    pub target: Option<String>,
    /// Exchange the ticker belongs to.
    pub market: Option<RawMarket>,
    /// Last price converted into several currencies.
    #[serde(default)]
    pub converted_last: HashMap<String, Option<f64>>,
    /// Volume converted into several currencies.
    #[serde(default)]
    pub converted_volume: HashMap<String, Option<f64>>,
    /// Upstream trust score (`green`, `yellow`, ...).
    pub trust_score: Option<String>,
    /// Time of the last trade.
    pub last_traded_at: Option<String>,
    /// Time the ticker was last fetched upstream.
    pub last_fetch_at: Option<String>,
}

/// Exchange descriptor inside a ticker.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawMarket {
    /// Display name.
    pub name: Option<String>,
    /// Exchange id.
    pub identifier: Option<String>,
}

/// Rounds `value` to `decimals` decimal places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Returns `true` if `coin` carries every field a price point needs.
pub fn validate_coin(coin: &MarketCoin) -> bool {
    let present = |s: &Option<String>| s.as_deref().is_some_and(|s| !s.is_empty());
    let finite = |v: Option<f64>| v.is_some_and(f64::is_finite);

    present(&coin.id)
        && present(&coin.symbol)
        && finite(coin.price_change_percentage_24h)
        && finite(coin.market_cap)
        && finite(coin.total_volume)
}

/// Converts a ticker into an exchange quote priced in `vs_currency`.
///
/// Returns `None` if the exchange name or id is missing or the ticker has
/// no finite price in `vs_currency`.
pub fn transform_ticker(ticker: &RawTicker, vs_currency: &str) -> Option<ExchangeQuote> {
    let market = ticker.market.as_ref()?;
    let name = market.name.as_deref().filter(|s| !s.is_empty())?;
    let identifier = market.identifier.as_deref().filter(|s| !s.is_empty())?;

    let price = ticker
        .converted_last
        .get(vs_currency)
        .copied()
        .flatten()
        .filter(|p| p.is_finite())?;
    let volume = ticker
        .converted_volume
        .get(vs_currency)
        .copied()
        .flatten()
        .filter(|v| v.is_finite());

    Some(ExchangeQuote {
        name: name.to_string(),
        identifier: identifier.to_string(),
        price_usdt: round_to(price, 2),
        volume_usdt: volume.map(|v| round_to(v, 0)),
        trust_score: ticker.trust_score.clone(),
        last_updated: ticker
            .last_traded_at
            .clone()
            .or_else(|| ticker.last_fetch_at.clone()),
        base: ticker.base.clone().unwrap_or_default(),
        target: ticker.target.clone().unwrap_or_default(),
    })
}

/// Arithmetic mean of the finite prices, `None` if there are none.
pub fn average_price<I>(prices: I) -> Option<f64>
where
    I: IntoIterator<Item = f64>,
{
    let (sum, count) = prices
        .into_iter()
        .filter(|p| p.is_finite())
        .fold((0.0, 0u32), |(sum, count), p| (sum + p, count + 1));

    (count > 0).then(|| sum / f64::from(count))
}

/// Builds the price point for `coin` from its exchange tickers.
///
/// Returns `None` if the coin fails [`validate_coin`], no ticker yields a
/// quote, or the averaged price is not positive.
pub fn transform_coin(
    coin: &MarketCoin,
    tickers: &[RawTicker],
    vs_currency: &str,
    timestamp_ms: u64,
) -> Option<PricePoint> {
    if !validate_coin(coin) {
        return None;
    }

    let exchanges: Vec<ExchangeQuote> = tickers
        .iter()
        .filter_map(|t| transform_ticker(t, vs_currency))
        .collect();
    let average = average_price(exchanges.iter().map(|e| e.price_usdt))?;
    if average <= 0.0 {
        return None;
    }

    Some(PricePoint {
        asset_id: coin.id.clone()?,
        symbol: coin.symbol.as_deref()?.to_uppercase(),
        price_usdt: round_to(average, 2),
        timestamp_ms,
        price_change_24h_pct: round_to(coin.price_change_percentage_24h?, 2),
        market_cap_usd: round_to(coin.market_cap?, 0),
        volume_24h_usd: round_to(coin.total_volume?, 0),
        exchanges,
    })
}
