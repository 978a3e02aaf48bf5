//! CoinGecko-backed collector.
//!
//! One batch is one `/coins/markets` request for the tracked ids followed by
//! one `/coins/{id}/tickers` request per coin, restricted to the configured
//! exchanges. The markets request is retried with exponential backoff; a
//! coin whose tickers cannot be fetched or used is logged and left out of
//! the batch.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;

use super::transform::{self, MarketCoin, TickersResponse};
use super::Collector;
use crate::config::SourceConfig;
use crate::error::{FetchError, Result};
use crate::point::{PricePoint, now_ms};

/// Header carrying the demo API key.
const API_KEY_HEADER: &str = "x-cg-demo-api-key";

const MARKETS_ENDPOINT: &str = "/coins/markets";

/// Collector fetching market and ticker data from the CoinGecko API.
#[derive(Debug, Clone)]
pub struct CoinGeckoCollector {
    client: Client,
    config: SourceConfig,
}

impl CoinGeckoCollector {
    /// Creates a collector for the given source settings.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::ClientCreate`] if the HTTP client cannot be
    /// built.
    pub fn new(config: SourceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| FetchError::ClientCreate { source: e })?;

        Ok(Self { client, config })
    }

    /// Fetches the markets entry of every tracked asset.
    async fn markets(&self) -> Result<Vec<MarketCoin>> {
        let per_page = self.config.assets.len().to_string();
        let query = [
            ("vs_currency", self.config.vs_currency.clone()),
            ("ids", self.config.assets.join(",")),
            ("order", "market_cap_desc".to_string()),
            ("per_page", per_page),
            ("page", "1".to_string()),
            ("sparkline", "false".to_string()),
        ];

        self.get_with_retry(MARKETS_ENDPOINT, &query, self.config.max_retries)
            .await
    }

    /// Fetches tickers of `coin_id` on the configured exchanges.
    async fn tickers(&self, coin_id: &str) -> Result<TickersResponse> {
        let endpoint = format!("/coins/{coin_id}/tickers");
        let query = [("exchange_ids", self.config.exchanges.join(","))];

        self.get_with_retry(&endpoint, &query, 0).await
    }

    /// Sends a GET request, retrying failures up to `max_retries` times.
    async fn get_with_retry<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
        max_retries: u32,
    ) -> Result<T> {
        let url = format!("{}{}", self.config.base_url, endpoint);
        let mut backoff = self.config.retry_backoff();
        let mut attempt = 0;

        loop {
            match self.get_once(&url, endpoint, query).await {
                Ok(body) => return Ok(body),
                Err(e) if attempt >= max_retries => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(
                        endpoint,
                        attempt,
                        error = %e,
                        "upstream request failed, retrying"
                    );
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2).min(Duration::from_secs(30));
            attempt += 1;
        }
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        url: &str,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<T, FetchError> {
        let mut request = self
            .client
            .get(url)
            .header("accept", "application/json")
            .query(query);
        if let Some(key) = &self.config.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await.map_err(|e| FetchError::Request {
            endpoint: endpoint.to_string(),
            source: e,
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::HttpStatus {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        response.json::<T>().await.map_err(|e| FetchError::Decode {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
    }

    /// Turns one markets entry into a point, or `None` if it must be dropped.
    async fn process_coin(&self, coin: &MarketCoin) -> Option<PricePoint> {
        let id = coin.id.as_deref().unwrap_or("<missing id>");
        if !transform::validate_coin(coin) {
            tracing::warn!(coin = id, "dropping coin with incomplete market data");
            return None;
        }

        let tickers = match self.tickers(id).await {
            Ok(response) => response.tickers,
            Err(e) => {
                tracing::warn!(coin = id, error = %e, "dropping coin, tickers unavailable");
                return None;
            }
        };

        let point = transform::transform_coin(coin, &tickers, &self.config.vs_currency, now_ms());
        if point.is_none() {
            tracing::warn!(
                coin = id,
                tickers = tickers.len(),
                "dropping coin without usable exchange prices"
            );
        }
        point
    }
}

#[async_trait]
impl Collector for CoinGeckoCollector {
    async fn collect_batch(&self) -> Result<Vec<PricePoint>> {
        let coins = self.markets().await?;

        let mut points = Vec::with_capacity(coins.len());
        // Sequential to stay within the upstream rate limit.
        for coin in &coins {
            if let Some(point) = self.process_coin(coin).await {
                points.push(point);
            }
        }

        tracing::debug!(coins = coins.len(), points = points.len(), "collected batch");
        Ok(points)
    }
}
