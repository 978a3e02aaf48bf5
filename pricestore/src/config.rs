//! Service configuration.
//!
//! A [`ServiceConfig`] can be loaded from a JSON file; every field has a
//! default, so a partial file (or none at all) is enough to run the
//! service. Binaries override individual values from command-line flags
//! and call [`ServiceConfig::validate`] before using the result.
//!
//! ```json
//! {
//!   "store_path": "./db/price-server",
//!   "listen_addr": "127.0.0.1:40001",
//!   "collection": { "interval_ms": 30000, "autostart": true },
//!   "source": { "assets": ["bitcoin", "ethereum"] }
//! }
//! ```

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::key;

/// Environment variable consulted for the upstream API key.
pub const API_KEY_ENV: &str = "COINGECKO_API_KEY";

/// Top-level configuration of the price service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Directory of the price store.
    pub store_path: PathBuf,
    /// Address the boundary listens on.
    pub listen_addr: String,
    /// Span used when a historical query omits `from`.
    pub history_window_ms: u64,
    /// Ingestion schedule.
    pub collection: CollectionConfig,
    /// External price source.
    pub source: SourceConfig,
}

/// Ingestion schedule settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Period between scheduled runs.
    pub interval_ms: u64,
    /// Arm the schedule when the server starts.
    pub autostart: bool,
}

/// External price source settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// API base URL, without a trailing slash.
    pub base_url: String,
    /// Demo API key sent as `x-cg-demo-api-key`.
    pub api_key: Option<String>,
    /// Currency prices are converted to.
    pub vs_currency: String,
    /// Tracked asset ids; also the default set for live fetches.
    pub assets: Vec<String>,
    /// Exchanges whose tickers are averaged.
    pub exchanges: Vec<String>,
    /// Per-request timeout.
    pub timeout_ms: u64,
    /// Retries for the markets request after the first attempt.
    pub max_retries: u32,
    /// Initial backoff between retries, doubled after each attempt.
    pub retry_backoff_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("./db/price-server"),
            listen_addr: "127.0.0.1:40001".to_string(),
            history_window_ms: 24 * 60 * 60 * 1000,
            collection: CollectionConfig::default(),
            source: SourceConfig::default(),
        }
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            autostart: true,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.coingecko.com/api/v3".to_string(),
            api_key: None,
            vs_currency: "usd".to_string(),
            assets: ["bitcoin", "ethereum", "tether", "binancecoin", "ripple"]
                .into_iter()
                .map(String::from)
                .collect(),
            exchanges: ["binance", "coinbase", "kraken"]
                .into_iter()
                .map(String::from)
                .collect(),
            timeout_ms: 10_000,
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl ServiceConfig {
    /// Loads a configuration file; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] if the file cannot be read and
    /// [`ConfigError::Parse`] if it is not valid JSON for this type.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config = serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(config)
    }

    /// Checks that every value is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(invalid(format!(
                "listen_addr '{}' is not a socket address",
                self.listen_addr
            )));
        }
        if self.history_window_ms == 0 {
            return Err(invalid("history_window_ms must be greater than zero"));
        }
        if self.collection.interval_ms == 0 {
            return Err(invalid("collection.interval_ms must be greater than zero"));
        }
        self.source.validate()
    }

    /// Period between scheduled runs.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.collection.interval_ms)
    }

    /// Default span of a historical query.
    pub fn history_window(&self) -> Duration {
        Duration::from_millis(self.history_window_ms)
    }
}

impl SourceConfig {
    /// Checks that the source settings are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(invalid("source.base_url must not be empty"));
        }
        if self.vs_currency.is_empty() {
            return Err(invalid("source.vs_currency must not be empty"));
        }
        if self.assets.is_empty() {
            return Err(invalid("source.assets must list at least one asset"));
        }
        for asset in &self.assets {
            if key::validate_asset_id(asset).is_err() {
                return Err(invalid(format!(
                    "source.assets entry '{asset}' is not a valid asset id"
                )));
            }
        }
        if self.timeout_ms == 0 {
            return Err(invalid("source.timeout_ms must be greater than zero"));
        }
        Ok(())
    }

    /// Per-request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Initial retry backoff.
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn invalid(reason: impl Into<String>) -> crate::error::PriceStoreError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
    .into()
}
