//! Sources of price points.
//!
//! A [`Collector`] produces one batch of [`PricePoint`]s per call. The
//! scheduler calls it on every ingestion run and the query resolver calls
//! it for live fetches. Upstream records that cannot be turned into a
//! point are dropped by the collector; only failures that leave nothing to
//! return (upstream unreachable, unreadable response) fail the batch.

pub mod transform;

#[cfg(feature = "coingecko")]
pub mod coingecko;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::point::PricePoint;

#[cfg(feature = "coingecko")]
pub use coingecko::CoinGeckoCollector;

/// Fetches a batch of current price points for the tracked assets.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Collects one batch.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::FetchError`] (wrapped) when the batch as a
    /// whole cannot be produced.
    async fn collect_batch(&self) -> Result<Vec<PricePoint>>;
}

impl std::fmt::Debug for dyn Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Collector")
    }
}

#[async_trait]
impl<C: Collector + ?Sized> Collector for Arc<C> {
    async fn collect_batch(&self) -> Result<Vec<PricePoint>> {
        (**self).collect_batch().await
    }
}
