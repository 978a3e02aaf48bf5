//! Query resolution over stored and live prices.
//!
//! The [`QueryResolver`] answers "latest" and "historical" queries from the
//! [`StorageEngine`] and falls back to the [`Collector`] when the store has
//! nothing to offer. Every live fetch is persisted before it is returned.
//!
//! The fallback is two explicit steps, [`QueryResolver::try_storage`] then
//! [`QueryResolver::try_live`]; the live step never consults storage again,
//! so a query performs at most one live fetch no matter what it returns.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::collector::Collector;
use crate::error::{PriceStoreError, Result};
use crate::point::PricePoint;
use crate::store::StorageEngine;

/// Latest point per asset id.
pub type LatestPrices = BTreeMap<String, PricePoint>;

/// Ascending series of points per asset id.
pub type PriceHistory = BTreeMap<String, Vec<PricePoint>>;

/// Answers price queries with a single live-fetch fallback.
#[derive(Debug, Clone)]
pub struct QueryResolver {
    store: Arc<StorageEngine>,
    collector: Arc<dyn Collector>,
}

impl QueryResolver {
    /// Creates a resolver over a shared store and collector.
    pub fn new(store: Arc<StorageEngine>, collector: Arc<dyn Collector>) -> Self {
        Self { store, collector }
    }

    /// Returns the latest point for each id in `ids` (all assets if empty).
    ///
    /// With `force_live` the collector is queried directly. Otherwise the
    /// store is read first and the collector is queried once only when the
    /// store returns nothing. Ids with no data anywhere are absent from the
    /// result; an empty result is not an error.
    ///
    /// # Errors
    ///
    /// Propagates storage faults and, on the live path, fetch faults.
    pub async fn get_latest(&self, ids: &[String], force_live: bool) -> Result<LatestPrices> {
        if !force_live {
            let stored = self.try_storage(ids).await.map_err(fault)?;
            if !stored.is_empty() {
                return Ok(stored);
            }
            tracing::info!(
                event = "fallback_engaged",
                query = "latest",
                requested = ids.len(),
                "no stored prices, fetching live"
            );
        }

        self.try_live(ids).await.map_err(fault)
    }

    /// Returns the stored series of each id with `from_ms < t < to_ms`,
    /// followed by the current live point.
    ///
    /// Every requested id is present in the result. When no id has stored
    /// points in the range, the result is the live point of each id alone.
    /// Either way, exactly one live fetch is made, and the appended live
    /// point may lie outside the requested range.
    ///
    /// # Errors
    ///
    /// - [`PriceStoreError::InvalidArgument`] if `ids` is empty
    /// - storage and fetch faults from the underlying reads and live fetch
    pub async fn get_historical(
        &self,
        ids: &[String],
        from_ms: u64,
        to_ms: u64,
    ) -> Result<PriceHistory> {
        if ids.is_empty() {
            return Err(PriceStoreError::invalid_argument("no pairs specified for historical data"));
        }

        let requested = ids.to_vec();
        let mut history = self
            .store
            .run_blocking(move |store| {
                let mut history = PriceHistory::new();
                for id in requested {
                    let series = store.get_range(&id, from_ms, to_ms)?;
                    history.insert(id, series);
                }
                Ok(history)
            })
            .await
            .map_err(fault)?;

        if history.values().all(Vec::is_empty) {
            tracing::info!(
                event = "fallback_engaged",
                query = "historical",
                requested = ids.len(),
                from_ms,
                to_ms,
                "no stored history in range, fetching live"
            );
        }

        // An empty series ends up holding the live point alone.
        let live = self.try_live(ids).await.map_err(fault)?;
        for (id, point) in live {
            if let Some(series) = history.get_mut(&id) {
                series.push(point);
            }
        }
        Ok(history)
    }

    /// Reads the latest stored points; never fetches.
    ///
    /// # Errors
    ///
    /// Propagates storage faults.
    pub async fn try_storage(&self, ids: &[String]) -> Result<LatestPrices> {
        let ids = ids.to_vec();
        self.store.run_blocking(move |store| store.get_latest(&ids)).await
    }

    /// Fetches a batch, persists all of it, and returns the requested ids.
    ///
    /// # Errors
    ///
    /// Propagates fetch faults and storage faults from persisting the batch.
    pub async fn try_live(&self, ids: &[String]) -> Result<LatestPrices> {
        let points = self.collector.collect_batch().await?;

        let mut live = LatestPrices::new();
        for point in points {
            let point = self
                .store
                .run_blocking(move |store| store.put(&point.asset_id, &point).map(|_| point))
                .await?;
            if ids.is_empty() || ids.contains(&point.asset_id) {
                live.insert(point.asset_id.clone(), point);
            }
        }
        Ok(live)
    }
}

fn fault(e: PriceStoreError) -> PriceStoreError {
    tracing::error!(event = "fault_raised", error = %e, "query failed");
    e
}
