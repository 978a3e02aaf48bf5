//! Example running ingestion and queries against a local store.
//!
//! This example shows how to:
//! - Open a store and plug in a collector
//! - Trigger collection runs and read the scheduler status
//! - Answer latest and historical queries through the resolver
//!
//! The collector here synthesizes prices, so no network access is needed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use pricestore::point::now_ms;
use pricestore::{
    CollectionScheduler, Collector, PricePoint, QueryResolver, RunOutcome, StorageEngine,
};

/// Produces a slowly drifting price for a few assets on every call.
struct Synthetic {
    tick: AtomicU64,
}

#[async_trait]
impl Collector for Synthetic {
    async fn collect_batch(&self) -> pricestore::Result<Vec<PricePoint>> {
        let tick = self.tick.fetch_add(1, Ordering::SeqCst);
        let timestamp_ms = now_ms() + tick;

        #[allow(clippy::cast_precision_loss)]
        let drift = tick as f64;
        Ok([("bitcoin", "BTC", 64_000.0), ("ethereum", "ETH", 3_000.0)]
            .into_iter()
            .map(|(id, symbol, base)| PricePoint {
                asset_id: id.to_string(),
                symbol: symbol.to_string(),
                price_usdt: base + drift * 10.0,
                timestamp_ms,
                price_change_24h_pct: 0.0,
                market_cap_usd: 0.0,
                volume_24h_usd: 0.0,
                exchanges: Vec::new(),
            })
            .collect())
    }
}

#[tokio::main]
async fn main() -> pricestore::Result<()> {
    let store_dir = std::env::temp_dir().join("pricestore_example");
    let _ = std::fs::remove_dir_all(&store_dir);

    let store = Arc::new(StorageEngine::open(&store_dir)?);
    let collector: Arc<dyn Collector> = Arc::new(Synthetic {
        tick: AtomicU64::new(0),
    });

    let scheduler = CollectionScheduler::new(Arc::clone(&store), Arc::clone(&collector));
    for _ in 0..3 {
        if let RunOutcome::Completed(summary) = scheduler.run().await? {
            println!("stored {} points in {}ms", summary.point_count, summary.duration_ms);
        }
    }

    let stats = scheduler.status().stats;
    println!("runs: {} total, {} successful", stats.total_runs, stats.successful_runs);

    let resolver = QueryResolver::new(Arc::clone(&store), collector);
    for (id, point) in resolver.get_latest(&[], false).await? {
        println!("latest {id}: {:.2} at {}", point.price_usdt, point.timestamp_ms);
    }

    let history = resolver
        .get_historical(&["bitcoin".to_string()], 0, now_ms() + 1_000)
        .await?;
    println!("bitcoin history: {} points (last one live)", history["bitcoin"].len());

    let _ = std::fs::remove_dir_all(&store_dir);
    Ok(())
}
