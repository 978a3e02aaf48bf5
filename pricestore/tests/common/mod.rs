//! Shared collectors and helpers for integration tests.

#![allow(dead_code, missing_docs)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pricestore::error::FetchError;
use pricestore::{Collector, PricePoint, Result, StorageEngine};
use tokio::sync::Notify;

/// Builds a minimal point.
pub fn point(asset_id: &str, timestamp_ms: u64, price: f64) -> PricePoint {
    PricePoint {
        asset_id: asset_id.to_string(),
        symbol: asset_id.chars().take(3).collect::<String>().to_uppercase(),
        price_usdt: price,
        timestamp_ms,
        price_change_24h_pct: 0.0,
        market_cap_usd: 0.0,
        volume_24h_usd: 0.0,
        exchanges: Vec::new(),
    }
}

/// Opens a fresh store inside `dir`.
pub fn open_store(dir: &tempfile::TempDir) -> Arc<StorageEngine> {
    Arc::new(StorageEngine::open(dir.path().join("store")).unwrap())
}

/// One scripted collector response.
#[derive(Debug, Clone)]
pub enum Step {
    Batch(Vec<PricePoint>),
    Fail(String),
}

/// Collector that replays a script; the last step repeats once the
/// script is exhausted.
#[derive(Debug)]
pub struct ScriptedCollector {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Step>,
    calls: AtomicUsize,
}

impl ScriptedCollector {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        let last = steps.last().cloned().unwrap_or(Step::Batch(Vec::new()));
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            last: Mutex::new(last),
            calls: AtomicUsize::new(0),
        })
    }

    /// Always returns `batch`.
    pub fn returning(batch: Vec<PricePoint>) -> Arc<Self> {
        Self::new(vec![Step::Batch(batch)])
    }

    /// Always fails with `reason`.
    pub fn failing(reason: &str) -> Arc<Self> {
        Self::new(vec![Step::Fail(reason.to_string())])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Collector for ScriptedCollector {
    async fn collect_batch(&self) -> Result<Vec<PricePoint>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.last.lock().unwrap().clone());

        match step {
            Step::Batch(points) => Ok(points),
            Step::Fail(reason) => Err(FetchError::Unavailable { reason }.into()),
        }
    }
}

/// Collector that signals `entered` and then blocks until `release`.
#[derive(Debug, Default)]
pub struct GatedCollector {
    pub entered: Notify,
    pub release: Notify,
    pub batch: Vec<PricePoint>,
    calls: AtomicUsize,
}

impl GatedCollector {
    pub fn new(batch: Vec<PricePoint>) -> Arc<Self> {
        Arc::new(Self {
            batch,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Collector for GatedCollector {
    async fn collect_batch(&self) -> Result<Vec<PricePoint>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        self.release.notified().await;
        Ok(self.batch.clone())
    }
}
