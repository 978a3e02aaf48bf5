//! # pricestore
//!
//! Embedded append-only price time-series store with scheduled ingestion
//! and cascading queries.
//!
//! pricestore keeps price observations for a small, fixed set of assets. A
//! scheduler periodically pulls a batch of points from an external source
//! and appends it to a sorted on-disk index; queries for the latest point
//! or a historical range are answered from the index and fall back to a
//! single live fetch when the index has nothing to offer.
//!
//! ## Key Properties
//!
//! - Append-only: a point is written once and never updated or deleted
//! - Keys sort by asset, then timestamp, so range scans are contiguous
//! - At most one ingestion run at a time; overlapping attempts are skipped
//! - Live fallback is a single bounded step, never a retry loop
//! - Run statistics live in memory and reset on restart
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use pricestore::{CollectionScheduler, Collector, PricePoint, QueryResolver, StorageEngine};
//!
//! struct Fixed;
//!
//! #[async_trait::async_trait]
//! impl Collector for Fixed {
//!     async fn collect_batch(&self) -> pricestore::Result<Vec<PricePoint>> {
//!         Ok(Vec::new())
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(StorageEngine::open("./db/price-server")?);
//! let collector: Arc<dyn Collector> = Arc::new(Fixed);
//!
//! let scheduler = Arc::new(CollectionScheduler::new(Arc::clone(&store), Arc::clone(&collector)));
//! scheduler.start(Duration::from_secs(30))?;
//!
//! let resolver = QueryResolver::new(store, collector);
//! let latest = resolver.get_latest(&["bitcoin".to_string()], false).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`StorageEngine`] - Store directory, key layout and the three read shapes
//! - [`CollectionScheduler`] - Single-flight ingestion runs and their statistics
//! - [`QueryResolver`] - Latest/historical queries with live fallback
//! - [`Collector`] - Source of price batches
//! - [`rpc::Service`] - Method dispatch for the request/response boundary
//!
//! ## Modules
//!
//! - [`store`] - Storage engine lifecycle, writes and reads
//! - [`key`] - Composite key layout and scan bounds
//! - [`index`] - Sorted in-memory index over the record log
//! - [`log`] - Append-only record log file format
//! - [`point`] - Price point types
//! - [`collector`] - Collector trait, upstream record transformation, CoinGecko client
//! - [`scheduler`] - Ingestion scheduler
//! - [`resolver`] - Query resolver
//! - [`rpc`] - Boundary methods and dispatch
//! - [`frame`] - Binary request/response envelope
//! - [`config`] - Service configuration
//! - [`error`] - Error types

pub mod collector;
pub mod config;
pub mod error;
pub mod frame;
pub mod index;
pub mod key;
pub mod log;
pub mod point;
pub mod resolver;
pub mod rpc;
pub mod scheduler;
pub mod store;

// Re-export primary API types at crate root for convenience.
pub use collector::Collector;
pub use config::ServiceConfig;
pub use error::{PriceStoreError, Result};
pub use key::StorageKey;
pub use point::{ExchangeQuote, PricePoint};
pub use resolver::QueryResolver;
pub use scheduler::{CollectionScheduler, CollectionStats, CollectionStatus, RunOutcome, RunSummary};
pub use store::StorageEngine;
