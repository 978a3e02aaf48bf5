//! Storage engine for price time series.
//!
//! The [`StorageEngine`] owns the store directory and the on-disk key
//! layout described in [`crate::key`]. Price points are written as JSON
//! under their time-series key and are never updated or deleted; reads
//! come in three shapes: latest point per asset, ascending range for one
//! asset, and fixed-name configuration entries.
//!
//! # File Layout
//!
//! ```text
//! store_dir/
//! ├── meta.json       <- format version, key separator, creation time
//! └── index.log       <- append-only record log (see crate::log)
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use pricestore::store::StorageEngine;
//! use pricestore::point::PricePoint;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = StorageEngine::open("./db/price-server")?;
//!
//! let point = PricePoint {
//!     asset_id: "bitcoin".to_string(),
//!     symbol: "BTC".to_string(),
//!     price_usdt: 64_250.5,
//!     timestamp_ms: 1_700_000_000_000,
//!     price_change_24h_pct: 0.0,
//!     market_cap_usd: 0.0,
//!     volume_24h_usd: 0.0,
//!     exchanges: Vec::new(),
//! };
//! store.put("bitcoin", &point)?;
//!
//! let latest = store.get_latest(&[])?;
//! let day = store.get_range("bitcoin", 1_699_913_600_000, 1_700_000_000_001)?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::ops::{Bound, ControlFlow};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{PriceStoreError, Result, StorageError};
use crate::index::{Direction, Index};
use crate::key::{self, KEY_SEPARATOR, MAX_SEQUENCE, StorageKey};
use crate::point::{PricePoint, now_ms};

/// Metadata file format version.
const METADATA_VERSION: u32 = 1;

/// Name of the metadata file in the store directory.
const METADATA_FILE: &str = "meta.json";

/// Name of the record log in the store directory.
const LOG_FILE: &str = "index.log";

/// Length of seeds created by [`StorageEngine::get_or_create_seed`].
pub const SEED_LEN: usize = 32;

/// Durable, ordered storage of price points.
///
/// # Thread Safety
///
/// `StorageEngine` is `Send + Sync`. Any number of readers may run
/// concurrently with one writer; writes are serialised internally, so the
/// engine can be shared through an `Arc` between the scheduler and the
/// query resolver.
#[derive(Debug)]
pub struct StorageEngine {
    /// Path to the store directory.
    path: PathBuf,
    /// Sorted index over the record log.
    index: Index,
}

/// Metadata stored in the store's meta.json file.
#[derive(Debug, Serialize, Deserialize)]
struct StoreMetadata {
    /// Metadata format version.
    version: u32,
    /// Separator between asset id and timestamp in time-series keys.
    separator: String,
    /// When the store was created, in milliseconds since the Unix epoch.
    created_at_ms: u64,
}

/// Per-asset overview returned by [`StorageEngine::summary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetSummary {
    /// Asset identifier.
    pub asset_id: String,
    /// Number of stored points.
    pub points: usize,
    /// Timestamp of the oldest point.
    pub first_ms: u64,
    /// Timestamp of the newest point.
    pub last_ms: u64,
}

impl StorageEngine {
    /// Creates a new store or opens an existing one at the given path.
    ///
    /// If the directory has no meta.json, the directory, the metadata and
    /// an empty record log are created. Otherwise the metadata is validated
    /// and the record log is replayed.
    ///
    /// # Errors
    ///
    /// - [`StorageError::DirectoryAccess`] if the directory cannot be created or read
    /// - [`StorageError::CorruptedMetadata`] if meta.json is invalid
    /// - [`StorageError::CorruptedLog`] if the record log is damaged
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if path.join(METADATA_FILE).exists() {
            Self::open_existing(path, false)
        } else {
            Self::create_new(path)
        }
    }

    /// Opens an existing store for inspection.
    ///
    /// Every write through the returned engine fails with
    /// [`StorageError::ReadOnly`]. A torn tail in the log is skipped but not
    /// truncated.
    ///
    /// # Errors
    ///
    /// Same as [`StorageEngine::open`], plus [`StorageError::DirectoryAccess`]
    /// if the store does not exist.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_existing(path.as_ref().to_path_buf(), true)
    }

    /// Creates a new store directory with initial files.
    fn create_new(path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&path).map_err(|e| StorageError::DirectoryAccess {
            path: path.display().to_string(),
            source: e,
        })?;

        let log_path = path.join(LOG_FILE);
        if log_path.exists() {
            return Err(StorageError::CorruptedMetadata {
                reason: format!("{LOG_FILE} exists but {METADATA_FILE} is missing"),
            }
            .into());
        }

        let metadata = StoreMetadata {
            version: METADATA_VERSION,
            separator: char::from(KEY_SEPARATOR).to_string(),
            created_at_ms: now_ms(),
        };

        let metadata_path = path.join(METADATA_FILE);
        let metadata_json =
            serde_json::to_string_pretty(&metadata).map_err(StorageError::MetadataSerialize)?;

        fs::write(&metadata_path, metadata_json).map_err(|e| StorageError::DirectoryAccess {
            path: metadata_path.display().to_string(),
            source: e,
        })?;

        let index = Index::open(&log_path, false)?;
        tracing::info!(path = %path.display(), "created new store");

        Ok(Self { path, index })
    }

    /// Opens an existing store directory.
    fn open_existing(path: PathBuf, read_only: bool) -> Result<Self> {
        let metadata_path = path.join(METADATA_FILE);
        let metadata_json =
            fs::read_to_string(&metadata_path).map_err(|e| StorageError::DirectoryAccess {
                path: metadata_path.display().to_string(),
                source: e,
            })?;

        let metadata: StoreMetadata =
            serde_json::from_str(&metadata_json).map_err(StorageError::MetadataSerialize)?;

        if metadata.version != METADATA_VERSION {
            return Err(StorageError::CorruptedMetadata {
                reason: format!(
                    "unsupported metadata version: expected {}, found {}",
                    METADATA_VERSION, metadata.version
                ),
            }
            .into());
        }

        if metadata.separator.as_bytes() != [KEY_SEPARATOR] {
            return Err(StorageError::CorruptedMetadata {
                reason: format!(
                    "key separator mismatch: expected '{}', found '{}'",
                    char::from(KEY_SEPARATOR),
                    metadata.separator
                ),
            }
            .into());
        }

        let index = Index::open(&path.join(LOG_FILE), read_only)?;
        tracing::info!(
            path = %path.display(),
            keys = index.len()?,
            read_only,
            "opened store"
        );

        Ok(Self { path, index })
    }

    /// Writes `point` under the key for `asset_id` and the point's timestamp.
    ///
    /// The first point at a given millisecond gets the bare key; further
    /// points at the same millisecond get increasing sequence suffixes, so
    /// nothing is overwritten and the last write sorts last. The write is
    /// durable and visible to every read issued after this returns.
    ///
    /// # Errors
    ///
    /// - [`PriceStoreError::InvalidArgument`] if `point.asset_id` differs from `asset_id`
    /// - [`StorageError::InvalidKey`] if the asset id cannot be used as a key
    /// - [`StorageError::SequenceExhausted`] after [`MAX_SEQUENCE`] collisions
    /// - [`StorageError::LogWrite`] if the append fails (nothing is written)
    pub fn put(&self, asset_id: &str, point: &PricePoint) -> Result<StorageKey> {
        if point.asset_id != asset_id {
            return Err(PriceStoreError::invalid_argument(format!(
                "point for '{}' written under '{asset_id}'",
                point.asset_id
            )));
        }

        let base = StorageKey::new(asset_id, point.timestamp_ms)?;
        let value = serde_json::to_vec(point).map_err(StorageError::PointEncode)?;

        let mut writer = self.index.writer()?;
        let key = match writer.last_key_in(key::prefix_bounds(&base.encode()))? {
            None => base,
            Some(last) => {
                let taken = StorageKey::decode(&last).map_or(0, |k| k.sequence());
                if taken >= MAX_SEQUENCE {
                    return Err(StorageError::SequenceExhausted {
                        asset_id: asset_id.to_string(),
                        timestamp_ms: point.timestamp_ms,
                    }
                    .into());
                }
                tracing::debug!(
                    asset_id,
                    timestamp_ms = point.timestamp_ms,
                    sequence = taken + 1,
                    "same-millisecond write, adding sequence suffix"
                );
                base.with_sequence(taken + 1)
            }
        };

        writer.insert(&key.encode(), &value)?;
        Ok(key)
    }

    /// Returns the most recent point for each requested asset.
    ///
    /// An empty `asset_ids` slice means every asset in the store: the whole
    /// index is walked newest-first once, and the first key seen for each
    /// asset is its latest point. Otherwise each id gets its own reverse
    /// scan limited to one entry. Assets that were never written are
    /// absent from the result, and so are ids that could never be written
    /// because they do not form a valid key.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PointDecode`] if a stored value is not a
    /// price point.
    pub fn get_latest(&self, asset_ids: &[String]) -> Result<BTreeMap<String, PricePoint>> {
        let mut latest = BTreeMap::new();
        let mut failure = None;

        if asset_ids.is_empty() {
            self.index.scan(
                (Bound::Unbounded, Bound::Unbounded),
                Direction::Reverse,
                |k, v| {
                    // Configuration entries and foreign keys do not decode.
                    let Some(key) = StorageKey::decode(k) else {
                        return ControlFlow::Continue(());
                    };
                    if latest.contains_key(key.asset_id()) {
                        return ControlFlow::Continue(());
                    }
                    match decode_point(k, v) {
                        Ok(point) => {
                            latest.insert(key.asset_id().to_string(), point);
                            ControlFlow::Continue(())
                        }
                        Err(e) => {
                            failure = Some(e);
                            ControlFlow::Break(())
                        }
                    }
                },
            )?;
        } else {
            for asset_id in asset_ids {
                let Ok(bounds) = key::asset_bounds(asset_id) else {
                    continue;
                };
                self.index.scan(bounds, Direction::Reverse, |k, v| {
                    match decode_point(k, v) {
                        Ok(point) => {
                            latest.insert(asset_id.clone(), point);
                        }
                        Err(e) => failure = Some(e),
                    }
                    ControlFlow::Break(())
                })?;
                if failure.is_some() {
                    break;
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(latest),
        }
    }

    /// Returns points of `asset_id` with `from_ms < timestamp < to_ms`,
    /// oldest first.
    ///
    /// Both bounds are exclusive; an empty interval, an unknown asset and
    /// an id that is not a valid key all yield an empty vector.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PointDecode`] if a stored value is not a
    /// price point.
    pub fn get_range(&self, asset_id: &str, from_ms: u64, to_ms: u64) -> Result<Vec<PricePoint>> {
        let Ok(Some(bounds)) = key::range_bounds(asset_id, from_ms, to_ms) else {
            return Ok(Vec::new());
        };

        let mut points = Vec::new();
        let mut failure = None;
        self.index.scan(bounds, Direction::Forward, |k, v| match decode_point(k, v) {
            Ok(point) => {
                points.push(point);
                ControlFlow::Continue(())
            }
            Err(e) => {
                failure = Some(e);
                ControlFlow::Break(())
            }
        })?;

        match failure {
            Some(e) => Err(e),
            None => Ok(points),
        }
    }

    /// Returns the configuration entry `name`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] if `name` contains the key
    /// separator.
    pub fn get_config(&self, name: &str) -> Result<Option<Vec<u8>>> {
        key::validate_config_key(name)?;
        self.index.get(name.as_bytes())
    }

    /// Writes the configuration entry `name`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] for an invalid name and a
    /// storage error if the append fails.
    pub fn put_config(&self, name: &str, value: &[u8]) -> Result<()> {
        key::validate_config_key(name)?;
        self.index.insert(name.as_bytes(), value)
    }

    /// Returns the seed stored under `name`, creating it on first use.
    ///
    /// New seeds are [`SEED_LEN`] random bytes and are persisted before
    /// being returned, so every later call yields the same bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] for an invalid name,
    /// [`StorageError::ReadOnly`] if the seed is missing from a read-only
    /// store, and a storage error if the append fails.
    pub fn get_or_create_seed(&self, name: &str) -> Result<Vec<u8>> {
        key::validate_config_key(name)?;
        if let Some(seed) = self.index.get(name.as_bytes())? {
            return Ok(seed);
        }

        let mut writer = self.index.writer()?;
        if let Some(seed) = writer.get(name.as_bytes())? {
            return Ok(seed);
        }

        let seed = rand::random::<[u8; SEED_LEN]>().to_vec();
        writer.insert(name.as_bytes(), &seed)?;
        tracing::info!(name, "created seed");
        Ok(seed)
    }

    /// Returns point counts and time spans per asset, ordered by asset id.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::LockPoisoned`] if a writer panicked.
    pub fn summary(&self) -> Result<Vec<AssetSummary>> {
        let mut assets: Vec<AssetSummary> = Vec::new();

        self.index.scan(
            (Bound::Unbounded, Bound::Unbounded),
            Direction::Forward,
            |k, _| {
                let Some(key) = StorageKey::decode(k) else {
                    return ControlFlow::Continue(());
                };
                match assets.last_mut() {
                    Some(last) if last.asset_id == key.asset_id() => {
                        last.points += 1;
                        last.first_ms = last.first_ms.min(key.timestamp_ms());
                        last.last_ms = last.last_ms.max(key.timestamp_ms());
                    }
                    _ => assets.push(AssetSummary {
                        asset_id: key.asset_id().to_string(),
                        points: 1,
                        first_ms: key.timestamp_ms(),
                        last_ms: key.timestamp_ms(),
                    }),
                }
                ControlFlow::Continue(())
            },
        )?;

        Ok(assets)
    }

    /// Total number of keys in the store, configuration entries included.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::LockPoisoned`] if a writer panicked.
    pub fn key_count(&self) -> Result<usize> {
        self.index.len()
    }

    /// Returns `true` if the store was opened with
    /// [`StorageEngine::open_read_only`].
    pub fn is_read_only(&self) -> bool {
        self.index.is_read_only()
    }

    /// Returns the path to the store directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `op` against the engine on tokio's blocking thread pool.
    ///
    /// Engine calls take locks and `put` waits for `sync_data`, so async
    /// callers go through here instead of calling the engine on a runtime
    /// worker.
    ///
    /// # Errors
    ///
    /// Returns whatever `op` returns, or [`StorageError::TaskFailed`] if
    /// the blocking task panicked or was cancelled.
    pub async fn run_blocking<T, F>(self: &Arc<Self>, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&StorageEngine) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| StorageError::TaskFailed {
                reason: e.to_string(),
            })?
    }
}

fn decode_point(key: &[u8], value: &[u8]) -> Result<PricePoint> {
    serde_json::from_slice(value).map_err(|e| {
        StorageError::PointDecode {
            key: String::from_utf8_lossy(key).into_owned(),
            source: e,
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn point(asset_id: &str, timestamp_ms: u64, price: f64) -> PricePoint {
        PricePoint {
            asset_id: asset_id.to_string(),
            symbol: asset_id.to_uppercase(),
            price_usdt: price,
            timestamp_ms,
            price_change_24h_pct: 0.0,
            market_cap_usd: 0.0,
            volume_24h_usd: 0.0,
            exchanges: Vec::new(),
        }
    }

    #[test]
    fn test_create_new_store() {
        let temp_dir = tempdir().unwrap();
        let store_path = temp_dir.path().join("new_store");

        let store = StorageEngine::open(&store_path).unwrap();

        assert!(store_path.join("meta.json").is_file());
        assert!(store_path.join("index.log").is_file());
        assert_eq!(store.path(), store_path);
        assert_eq!(store.key_count().unwrap(), 0);
        assert!(!store.is_read_only());
    }

    #[test]
    fn test_reopen_preserves_points() {
        let temp_dir = tempdir().unwrap();
        let store_path = temp_dir.path().join("store");

        let store = StorageEngine::open(&store_path).unwrap();
        store.put("bitcoin", &point("bitcoin", 100, 1.0)).unwrap();
        store.put("bitcoin", &point("bitcoin", 200, 2.0)).unwrap();
        drop(store);

        let store = StorageEngine::open(&store_path).unwrap();
        let latest = store.get_latest(&["bitcoin".to_string()]).unwrap();
        assert_eq!(latest["bitcoin"].price_usdt, 2.0);
    }

    #[test]
    fn test_put_rejects_mismatched_asset() {
        let temp_dir = tempdir().unwrap();
        let store = StorageEngine::open(temp_dir.path()).unwrap();

        let result = store.put("ethereum", &point("bitcoin", 1, 1.0));
        assert!(matches!(result, Err(PriceStoreError::InvalidArgument { .. })));
        assert_eq!(store.key_count().unwrap(), 0);
    }

    #[test]
    fn test_same_millisecond_writes_get_sequence() {
        let temp_dir = tempdir().unwrap();
        let store = StorageEngine::open(temp_dir.path()).unwrap();

        let first = store.put("bitcoin", &point("bitcoin", 500, 1.0)).unwrap();
        let second = store.put("bitcoin", &point("bitcoin", 500, 2.0)).unwrap();
        let third = store.put("bitcoin", &point("bitcoin", 500, 3.0)).unwrap();

        assert_eq!(first.sequence(), 0);
        assert_eq!(second.sequence(), 1);
        assert_eq!(third.sequence(), 2);

        let range = store.get_range("bitcoin", 499, 501).unwrap();
        let prices: Vec<f64> = range.iter().map(|p| p.price_usdt).collect();
        assert_eq!(prices, vec![1.0, 2.0, 3.0]);

        let latest = store.get_latest(&[]).unwrap();
        assert_eq!(latest["bitcoin"].price_usdt, 3.0);
    }

    #[test]
    fn test_config_entries_stay_out_of_latest() {
        let temp_dir = tempdir().unwrap();
        let store = StorageEngine::open(temp_dir.path()).unwrap();

        store.put_config("dht-seed", &[1, 2, 3]).unwrap();
        store.put("ripple", &point("ripple", 10, 0.5)).unwrap();

        let latest = store.get_latest(&[]).unwrap();
        assert_eq!(latest.len(), 1);
        assert!(latest.contains_key("ripple"));
        assert_eq!(store.get_config("dht-seed").unwrap(), Some(vec![1, 2, 3]));
        assert!(store.put_config("bad:name", b"x").is_err());
    }

    #[test]
    fn test_seed_is_stable_across_reopen() {
        let temp_dir = tempdir().unwrap();

        let store = StorageEngine::open(temp_dir.path()).unwrap();
        let seed = store.get_or_create_seed("rpc-seed").unwrap();
        assert_eq!(seed.len(), SEED_LEN);
        assert_eq!(store.get_or_create_seed("rpc-seed").unwrap(), seed);
        drop(store);

        let store = StorageEngine::open(temp_dir.path()).unwrap();
        assert_eq!(store.get_or_create_seed("rpc-seed").unwrap(), seed);
    }

    #[test]
    fn test_summary() {
        let temp_dir = tempdir().unwrap();
        let store = StorageEngine::open(temp_dir.path()).unwrap();

        store.put_config("rpc-seed", &[0; 4]).unwrap();
        store.put("ethereum", &point("ethereum", 30, 1.0)).unwrap();
        store.put("bitcoin", &point("bitcoin", 20, 1.0)).unwrap();
        store.put("bitcoin", &point("bitcoin", 10, 1.0)).unwrap();

        let summary = store.summary().unwrap();
        assert_eq!(
            summary,
            vec![
                AssetSummary {
                    asset_id: "bitcoin".to_string(),
                    points: 2,
                    first_ms: 10,
                    last_ms: 20,
                },
                AssetSummary {
                    asset_id: "ethereum".to_string(),
                    points: 1,
                    first_ms: 30,
                    last_ms: 30,
                },
            ]
        );
    }

    #[test]
    fn test_corrupted_metadata_detection() {
        let temp_dir = tempdir().unwrap();
        let store_path = temp_dir.path().join("corrupted_store");

        drop(StorageEngine::open(&store_path).unwrap());
        fs::write(store_path.join("meta.json"), "{ invalid json }").unwrap();

        match StorageEngine::open(&store_path).unwrap_err() {
            PriceStoreError::Storage(StorageError::MetadataSerialize(_)) => {}
            other => panic!("Expected MetadataSerialize error, got: {:?}", other),
        }
    }

    #[test]
    fn test_version_mismatch_detection() {
        let temp_dir = tempdir().unwrap();
        let store_path = temp_dir.path().join("store");

        drop(StorageEngine::open(&store_path).unwrap());
        fs::write(
            store_path.join("meta.json"),
            r#"{"version": 99, "separator": ":", "created_at_ms": 0}"#,
        )
        .unwrap();

        assert!(matches!(
            StorageEngine::open(&store_path),
            Err(PriceStoreError::Storage(StorageError::CorruptedMetadata { .. }))
        ));
    }

    #[test]
    fn test_log_without_metadata_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let store_path = temp_dir.path().join("store");

        drop(StorageEngine::open(&store_path).unwrap());
        fs::remove_file(store_path.join("meta.json")).unwrap();

        assert!(StorageEngine::open(&store_path).is_err());
    }

    #[test]
    fn test_read_only_store() {
        let temp_dir = tempdir().unwrap();

        let store = StorageEngine::open(temp_dir.path()).unwrap();
        store.put("bitcoin", &point("bitcoin", 1, 1.0)).unwrap();
        drop(store);

        let store = StorageEngine::open_read_only(temp_dir.path()).unwrap();
        assert!(store.is_read_only());
        assert_eq!(store.get_latest(&[]).unwrap().len(), 1);
        assert!(matches!(
            store.put("bitcoin", &point("bitcoin", 2, 1.0)),
            Err(PriceStoreError::Storage(StorageError::ReadOnly))
        ));
        assert!(store.get_or_create_seed("rpc-seed").is_err());
    }

    #[test]
    fn test_read_only_missing_store() {
        let temp_dir = tempdir().unwrap();
        assert!(StorageEngine::open_read_only(temp_dir.path().join("nope")).is_err());
    }

    #[tokio::test]
    async fn test_run_blocking_off_the_runtime() {
        let temp_dir = tempdir().unwrap();
        let store = Arc::new(StorageEngine::open(temp_dir.path()).unwrap());

        let runtime_thread = std::thread::current().id();
        let (key, thread) = store
            .run_blocking(|store| {
                let key = store.put("bitcoin", &point("bitcoin", 7, 1.0))?;
                Ok((key, std::thread::current().id()))
            })
            .await
            .unwrap();
        assert_eq!(key.timestamp_ms(), 7);
        assert_ne!(thread, runtime_thread);

        let err = store
            .run_blocking(|store| store.put("", &point("", 8, 1.0)))
            .await
            .unwrap_err();
        assert!(matches!(err, PriceStoreError::Storage(StorageError::InvalidKey { .. })));
        assert_eq!(store.key_count().unwrap(), 1);
    }
}
