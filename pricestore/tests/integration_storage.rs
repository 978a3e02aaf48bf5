//! Integration tests for the storage engine.
//!
//! These tests exercise writes, the three read shapes, reopen and crash
//! recovery through the public API only.

mod common;

use std::fs::OpenOptions;
use std::io::Write;

use common::{open_store, point};
use pricestore::error::StorageError;
use pricestore::{PriceStoreError, StorageEngine};
use tempfile::tempdir;

#[test]
fn test_bitcoin_range_scenario() {
    let temp_dir = tempdir().unwrap();
    let store = open_store(&temp_dir);

    store.put("bitcoin", &point("bitcoin", 100, 1.0)).unwrap();
    store.put("bitcoin", &point("bitcoin", 200, 2.0)).unwrap();

    let latest = store.get_latest(&["bitcoin".to_string()]).unwrap();
    assert_eq!(latest["bitcoin"].price_usdt, 2.0);

    let prices = |from, to| -> Vec<f64> {
        store
            .get_range("bitcoin", from, to)
            .unwrap()
            .iter()
            .map(|p| p.price_usdt)
            .collect()
    };
    assert_eq!(prices(50, 150), vec![1.0]);
    assert_eq!(prices(150, 250), vec![2.0]);
    // Both bounds are exclusive
    assert!(prices(100, 200).is_empty());
    assert_eq!(prices(99, 201), vec![1.0, 2.0]);
    // Inverted and empty intervals are not errors
    assert!(prices(200, 100).is_empty());
    assert!(prices(100, 101).is_empty());
}

#[test]
fn test_range_is_ascending_regardless_of_write_order() {
    let temp_dir = tempdir().unwrap();
    let store = open_store(&temp_dir);

    for ts in [9_000u64, 10, 500, 7, 123_456, 99_999_999] {
        store.put("ethereum", &point("ethereum", ts, ts as f64)).unwrap();
    }

    let range = store.get_range("ethereum", 0, u64::MAX).unwrap();
    let timestamps: Vec<u64> = range.iter().map(|p| p.timestamp_ms).collect();
    assert_eq!(timestamps, vec![7, 10, 500, 9_000, 123_456, 99_999_999]);
}

#[test]
fn test_latest_of_all_matches_per_asset_latest() {
    let temp_dir = tempdir().unwrap();
    let store = open_store(&temp_dir);

    let writes = [
        ("bitcoin", 300, 3.0),
        ("ethereum", 50, 0.5),
        ("bitcoin", 100, 1.0),
        ("tether", 10, 1.0),
        ("ethereum", 75, 0.75),
        ("binancecoin", 1, 2.0),
    ];
    for (id, ts, price) in writes {
        store.put(id, &point(id, ts, price)).unwrap();
    }
    store.put_config("dht-seed", &[9; 32]).unwrap();

    let all = store.get_latest(&[]).unwrap();
    assert_eq!(all.len(), 4);
    for (id, latest) in &all {
        let single = store.get_latest(&[id.clone()]).unwrap();
        assert_eq!(&single[id], latest);
    }
    assert_eq!(all["bitcoin"].timestamp_ms, 300);
    assert_eq!(all["ethereum"].timestamp_ms, 75);
}

#[test]
fn test_unknown_assets_are_absent() {
    let temp_dir = tempdir().unwrap();
    let store = open_store(&temp_dir);
    store.put("bitcoin", &point("bitcoin", 1, 1.0)).unwrap();

    let latest = store
        .get_latest(&["bitcoin".to_string(), "dogecoin".to_string()])
        .unwrap();
    assert_eq!(latest.len(), 1);
    assert!(!latest.contains_key("dogecoin"));

    assert!(store.get_latest(&[]).unwrap().contains_key("bitcoin"));
    assert!(open_store(&tempdir().unwrap()).get_latest(&[]).unwrap().is_empty());
}

#[test]
fn test_prefix_sharing_ids_do_not_leak() {
    let temp_dir = tempdir().unwrap();
    let store = open_store(&temp_dir);

    store.put("bit", &point("bit", 10, 1.0)).unwrap();
    store.put("bitcoin", &point("bitcoin", 5, 2.0)).unwrap();
    store.put("bitcoin-cash", &point("bitcoin-cash", 20, 3.0)).unwrap();

    let latest = store.get_latest(&["bit".to_string()]).unwrap();
    assert_eq!(latest["bit"].price_usdt, 1.0);

    let latest = store.get_latest(&["bitcoin".to_string()]).unwrap();
    assert_eq!(latest["bitcoin"].price_usdt, 2.0);

    assert_eq!(store.get_range("bit", 0, 100).unwrap().len(), 1);
    assert_eq!(store.get_range("bitcoin", 0, 100).unwrap().len(), 1);
    assert_eq!(store.get_latest(&[]).unwrap().len(), 3);
}

#[test]
fn test_ids_with_high_bytes_are_scanned_correctly() {
    let temp_dir = tempdir().unwrap();
    let store = open_store(&temp_dir);

    // '~' and non-ASCII bytes sort above the old '~' sentinel
    for id in ["coin~x", "coin", "coïn", "币"] {
        store.put(id, &point(id, 42, 1.0)).unwrap();
    }

    for id in ["coin~x", "coin", "coïn", "币"] {
        let latest = store.get_latest(&[id.to_string()]).unwrap();
        assert_eq!(latest[id].asset_id, id);
        assert_eq!(store.get_range(id, 0, 100).unwrap().len(), 1);
    }
    assert_eq!(store.get_latest(&[]).unwrap().len(), 4);
}

#[test]
fn test_invalid_asset_ids_are_rejected() {
    let temp_dir = tempdir().unwrap();
    let store = open_store(&temp_dir);

    for id in ["", "btc:usd", "line\nbreak"] {
        let result = store.put(id, &point(id, 1, 1.0));
        assert!(
            matches!(result, Err(PriceStoreError::Storage(StorageError::InvalidKey { .. }))),
            "id {id:?} accepted"
        );
    }
    assert_eq!(store.key_count().unwrap(), 0);
}

#[test]
fn test_unusable_ids_read_as_absent() {
    let temp_dir = tempdir().unwrap();
    let store = open_store(&temp_dir);
    store.put("bitcoin", &point("bitcoin", 10, 64_000.0)).unwrap();

    let requested = ["bitcoin", "BTC:USDT", ""].map(String::from);
    let latest = store.get_latest(&requested).unwrap();
    assert_eq!(latest.keys().collect::<Vec<_>>(), ["bitcoin"]);

    assert!(store.get_latest(&["a:b".to_string()]).unwrap().is_empty());
    assert!(store.get_range("BTC:USDT", 0, 100).unwrap().is_empty());
    assert!(store.get_range("", 0, 100).unwrap().is_empty());
}

#[test]
fn test_reopen_preserves_everything() {
    let temp_dir = tempdir().unwrap();
    let store_path = temp_dir.path().join("store");

    let seed = {
        let store = StorageEngine::open(&store_path).unwrap();
        for ts in 1..=50u64 {
            store.put("ripple", &point("ripple", ts * 1000, ts as f64)).unwrap();
        }
        store.put("ripple", &point("ripple", 50_000, 51.0)).unwrap();
        store.get_or_create_seed("rpc-seed").unwrap()
    };

    let store = StorageEngine::open(&store_path).unwrap();
    assert_eq!(store.get_range("ripple", 0, u64::MAX).unwrap().len(), 51);
    assert_eq!(store.get_latest(&[]).unwrap()["ripple"].price_usdt, 51.0);
    assert_eq!(store.get_or_create_seed("rpc-seed").unwrap(), seed);
}

#[test]
fn test_torn_tail_is_recovered_on_reopen() {
    let temp_dir = tempdir().unwrap();
    let store_path = temp_dir.path().join("store");

    {
        let store = StorageEngine::open(&store_path).unwrap();
        store.put("bitcoin", &point("bitcoin", 1, 1.0)).unwrap();
        store.put("bitcoin", &point("bitcoin", 2, 2.0)).unwrap();
    }

    // A crash halfway through an append leaves a partial record
    let mut log = OpenOptions::new()
        .append(true)
        .open(store_path.join("index.log"))
        .unwrap();
    log.write_all(&[40, 0, 0, 0, 200, 0, 0, 0, b'b', b'i']).unwrap();
    drop(log);

    let store = StorageEngine::open(&store_path).unwrap();
    assert_eq!(store.get_range("bitcoin", 0, 10).unwrap().len(), 2);

    store.put("bitcoin", &point("bitcoin", 3, 3.0)).unwrap();
    drop(store);

    let store = StorageEngine::open(&store_path).unwrap();
    let prices: Vec<f64> = store
        .get_range("bitcoin", 0, 10)
        .unwrap()
        .iter()
        .map(|p| p.price_usdt)
        .collect();
    assert_eq!(prices, vec![1.0, 2.0, 3.0]);
}

#[test]
fn test_damaged_record_before_tail_is_corruption() {
    let temp_dir = tempdir().unwrap();
    let store_path = temp_dir.path().join("store");

    {
        let store = StorageEngine::open(&store_path).unwrap();
        store.put("bitcoin", &point("bitcoin", 1, 1.0)).unwrap();
        store.put("bitcoin", &point("bitcoin", 2, 2.0)).unwrap();
    }

    // Flip one byte inside the first record's key
    let log_path = store_path.join("index.log");
    let mut bytes = std::fs::read(&log_path).unwrap();
    bytes[16 + 8] ^= 0x20;
    std::fs::write(&log_path, bytes).unwrap();

    assert!(matches!(
        StorageEngine::open(&store_path),
        Err(PriceStoreError::Storage(StorageError::CorruptedLog { .. }))
    ));
}

#[test]
fn test_failed_writes_have_no_side_effects() {
    let temp_dir = tempdir().unwrap();
    let store_path = temp_dir.path().join("store");

    {
        let store = StorageEngine::open(&store_path).unwrap();
        store.put("bitcoin", &point("bitcoin", 1, 1.0)).unwrap();
    }

    let store = StorageEngine::open_read_only(&store_path).unwrap();
    for _ in 0..3 {
        assert!(store.put("bitcoin", &point("bitcoin", 2, 2.0)).is_err());
    }
    assert_eq!(store.get_range("bitcoin", 0, 10).unwrap().len(), 1);
    drop(store);

    let store = StorageEngine::open(&store_path).unwrap();
    assert_eq!(store.key_count().unwrap(), 1);
}

#[test]
fn test_concurrent_readers_and_writer() {
    let temp_dir = tempdir().unwrap();
    let store = open_store(&temp_dir);

    std::thread::scope(|scope| {
        let writer = scope.spawn(|| {
            for ts in 1..=200u64 {
                store.put("tether", &point("tether", ts, 1.0)).unwrap();
            }
        });

        for _ in 0..4 {
            scope.spawn(|| {
                let mut last_seen = 0;
                for _ in 0..200 {
                    let latest = store.get_latest(&["tether".to_string()]).unwrap();
                    if let Some(p) = latest.get("tether") {
                        // Timestamps only move forward
                        assert!(p.timestamp_ms >= last_seen);
                        last_seen = p.timestamp_ms;
                    }
                }
            });
        }

        writer.join().unwrap();
    });

    assert_eq!(store.get_range("tether", 0, 1_000).unwrap().len(), 200);
}
