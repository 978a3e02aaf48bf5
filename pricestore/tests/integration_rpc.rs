//! Integration tests for the boundary surface: method dispatch, error
//! bodies and the framed request/response envelope.

mod common;

use std::sync::Arc;

use common::{GatedCollector, ScriptedCollector, open_store, point};
use pricestore::rpc::Service;
use pricestore::{CollectionScheduler, Collector, QueryResolver, ServiceConfig, frame};
use serde_json::{Value, json};
use tempfile::tempdir;

fn service(dir: &tempfile::TempDir, collector: Arc<dyn Collector>) -> Service {
    let store = open_store(dir);
    let scheduler = Arc::new(CollectionScheduler::new(Arc::clone(&store), Arc::clone(&collector)));
    let resolver = QueryResolver::new(store, collector);
    Service::new(scheduler, resolver, &ServiceConfig::default())
}

async fn call(service: &Service, method: &str, body: Value) -> Value {
    let body = if body.is_null() { Vec::new() } else { body.to_string().into_bytes() };
    let response = service.handle(method, &body).await;
    serde_json::from_slice(&response).unwrap()
}

#[tokio::test]
async fn test_ping_echoes_nonce() {
    let temp_dir = tempdir().unwrap();
    let service = service(&temp_dir, ScriptedCollector::returning(Vec::new()));

    let response = call(&service, "ping", json!({ "nonce": 12345 })).await;
    assert_eq!(response, json!({ "nonce": 12345, "pong": true }));

    let response = call(&service, "ping", json!({})).await;
    assert_eq!(response["error"], "protocol error: missing nonce in ping request");
}

#[tokio::test]
async fn test_unknown_method_and_malformed_body_are_error_bodies() {
    let temp_dir = tempdir().unwrap();
    let service = service(&temp_dir, ScriptedCollector::returning(Vec::new()));

    let response = call(&service, "dropDatabase", Value::Null).await;
    assert!(response["error"].as_str().unwrap().contains("unknown method 'dropDatabase'"));

    let raw = service.handle("getLatestPrices", b"{not json").await;
    let response: Value = serde_json::from_slice(&raw).unwrap();
    assert!(response["error"].as_str().unwrap().contains("malformed body"));
}

#[tokio::test]
async fn test_latest_prices_with_and_without_pairs() {
    let temp_dir = tempdir().unwrap();
    let collector = ScriptedCollector::returning(vec![
        point("bitcoin", 1_000, 64_000.0),
        point("ethereum", 1_000, 3_000.0),
    ]);
    let service = service(&temp_dir, collector.clone());

    let response = call(&service, "getLatestPrices", json!({ "pairs": ["bitcoin"] })).await;
    assert_eq!(response["bitcoin"]["price_usdt"], 64_000.0);
    assert_eq!(response["bitcoin"]["id"], "bitcoin");
    assert!(response.get("ethereum").is_none());

    // Empty body means every stored asset
    let response = call(&service, "getLatestPrices", Value::Null).await;
    assert_eq!(response.as_object().unwrap().len(), 2);
    assert_eq!(collector.calls(), 1);

    let body = json!({ "pairs": ["bitcoin"], "forceLive": true });
    let _ = call(&service, "getLatestPrices", body).await;
    assert_eq!(collector.calls(), 2);
}

#[tokio::test]
async fn test_historical_prices() {
    let temp_dir = tempdir().unwrap();
    let collector = ScriptedCollector::returning(vec![point("bitcoin", 10_000, 2.0)]);
    let service = service(&temp_dir, collector);

    let response = call(&service, "getHistoricalPrices", json!({ "from": 0, "to": 100 })).await;
    assert_eq!(response["error"], "invalid argument: no pairs specified for historical data");

    let response = call(
        &service,
        "getHistoricalPrices",
        json!({ "pairs": ["bitcoin"], "from": 0, "to": 100 }),
    )
    .await;
    let series = response["bitcoin"].as_array().unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0]["timestamp"], 10_000);

    // The default window ends now, so only the live point comes back
    let response = call(&service, "getHistoricalPrices", json!({ "pairs": ["bitcoin"] })).await;
    assert_eq!(response["bitcoin"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_trigger_collection_summary_and_status() {
    let temp_dir = tempdir().unwrap();
    let collector = ScriptedCollector::returning(vec![
        point("bitcoin", 1, 1.0),
        point("ethereum", 1, 1.0),
        point("tether", 1, 1.0),
    ]);
    let service = service(&temp_dir, collector);

    let response = call(&service, "triggerCollection", Value::Null).await;
    assert_eq!(response["success"], true);
    assert_eq!(response["dataCount"], 3);
    assert!(response["duration"].is_u64());
    assert!(response["timestamp"].is_u64());

    let status = call(&service, "getCollectionStatus", Value::Null).await;
    assert_eq!(status["isCollecting"], false);
    assert_eq!(status["isScheduled"], false);
    assert_eq!(status["stats"]["totalRuns"], 1);
    assert_eq!(status["stats"]["successfulRuns"], 1);
    assert_eq!(status["lastRunAt"], response["timestamp"]);
}

#[tokio::test]
async fn test_trigger_collection_failure_is_recorded() {
    let temp_dir = tempdir().unwrap();
    let service = service(&temp_dir, ScriptedCollector::failing("HTTP 429"));

    let response = call(&service, "triggerCollection", Value::Null).await;
    assert!(response["error"].as_str().unwrap().contains("HTTP 429"));

    let status = call(&service, "getCollectionStatus", Value::Null).await;
    assert_eq!(status["stats"]["failedRuns"], 1);
    assert!(status["stats"]["lastError"].as_str().unwrap().contains("HTTP 429"));
}

#[tokio::test]
async fn test_trigger_while_running_is_skipped() {
    let temp_dir = tempdir().unwrap();
    let collector = GatedCollector::new(Vec::new());
    let service = service(&temp_dir, collector.clone());

    let background = tokio::spawn({
        let service = service.clone();
        async move { service.handle("triggerCollection", b"").await }
    });
    collector.entered.notified().await;

    let response = call(&service, "triggerCollection", Value::Null).await;
    assert_eq!(response, json!({ "success": false, "skipped": true }));

    collector.release.notify_one();
    let first: Value = serde_json::from_slice(&background.await.unwrap()).unwrap();
    assert_eq!(first["success"], true);
}

#[tokio::test]
async fn test_start_and_stop_collection() {
    let temp_dir = tempdir().unwrap();
    let service = service(&temp_dir, ScriptedCollector::returning(Vec::new()));

    assert_eq!(call(&service, "startCollection", Value::Null).await, json!({ "success": true }));
    assert_eq!(call(&service, "getCollectionStatus", Value::Null).await["isScheduled"], true);
    // Starting twice is a no-op
    assert_eq!(call(&service, "startCollection", Value::Null).await, json!({ "success": true }));

    assert_eq!(call(&service, "stopCollection", Value::Null).await, json!({ "success": true }));
    assert_eq!(call(&service, "getCollectionStatus", Value::Null).await["isScheduled"], false);
    assert_eq!(call(&service, "stopCollection", Value::Null).await, json!({ "success": true }));
}

#[tokio::test]
async fn test_framed_round_trip() {
    let temp_dir = tempdir().unwrap();
    let service = service(&temp_dir, ScriptedCollector::returning(vec![point("ripple", 1, 0.5)]));
    let (mut client, mut server) = tokio::io::duplex(4096);

    let server_task = tokio::spawn(async move {
        while let Some(request) = frame::read_request(&mut server).await.unwrap() {
            let response = service.handle(&request.method, &request.body).await;
            frame::write_response(&mut server, &response).await.unwrap();
        }
    });

    frame::write_request(&mut client, "ping", br#"{"nonce":"abc"}"#).await.unwrap();
    let body = frame::read_response(&mut client).await.unwrap().unwrap();
    assert_eq!(serde_json::from_slice::<Value>(&body).unwrap()["nonce"], "abc");

    frame::write_request(&mut client, "getLatestPrices", b"").await.unwrap();
    let body = frame::read_response(&mut client).await.unwrap().unwrap();
    let prices: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(prices["ripple"]["price_usdt"], 0.5);

    drop(client);
    server_task.await.unwrap();
}
