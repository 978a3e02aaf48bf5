//! Request/response boundary of the price service.
//!
//! Each request names a [`Method`] and carries a UTF-8 JSON body; an empty
//! body is read as `{}`. [`Service::handle`] always produces a JSON body:
//! application errors, including malformed requests and unknown methods,
//! come back as `{"error": "<message>"}` rather than as transport faults,
//! so callers must inspect every response.
//!
//! | Method | Request | Response |
//! |---|---|---|
//! | `ping` | `nonce` | `{nonce, pong: true}` |
//! | `getLatestPrices` | `pairs?`, `forceLive?` | id → point |
//! | `getHistoricalPrices` | `pairs`, `from?`, `to?` | id → [point] |
//! | `triggerCollection` | | run summary |
//! | `getCollectionStatus` | | status snapshot |
//! | `startCollection` | | `{success: true}` |
//! | `stopCollection` | | `{success: true}` |

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::ServiceConfig;
use crate::error::{ProtocolError, Result};
use crate::point::now_ms;
use crate::resolver::QueryResolver;
use crate::scheduler::{CollectionScheduler, RunOutcome};

/// Methods of the boundary surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Liveness check echoing a nonce.
    Ping,
    /// Latest point per asset.
    GetLatestPrices,
    /// Stored series per asset plus a live point.
    GetHistoricalPrices,
    /// Run one ingestion now.
    TriggerCollection,
    /// Scheduler status snapshot.
    GetCollectionStatus,
    /// Arm the recurring schedule.
    StartCollection,
    /// Disarm the recurring schedule.
    StopCollection,
}

impl Method {
    /// Every method, in documentation order.
    pub const ALL: [Method; 7] = [
        Method::Ping,
        Method::GetLatestPrices,
        Method::GetHistoricalPrices,
        Method::TriggerCollection,
        Method::GetCollectionStatus,
        Method::StartCollection,
        Method::StopCollection,
    ];

    /// Wire name of the method.
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Ping => "ping",
            Method::GetLatestPrices => "getLatestPrices",
            Method::GetHistoricalPrices => "getHistoricalPrices",
            Method::TriggerCollection => "triggerCollection",
            Method::GetCollectionStatus => "getCollectionStatus",
            Method::StartCollection => "startCollection",
            Method::StopCollection => "stopCollection",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ProtocolError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Method::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownMethod {
                method: s.to_string(),
            })
    }
}

#[derive(Debug, Default, Deserialize)]
struct PingRequest {
    #[serde(default)]
    nonce: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestRequest {
    #[serde(default)]
    pairs: Vec<String>,
    #[serde(default)]
    force_live: bool,
}

#[derive(Debug, Default, Deserialize)]
struct HistoricalRequest {
    #[serde(default)]
    pairs: Vec<String>,
    from: Option<u64>,
    to: Option<u64>,
}

#[derive(Debug, Serialize)]
struct PingResponse<'a> {
    nonce: &'a Value,
    pong: bool,
}

/// Dispatches boundary requests to the scheduler and the resolver.
#[derive(Debug, Clone)]
pub struct Service {
    scheduler: Arc<CollectionScheduler>,
    resolver: QueryResolver,
    interval: Duration,
    history_window_ms: u64,
}

impl Service {
    /// Creates the service; `config` supplies the collection period used by
    /// `startCollection` and the default historical window.
    pub fn new(
        scheduler: Arc<CollectionScheduler>,
        resolver: QueryResolver,
        config: &ServiceConfig,
    ) -> Self {
        Self {
            scheduler,
            resolver,
            interval: config.interval(),
            history_window_ms: config.history_window_ms,
        }
    }

    /// Scheduler behind the service.
    pub fn scheduler(&self) -> &Arc<CollectionScheduler> {
        &self.scheduler
    }

    /// Answers one request; failures become `{"error": ...}` bodies.
    pub async fn handle(&self, method: &str, body: &[u8]) -> Vec<u8> {
        match self.dispatch(method, body).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(method, error = %e, "request failed");
                json!({ "error": e.to_string() }).to_string().into_bytes()
            }
        }
    }

    /// Answers one request, returning application errors as `Err`.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::UnknownMethod`] for a method outside the surface
    /// - [`ProtocolError::MalformedBody`] if the body is not valid for the method
    /// - [`ProtocolError::MissingField`] for a ping without nonce
    /// - any fault raised by the scheduler or the resolver
    pub async fn dispatch(&self, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        let method: Method = method.parse()?;
        tracing::debug!(%method, body_len = body.len(), "handling request");

        match method {
            Method::Ping => {
                let request: PingRequest = parse_body(method, body)?;
                if is_falsy(&request.nonce) {
                    return Err(ProtocolError::MissingField {
                        method: method.to_string(),
                        field: "nonce",
                    }
                    .into());
                }
                encode(method, &PingResponse {
                    nonce: &request.nonce,
                    pong: true,
                })
            }
            Method::GetLatestPrices => {
                let request: LatestRequest = parse_body(method, body)?;
                let prices = self
                    .resolver
                    .get_latest(&request.pairs, request.force_live)
                    .await?;
                encode(method, &prices)
            }
            Method::GetHistoricalPrices => {
                let request: HistoricalRequest = parse_body(method, body)?;
                let to = request.to.unwrap_or_else(now_ms);
                let from = request
                    .from
                    .unwrap_or_else(|| to.saturating_sub(self.history_window_ms));
                let history = self.resolver.get_historical(&request.pairs, from, to).await?;
                encode(method, &history)
            }
            Method::TriggerCollection => {
                let response = match self.scheduler.run().await? {
                    RunOutcome::Completed(summary) => json!({
                        "success": true,
                        "duration": summary.duration_ms,
                        "timestamp": summary.timestamp_ms,
                        "dataCount": summary.point_count,
                    }),
                    RunOutcome::Skipped => json!({ "success": false, "skipped": true }),
                };
                encode(method, &response)
            }
            Method::GetCollectionStatus => encode(method, &self.scheduler.status()),
            Method::StartCollection => {
                self.scheduler.start(self.interval)?;
                encode(method, &json!({ "success": true }))
            }
            Method::StopCollection => {
                self.scheduler.stop();
                encode(method, &json!({ "success": true }))
            }
        }
    }
}

/// Decodes a request body; empty or whitespace-only bodies mean `{}`.
fn parse_body<T: DeserializeOwned + Default>(method: Method, body: &[u8]) -> Result<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        ProtocolError::MalformedBody {
            method: method.to_string(),
            source: e,
        }
        .into()
    })
}

fn encode<T: Serialize + ?Sized>(method: Method, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        ProtocolError::ResponseEncode {
            method: method.to_string(),
            source: e,
        }
        .into()
    })
}

/// `null`, `false`, `0` and `""` do not count as a nonce.
fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(_) | Value::Object(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_names_round_trip() {
        for method in Method::ALL {
            assert_eq!(method.as_str().parse::<Method>().unwrap(), method);
        }
        assert!(matches!(
            "getPrices".parse::<Method>(),
            Err(ProtocolError::UnknownMethod { .. })
        ));
    }

    #[test]
    fn test_parse_body_defaults_when_empty() {
        let request: LatestRequest = parse_body(Method::GetLatestPrices, b"").unwrap();
        assert!(request.pairs.is_empty());
        assert!(!request.force_live);

        let request: LatestRequest = parse_body(Method::GetLatestPrices, b"  \n").unwrap();
        assert!(request.pairs.is_empty());
    }

    #[test]
    fn test_parse_body_reads_fields() {
        let body = br#"{"pairs":["bitcoin"],"forceLive":true}"#;
        let request: LatestRequest = parse_body(Method::GetLatestPrices, body).unwrap();
        assert_eq!(request.pairs, vec!["bitcoin"]);
        assert!(request.force_live);

        let request: HistoricalRequest =
            parse_body(Method::GetHistoricalPrices, br#"{"pairs":["ethereum"],"from":5}"#).unwrap();
        assert_eq!(request.from, Some(5));
        assert_eq!(request.to, None);
    }

    #[test]
    fn test_parse_body_rejects_malformed_json() {
        let result: Result<LatestRequest> = parse_body(Method::GetLatestPrices, b"{pairs:");
        let err = result.unwrap_err();
        assert!(err.to_string().contains("malformed body for 'getLatestPrices'"));

        let result: Result<LatestRequest> =
            parse_body(Method::GetLatestPrices, br#"{"pairs":"bitcoin"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_is_falsy() {
        assert!(is_falsy(&Value::Null));
        assert!(is_falsy(&json!(0)));
        assert!(is_falsy(&json!("")));
        assert!(!is_falsy(&json!(17)));
        assert!(!is_falsy(&json!("abc")));
    }
}
