//! Error types for the pricestore engine and services.

use thiserror::Error;

/// The main error type for all pricestore operations.
///
/// Each variant corresponds to one fault class of the service: storage
/// faults from the index, fetch faults from the external price source,
/// invalid arguments from callers, protocol faults at the boundary and
/// configuration faults at startup.
#[derive(Error, Debug)]
pub enum PriceStoreError {
    /// The persistent index is unreachable or failed an I/O operation.
    #[error("storage fault: {0}")]
    Storage(#[from] StorageError),

    /// The external price source failed for a whole batch.
    #[error("fetch fault: {0}")]
    Fetch(#[from] FetchError),

    /// A caller supplied an unusable argument.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// Why the argument was rejected.
        reason: String,
    },

    /// A boundary payload or frame was malformed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The service configuration could not be loaded or is invalid.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl PriceStoreError {
    /// Shorthand for [`PriceStoreError::InvalidArgument`].
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }
}

/// Errors raised by the storage engine, its index and its on-disk log.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The store directory could not be created or accessed.
    #[error("failed to access store directory '{path}': {source}")]
    DirectoryAccess {
        /// The path that could not be accessed.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The metadata file (meta.json) is corrupted or invalid.
    #[error("corrupted metadata file: {reason}")]
    CorruptedMetadata {
        /// Description of what was invalid about the metadata.
        reason: String,
    },

    /// Failed to serialize or parse metadata JSON.
    #[error("failed to serialize metadata: {0}")]
    MetadataSerialize(#[from] serde_json::Error),

    /// The record log could not be opened.
    #[error("failed to open log '{path}': {source}")]
    LogOpen {
        /// The log file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Appending to the record log failed.
    #[error("failed to append to log '{path}' at offset {offset}: {source}")]
    LogWrite {
        /// The log file path.
        path: String,
        /// The byte offset where the append started.
        offset: u64,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Memory mapping the log for replay failed.
    #[error("memory mapping failed for file '{path}': {source}")]
    MemoryMap {
        /// The file path that failed to map.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The record log has an invalid header or a damaged record.
    #[error("log '{path}' is corrupted at offset {offset}: {reason}")]
    CorruptedLog {
        /// The log file path.
        path: String,
        /// Offset of the damaged header or record.
        offset: u64,
        /// Description of the corruption.
        reason: String,
    },

    /// A key does not satisfy the key layout rules.
    #[error("invalid key '{key}': {reason}")]
    InvalidKey {
        /// The offending key (lossy UTF-8).
        key: String,
        /// Why the key was rejected.
        reason: String,
    },

    /// A value exceeds the maximum record size.
    #[error("value of {len} bytes exceeds limit of {max} bytes")]
    ValueTooLarge {
        /// Length of the rejected value.
        len: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// A price point could not be encoded as JSON.
    #[error("failed to encode price point: {0}")]
    PointEncode(#[source] serde_json::Error),

    /// A stored value could not be decoded as a price point.
    #[error("failed to decode price point at '{key}': {source}")]
    PointDecode {
        /// The key whose value failed to decode.
        key: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// Too many writes for one asset landed in the same millisecond.
    #[error("sequence space exhausted for '{asset_id}' at {timestamp_ms}ms")]
    SequenceExhausted {
        /// The asset id being written.
        asset_id: String,
        /// The contended timestamp.
        timestamp_ms: u64,
    },

    /// The store was opened read-only.
    #[error("store is opened read-only")]
    ReadOnly,

    /// A thread panicked while holding the index lock.
    #[error("index lock poisoned")]
    LockPoisoned,

    /// A storage call handed to the blocking pool did not complete.
    #[error("storage task failed: {reason}")]
    TaskFailed {
        /// Why the task ended without a result.
        reason: String,
    },
}

/// Errors raised while fetching from the external price source.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Failed to build the HTTP client.
    #[cfg(feature = "coingecko")]
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The HTTP request failed after retries.
    #[cfg(feature = "coingecko")]
    #[error("request to {endpoint} failed: {source}")]
    Request {
        /// The endpoint that was called.
        endpoint: String,
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The upstream returned a non-2xx status after retries.
    #[error("{endpoint} returned status {status}: {body}")]
    HttpStatus {
        /// The endpoint that was called.
        endpoint: String,
        /// The HTTP status code.
        status: u16,
        /// The response body text.
        body: String,
    },

    /// The upstream response could not be decoded.
    #[error("failed to decode response from {endpoint}: {reason}")]
    Decode {
        /// The endpoint that was called.
        endpoint: String,
        /// What was wrong with the body.
        reason: String,
    },

    /// The source reported a failure that is not HTTP specific.
    #[error("upstream unavailable: {reason}")]
    Unavailable {
        /// Description of the failure.
        reason: String,
    },
}

/// Errors raised at the request/response boundary.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The method name is not part of the boundary surface.
    #[error("unknown method '{method}'")]
    UnknownMethod {
        /// The requested method name.
        method: String,
    },

    /// The request body is not valid JSON for the method.
    #[error("malformed body for '{method}': {source}")]
    MalformedBody {
        /// The method whose body failed to parse.
        method: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A response body could not be encoded.
    #[error("failed to encode response for '{method}': {source}")]
    ResponseEncode {
        /// The method being answered.
        method: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A required request field is missing.
    #[error("missing {field} in {method} request")]
    MissingField {
        /// The method being called.
        method: String,
        /// The missing field.
        field: &'static str,
    },

    /// A frame exceeds the maximum accepted size.
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// Announced frame length.
        len: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// A frame is structurally invalid.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// Description of the problem.
        reason: String,
    },

    /// Reading or writing a frame failed.
    #[error("frame I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Read {
        /// The config file path.
        path: std::path::PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`crate::config::ServiceConfig`].
    #[error("failed to parse config '{}': {source}", path.display())]
    Parse {
        /// The config file path.
        path: std::path::PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A config value is out of range.
    #[error("invalid configuration: {reason}")]
    Invalid {
        /// Description of the problem.
        reason: String,
    },
}

/// Type alias for `Result<T, PriceStoreError>`.
pub type Result<T> = std::result::Result<T, PriceStoreError>;
