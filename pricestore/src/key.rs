//! Composite key layout for the price index.
//!
//! The index holds two disjoint key families in one namespace:
//!
//! ```text
//! dht-seed                                  <- configuration entry (binary value)
//! rpc-seed                                  <- configuration entry (binary value)
//! bitcoin:00000001700000000000            <- time-series entry (JSON value)
//! bitcoin:00000001700000000000#000001     <- same-millisecond collision
//! ethereum:00000001700000000000
//! ```
//!
//! Time-series keys are `asset_id`, the `:` separator and the timestamp in
//! milliseconds zero-padded to 20 digits, so byte order equals timestamp
//! order within one asset. Because asset ids may not contain the separator,
//! every key of an asset starts with `asset_id:` and nothing else does: the
//! keys of one asset are contiguous. Configuration keys never contain the
//! separator, which is what keeps the two families apart.
//!
//! Prefix scans are bounded with [`prefix_successor`] instead of a sentinel
//! byte, so they stay correct for any byte an asset id may contain.

use std::fmt;
use std::ops::Bound;

use crate::error::{Result, StorageError};

/// Separator between the asset id and the timestamp.
pub const KEY_SEPARATOR: u8 = b':';

/// Marker introducing a collision sequence number.
const SEQUENCE_MARKER: u8 = b'#';

/// Width of the zero-padded timestamp (enough for `u64::MAX`).
const TIMESTAMP_WIDTH: usize = 20;

/// Width of the zero-padded collision sequence.
const SEQUENCE_WIDTH: usize = 6;

/// Largest collision sequence number for one asset and millisecond.
pub const MAX_SEQUENCE: u32 = 999_999;

/// Maximum length of an asset id in bytes.
pub const MAX_ASSET_ID_LEN: usize = 128;

/// Key bounds for a range scan over the index.
pub type KeyBounds = (Bound<Vec<u8>>, Bound<Vec<u8>>);

/// A decoded time-series key.
///
/// Sequence `0` is the bare key written by the first point at a given
/// millisecond; later points at the same millisecond get `1`, `2`, ...
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    asset_id: String,
    timestamp_ms: u64,
    sequence: u32,
}

impl StorageKey {
    /// Creates the bare key for an asset at a timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] if the asset id is empty, too
    /// long, or contains the separator or a control character.
    pub fn new(asset_id: &str, timestamp_ms: u64) -> Result<Self> {
        validate_asset_id(asset_id)?;
        Ok(Self {
            asset_id: asset_id.to_string(),
            timestamp_ms,
            sequence: 0,
        })
    }

    /// Returns this key with a collision sequence number.
    #[must_use]
    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.sequence = sequence;
        self
    }

    /// The asset id part.
    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    /// The timestamp part, in milliseconds.
    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// The collision sequence number (`0` for the bare key).
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Encodes the key into its on-disk byte form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = asset_prefix(&self.asset_id);
        out.extend_from_slice(
            format!("{:0width$}", self.timestamp_ms, width = TIMESTAMP_WIDTH).as_bytes(),
        );
        if self.sequence > 0 {
            out.push(SEQUENCE_MARKER);
            out.extend_from_slice(
                format!("{:0width$}", self.sequence, width = SEQUENCE_WIDTH).as_bytes(),
            );
        }
        out
    }

    /// Decodes a time-series key.
    ///
    /// Returns `None` for configuration keys and for anything that does not
    /// follow the time-series layout exactly.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let split = bytes.iter().position(|&b| b == KEY_SEPARATOR)?;
        let (asset, rest) = (&bytes[..split], &bytes[split + 1..]);
        let asset_id = std::str::from_utf8(asset).ok()?;
        validate_asset_id(asset_id).ok()?;

        if rest.len() < TIMESTAMP_WIDTH {
            return None;
        }
        let (ts, suffix) = rest.split_at(TIMESTAMP_WIDTH);
        let timestamp_ms = parse_digits(ts)?;

        let sequence = match suffix {
            [] => 0,
            [SEQUENCE_MARKER, digits @ ..] if digits.len() == SEQUENCE_WIDTH => {
                u32::try_from(parse_digits(digits)?).ok().filter(|&s| s > 0)?
            }
            _ => return None,
        };

        Some(Self {
            asset_id: asset_id.to_string(),
            timestamp_ms,
            sequence,
        })
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.encode()))
    }
}

/// Parses a run of ASCII digits as `u64`.
fn parse_digits(digits: &[u8]) -> Option<u64> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Validates an asset id for use as a key prefix.
///
/// # Errors
///
/// Returns [`StorageError::InvalidKey`] if the id is empty, longer than
/// [`MAX_ASSET_ID_LEN`], or contains the separator or a control character.
pub fn validate_asset_id(asset_id: &str) -> Result<()> {
    let reason = if asset_id.is_empty() {
        "asset id must not be empty".to_string()
    } else if asset_id.len() > MAX_ASSET_ID_LEN {
        format!("asset id longer than {MAX_ASSET_ID_LEN} bytes")
    } else if asset_id.as_bytes().contains(&KEY_SEPARATOR) {
        "asset id must not contain ':'".to_string()
    } else if asset_id.chars().any(char::is_control) {
        "asset id must not contain control characters".to_string()
    } else {
        return Ok(());
    };

    Err(StorageError::InvalidKey {
        key: asset_id.to_string(),
        reason,
    }
    .into())
}

/// Validates a configuration key name.
///
/// # Errors
///
/// Returns [`StorageError::InvalidKey`] if the name is empty or contains the
/// time-series separator.
pub fn validate_config_key(name: &str) -> Result<()> {
    if name.is_empty() || name.as_bytes().contains(&KEY_SEPARATOR) {
        return Err(StorageError::InvalidKey {
            key: name.to_string(),
            reason: "configuration keys must be non-empty and must not contain ':'".to_string(),
        }
        .into());
    }
    Ok(())
}

/// Returns the byte prefix shared by every key of `asset_id`.
pub fn asset_prefix(asset_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(asset_id.len() + 1 + TIMESTAMP_WIDTH);
    prefix.extend_from_slice(asset_id.as_bytes());
    prefix.push(KEY_SEPARATOR);
    prefix
}

/// Returns the smallest byte string greater than every string starting
/// with `prefix`.
///
/// Trailing `0xFF` bytes are dropped and the last remaining byte is
/// incremented. Returns `None` when no such string exists (empty or all
/// `0xFF`), meaning the scan is unbounded above.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut successor = prefix.to_vec();
    while let Some(last) = successor.pop() {
        if last < u8::MAX {
            successor.push(last + 1);
            return Some(successor);
        }
    }
    None
}

/// Half-open bounds covering every key that starts with `prefix`.
pub fn prefix_bounds(prefix: &[u8]) -> KeyBounds {
    let upper = match prefix_successor(prefix) {
        Some(successor) => Bound::Excluded(successor),
        None => Bound::Unbounded,
    };
    (Bound::Included(prefix.to_vec()), upper)
}

/// Bounds covering every time-series key of `asset_id`.
///
/// # Errors
///
/// Returns [`StorageError::InvalidKey`] if the asset id is invalid.
pub fn asset_bounds(asset_id: &str) -> Result<KeyBounds> {
    validate_asset_id(asset_id)?;
    Ok(prefix_bounds(&asset_prefix(asset_id)))
}

/// Bounds covering keys of `asset_id` with `from_ms < timestamp < to_ms`.
///
/// Collision suffixes sort after their bare key and before the next
/// millisecond, so starting at the bare key of `from_ms + 1` and stopping
/// before the bare key of `to_ms` excludes both endpoints entirely.
/// Returns `Ok(None)` when the interval contains no millisecond.
///
/// # Errors
///
/// Returns [`StorageError::InvalidKey`] if the asset id is invalid.
pub fn range_bounds(asset_id: &str, from_ms: u64, to_ms: u64) -> Result<Option<KeyBounds>> {
    validate_asset_id(asset_id)?;
    let Some(first) = from_ms.checked_add(1) else {
        return Ok(None);
    };
    if first >= to_ms {
        return Ok(None);
    }

    let lower = StorageKey::new(asset_id, first)?.encode();
    let upper = StorageKey::new(asset_id, to_ms)?.encode();
    Ok(Some((Bound::Included(lower), Bound::Excluded(upper))))
}
