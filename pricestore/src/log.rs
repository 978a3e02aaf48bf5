//! Append-only record log backing the price index.
//!
//! Every write to the index becomes one record appended to a single log
//! file. The sorted index is rebuilt from the log when the store is opened;
//! nothing in the file is ever rewritten in place.
//!
//! # File Format
//!
//! ```text
//! [0..16)     Header: magic "PSLG", version (u32 LE), 8 reserved bytes
//! [16..)      Records, back to back:
//!               key_len   u32 LE
//!               value_len u32 LE
//!               key       key_len bytes
//!               value     value_len bytes
//!               checksum  u32 LE, FNV-1a over key || value
//! ```
//!
//! # Recovery
//!
//! A crash during an append can leave a partial record at the end of the
//! file. Replay stops at the last complete record; the writer truncates the
//! torn tail before appending again. A damaged record followed by further
//! data cannot be a torn append and is reported as corruption.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use memmap2::Mmap;

use crate::error::{Result, StorageError};

/// Magic bytes identifying a pricestore log file.
const LOG_MAGIC: [u8; 4] = *b"PSLG";

/// Current log format version.
const LOG_VERSION: u32 = 1;

/// Size of the log header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Bytes of framing around each record's key and value.
const RECORD_OVERHEAD: usize = 12;

/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// Maximum value length in bytes.
pub const MAX_VALUE_LEN: usize = 16 * 1024 * 1024;

/// Header at the start of every log file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LogHeader {
    /// Magic bytes for file type identification.
    magic: [u8; 4],
    /// Log format version number.
    version: u32,
}

impl LogHeader {
    fn new() -> Self {
        Self {
            magic: LOG_MAGIC,
            version: LOG_VERSION,
        }
    }

    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.magic);
        bytes[4..8].copy_from_slice(&self.version.to_le_bytes());
        bytes
    }

    fn decode(bytes: &[u8], path: &str) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(corrupted(
                path,
                0,
                format!("file is {} bytes, shorter than the header", bytes.len()),
            ));
        }

        let header = Self {
            magic: [bytes[0], bytes[1], bytes[2], bytes[3]],
            version: read_u32(&bytes[4..8]),
        };
        header.validate(path)?;
        Ok(header)
    }

    /// Validates the header magic and version.
    fn validate(&self, path: &str) -> Result<()> {
        if self.magic != LOG_MAGIC {
            return Err(corrupted(
                path,
                0,
                format!("invalid magic bytes: expected {:?}, found {:?}", LOG_MAGIC, self.magic),
            ));
        }

        if self.version != LOG_VERSION {
            return Err(corrupted(
                path,
                0,
                format!("unsupported version: expected {}, found {}", LOG_VERSION, self.version),
            ));
        }

        Ok(())
    }
}

/// Result of replaying a log file.
#[derive(Debug, Default)]
pub struct Replay {
    /// Records in file order as `(key, value)` pairs.
    pub records: Vec<(Vec<u8>, Vec<u8>)>,
    /// Length of the file up to the end of the last complete record.
    pub valid_len: u64,
    /// Bytes after `valid_len` belonging to a torn final record.
    pub torn_bytes: u64,
}

/// Creates the log file with a fresh header if it is missing or empty.
///
/// # Errors
///
/// Returns [`StorageError::LogOpen`] or [`StorageError::LogWrite`] if the
/// file cannot be created or the header cannot be written.
pub fn initialize(path: &Path) -> Result<()> {
    let path_str = path.display().to_string();

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| StorageError::LogOpen {
            path: path_str.clone(),
            source: e,
        })?;

    let len = file
        .metadata()
        .map_err(|e| StorageError::LogOpen {
            path: path_str.clone(),
            source: e,
        })?
        .len();

    if len == 0 {
        file.write_all(&LogHeader::new().encode())
            .and_then(|()| file.sync_all())
            .map_err(|e| StorageError::LogWrite {
                path: path_str,
                offset: 0,
                source: e,
            })?;
    }

    Ok(())
}

/// Reads every complete record from the log at `path`.
///
/// # Errors
///
/// Returns [`StorageError::LogOpen`] if the file cannot be opened,
/// [`StorageError::MemoryMap`] if it cannot be mapped, and
/// [`StorageError::CorruptedLog`] if the header or a non-final record is
/// damaged.
pub fn replay(path: &Path) -> Result<Replay> {
    let path_str = path.display().to_string();

    let file = File::open(path).map_err(|e| StorageError::LogOpen {
        path: path_str.clone(),
        source: e,
    })?;

    let len = file
        .metadata()
        .map_err(|e| StorageError::LogOpen {
            path: path_str.clone(),
            source: e,
        })?
        .len();

    if len == 0 {
        return Err(corrupted(&path_str, 0, "file is empty".to_string()));
    }

    // SAFETY: the map is read-only and dropped before this function returns.
    // The only writer of the log is the `LogWriter` of the owning store,
    // which is opened after replay completes.
    let mmap = unsafe {
        Mmap::map(&file).map_err(|e| StorageError::MemoryMap {
            path: path_str.clone(),
            source: e,
        })?
    };

    parse(&mmap, &path_str)
}

/// Parses a complete log image.
fn parse(bytes: &[u8], path: &str) -> Result<Replay> {
    LogHeader::decode(bytes, path)?;

    let mut records = Vec::new();
    let mut offset = HEADER_SIZE;

    while offset < bytes.len() {
        let remaining = &bytes[offset..];
        if remaining.len() < 8 {
            break;
        }

        let key_len = read_u32(&remaining[0..4]) as usize;
        let value_len = read_u32(&remaining[4..8]) as usize;
        if key_len > MAX_KEY_LEN || value_len > MAX_VALUE_LEN {
            return Err(corrupted(
                path,
                offset as u64,
                format!("record lengths out of range: key {key_len}, value {value_len}"),
            ));
        }

        let record_len = RECORD_OVERHEAD + key_len + value_len;
        if remaining.len() < record_len {
            break;
        }

        let key = &remaining[8..8 + key_len];
        let value = &remaining[8 + key_len..8 + key_len + value_len];
        let stored = read_u32(&remaining[8 + key_len + value_len..record_len]);

        if stored != checksum(key, value) {
            if offset + record_len == bytes.len() {
                // Damaged final record: treat like a torn append.
                break;
            }
            return Err(corrupted(path, offset as u64, "checksum mismatch".to_string()));
        }

        records.push((key.to_vec(), value.to_vec()));
        offset += record_len;
    }

    Ok(Replay {
        records,
        valid_len: offset as u64,
        torn_bytes: (bytes.len() - offset) as u64,
    })
}

/// Appends records to a log file.
///
/// A single `LogWriter` may exist per log; the index serialises access to it.
#[derive(Debug)]
pub struct LogWriter {
    /// The open log file.
    file: File,
    /// Path to the log file (for error reporting).
    path: String,
    /// Offset where the next record starts.
    offset: u64,
}

impl LogWriter {
    /// Opens the log for appending after the first `valid_len` bytes.
    ///
    /// Anything past `valid_len` (a torn record found by [`replay`]) is cut
    /// off before the first append.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::LogOpen`] if the file cannot be opened or
    /// truncated.
    pub fn open(path: &Path, valid_len: u64) -> Result<Self> {
        let path_str = path.display().to_string();
        let open_err = |e| StorageError::LogOpen {
            path: path_str.clone(),
            source: e,
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(open_err)?;

        let len = file.metadata().map_err(open_err)?.len();
        if len > valid_len {
            file.set_len(valid_len).map_err(open_err)?;
            file.sync_all().map_err(open_err)?;
        }
        file.seek(SeekFrom::Start(valid_len)).map_err(open_err)?;

        Ok(Self {
            file,
            path: path_str,
            offset: valid_len,
        })
    }

    /// Appends one record and syncs it to disk.
    ///
    /// On failure the file is cut back to its previous length, so a failed
    /// append leaves no partial record behind.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] or [`StorageError::ValueTooLarge`]
    /// for oversized records and [`StorageError::LogWrite`] if the write or
    /// sync fails.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<u64> {
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            return Err(StorageError::InvalidKey {
                key: String::from_utf8_lossy(key).into_owned(),
                reason: format!("key length must be 1..={MAX_KEY_LEN} bytes"),
            }
            .into());
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(StorageError::ValueTooLarge {
                len: value.len(),
                max: MAX_VALUE_LEN,
            }
            .into());
        }

        let record = encode_record(key, value);
        let start = self.offset;

        let written = self
            .file
            .seek(SeekFrom::Start(start))
            .and_then(|_| self.file.write_all(&record))
            .and_then(|()| self.file.sync_data());

        if let Err(e) = written {
            let _ = self.file.set_len(start);
            return Err(StorageError::LogWrite {
                path: self.path.clone(),
                offset: start,
                source: e,
            }
            .into());
        }

        self.offset += record.len() as u64;
        Ok(start)
    }

    /// Offset where the next record will start.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

/// Serialises one record.
#[allow(clippy::cast_possible_truncation)] // lengths are bounded by MAX_KEY_LEN / MAX_VALUE_LEN
fn encode_record(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut record = Vec::with_capacity(RECORD_OVERHEAD + key.len() + value.len());
    record.extend_from_slice(&(key.len() as u32).to_le_bytes());
    record.extend_from_slice(&(value.len() as u32).to_le_bytes());
    record.extend_from_slice(key);
    record.extend_from_slice(value);
    record.extend_from_slice(&checksum(key, value).to_le_bytes());
    record
}

/// FNV-1a over the key followed by the value.
fn checksum(key: &[u8], value: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;

    key.iter()
        .chain(value)
        .fold(OFFSET_BASIS, |hash, &byte| (hash ^ u32::from(byte)).wrapping_mul(PRIME))
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn corrupted(path: &str, offset: u64, reason: String) -> crate::error::PriceStoreError {
    StorageError::CorruptedLog {
        path: path.to_string(),
        offset,
        reason,
    }
    .into()
}
