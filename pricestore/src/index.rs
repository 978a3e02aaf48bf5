//! Ordered in-memory index over the record log.
//!
//! The [`Index`] keeps every key and value in a `BTreeMap`, sorted by the
//! byte order of the keys. Writes go to the log first and are only applied
//! to the map after the append is durable, so a failed write changes
//! nothing. Readers take a shared lock and never block each other.

use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock};

use crate::error::{Result, StorageError};
use crate::key::KeyBounds;
use crate::log::{self, LogWriter};

/// Iteration order for [`Index::scan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending key order.
    Forward,
    /// Descending key order.
    Reverse,
}

/// Ordered key-value index persisted through an append-only log.
#[derive(Debug)]
pub struct Index {
    /// Sorted view of every live record.
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    /// Log appender, `None` when opened read-only.
    writer: Mutex<Option<LogWriter>>,
}

impl Index {
    /// Opens the index backed by the log at `path`.
    ///
    /// The log is created when missing (unless `read_only`), replayed into
    /// memory, and any torn tail from an interrupted append is discarded.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the log cannot be created, read or
    /// contains a corrupted record.
    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        if !read_only {
            log::initialize(path)?;
        }

        let replay = log::replay(path)?;
        if replay.torn_bytes > 0 {
            tracing::warn!(
                path = %path.display(),
                valid_len = replay.valid_len,
                torn_bytes = replay.torn_bytes,
                "discarding torn tail of record log"
            );
        }

        let record_count = replay.records.len();
        let entries: BTreeMap<Vec<u8>, Vec<u8>> = replay.records.into_iter().collect();

        let writer = if read_only {
            None
        } else {
            Some(LogWriter::open(path, replay.valid_len)?)
        };

        tracing::debug!(
            path = %path.display(),
            records = record_count,
            keys = entries.len(),
            read_only,
            "index opened"
        );

        Ok(Self {
            entries: RwLock::new(entries),
            writer: Mutex::new(writer),
        })
    }

    /// Returns the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::LockPoisoned`] if a writer panicked.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries.get(key).cloned())
    }

    /// Visits entries within `bounds` in the given direction.
    ///
    /// The visitor returns [`ControlFlow::Break`] to stop early. The shared
    /// lock is held for the duration of the scan.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::LockPoisoned`] if a writer panicked.
    pub fn scan<F>(&self, bounds: KeyBounds, direction: Direction, mut visit: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> ControlFlow<()>,
    {
        let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
        let range = entries.range::<Vec<u8>, _>(bounds);

        // Break only ends the walk; it is not an error.
        let _ = match direction {
            Direction::Forward => range.into_iter().try_for_each(|(k, v)| visit(k, v)),
            Direction::Reverse => range.rev().try_for_each(|(k, v)| visit(k, v)),
        };

        Ok(())
    }

    /// Number of keys in the index.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::LockPoisoned`] if a writer panicked.
    pub fn len(&self) -> Result<usize> {
        let entries = self.entries.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries.len())
    }

    /// Returns `true` if the index holds no keys.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::LockPoisoned`] if a writer panicked.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Returns `true` if the index rejects writes.
    pub fn is_read_only(&self) -> bool {
        self.writer
            .lock()
            .map(|writer| writer.is_none())
            .unwrap_or(true)
    }

    /// Acquires exclusive write access.
    ///
    /// Writers are serialised; a caller that needs to read the current
    /// state and then write based on it does both through one
    /// [`IndexWriter`].
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ReadOnly`] for a read-only index and
    /// [`StorageError::LockPoisoned`] if a previous writer panicked.
    pub fn writer(&self) -> Result<IndexWriter<'_>> {
        let guard = self.writer.lock().map_err(|_| StorageError::LockPoisoned)?;
        if guard.is_none() {
            return Err(StorageError::ReadOnly.into());
        }
        Ok(IndexWriter { index: self, log: guard })
    }

    /// Writes a single key-value pair.
    ///
    /// # Errors
    ///
    /// See [`Index::writer`] and [`IndexWriter::insert`].
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.writer()?.insert(key, value)
    }
}

/// Exclusive write access to an [`Index`].
///
/// Holding an `IndexWriter` keeps other writers out, so a key chosen with
/// [`IndexWriter::last_key_in`] cannot be taken before it is inserted.
#[derive(Debug)]
pub struct IndexWriter<'a> {
    index: &'a Index,
    log: MutexGuard<'a, Option<LogWriter>>,
}

impl IndexWriter<'_> {
    /// Returns the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::LockPoisoned`] if a writer panicked.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.index.get(key)
    }

    /// Returns the greatest key within `bounds`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::LockPoisoned`] if a writer panicked.
    pub fn last_key_in(&self, bounds: KeyBounds) -> Result<Option<Vec<u8>>> {
        let entries = self
            .index
            .entries
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries
            .range::<Vec<u8>, _>(bounds)
            .next_back()
            .map(|(k, _)| k.clone()))
    }

    /// Appends the pair to the log and then publishes it to readers.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] if the record is too large or the append
    /// fails; the index is unchanged in that case.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let writer = self.log.as_mut().ok_or(StorageError::ReadOnly)?;
        writer.append(key, value)?;

        let mut entries = self
            .index
            .entries
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}
