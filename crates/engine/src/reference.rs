//! Storage reference manager
//!
//! Process-wide registry of storages that are in use (including those that
//! are logically about to be used). References come in two kinds: reading
//! and writing. Query methods let the rest of the engine ask whether a
//! storage or an image file is currently referenced.
//!
//! A writer reservation blocks subsequent writer reservations on the same
//! image file, but never blocks readers.

use chrono::DateTime;
use parking_lot::RwLock;
use snaptree_core::{now_micros, Error, Result, StorageIdent, StorageRecord, Timestamp};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// One reservation: a storage plus the file backing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceRecord {
    /// The reserved storage.
    pub storage_ident: StorageIdent,
    /// Its backing image file.
    pub image_path: PathBuf,
    /// When the reservation was taken.
    pub reserved_at: Timestamp,
}

impl ReferenceRecord {
    fn new(record: &StorageRecord) -> Self {
        Self {
            storage_ident: record.ident,
            image_path: record.image_path.clone(),
            reserved_at: now_micros(),
        }
    }
}

impl fmt::Display for ReferenceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let when = DateTime::from_timestamp_micros(self.reserved_at as i64)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S%.6f").to_string())
            .unwrap_or_else(|| self.reserved_at.to_string());
        write!(
            f,
            "{}|{}|{}",
            when,
            self.image_path.display(),
            self.storage_ident
        )
    }
}

/// Tracks live reader and writer reservations per caller.
///
/// The generation counter increments on every mutation; callers that cache
/// query answers must key them by the generation they observed.
#[derive(Debug, Default)]
pub struct ReferenceManager {
    reading: RwLock<HashMap<String, Vec<ReferenceRecord>>>,
    writing: RwLock<HashMap<String, ReferenceRecord>>,
    generation: AtomicU64,
}

impl ReferenceManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register reading reservations for a caller.
    ///
    /// The caller must not already hold reading reservations.
    pub fn add_reading(&self, caller: &str, storages: &[StorageRecord]) -> Result<()> {
        debug_assert!(!caller.is_empty());
        let mut reading = self.reading.write();
        if reading.contains_key(caller) {
            return Err(Error::internal(format!(
                "caller {caller} already holds reading references"
            )));
        }
        reading.insert(
            caller.to_string(),
            storages.iter().map(ReferenceRecord::new).collect(),
        );
        self.bump();
        Ok(())
    }

    /// Drop a caller's reading reservations. No-op for unknown callers.
    pub fn remove_reading(&self, caller: &str) {
        debug_assert!(!caller.is_empty());
        if self.reading.write().remove(caller).is_some() {
            self.bump();
        }
    }

    /// Register a writing reservation for a caller.
    ///
    /// Fails with `StorageReferenceRepeated` when any existing writer holds
    /// the same image file.
    pub fn add_writing(&self, caller: &str, storage: &StorageRecord) -> Result<()> {
        debug_assert!(!caller.is_empty());
        let mut writing = self.writing.write();
        if writing.contains_key(caller) {
            return Err(Error::internal(format!(
                "caller {caller} already holds a writing reference"
            )));
        }
        for record in writing.values() {
            if record.image_path == storage.image_path {
                return Err(Error::StorageReferenceRepeated {
                    path: storage.image_path.clone(),
                });
            }
        }
        writing.insert(caller.to_string(), ReferenceRecord::new(storage));
        self.bump();
        Ok(())
    }

    /// Drop a caller's writing reservation. No-op for unknown callers.
    pub fn remove_writing(&self, caller: &str) {
        debug_assert!(!caller.is_empty());
        if self.writing.write().remove(caller).is_some() {
            self.bump();
        }
    }

    /// Whether any reading or writing reservation covers the storage.
    pub fn is_storage_using(&self, ident: StorageIdent) -> bool {
        {
            let reading = self.reading.read();
            for records in reading.values() {
                if records.iter().any(|r| r.storage_ident == ident) {
                    return true;
                }
            }
        }
        let writing = self.writing.read();
        writing.values().any(|r| r.storage_ident == ident)
    }

    /// Whether any writing reservation covers the image file.
    pub fn is_storage_writing(&self, path: &Path) -> bool {
        let writing = self.writing.read();
        writing.values().any(|r| r.image_path == path)
    }

    /// Current mutation generation; bumped on every add or remove.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}
