//! Storage chains
//!
//! A chain is the ordered sequence of storages needed to reconstruct a
//! virtual disk at a moment, root first. The *key* subset is the minimal
//! list of storages that must be physically opened:
//!
//! - the last element, always;
//! - the root, when it is a file-level-dedup storage;
//! - every element whose successor lives in a different image file;
//! - every element whose successor is still mutating its file
//!   (`STATUS_WRITING` — a consumer needs the prior file while its
//!   successor is written).
//!
//! Chains come in three flavours over the same key computation: read chains
//! register reader reservations, write chains register the tail as a writer
//! and expose only the tail's image-mates, read/write chains register both.
//!
//! `acquire` consumes the chain and must not be re-entered; `release` runs
//! on every exit path, including drop.

use crate::reference::ReferenceManager;
use snaptree_core::{Error, Result, StorageRecord, StorageStatus, Timestamp};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Purpose a chain is opened for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainMode {
    /// Reconstruct and read; tail must not be `Creating`.
    Read,
    /// Append into the tail; tail must be `Creating`.
    Write,
    /// Read while appending into a freshly created tail.
    ReadWrite,
}

impl ChainMode {
    fn prefix(&self) -> &'static str {
        match self {
            ChainMode::Read => "r",
            ChainMode::Write => "w",
            ChainMode::ReadWrite => "rw",
        }
    }
}

/// Compute the key subset of a full chain.
///
/// Order is preserved, no element is duplicated, and the last element is
/// always included.
pub fn key_storage_list(storages: &[StorageRecord]) -> Vec<StorageRecord> {
    let mut key = Vec::new();
    let last = storages.len().saturating_sub(1);
    for (i, storage) in storages.iter().enumerate() {
        debug_assert!(storage.status != StorageStatus::Recycled);
        if i == last {
            key.push(storage.clone());
            continue;
        }
        if i == 0 && storage.file_level_deduplication {
            debug_assert!(storage.parent_ident.is_none());
            key.push(storage.clone());
            continue;
        }
        if storage.image_path != storages[i + 1].image_path {
            key.push(storage.clone());
            continue;
        }
        if storages[i + 1].status.is_writing() {
            key.push(storage.clone());
            continue;
        }
    }
    key
}

/// An unacquired chain: the full storage list plus intent.
#[derive(Debug)]
pub struct StorageChain {
    mode: ChainMode,
    name: String,
    timestamp: Option<Timestamp>,
    storages: Vec<StorageRecord>,
}

impl StorageChain {
    /// Create an empty chain for a caller.
    ///
    /// `timestamp` selects the moment within a CDP tail; `None` means the
    /// tail's full range.
    pub fn new(mode: ChainMode, caller_name: &str, timestamp: Option<Timestamp>) -> Self {
        Self {
            mode,
            name: format!(
                "{} | {} | {}",
                mode.prefix(),
                Uuid::new_v4().simple(),
                caller_name
            ),
            timestamp,
            storages: Vec::new(),
        }
    }

    /// Create a chain from an eagerly built full storage list, root first.
    pub fn from_storages(
        mode: ChainMode,
        caller_name: &str,
        timestamp: Option<Timestamp>,
        storages: Vec<StorageRecord>,
    ) -> Self {
        let mut chain = Self::new(mode, caller_name, timestamp);
        chain.storages = storages;
        chain
    }

    /// Prepend a storage (towards the root).
    pub fn push_head(&mut self, record: StorageRecord) {
        self.storages.insert(0, record);
    }

    /// Append a storage (towards the tail).
    pub fn push_tail(&mut self, record: StorageRecord) {
        self.storages.push(record);
    }

    /// Whether the chain has no storages.
    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }

    /// Unique name identifying this chain as a reference-manager caller.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compute the key list and register reservations.
    ///
    /// A partial registration (read taken, write refused) is rolled back
    /// before the error propagates.
    pub fn acquire(self, references: Arc<ReferenceManager>) -> Result<AcquiredChain> {
        if self.storages.is_empty() {
            return Err(Error::internal(format!("chain {} is empty", self.name)));
        }
        if let Some(bad) = self
            .storages
            .iter()
            .find(|s| s.status == StorageStatus::Recycled)
        {
            return Err(Error::internal(format!(
                "chain {} contains recycled storage {bad}",
                self.name
            )));
        }

        let tail = self.storages.last().expect("non-empty chain");
        match self.mode {
            ChainMode::Read => {
                if tail.status == StorageStatus::Creating {
                    return Err(Error::internal(format!(
                        "read chain {} tail {tail} is still creating",
                        self.name
                    )));
                }
            }
            ChainMode::Write => {
                if tail.status != StorageStatus::Creating {
                    return Err(Error::internal(format!(
                        "write chain {} tail {tail} is not creating",
                        self.name
                    )));
                }
            }
            ChainMode::ReadWrite => {}
        }

        let key = key_storage_list(&self.storages);
        let write_key = match self.mode {
            ChainMode::Write => key
                .iter()
                .filter(|s| s.image_path == tail.image_path)
                .cloned()
                .collect(),
            _ => Vec::new(),
        };

        let mut acquired = AcquiredChain {
            mode: self.mode,
            name: self.name,
            timestamp: self.timestamp,
            storages: self.storages,
            key,
            write_key,
            references,
            reading_registered: false,
            writing_registered: false,
            released: false,
        };
        acquired.register()?;
        Ok(acquired)
    }
}

/// A chain holding live reservations at the reference manager.
#[derive(Debug)]
pub struct AcquiredChain {
    mode: ChainMode,
    name: String,
    timestamp: Option<Timestamp>,
    storages: Vec<StorageRecord>,
    key: Vec<StorageRecord>,
    write_key: Vec<StorageRecord>,
    references: Arc<ReferenceManager>,
    reading_registered: bool,
    writing_registered: bool,
    released: bool,
}

impl AcquiredChain {
    fn register(&mut self) -> Result<()> {
        let result = self.register_inner();
        if result.is_err() {
            self.release_in_place();
        }
        result
    }

    fn register_inner(&mut self) -> Result<()> {
        let tail = self.storages.last().expect("non-empty chain").clone();
        match self.mode {
            ChainMode::Read => {
                self.references.add_reading(&self.name, &self.key)?;
                self.reading_registered = true;
            }
            ChainMode::Write => {
                self.references.add_writing(&self.name, &tail)?;
                self.writing_registered = true;
            }
            ChainMode::ReadWrite => {
                self.references.add_reading(&self.name, &self.key)?;
                self.reading_registered = true;
                self.references.add_writing(&self.name, &tail)?;
                self.writing_registered = true;
            }
        }
        Ok(())
    }

    /// The storages that must be physically opened for this chain's mode.
    pub fn storages(&self) -> &[StorageRecord] {
        match self.mode {
            ChainMode::Write => &self.write_key,
            _ => &self.key,
        }
    }

    /// The full chain, root first.
    pub fn full_chain(&self) -> &[StorageRecord] {
        &self.storages
    }

    /// The key list regardless of mode.
    pub fn key_storages(&self) -> &[StorageRecord] {
        &self.key
    }

    /// The chain tail.
    pub fn tail(&self) -> &StorageRecord {
        self.storages.last().expect("non-empty chain")
    }

    /// Selected moment within a CDP tail, if any.
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }

    /// Mode the chain was acquired for.
    pub fn mode(&self) -> ChainMode {
        self.mode
    }

    /// Unique chain name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release all reservations. Also runs on drop; releasing twice is a
    /// no-op.
    pub fn release(mut self) {
        self.release_in_place();
    }

    fn release_in_place(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if self.reading_registered {
            self.references.remove_reading(&self.name);
            self.reading_registered = false;
        }
        if self.writing_registered {
            self.references.remove_writing(&self.name);
            self.writing_registered = false;
        }
    }
}

impl Drop for AcquiredChain {
    fn drop(&mut self) {
        if !self.released && (self.reading_registered || self.writing_registered) {
            warn!(chain = %self.name, "chain dropped while holding reservations");
        }
        self.release_in_place();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snaptree_core::{RootIdent, StorageIdent, StorageKind};
    use std::path::{Path, PathBuf};

    fn storage(path: &str, status: StorageStatus) -> StorageRecord {
        StorageRecord {
            row_id: 0,
            ident: StorageIdent::new(),
            root_id: RootIdent::new(),
            locator_id: None,
            kind: StorageKind::Qcow,
            status,
            disk_bytes: 1 << 30,
            image_path: PathBuf::from(path),
            full_hash_path: None,
            inc_hash_path: None,
            begin_timestamp: 100,
            end_timestamp: 100,
            parent_ident: None,
            parent_timestamp: None,
            file_level_deduplication: false,
        }
    }

    #[test]
    fn test_key_list_single_element() {
        let chain = vec![storage("/mnt/s/a.qcow", StorageStatus::Storage)];
        let key = key_storage_list(&chain);
        assert_eq!(key.len(), 1);
        assert_eq!(key[0].ident, chain[0].ident);
    }

    #[test]
    fn test_key_list_collapses_same_file_runs() {
        // three snapshots in one file plus a tail in another: only the last
        // snapshot of the first file and the tail are key
        let chain = vec![
            storage("/mnt/s/a.qcow", StorageStatus::Storage),
            storage("/mnt/s/a.qcow", StorageStatus::Storage),
            storage("/mnt/s/a.qcow", StorageStatus::Storage),
            storage("/mnt/s/b.qcow", StorageStatus::Storage),
        ];
        let key = key_storage_list(&chain);
        let idents: Vec<StorageIdent> = key.iter().map(|s| s.ident).collect();
        assert_eq!(idents, vec![chain[2].ident, chain[3].ident]);
    }

    #[test]
    fn test_key_list_keeps_predecessor_of_writing_successor() {
        let chain = vec![
            storage("/mnt/s/a.qcow", StorageStatus::Storage),
            storage("/mnt/s/a.qcow", StorageStatus::Hashing),
            storage("/mnt/s/a.qcow", StorageStatus::Creating),
        ];
        let key = key_storage_list(&chain);
        let idents: Vec<StorageIdent> = key.iter().map(|s| s.ident).collect();
        // every element survives: each successor is in STATUS_WRITING
        assert_eq!(
            idents,
            vec![chain[0].ident, chain[1].ident, chain[2].ident]
        );
    }

    #[test]
    fn test_key_list_keeps_dedup_root() {
        let mut root = storage("/mnt/s/a.qcow", StorageStatus::Storage);
        root.file_level_deduplication = true;
        let chain = vec![
            root,
            storage("/mnt/s/a.qcow", StorageStatus::Storage),
            storage("/mnt/s/a.qcow", StorageStatus::Storage),
        ];
        let key = key_storage_list(&chain);
        let idents: Vec<StorageIdent> = key.iter().map(|s| s.ident).collect();
        assert_eq!(idents, vec![chain[0].ident, chain[2].ident]);
    }

    #[test]
    fn test_read_chain_rejects_creating_tail() {
        let refs = Arc::new(ReferenceManager::new());
        let chain = StorageChain::from_storages(
            ChainMode::Read,
            "caller",
            None,
            vec![storage("/mnt/s/a.qcow", StorageStatus::Creating)],
        );
        assert!(chain.acquire(refs).is_err());
    }

    #[test]
    fn test_write_chain_exposes_only_tail_image_mates() {
        let refs = Arc::new(ReferenceManager::new());
        let chain = StorageChain::from_storages(
            ChainMode::Write,
            "caller",
            None,
            vec![
                storage("/mnt/s/a.qcow", StorageStatus::Storage),
                storage("/mnt/s/b.qcow", StorageStatus::Storage),
                storage("/mnt/s/b.qcow", StorageStatus::Creating),
            ],
        );
        let acquired = chain.acquire(refs.clone()).unwrap();
        let paths: Vec<&Path> = acquired
            .storages()
            .iter()
            .map(|s| s.image_path.as_path())
            .collect();
        assert!(paths.iter().all(|p| *p == Path::new("/mnt/s/b.qcow")));
        assert!(refs.is_storage_writing(Path::new("/mnt/s/b.qcow")));
        assert!(!refs.is_storage_writing(Path::new("/mnt/s/a.qcow")));
    }

    #[test]
    fn test_rw_chain_registers_reader_and_writer() {
        let refs = Arc::new(ReferenceManager::new());
        let tail = storage("/mnt/s/b.qcow", StorageStatus::Creating);
        let head = storage("/mnt/s/a.qcow", StorageStatus::Storage);
        let head_ident = head.ident;
        let chain = StorageChain::from_storages(
            ChainMode::ReadWrite,
            "caller",
            None,
            vec![head, tail],
        );
        let acquired = chain.acquire(refs.clone()).unwrap();
        assert!(refs.is_storage_using(head_ident));
        assert!(refs.is_storage_writing(Path::new("/mnt/s/b.qcow")));

        acquired.release();
        assert!(!refs.is_storage_using(head_ident));
        assert!(!refs.is_storage_writing(Path::new("/mnt/s/b.qcow")));
    }

    #[test]
    fn test_failed_acquire_rolls_back_partial_reservations() {
        let refs = Arc::new(ReferenceManager::new());
        let blocker = storage("/mnt/s/b.qcow", StorageStatus::Creating);
        refs.add_writing("existing-writer", &blocker).unwrap();

        let head = storage("/mnt/s/a.qcow", StorageStatus::Storage);
        let head_ident = head.ident;
        let chain = StorageChain::from_storages(
            ChainMode::ReadWrite,
            "caller",
            None,
            vec![head, storage("/mnt/s/b.qcow", StorageStatus::Creating)],
        );
        let err = chain.acquire(refs.clone()).unwrap_err();
        assert!(matches!(err, Error::StorageReferenceRepeated { .. }));
        // the reading half must have been rolled back
        assert!(!refs.is_storage_using(head_ident));
    }

    #[test]
    fn test_release_on_drop() {
        let refs = Arc::new(ReferenceManager::new());
        let record = storage("/mnt/s/a.qcow", StorageStatus::Storage);
        let ident = record.ident;
        {
            let chain =
                StorageChain::from_storages(ChainMode::Read, "caller", None, vec![record]);
            let _acquired = chain.acquire(refs.clone()).unwrap();
            assert!(refs.is_storage_using(ident));
        }
        assert!(!refs.is_storage_using(ident));
    }

    #[test]
    fn test_empty_chain_cannot_acquire() {
        let refs = Arc::new(ReferenceManager::new());
        let chain = StorageChain::new(ChainMode::Read, "caller", None);
        assert!(chain.is_empty());
        assert!(chain.acquire(refs).is_err());
    }
}
