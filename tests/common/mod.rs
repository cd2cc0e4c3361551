//! Shared fixtures for the integration suite
//!
//! Builds a service over a recording fake daemon and a tempdir-backed
//! valid storage directory, plus builders for seeding catalog rows.

#![allow(dead_code)]

use snaptree::testing::FakeImageService;
use snaptree::{
    Catalog, HashKind, HostSnapshotIdent, HostSnapshotKind, HostSnapshotRecord, LocatorId,
    RootIdent, SnapshotService, StorageIdent, StorageKind, StorageRecord, StorageStatus,
    Timestamp,
};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub struct Fixture {
    pub service: Arc<SnapshotService>,
    pub images: Arc<FakeImageService>,
    pub dir: PathBuf,
    _tmp: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("mnt/storage/pool0");
        std::fs::create_dir_all(&dir).unwrap();

        let images = Arc::new(FakeImageService::new());
        let service = Arc::new(SnapshotService::new(images.clone()));
        service.add_storage_directory(&dir).unwrap();

        Self {
            service,
            images,
            dir,
            _tmp: tmp,
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        self.service.catalog()
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Create the file so delete work and open checks see it on disk.
    pub fn touch(&self, name: &str) -> PathBuf {
        let path = self.path(name);
        File::create(&path).unwrap();
        path
    }

    pub fn storage_status(&self, ident: StorageIdent) -> StorageStatus {
        self.catalog().snapshot().storage(ident).unwrap().status
    }

    pub fn storage(&self, ident: StorageIdent) -> StorageRecord {
        self.catalog().snapshot().storage(ident).unwrap()
    }

    /// Register a host snapshot with one disk snapshot per locator.
    pub fn host_snapshot(
        &self,
        kind: HostSnapshotKind,
        valid: bool,
        begin: Timestamp,
        end: Timestamp,
        locators: &[LocatorId],
    ) -> HostSnapshotIdent {
        let ident = HostSnapshotIdent::new();
        self.catalog()
            .transaction(|tx| {
                tx.insert_host_snapshot(HostSnapshotRecord {
                    ident,
                    kind,
                    valid,
                    begin_timestamp: begin,
                    end_timestamp: end,
                });
                for (disk_index, locator) in locators.iter().enumerate() {
                    tx.insert_disk_snapshot(ident, *locator, disk_index as u32);
                }
                Ok(())
            })
            .unwrap();
        ident
    }

    pub fn invalidate_host_snapshot(&self, ident: HostSnapshotIdent) {
        self.catalog()
            .transaction(|tx| tx.set_host_snapshot_valid(ident, false))
            .unwrap();
    }
}

/// Seed-row builder in the shape the engine persists.
pub struct StorageBuilder {
    record: StorageRecord,
}

impl StorageBuilder {
    fn new(root: RootIdent, kind: StorageKind, path: &Path) -> Self {
        Self {
            record: StorageRecord {
                row_id: 0,
                ident: StorageIdent::new(),
                root_id: root,
                locator_id: None,
                kind,
                status: StorageStatus::Storage,
                disk_bytes: 1 << 30,
                image_path: path.to_path_buf(),
                full_hash_path: None,
                inc_hash_path: None,
                begin_timestamp: 100,
                end_timestamp: 100,
                parent_ident: None,
                parent_timestamp: None,
                file_level_deduplication: false,
            },
        }
    }

    pub fn qcow(root: RootIdent, path: &Path) -> Self {
        Self::new(root, StorageKind::Qcow, path)
    }

    pub fn cdp(root: RootIdent, path: &Path) -> Self {
        Self::new(root, StorageKind::Cdp, path)
    }

    pub fn parent(mut self, parent: StorageIdent) -> Self {
        self.record.parent_ident = Some(parent);
        self
    }

    pub fn parent_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.record.parent_timestamp = Some(timestamp);
        self
    }

    pub fn status(mut self, status: StorageStatus) -> Self {
        self.record.status = status;
        self
    }

    pub fn locator(mut self, locator: LocatorId) -> Self {
        self.record.locator_id = Some(locator);
        self
    }

    pub fn span(mut self, begin: Timestamp, end: Timestamp) -> Self {
        self.record.begin_timestamp = begin;
        self.record.end_timestamp = end;
        self
    }

    pub fn disk_bytes(mut self, bytes: u64) -> Self {
        self.record.disk_bytes = bytes;
        self
    }

    pub fn inc_hash(mut self) -> Self {
        let mut name = self.record.image_path.as_os_str().to_os_string();
        name.push(format!("_{}.hash", self.record.ident));
        self.record.inc_hash_path = Some(PathBuf::from(name));
        self
    }

    pub fn dedup(mut self) -> Self {
        self.record.file_level_deduplication = true;
        self
    }

    pub fn insert(self, catalog: &Catalog) -> StorageRecord {
        catalog
            .transaction(|tx| tx.insert_storage(self.record.clone()))
            .unwrap()
    }
}

/// Create an ordinary root with a registered locker.
pub fn seeded_root(fixture: &Fixture, hash_kind: HashKind) -> RootIdent {
    fixture.service.create_root(hash_kind).unwrap().ident
}
