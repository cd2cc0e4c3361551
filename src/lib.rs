//! snaptree — disk-snapshot storage engine for host backup services
//!
//! Models each backed-up disk as a rooted tree of immutable or append-only
//! storage objects: QCOW files (copy-on-write image snapshots) and CDP
//! files (continuous-data-protection byte streams). On top of the tree it
//! provides:
//!
//! - opening read or read/write *chains*: the concrete file sequence
//!   needed to reconstruct a virtual disk at a moment;
//! - safe creation of new snapshots that extend the tree while other
//!   readers and writers are active;
//! - a background *reclamation engine* that deletes or merges obsolete
//!   storage while never breaking live references.
//!
//! The façade re-exports the user-facing API of the three workspace
//! crates. Start with [`SnapshotService`].

pub use snaptree_catalog::{Catalog, Tables};
pub use snaptree_core::{
    now_micros, recycle_root_ident, DiskSnapshotRecord, Error, HashKind, HostSnapshotIdent,
    HostSnapshotKind, HostSnapshotRecord, JournalPayload, JournalRecord, JournalToken, LocatorId,
    Result, RootIdent, RootRecord, StorageIdent, StorageKind, StorageRecord, StorageStatus,
    Timestamp,
};
pub use snaptree_engine::{
    key_storage_list, AcquiredChain, CdpSeek, ChainMode, CollectorDaemon, CreateStorageRequest,
    DiskOpenOutcome, HandleManager, ImageRpcError, ImageService, MergeCdpRequest,
    MergeQcowTypeBRequest, OpenHostSnapshotRequest, OpenOutcome, OpenStorageRequest,
    ReferenceManager, RootLockerManager, SnapshotImage, SnapshotService, StorageActions,
    StorageChain, StorageCollector, StorageTree, ValidDirectories, CDP_FILE_NO_CONTENT,
};

/// Test support (recording fake of the image daemon).
pub mod testing {
    pub use snaptree_engine::testing::FakeImageService;
}
