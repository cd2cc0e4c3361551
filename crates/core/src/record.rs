//! Persistent records
//!
//! These are the row types held by the catalog. Chains and reclamation work
//! items carry owned copies of these records (a stable snapshot of the row
//! at the time the tree was built), never live references into the store.

use crate::types::{
    recycle_root_ident, HashKind, HostSnapshotIdent, HostSnapshotKind, JournalToken, LocatorId,
    RootIdent, StorageIdent, StorageKind, StorageStatus, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// A persisted snapshot storage node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageRecord {
    /// Append order assigned by the catalog; mirrors row insertion order.
    pub row_id: u64,
    /// Stable unique identifier; also the snapshot name inside a QCOW file.
    pub ident: StorageIdent,
    /// Root (connected component) this storage belongs to.
    pub root_id: RootIdent,
    /// Back-pointer to the logical disk snapshot, if still referenced.
    pub locator_id: Option<LocatorId>,
    /// Physical format.
    pub kind: StorageKind,
    /// Lifecycle state.
    pub status: StorageStatus,
    /// Virtual disk size in bytes.
    pub disk_bytes: u64,
    /// Absolute path of the backing image file.
    pub image_path: PathBuf,
    /// Full hash file, when the root's hash policy produces one.
    pub full_hash_path: Option<PathBuf>,
    /// Incremental hash file, when the root's hash policy produces one.
    pub inc_hash_path: Option<PathBuf>,
    /// Start of the described interval (for QCOW, `begin == end`).
    pub begin_timestamp: Timestamp,
    /// End of the described interval.
    pub end_timestamp: Timestamp,
    /// Parent storage in the tree, if any.
    pub parent_ident: Option<StorageIdent>,
    /// Mid-interval dependency on a CDP parent, if any.
    pub parent_timestamp: Option<Timestamp>,
    /// Whether the root QCOW file participates in file-level deduplication.
    pub file_level_deduplication: bool,
}

impl StorageRecord {
    /// Whether the backing file is a CDP stream.
    pub fn is_cdp_file(&self) -> bool {
        self.kind == StorageKind::Cdp
    }

    /// Whether `[begin, end]` of this storage overlaps the given interval.
    pub fn overlaps(&self, begin: Timestamp, end: Timestamp) -> bool {
        !(self.begin_timestamp > end || self.end_timestamp < begin)
    }
}

impl fmt::Display for StorageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "storage:<{}:{}:{}:{}>",
            self.ident,
            self.locator_id
                .map(|l| l.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.image_path.display(),
            self.root_id,
        )
    }
}

/// Payload of a pending journal entry.
///
/// One tagged variant per operation kind; the create kinds are replayed onto
/// the storage tree so readers observe the prospective tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum JournalPayload {
    /// Create a new storage under an (optionally pending) parent.
    NormalCreate {
        /// Identifier the new storage will carry.
        new_ident: StorageIdent,
        /// Declared parent; `None` starts a new tree.
        parent_ident: Option<StorageIdent>,
        /// Mid-interval dependency on a CDP parent.
        parent_timestamp: Option<Timestamp>,
        /// Format of the new storage.
        kind: StorageKind,
        /// Virtual disk size in bytes.
        disk_bytes: u64,
        /// Directory the new image file will be allocated in.
        storage_folder: PathBuf,
    },
    /// Insert a new storage between a QCOW source and its children.
    CreateFromQcow {
        /// Identifier the new storage will carry.
        new_ident: StorageIdent,
        /// Source storage to branch from.
        source_ident: StorageIdent,
    },
    /// Insert a new storage after a run of CDP sources.
    CreateFromCdp {
        /// Identifier the new storage will carry.
        new_ident: StorageIdent,
        /// Source CDP run; the new node attaches under the last entry.
        source_idents: Vec<StorageIdent>,
    },
    /// Request reclamation of the named storages.
    Destroy {
        /// Storages whose locator linkage should be severed.
        idents: Vec<StorageIdent>,
    },
}

impl JournalPayload {
    /// Whether this payload is replayed onto the storage tree.
    pub fn is_create_kind(&self) -> bool {
        !matches!(self, JournalPayload::Destroy { .. })
    }

    /// The identifier a create-kind payload introduces.
    pub fn new_ident(&self) -> Option<StorageIdent> {
        match self {
            JournalPayload::NormalCreate { new_ident, .. }
            | JournalPayload::CreateFromQcow { new_ident, .. }
            | JournalPayload::CreateFromCdp { new_ident, .. } => Some(*new_ident),
            JournalPayload::Destroy { .. } => None,
        }
    }
}

/// A pending tree mutation not yet materialised in the storage table.
///
/// Journals are totally ordered per root by `id`; tree construction replays
/// unconsumed create-kind journals in that order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Append id assigned by the catalog; the per-root total order.
    pub id: u64,
    /// Token handed to the caller that appended the entry.
    pub token: JournalToken,
    /// Root the pending mutation applies to.
    pub root_id: RootIdent,
    /// When the entry was appended.
    pub produced_timestamp: Timestamp,
    /// Set exactly once, when the entry is consumed.
    pub consumed_timestamp: Option<Timestamp>,
    /// The pending operation.
    pub payload: JournalPayload,
    /// Live storages that must be reparented onto the materialised node.
    pub children_idents: Vec<StorageIdent>,
}

impl JournalRecord {
    /// Whether the entry has not been consumed yet.
    pub fn is_unconsumed(&self) -> bool {
        self.consumed_timestamp.is_none()
    }
}

/// A storage root: identity of a connected storage tree plus hash policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootRecord {
    /// Root identifier.
    pub ident: RootIdent,
    /// Hash policy shared by all storages in the tree.
    pub hash_kind: HashKind,
    /// Cleared when the tree empties; the recycle root is never invalidated.
    pub valid: bool,
}

impl RootRecord {
    /// Whether this is the distinguished recycle root.
    pub fn is_recycle_root(&self) -> bool {
        self.ident == recycle_root_ident()
    }
}

impl fmt::Display for RootRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "root:<{}>", self.ident)
    }
}

/// A host snapshot: validity plus the time interval it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSnapshotRecord {
    /// Host snapshot identifier.
    pub ident: HostSnapshotIdent,
    /// Point-in-time or CDP.
    pub kind: HostSnapshotKind,
    /// Cleared when the backup is retired; gates both open and reclamation.
    pub valid: bool,
    /// Start of the described interval.
    pub begin_timestamp: Timestamp,
    /// End of the described interval.
    pub end_timestamp: Timestamp,
}

impl HostSnapshotRecord {
    /// Whether the host snapshot captures continuous data.
    pub fn is_cdp(&self) -> bool {
        self.kind == HostSnapshotKind::Cdp
    }
}

impl fmt::Display for HostSnapshotRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            HostSnapshotKind::Normal => "normal",
            HostSnapshotKind::Cdp => "cdp",
        };
        write!(f, "host_snapshot:<{}:{}>", kind, self.ident)
    }
}

/// A logical disk snapshot beneath a host snapshot.
///
/// The locator is the cross-referencing key between this logical snapshot
/// and the one or more storages that back it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSnapshotRecord {
    /// Row id assigned by the catalog.
    pub id: u64,
    /// Owning host snapshot.
    pub host_snapshot: HostSnapshotIdent,
    /// Locator linking to the backing storages.
    pub locator_id: LocatorId,
    /// Index of the disk within the host.
    pub disk_index: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(begin: Timestamp, end: Timestamp) -> StorageRecord {
        StorageRecord {
            row_id: 0,
            ident: StorageIdent::new(),
            root_id: RootIdent::new(),
            locator_id: None,
            kind: StorageKind::Cdp,
            status: StorageStatus::Storage,
            disk_bytes: 1 << 30,
            image_path: PathBuf::from("/mnt/storage/a.cdp"),
            full_hash_path: None,
            inc_hash_path: None,
            begin_timestamp: begin,
            end_timestamp: end,
            parent_ident: None,
            parent_timestamp: None,
            file_level_deduplication: false,
        }
    }

    #[test]
    fn test_overlap_contained() {
        assert!(record(1000, 1500).overlaps(1200, 1300));
    }

    #[test]
    fn test_overlap_touching_edges() {
        assert!(record(1000, 1500).overlaps(1500, 1700));
        assert!(record(1000, 1500).overlaps(500, 1000));
    }

    #[test]
    fn test_overlap_disjoint() {
        assert!(!record(1000, 1500).overlaps(1501, 1700));
        assert!(!record(1000, 1500).overlaps(0, 999));
    }

    #[test]
    fn test_payload_create_kinds() {
        let normal = JournalPayload::NormalCreate {
            new_ident: StorageIdent::new(),
            parent_ident: None,
            parent_timestamp: None,
            kind: StorageKind::Qcow,
            disk_bytes: 1 << 30,
            storage_folder: PathBuf::from("/mnt/storage"),
        };
        let destroy = JournalPayload::Destroy { idents: vec![] };
        assert!(normal.is_create_kind());
        assert!(normal.new_ident().is_some());
        assert!(!destroy.is_create_kind());
        assert!(destroy.new_ident().is_none());
    }

    #[test]
    fn test_payload_json_roundtrip() {
        let payload = JournalPayload::CreateFromCdp {
            new_ident: StorageIdent::new(),
            source_idents: vec![StorageIdent::new(), StorageIdent::new()],
        };
        let text = serde_json::to_string(&payload).unwrap();
        assert!(text.contains("create_from_cdp"));
        let back: JournalPayload = serde_json::from_str(&text).unwrap();
        assert_eq!(payload, back);
    }

    #[test]
    fn test_recycle_root_record() {
        let recycle = RootRecord {
            ident: recycle_root_ident(),
            hash_kind: HashKind::Unknown,
            valid: true,
        };
        let ordinary = RootRecord {
            ident: RootIdent::new(),
            hash_kind: HashKind::Md4Crc32,
            valid: true,
        };
        assert!(recycle.is_recycle_root());
        assert!(!ordinary.is_recycle_root());
    }
}
