//! Identifier and enumeration types
//!
//! This module defines the identifier newtypes and the storage status
//! machine:
//! - `StorageIdent` / `RootIdent` / `JournalToken` / `HostSnapshotIdent`:
//!   UUID-backed identifiers
//! - `StorageKind`: QCOW vs CDP storage
//! - `StorageStatus`: lifecycle state plus the status partitions used by the
//!   chain builder and the reclamation engine
//! - `Timestamp`: microseconds since the Unix epoch

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Microseconds since the Unix epoch.
///
/// QCOW storages describe a single instant (`begin == end`); CDP storages
/// describe a half-open capture interval.
pub type Timestamp = u64;

/// Current wall-clock time in microseconds.
pub fn now_micros() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

macro_rules! uuid_ident {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new random identifier (UUID v4).
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse from a string representation (with or without hyphens).
            pub fn from_string(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
            }

            /// Wrap an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// The underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.simple())
            }
        }
    };
}

uuid_ident! {
    /// Stable unique identifier of a snapshot storage.
    ///
    /// Doubles as the snapshot name inside a QCOW file when several
    /// snapshots share one physical image.
    StorageIdent
}

uuid_ident! {
    /// Identifier of a storage root: one connected component of the
    /// snapshot storage tree.
    RootIdent
}

uuid_ident! {
    /// Token of a journal entry, handed out to the caller that requested
    /// the pending operation.
    JournalToken
}

uuid_ident! {
    /// Identifier of a host snapshot.
    HostSnapshotIdent
}

/// Cross-reference key between a logical disk snapshot and the storages
/// backing it. The unit of liveness with respect to host snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocatorId(pub u64);

impl fmt::Display for LocatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "locator:{}", self.0)
    }
}

static RECYCLE_ROOT: Lazy<RootIdent> = Lazy::new(|| {
    RootIdent::from_uuid(
        Uuid::parse_str("00000000-0000-0000-0000-000000000001").expect("recycle root uuid"),
    )
});

/// The distinguished root that absorbs detached nodes during root merges.
///
/// It is never invalidated and its storages are reclaimed without building
/// a tree (detached nodes have no common ancestor).
pub fn recycle_root_ident() -> RootIdent {
    *RECYCLE_ROOT
}

/// Physical format of a snapshot storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageKind {
    /// Copy-on-write image snapshot; several snapshots may share one file.
    Qcow,
    /// Continuous-data-protection byte stream; always one file per storage.
    Cdp,
}

impl StorageKind {
    /// File-name extension used when allocating a new image file.
    pub fn extension(&self) -> &'static str {
        match self {
            StorageKind::Qcow => "qcow",
            StorageKind::Cdp => "cdp",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Qcow => write!(f, "qcow"),
            StorageKind::Cdp => write!(f, "cdp"),
        }
    }
}

/// Lifecycle state of a snapshot storage.
///
/// Transitions form a DAG:
/// `Creating → DataWriting → Hashing → Storage`; any non-`Recycled` state
/// may move to `Recycling`; `Recycling → Recycled` is terminal; `Exception`
/// is reachable from merge failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageStatus {
    /// Row exists, image file is being created.
    Creating,
    /// Image data is streaming in.
    DataWriting,
    /// Data complete, hash files are being produced.
    Hashing,
    /// Fully ingested and readable.
    Storage,
    /// A merge involving this storage failed; data kept for inspection.
    Exception,
    /// Selected by the reclamation engine; work is pending or in flight.
    Recycling,
    /// Terminal: backing data has been deleted or merged away.
    Recycled,
}

impl StorageStatus {
    /// States in which the storage's file is still being mutated by ingest.
    ///
    /// A `Hashing` tail counts as a writer: a consumer needs the prior file
    /// while its successor is still mutating.
    pub const WRITING: &'static [StorageStatus] = &[
        StorageStatus::Creating,
        StorageStatus::DataWriting,
        StorageStatus::Hashing,
    ];

    /// States from which delete work may be produced.
    pub const CAN_DELETE: &'static [StorageStatus] = &[
        StorageStatus::Hashing,
        StorageStatus::Storage,
        StorageStatus::Exception,
        StorageStatus::Recycling,
    ];

    /// States from which merge work may be produced.
    pub const CAN_MERGE: &'static [StorageStatus] = &[
        StorageStatus::Storage,
        StorageStatus::Exception,
        StorageStatus::Recycling,
    ];

    /// States that must not appear in a read chain.
    pub const NOT_READABLE: &'static [StorageStatus] =
        &[StorageStatus::Creating, StorageStatus::Recycled];

    /// States owned by the reclamation engine.
    pub const RECYCLE: &'static [StorageStatus] =
        &[StorageStatus::Recycling, StorageStatus::Recycled];

    /// Whether ingest is still mutating the storage's file.
    pub fn is_writing(&self) -> bool {
        Self::WRITING.contains(self)
    }

    /// Whether the storage is in a reclamation-owned state.
    pub fn is_recycle(&self) -> bool {
        Self::RECYCLE.contains(self)
    }

    /// Validate a status transition against the lifecycle DAG.
    ///
    /// `false` means the move would corrupt the lifecycle (e.g. leaving
    /// `Recycled`, or jumping from `Storage` to anything but reclamation).
    pub fn can_transition_to(&self, next: StorageStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            StorageStatus::Storage | StorageStatus::Exception => {
                matches!(next, StorageStatus::Recycling | StorageStatus::Recycled)
            }
            StorageStatus::Recycling => next == StorageStatus::Recycled,
            StorageStatus::Recycled => false,
            _ => next != StorageStatus::Recycled,
        }
    }
}

impl fmt::Display for StorageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageStatus::Creating => "creating",
            StorageStatus::DataWriting => "data_writing",
            StorageStatus::Hashing => "hashing",
            StorageStatus::Storage => "storage",
            StorageStatus::Exception => "exception",
            StorageStatus::Recycling => "recycling",
            StorageStatus::Recycled => "recycled",
        };
        write!(f, "{}", s)
    }
}

/// Hash policy of a storage root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashKind {
    /// Policy not yet decided; such roots are skipped by reclamation.
    Unknown,
    /// No hash data is produced for this tree.
    None,
    /// MD4 + CRC32 hash files accompany each snapshot.
    Md4Crc32,
}

/// Kind of a host snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostSnapshotKind {
    /// Point-in-time backup.
    Normal,
    /// Continuous-data-protection backup covering an interval.
    Cdp,
}
