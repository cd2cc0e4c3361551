//! Core types for the snaptree disk-snapshot storage engine
//!
//! This crate defines the foundational vocabulary shared by the catalog and
//! the engine:
//! - Identifier newtypes (`StorageIdent`, `RootIdent`, `JournalToken`, ...)
//! - Persistent records (`StorageRecord`, `JournalRecord`, `RootRecord`, ...)
//! - The storage status machine and its status partitions
//! - The unified error type used across all public APIs

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod record;
pub mod types;

pub use error::{Error, Result};
pub use record::{
    DiskSnapshotRecord, HostSnapshotRecord, JournalPayload, JournalRecord, RootRecord,
    StorageRecord,
};
pub use types::{
    now_micros, recycle_root_ident, HashKind, HostSnapshotIdent, HostSnapshotKind, JournalToken,
    LocatorId, RootIdent, StorageIdent, StorageKind, StorageStatus, Timestamp,
};
