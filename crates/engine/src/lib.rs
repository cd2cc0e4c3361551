//! Engine layer for snaptree
//!
//! This crate implements the two core subsystems of the disk-snapshot
//! storage engine:
//!
//! - **Chain & tree engine**: building storage trees from persisted rows
//!   plus uncommitted journal entries, traversing them into read/write
//!   chains, and the reference manager that records what is being read or
//!   written.
//! - **Reclamation engine**: the per-root collect pass that produces delete
//!   and merge work under the root locker, executes it outside the critical
//!   section, and commits results atomically.
//!
//! Supporting services: the per-root locker, the handle pool, the image
//! service façade, the valid-directory gate, and the background collector.
//!
//! Lock order, to avoid deadlock: root locker first, then the tree locker,
//! then reference-manager internals (always leaves). Work items never take
//! the root locker.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actions;
pub mod chain;
pub mod create;
pub mod daemon;
pub mod handle;
pub mod image;
pub mod locker;
pub mod open;
pub mod reclaim;
pub mod reference;
pub mod service;
pub mod testing;
pub mod tree;
pub mod valid_dir;

pub use actions::StorageActions;
pub use chain::{key_storage_list, AcquiredChain, ChainMode, StorageChain};
pub use create::CreateStorageRequest;
pub use daemon::CollectorDaemon;
pub use handle::{HandleManager, OpenOutcome};
pub use image::{
    CdpSeek, ImageRpcError, ImageService, MergeCdpRequest, MergeQcowTypeBRequest, SnapshotImage,
    CDP_FILE_NO_CONTENT,
};
pub use locker::{RootLockGuard, RootLockerManager};
pub use open::{DiskOpenOutcome, OpenHostSnapshotRequest, OpenStorageRequest};
pub use reclaim::StorageCollector;
pub use reference::ReferenceManager;
pub use service::SnapshotService;
pub use tree::{NodeIndex, StorageTree};
pub use valid_dir::ValidDirectories;
