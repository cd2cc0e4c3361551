//! Snapshot service
//!
//! Long-lived service wiring every engine component together. All services
//! are explicitly constructed and injected; there is no module-level state.
//! Public methods form the service boundary: errors are logged here exactly
//! once and surfaced to the caller.

use crate::actions::StorageActions;
use crate::create::{self, CreateStorageRequest};
use crate::daemon::CollectorDaemon;
use crate::handle::{HandleManager, OpenOutcome};
use crate::image::ImageService;
use crate::locker::RootLockerManager;
use crate::open::{self, DiskOpenOutcome, OpenHostSnapshotRequest, OpenStorageRequest};
use crate::reclaim::StorageCollector;
use crate::reference::ReferenceManager;
use crate::valid_dir::ValidDirectories;
use parking_lot::Mutex;
use snaptree_catalog::Catalog;
use snaptree_core::{
    Error, HashKind, JournalPayload, JournalRecord, Result, RootIdent, RootRecord,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// The disk-snapshot storage service.
pub struct SnapshotService {
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) references: Arc<ReferenceManager>,
    pub(crate) lockers: Arc<RootLockerManager>,
    pub(crate) handles: Arc<HandleManager>,
    pub(crate) directories: Arc<ValidDirectories>,
    pub(crate) actions: Arc<StorageActions>,
    /// Serializes tree construction; always taken after a root locker.
    pub(crate) tree_locker: Arc<Mutex<()>>,
}

impl SnapshotService {
    /// Create a service over a fresh catalog.
    pub fn new(images: Arc<dyn ImageService>) -> Self {
        Self::with_catalog(Arc::new(Catalog::new()), images)
    }

    /// Create a service over an existing catalog, registering a locker for
    /// every valid root (including the recycle root, created on demand).
    pub fn with_catalog(catalog: Arc<Catalog>, images: Arc<dyn ImageService>) -> Self {
        let directories = Arc::new(ValidDirectories::new());
        let lockers = Arc::new(RootLockerManager::new());

        let recycle = catalog
            .transaction(|tx| Ok(tx.recycle_root()))
            .expect("recycle root creation cannot fail");
        lockers.add_locker(recycle.ident);
        for root in catalog.snapshot().valid_roots() {
            lockers.add_locker(root.ident);
        }

        Self {
            catalog,
            references: Arc::new(ReferenceManager::new()),
            lockers,
            handles: Arc::new(HandleManager::new()),
            actions: Arc::new(StorageActions::new(images, directories.clone())),
            directories,
            tree_locker: Arc::new(Mutex::new(())),
        }
    }

    /// The metadata catalog.
    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// The reference manager.
    pub fn references(&self) -> &Arc<ReferenceManager> {
        &self.references
    }

    /// The handle pool.
    pub fn handles(&self) -> &Arc<HandleManager> {
        &self.handles
    }

    /// The valid-directory gate.
    pub fn directories(&self) -> &Arc<ValidDirectories> {
        &self.directories
    }

    /// Log an error once at the service boundary and pass it through.
    fn boundary<T>(operation: &'static str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            error!(%operation, status = e.transport_status(), "{e}");
        }
        result
    }

    /// Register a valid storage directory.
    pub fn add_storage_directory(&self, directory: impl Into<PathBuf>) -> Result<()> {
        Self::boundary("add_storage_directory", self.directories.add_directory(directory))
    }

    /// Deregister a storage directory.
    pub fn remove_storage_directory(&self, directory: impl Into<PathBuf>) {
        self.directories.remove_directory(directory.into());
    }

    /// Start a new independent storage tree.
    pub fn create_root(&self, hash_kind: HashKind) -> Result<RootRecord> {
        let root = self.catalog.transaction(|tx| Ok(tx.insert_root(hash_kind)))?;
        self.lockers.add_locker(root.ident);
        Ok(root)
    }

    /// Append a pending operation for a root.
    pub fn append_journal(
        &self,
        root: RootIdent,
        payload: JournalPayload,
    ) -> Result<JournalRecord> {
        Self::boundary(
            "append_journal",
            self.catalog.transaction(|tx| {
                let record = tx
                    .root(root)
                    .ok_or_else(|| Error::validation(format!("root {root} does not exist")))?;
                if !record.valid {
                    return Err(Error::validation(format!("root {root} is invalid")));
                }
                Ok(tx.append_journal(root, payload))
            }),
        )
    }

    /// Consume a normal-create journal and open a write handle on the new
    /// storage.
    pub fn create_storage(&self, request: CreateStorageRequest) -> Result<OpenOutcome> {
        Self::boundary("create_storage", create::create_storage(self, request))
    }

    /// Open a read chain on one storage.
    pub fn open_storage(&self, request: OpenStorageRequest) -> Result<OpenOutcome> {
        Self::boundary("open_storage", open::open_storage(self, request))
    }

    /// Open read chains for every disk of a host snapshot.
    pub fn open_host_snapshot(
        &self,
        request: OpenHostSnapshotRequest,
    ) -> Result<Vec<DiskOpenOutcome>> {
        Self::boundary("open_host_snapshot", open::open_host_snapshot(self, request))
    }

    /// Close a handle: pop it, close the endpoint, release the chain.
    ///
    /// The reservation is freed whether or not the external close succeeds.
    pub fn close_disk_snapshot(&self, handle: &str) -> Result<()> {
        Self::boundary("close_disk_snapshot", {
            match self.handles.pop(handle) {
                Ok((chain, raw_handle, endpoint)) => {
                    let result = self.actions.close_disk_snapshot(&raw_handle, &endpoint);
                    chain.release();
                    result
                }
                Err(e) => Err(e),
            }
        })
    }

    /// Run one collect pass over a root. Returns whether any work committed.
    pub fn collect_root(&self, root: RootIdent) -> Result<bool> {
        let collector = StorageCollector::new(
            root,
            self.catalog.clone(),
            self.references.clone(),
            self.lockers.clone(),
            self.actions.clone(),
        );
        Self::boundary("collect_root", collector.collect())
    }

    /// Run one collect pass over every eligible root.
    ///
    /// Ordinary roots need a known hash policy; the recycle root is always
    /// eligible (it only produces delete work). A failing root does not
    /// stop the sweep: its error is logged and the remaining roots still
    /// get their pass.
    pub fn collect_all(&self) -> bool {
        let mut any = false;
        for root in self.catalog.snapshot().valid_roots() {
            if !root.is_recycle_root() && root.hash_kind == HashKind::Unknown {
                continue;
            }
            match self.collect_root(root.ident) {
                Ok(did_work) => any = any || did_work,
                Err(_) => {} // already logged at the boundary
            }
        }
        any
    }

    /// Build a background collector sweeping all roots on an interval.
    pub fn collector_daemon(self: &Arc<Self>, interval: Duration) -> CollectorDaemon {
        CollectorDaemon::new(Arc::clone(self), interval)
    }
}
