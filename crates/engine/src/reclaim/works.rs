//! Reclamation work items
//!
//! Each work item is produced inside the analysis critical section,
//! executed outside it, and committed back inside it:
//!
//! - `work()` performs file IO and daemon calls. It must not take the root
//!   locker and must not fail: failures are recorded in `work_successful`.
//! - `save_work_result()` updates the catalog. It runs inside the locker
//!   and may only fail on store errors, which abort the commit.
//!
//! Work items compare by `worker_ident` so duplicate work is dropped: when
//! one QCOW file holds several condemned snapshots, a single delete-file
//! work replaces the per-snapshot deletes.

use crate::actions::StorageActions;
use crate::chain::AcquiredChain;
use snaptree_catalog::Tables;
use snaptree_core::{HashKind, Result, StorageIdent, StorageRecord, StorageStatus};
use std::fmt;
use tracing::warn;

/// Everything a work item may touch outside the locker.
pub(crate) struct WorkContext<'a> {
    /// Gate-checked file and daemon operations.
    pub actions: &'a StorageActions,
    /// Hash policy of the root being collected.
    pub hash_kind: HashKind,
}

/// One unit of reclamation work.
pub(crate) trait RecyclingWork: fmt::Display {
    /// Identity used to drop duplicate work items.
    fn worker_ident(&self) -> String;

    /// Perform the file IO / daemon calls. Never fails; the outcome is
    /// recorded internally.
    fn work(&mut self, ctx: &WorkContext<'_>);

    /// Commit the outcome to the catalog. Runs under the root locker.
    /// Returns whether this work changed anything.
    fn save_work_result(&mut self, tables: &mut Tables) -> Result<bool>;
}

// =============================================================================
// Delete work
// =============================================================================

/// Delete a whole image file (QCOW or CDP) and its auxiliary files.
pub(crate) struct DeleteFileWork {
    storage: StorageRecord,
    member_idents: Vec<StorageIdent>,
    work_successful: bool,
}

impl DeleteFileWork {
    /// `storage` must already be `Recycling`; every non-`Recycled` storage
    /// in the same file is captured and recycled together on success.
    pub fn new(storage: StorageRecord, tables: &Tables) -> Self {
        debug_assert_eq!(storage.status, StorageStatus::Recycling);
        let members = tables.live_storages_on_path(&storage.image_path);
        debug_assert!(members
            .iter()
            .all(|m| m.status == StorageStatus::Recycling));
        Self {
            member_idents: members.iter().map(|m| m.ident).collect(),
            storage,
            work_successful: false,
        }
    }
}

impl fmt::Display for DeleteFileWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delete_file_work:<{}>", self.storage.image_path.display())
    }
}

impl RecyclingWork for DeleteFileWork {
    fn worker_ident(&self) -> String {
        format!("{}:delete_file_work", self.storage.image_path.display())
    }

    fn work(&mut self, ctx: &WorkContext<'_>) {
        let result = if self.storage.is_cdp_file() {
            ctx.actions.remove_cdp_file(&self.storage.image_path)
        } else {
            ctx.actions.remove_qcow_file(&self.storage.image_path)
        };
        match result {
            Ok(()) => self.work_successful = true,
            Err(e) => warn!("{self} failed\n{e}"),
        }
    }

    fn save_work_result(&mut self, tables: &mut Tables) -> Result<bool> {
        if self.work_successful {
            for ident in &self.member_idents {
                tables.set_storage_status(*ident, StorageStatus::Recycled)?;
            }
        }
        Ok(self.work_successful)
    }
}

/// Delete one snapshot inside a QCOW file.
///
/// Related data (hash files) must already be merged or known unneeded.
pub(crate) struct DeleteQcowSnapshotWork {
    storage: StorageRecord,
    work_successful: bool,
}

impl DeleteQcowSnapshotWork {
    /// `storage` must already be `Recycling` and live in a QCOW file.
    pub fn new(storage: StorageRecord) -> Self {
        debug_assert_eq!(storage.status, StorageStatus::Recycling);
        debug_assert!(!storage.is_cdp_file());
        Self {
            storage,
            work_successful: false,
        }
    }
}

impl fmt::Display for DeleteQcowSnapshotWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "delete_qcow_snapshot_work:<{}:{}>",
            self.storage.image_path.display(),
            self.storage.ident
        )
    }
}

impl RecyclingWork for DeleteQcowSnapshotWork {
    fn worker_ident(&self) -> String {
        format!(
            "{}:{}:delete_qcow_snapshot_work",
            self.storage.ident,
            self.storage.image_path.display()
        )
    }

    fn work(&mut self, ctx: &WorkContext<'_>) {
        let snapshot_name = self.storage.ident.to_string();
        match ctx
            .actions
            .delete_qcow_snapshot(&self.storage.image_path, &snapshot_name)
        {
            Ok(()) => self.work_successful = true,
            Err(e) => warn!("{self} failed\n{e}"),
        }
    }

    fn save_work_result(&mut self, tables: &mut Tables) -> Result<bool> {
        if self.work_successful {
            tables.set_storage_status(self.storage.ident, StorageStatus::Recycled)?;
        }
        Ok(self.work_successful)
    }
}

// =============================================================================
// Merge work
// =============================================================================

fn reparent(
    tables: &mut Tables,
    children: &[StorageRecord],
    new_parent: Option<StorageIdent>,
) -> Result<()> {
    for child in children {
        tables.set_storage_parent(child.ident, new_parent)?;
    }
    Ok(())
}

fn mark_exception(tables: &mut Tables, ident: StorageIdent) -> Result<()> {
    let current = tables.storage_required(ident)?;
    if current.status != StorageStatus::Exception {
        tables.set_storage_status(ident, StorageStatus::Exception)?;
    }
    Ok(())
}

/// Fold a run of CDP storages into a freshly created QCOW snapshot.
pub(crate) struct MergeCdpWork {
    parent: StorageRecord,
    merged: Vec<StorageRecord>,
    children: Vec<StorageRecord>,
    new_storage: StorageRecord,
    rw_chain: Option<AcquiredChain>,
    work_successful: bool,
}

impl MergeCdpWork {
    /// `new_storage` is the pre-created merge target (`Creating`);
    /// `children` are the children of the last merged node, which adopt
    /// the new node on success.
    pub fn new(
        parent: StorageRecord,
        merged: Vec<StorageRecord>,
        children: Vec<StorageRecord>,
        new_storage: StorageRecord,
        rw_chain: AcquiredChain,
    ) -> Self {
        debug_assert!(!merged.is_empty());
        Self {
            parent,
            merged,
            children,
            new_storage,
            rw_chain: Some(rw_chain),
            work_successful: false,
        }
    }
}

impl fmt::Display for MergeCdpWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "merge_cdp_work:<{}>", self.new_storage)
    }
}

impl RecyclingWork for MergeCdpWork {
    fn worker_ident(&self) -> String {
        format!("{}:merge_cdp_work", self.new_storage.ident)
    }

    fn work(&mut self, ctx: &WorkContext<'_>) {
        let chain = self.rw_chain.take().expect("chain acquired at analysis");
        let result = ctx
            .actions
            .merge_cdp_to_qcow(ctx.hash_kind, &chain, &self.merged);
        chain.release();
        match result {
            Ok(()) => self.work_successful = true,
            Err(e) => warn!("{self} failed\n{e}\n  parent: {}", self.parent),
        }
    }

    fn save_work_result(&mut self, tables: &mut Tables) -> Result<bool> {
        if self.work_successful {
            tables.set_storage_status(self.new_storage.ident, StorageStatus::Storage)?;
            reparent(tables, &self.children, Some(self.new_storage.ident))?;
            for cdp in &self.merged {
                debug_assert!(cdp.is_cdp_file());
                tables.clear_storage_locator(cdp.ident)?;
            }
        } else {
            mark_exception(tables, self.new_storage.ident)?;
        }
        Ok(self.work_successful)
    }
}

/// In-file QCOW merge: the parent absorbs the merged snapshot's role, no
/// data moves. Also covers merging a root node away, in which case the
/// detached node moves into the recycle root so the tree never splits.
pub(crate) struct MergeQcowTypeAWork {
    parent: Option<StorageRecord>,
    merge_storage: StorageRecord,
    children: Vec<StorageRecord>,
    work_successful: bool,
}

impl MergeQcowTypeAWork {
    /// A merged root node (`parent == None`) must have exactly one child,
    /// which becomes the new tree root on success.
    pub fn new(
        parent: Option<StorageRecord>,
        merge_storage: StorageRecord,
        children: Vec<StorageRecord>,
    ) -> Self {
        if parent.is_none() {
            debug_assert_eq!(children.len(), 1);
            debug_assert!(merge_storage.parent_ident.is_none());
        }
        Self {
            parent,
            merge_storage,
            children,
            work_successful: false,
        }
    }
}

impl fmt::Display for MergeQcowTypeAWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "merge_qcow_snapshot_type_a_work:<{}>", self.merge_storage)
    }
}

impl RecyclingWork for MergeQcowTypeAWork {
    fn worker_ident(&self) -> String {
        format!("{}:merge_qcow_snapshot_type_a_work", self.merge_storage.ident)
    }

    fn work(&mut self, ctx: &WorkContext<'_>) {
        match ctx.actions.merge_qcow_snapshot_type_a(
            ctx.hash_kind,
            &self.children,
            &self.merge_storage,
        ) {
            Ok(()) => self.work_successful = true,
            Err(e) => warn!("{self} failed\n{e}"),
        }
    }

    fn save_work_result(&mut self, tables: &mut Tables) -> Result<bool> {
        if self.work_successful {
            if self.parent.is_none() {
                // keep the tree connected: the detached root moves into
                // the recycle root
                let recycle = tables.recycle_root();
                tables.set_storage_root(self.merge_storage.ident, recycle.ident)?;
            }
            reparent(
                tables,
                &self.children,
                self.parent.as_ref().map(|p| p.ident),
            )?;
            tables.clear_storage_locator(self.merge_storage.ident)?;
        }
        Ok(self.work_successful)
    }
}

/// Cross-file QCOW merge: the merged snapshot's data moves into a new
/// snapshot pre-created in the parent's file.
pub(crate) struct MergeQcowTypeBWork {
    parent: StorageRecord,
    merge_storage: StorageRecord,
    children: Vec<StorageRecord>,
    new_storage: StorageRecord,
    write_chain: Option<AcquiredChain>,
    work_successful: bool,
}

impl MergeQcowTypeBWork {
    /// `new_storage` is the pre-created merge target in the parent's file.
    pub fn new(
        parent: StorageRecord,
        merge_storage: StorageRecord,
        children: Vec<StorageRecord>,
        new_storage: StorageRecord,
        write_chain: AcquiredChain,
    ) -> Self {
        debug_assert!(!parent.is_cdp_file());
        debug_assert!(!children.is_empty());
        Self {
            parent,
            merge_storage,
            children,
            new_storage,
            write_chain: Some(write_chain),
            work_successful: false,
        }
    }
}

impl fmt::Display for MergeQcowTypeBWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "merge_qcow_snapshot_type_b_work:<{}>", self.merge_storage)
    }
}

impl RecyclingWork for MergeQcowTypeBWork {
    fn worker_ident(&self) -> String {
        format!("{}:merge_qcow_snapshot_type_b_work", self.merge_storage.ident)
    }

    fn work(&mut self, ctx: &WorkContext<'_>) {
        let chain = self.write_chain.take().expect("chain acquired at analysis");
        let result =
            ctx.actions
                .merge_qcow_snapshot_type_b(ctx.hash_kind, &chain, &self.merge_storage);
        chain.release();
        match result {
            Ok(()) => self.work_successful = true,
            Err(e) => warn!("{self} failed\n{e}\n  parent: {}", self.parent),
        }
    }

    fn save_work_result(&mut self, tables: &mut Tables) -> Result<bool> {
        if self.work_successful {
            tables.set_storage_status(self.new_storage.ident, StorageStatus::Storage)?;
            reparent(tables, &self.children, Some(self.new_storage.ident))?;
            tables.clear_storage_locator(self.merge_storage.ident)?;
        } else {
            mark_exception(tables, self.new_storage.ident)?;
        }
        Ok(self.work_successful)
    }
}
