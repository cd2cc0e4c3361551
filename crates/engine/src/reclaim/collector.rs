//! Collect pass
//!
//! Analysis walks the prospective tree twice: leaf-up for delete work,
//! then root-down (breadth first) for merge work, producing at most one
//! merge per pass. Storages selected for work are marked `Recycling`
//! inside the analysis transaction, so a crash between analysis and commit
//! leaves only markers behind, which the next pass picks up again.
//!
//! Status checks always re-read the transaction state rather than the tree
//! copy: the analysis itself moves storages to `Recycling` while walking.

use crate::actions::StorageActions;
use crate::chain::{ChainMode, StorageChain};
use crate::locker::RootLockerManager;
use crate::reclaim::works::{
    DeleteFileWork, DeleteQcowSnapshotWork, MergeCdpWork, MergeQcowTypeAWork, MergeQcowTypeBWork,
    RecyclingWork, WorkContext,
};
use crate::reference::ReferenceManager;
use crate::tree::{NodeIndex, StorageTree};
use rustc_hash::FxHashMap;
use snaptree_catalog::{Catalog, Tables};
use snaptree_core::{
    Error, HashKind, HostSnapshotRecord, JournalPayload, LocatorId, Result, RootIdent,
    StorageIdent, StorageKind, StorageRecord, StorageStatus,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Pass-scoped cache of host snapshots per locator.
///
/// Host snapshot rows are not mutated during analysis, so answers are
/// stable within the pass; the cache dies with the pass.
#[derive(Default)]
struct LocatorCache {
    cache: FxHashMap<LocatorId, Vec<HostSnapshotRecord>>,
}

impl LocatorCache {
    fn query(&mut self, tables: &Tables, locator: LocatorId) -> &[HostSnapshotRecord] {
        self.cache
            .entry(locator)
            .or_insert_with(|| tables.host_snapshots_by_locator(locator))
    }
}

fn hash_sibling(image: &Path, ident: StorageIdent, suffix: &str) -> PathBuf {
    let mut name = image.as_os_str().to_os_string();
    name.push(format!("_{ident}.{suffix}"));
    PathBuf::from(name)
}

/// Per-root reclamation scanner.
pub struct StorageCollector {
    name: String,
    root_id: RootIdent,
    catalog: Arc<Catalog>,
    references: Arc<ReferenceManager>,
    lockers: Arc<RootLockerManager>,
    actions: Arc<StorageActions>,
}

impl StorageCollector {
    /// Create a collector for one root.
    pub fn new(
        root_id: RootIdent,
        catalog: Arc<Catalog>,
        references: Arc<ReferenceManager>,
        lockers: Arc<RootLockerManager>,
        actions: Arc<StorageActions>,
    ) -> Self {
        Self {
            name: format!("storage_collection:[{root_id}]"),
            root_id,
            catalog,
            references,
            lockers,
            actions,
        }
    }

    /// Run one collect pass. Returns whether any work result committed.
    ///
    /// Safe to re-run: a pass that commits nothing leaves the tree
    /// unchanged apart from `Recycling` markers, which the next pass
    /// resolves.
    pub fn collect(&self) -> Result<bool> {
        let root = self
            .catalog
            .snapshot()
            .root(self.root_id)
            .ok_or_else(|| Error::internal(format!("root {} does not exist", self.root_id)))?;
        if !root.valid {
            return Err(Error::internal(format!("collect on invalid root {root}")));
        }
        if !root.is_recycle_root() && root.hash_kind == HashKind::Unknown {
            return Err(Error::internal(format!(
                "collect on {root} with unknown hash policy"
            )));
        }

        let (mut works, invalidated) = if root.is_recycle_root() {
            (self.analyze_recycle_root()?, false)
        } else {
            self.analyze()?
        };
        if invalidated {
            self.lockers.remove_locker(self.root_id);
        }
        if works.is_empty() {
            return Ok(false);
        }

        // file IO and daemon calls happen outside the locker
        let ctx = WorkContext {
            actions: &self.actions,
            hash_kind: root.hash_kind,
        };
        for work in works.iter_mut() {
            debug!(root = %self.root_id, "executing {work}");
            work.work(&ctx);
        }

        // one transaction commits every work result
        let _guard = self.lockers.acquire(self.root_id, &self.name)?;
        self.catalog.transaction(|tx| {
            let mut any = false;
            for work in works.iter_mut() {
                if work.save_work_result(tx)? {
                    any = true;
                }
            }
            Ok(any)
        })
    }

    /// The recycle root holds detached nodes only: delete whatever is not
    /// referenced, no tree needed.
    fn analyze_recycle_root(&self) -> Result<Vec<Box<dyn RecyclingWork>>> {
        let _guard = self.lockers.acquire(self.root_id, &self.name)?;
        self.catalog.transaction(|tx| {
            let mut candidates = Vec::new();
            for storage in tx.storages_for_root(self.root_id) {
                if self.references.is_storage_using(storage.ident) {
                    continue;
                }
                if storage.status != StorageStatus::Recycling {
                    tx.set_storage_status(storage.ident, StorageStatus::Recycling)?;
                }
                candidates.push(tx.storage_required(storage.ident)?);
            }
            Ok(create_delete_works(tx, candidates))
        })
    }

    fn analyze(&self) -> Result<(Vec<Box<dyn RecyclingWork>>, bool)> {
        let _guard = self.lockers.acquire(self.root_id, &self.name)?;
        let mut invalidated = false;
        let works = self.catalog.transaction(|tx| {
            self.consume_destroy_journals(tx)?;

            let tree = StorageTree::build(
                tx.storages_for_root(self.root_id),
                &tx.unconsumed_create_journals(self.root_id),
            )?;
            if tree.is_empty() {
                tx.set_root_invalid(self.root_id)?;
                invalidated = true;
                return Ok(Vec::new());
            }

            let mut cache = LocatorCache::default();
            let deletes = self.fetch_and_mark_deletes(tx, &tree, &mut cache)?;
            if !deletes.is_empty() {
                return Ok(create_delete_works(tx, deletes));
            }
            self.analyze_merge(tx, &tree, &mut cache)
        })?;
        Ok((works, invalidated))
    }

    /// A destroy journal severs the locator linkage of the named storages,
    /// making them reclaimable once their references drain.
    fn consume_destroy_journals(&self, tx: &mut Tables) -> Result<()> {
        for journal in tx.unconsumed_destroy_journals(self.root_id) {
            tx.consume_journal(journal.token)?;
            let JournalPayload::Destroy { idents } = journal.payload else {
                continue;
            };
            for ident in idents {
                if tx.storage(ident).is_some() {
                    debug!(%ident, "destroy journal severs locator");
                    tx.clear_storage_locator(ident)?;
                }
            }
        }
        Ok(())
    }

    /// Leaf-up delete analysis: walk from every leaf towards the root,
    /// marking deletable storages `Recycling` until one is not deletable.
    fn fetch_and_mark_deletes(
        &self,
        tx: &mut Tables,
        tree: &StorageTree,
        cache: &mut LocatorCache,
    ) -> Result<Vec<StorageRecord>> {
        let mut candidates = Vec::new();
        for leaf in tree.leaves() {
            for node in tree.dfs_to_root(leaf) {
                match self.deletable_storage(tx, tree, node, cache)? {
                    Some(storage) => {
                        set_recycling(tx, storage.ident)?;
                        candidates.push(tx.storage_required(storage.ident)?);
                    }
                    None => break,
                }
            }
        }
        Ok(candidates)
    }

    /// Whether the node's storage can move straight to delete work.
    fn deletable_storage(
        &self,
        tx: &Tables,
        tree: &StorageTree,
        node: NodeIndex,
        cache: &mut LocatorCache,
    ) -> Result<Option<StorageRecord>> {
        if tree.is_pending(node) {
            return Ok(None);
        }
        let storage = tx.storage_required(tree.ident(node))?;
        if !StorageStatus::CAN_DELETE.contains(&storage.status) {
            return Ok(None);
        }
        if !self.all_locators_invalid(tx, tree, node, &storage, cache) {
            return Ok(None);
        }
        if self.references.is_storage_using(storage.ident) {
            return Ok(None);
        }
        if !storage.is_cdp_file() && self.references.is_storage_writing(&storage.image_path) {
            return Ok(None);
        }
        for child in tree.children(node) {
            if tree.is_pending(*child) {
                return Ok(None);
            }
            let child_storage = tx.storage_required(tree.ident(*child))?;
            if !child_storage.status.is_recycle() {
                return Ok(None);
            }
        }
        Ok(Some(storage))
    }

    /// A storage is still referenced when any valid host snapshot reaches
    /// it through its locator and overlaps its interval.
    ///
    /// CDP special case: a CDP host snapshot whose interval does not
    /// overlap still counts as a reference unless a child carries the same
    /// locator (a disk with almost no writes can leave such storages
    /// behind).
    fn all_locators_invalid(
        &self,
        tx: &Tables,
        tree: &StorageTree,
        node: NodeIndex,
        storage: &StorageRecord,
        cache: &mut LocatorCache,
    ) -> bool {
        let Some(locator) = storage.locator_id else {
            return true;
        };
        for host in cache.query(tx, locator) {
            if !host.valid {
                continue;
            }
            if storage.overlaps(host.begin_timestamp, host.end_timestamp) {
                return false;
            }
            if host.is_cdp() {
                let child_shares_locator = tree.children(node).iter().any(|child| {
                    tree.storage(*child)
                        .map(|c| c.locator_id == storage.locator_id)
                        .unwrap_or(false)
                });
                if !child_shares_locator {
                    return false;
                }
            }
        }
        true
    }

    fn can_merge(
        &self,
        tx: &Tables,
        tree: &StorageTree,
        node: NodeIndex,
        storage: &StorageRecord,
        parent: Option<&StorageRecord>,
        cache: &mut LocatorCache,
    ) -> bool {
        if !StorageStatus::CAN_MERGE.contains(&storage.status) {
            return false;
        }
        if let Some(parent) = parent {
            if !parent.is_cdp_file() && parent.status == StorageStatus::Recycling {
                return false;
            }
        }
        self.all_locators_invalid(tx, tree, node, storage, cache)
    }

    /// Root-down merge analysis. Emits at most one merge work per pass.
    fn analyze_merge(
        &self,
        tx: &mut Tables,
        tree: &StorageTree,
        cache: &mut LocatorCache,
    ) -> Result<Vec<Box<dyn RecyclingWork>>> {
        for node in tree.bfs() {
            if tree.is_root(node) && tree.children(node).len() > 1 {
                continue; // merging would split the tree in two
            }
            if tree.is_leaf(node) {
                continue; // leaves go through the delete path
            }
            if tree.is_pending(node) || tree.has_pending_child(node) {
                continue; // journal-only structure is still in flux
            }
            let storage = tx.storage_required(tree.ident(node))?;
            if storage.file_level_deduplication {
                continue;
            }

            let parent = match tree.parent(node) {
                None => None,
                Some(p) if tree.is_pending(p) => continue,
                Some(p) => Some(tx.storage_required(tree.ident(p))?),
            };
            if !self.can_merge(tx, tree, node, &storage, parent.as_ref(), cache) {
                continue;
            }

            if storage.is_cdp_file() {
                let merged = self.fetch_and_mark_cdp_run(tx, tree, node, cache)?;
                if !merged.is_empty() {
                    let parent = parent.expect("cdp storages always have a parent");
                    return Ok(vec![self.build_merge_cdp_work(tx, tree, parent, merged)?]);
                }
            } else if children_in_other_file(tree, node, &storage) {
                if tree.is_root(node) {
                    continue; // no parent file to merge into
                }
                let parent = parent.expect("non-root node has a parent");
                if parent.is_cdp_file() {
                    continue;
                }
                if parent.disk_bytes != storage.disk_bytes {
                    continue;
                }
                if parent.status != StorageStatus::Storage {
                    continue;
                }
                if multi_snapshot_in_qcow(tree, node, &storage) {
                    continue; // other snapshots still live in this file
                }
                if self.references.is_storage_writing(&parent.image_path) {
                    continue;
                }
                set_recycling(tx, storage.ident)?;
                return Ok(vec![self.build_merge_type_b_work(tx, tree, node, parent, storage)?]);
            } else if self.references.is_storage_writing(&storage.image_path) {
                continue;
            } else {
                set_recycling(tx, storage.ident)?;
                let children = tree.children_storages(node);
                let merge_storage = tx.storage_required(storage.ident)?;
                return Ok(vec![Box::new(MergeQcowTypeAWork::new(
                    parent,
                    merge_storage,
                    children,
                ))]);
            }
        }
        Ok(Vec::new())
    }

    /// Walk consecutive CDP descendants from `node`, marking each
    /// `Recycling` while its parent allows merging, no child depends on a
    /// mid-interval timestamp, and a QCOW parent's file is not being
    /// written.
    fn fetch_and_mark_cdp_run(
        &self,
        tx: &mut Tables,
        tree: &StorageTree,
        node: NodeIndex,
        cache: &mut LocatorCache,
    ) -> Result<Vec<StorageRecord>> {
        let mut merged = Vec::new();
        let mut current = node;
        loop {
            if tree.has_pending_child(current) {
                break;
            }
            let storage = tx.storage_required(tree.ident(current))?;
            debug_assert!(storage.is_cdp_file());

            let parent_idx = match tree.parent(current) {
                Some(p) if !tree.is_pending(p) => p,
                _ => break,
            };
            let parent = tx.storage_required(tree.ident(parent_idx))?;
            if !StorageStatus::CAN_MERGE.contains(&parent.status) {
                break; // parent is still being produced
            }
            if tree.children_storages(current)
                .iter()
                .any(|c| c.parent_timestamp.is_some())
            {
                break; // a child depends on a mid-interval instant
            }
            if !parent.is_cdp_file() && self.references.is_storage_writing(&parent.image_path) {
                break;
            }

            set_recycling(tx, storage.ident)?;
            merged.push(tx.storage_required(storage.ident)?);

            // a recyclable CDP run continues through a single CDP child
            // that is not a leaf (leaves go through the delete path)
            let children = tree.children(current);
            if children.len() != 1 {
                break;
            }
            let child = children[0];
            if tree.is_pending(child) || tree.is_leaf(child) {
                break;
            }
            let child_storage = tx.storage_required(tree.ident(child))?;
            if !child_storage.is_cdp_file() {
                break;
            }
            debug_assert_eq!(child_storage.locator_id, storage.locator_id);
            if !self.can_merge(tx, tree, child, &child_storage, None, cache) {
                break;
            }
            current = child;
        }
        Ok(merged)
    }

    fn build_merge_cdp_work(
        &self,
        tx: &mut Tables,
        tree: &StorageTree,
        parent: StorageRecord,
        merged: Vec<StorageRecord>,
    ) -> Result<Box<dyn RecyclingWork>> {
        let last = merged.last().expect("non-empty run");
        let last_node = tree.get(last.ident).expect("run nodes are in the tree");
        let children = tree.children_storages(last_node);

        let ident = StorageIdent::new();
        let image_path = if parent.is_cdp_file() {
            // a cdp parent cannot absorb the merged data: allocate a new
            // qcow next to it
            let folder = parent.image_path.parent().ok_or_else(|| {
                Error::internal(format!("{parent} has no parent directory"))
            })?;
            folder.join(format!("{ident}.qcow"))
        } else {
            parent.image_path.clone()
        };
        let new_storage = tx.insert_storage(StorageRecord {
            row_id: 0,
            ident,
            root_id: parent.root_id,
            locator_id: None,
            kind: StorageKind::Qcow,
            status: StorageStatus::Creating,
            disk_bytes: parent.disk_bytes,
            inc_hash_path: Some(hash_sibling(&image_path, ident, "hash")),
            full_hash_path: None,
            image_path,
            begin_timestamp: last.end_timestamp,
            end_timestamp: last.end_timestamp,
            parent_ident: Some(parent.ident),
            parent_timestamp: None,
            file_level_deduplication: false,
        })?;

        let work_name = format!("merge_cdp_work:<{}>", new_storage.ident);
        let chain = self.merge_chain(
            tree,
            &parent,
            &new_storage,
            ChainMode::ReadWrite,
            &work_name,
        )?;
        Ok(Box::new(MergeCdpWork::new(
            parent,
            merged,
            children,
            new_storage,
            chain,
        )))
    }

    fn build_merge_type_b_work(
        &self,
        tx: &mut Tables,
        tree: &StorageTree,
        node: NodeIndex,
        parent: StorageRecord,
        merge_storage: StorageRecord,
    ) -> Result<Box<dyn RecyclingWork>> {
        debug_assert_eq!(tx.live_storages_on_path(&merge_storage.image_path).len(), 1);
        let children = tree.children_storages(node);

        let ident = StorageIdent::new();
        let image_path = parent.image_path.clone();
        let (full_hash_path, inc_hash_path) = match tx.root(parent.root_id) {
            Some(root) if root.hash_kind == HashKind::None => (None, None),
            _ => {
                if merge_storage.full_hash_path.is_some() {
                    (Some(hash_sibling(&image_path, ident, "full_hash")), None)
                } else {
                    (None, Some(hash_sibling(&image_path, ident, "hash")))
                }
            }
        };
        let new_storage = tx.insert_storage(StorageRecord {
            row_id: 0,
            ident,
            root_id: parent.root_id,
            locator_id: None,
            kind: StorageKind::Qcow,
            status: StorageStatus::Creating,
            disk_bytes: parent.disk_bytes,
            image_path,
            full_hash_path,
            inc_hash_path,
            begin_timestamp: merge_storage.end_timestamp,
            end_timestamp: merge_storage.end_timestamp,
            parent_ident: Some(parent.ident),
            parent_timestamp: None,
            file_level_deduplication: false,
        })?;

        let work_name = format!("merge_qcow_snapshot_type_b_work:<{}>", merge_storage.ident);
        let chain = self.merge_chain(tree, &parent, &new_storage, ChainMode::Write, &work_name)?;
        let merge_storage = tx.storage_required(merge_storage.ident)?;
        Ok(Box::new(MergeQcowTypeBWork::new(
            parent,
            merge_storage,
            children,
            new_storage,
            chain,
        )))
    }

    /// Chain from the root down to `parent` plus the pre-created merge
    /// target as tail.
    fn merge_chain(
        &self,
        tree: &StorageTree,
        parent: &StorageRecord,
        new_storage: &StorageRecord,
        mode: ChainMode,
        work_name: &str,
    ) -> Result<crate::chain::AcquiredChain> {
        let parent_idx = tree
            .get(parent.ident)
            .ok_or_else(|| Error::internal(format!("{parent} not in tree")))?;
        let mut storages = tree.real_chain_to_root(parent_idx);
        storages.push(new_storage.clone());
        StorageChain::from_storages(mode, work_name, None, storages)
            .acquire(self.references.clone())
    }
}

fn set_recycling(tx: &mut Tables, ident: StorageIdent) -> Result<()> {
    if tx.storage_required(ident)?.status == StorageStatus::Recycling {
        return Ok(());
    }
    tx.set_storage_status(ident, StorageStatus::Recycling)
}

/// Whether any child lives in a different image file than the node.
fn children_in_other_file(tree: &StorageTree, node: NodeIndex, storage: &StorageRecord) -> bool {
    tree.children_storages(node)
        .iter()
        .any(|c| c.image_path != storage.image_path)
}

/// Whether the node shares its QCOW file with its parent or any child.
fn multi_snapshot_in_qcow(tree: &StorageTree, node: NodeIndex, storage: &StorageRecord) -> bool {
    if let Some(parent) = tree.parent(node).and_then(|p| tree.storage(p)) {
        if parent.image_path == storage.image_path {
            return true;
        }
    }
    tree.children_storages(node)
        .iter()
        .any(|c| c.image_path == storage.image_path)
}

/// Build delete works for the marked candidates, dropping duplicates.
///
/// A QCOW file whose snapshots are all condemned gets one delete-file
/// work; a file with other live snapshots gets per-snapshot deletes.
fn create_delete_works(tx: &Tables, candidates: Vec<StorageRecord>) -> Vec<Box<dyn RecyclingWork>> {
    let mut works: Vec<Box<dyn RecyclingWork>> = Vec::new();
    for storage in candidates {
        let work: Box<dyn RecyclingWork> = if storage.is_cdp_file() {
            Box::new(DeleteFileWork::new(storage, tx))
        } else if tx.live_snapshot_count_on_path(&storage.image_path) > 0 {
            Box::new(DeleteQcowSnapshotWork::new(storage))
        } else {
            Box::new(DeleteFileWork::new(storage, tx))
        };
        if !works.iter().any(|w| w.worker_ident() == work.worker_ident()) {
            works.push(work);
        }
    }
    works
}
