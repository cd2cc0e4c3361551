//! Table set and typed accessors
//!
//! `Tables` holds every metadata table. Query methods take `&self` and
//! return owned record copies (the engine never holds references into the
//! store); mutation methods take `&mut self` and are only reachable inside
//! [`crate::Catalog::transaction`].

use rustc_hash::FxHashMap;
use snaptree_core::{
    now_micros, recycle_root_ident, DiskSnapshotRecord, Error, HashKind, HostSnapshotIdent,
    HostSnapshotRecord, JournalPayload, JournalRecord, JournalToken, LocatorId, Result,
    RootIdent, RootRecord, StorageIdent, StorageRecord, StorageStatus,
};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// All metadata tables.
///
/// Cloning a `Tables` is the unit of transactional isolation: a clone is a
/// stable snapshot that can be mutated and either published or discarded.
#[derive(Debug, Clone, Default)]
pub struct Tables {
    storages: BTreeMap<StorageIdent, StorageRecord>,
    journals: BTreeMap<u64, JournalRecord>,
    journal_tokens: FxHashMap<JournalToken, u64>,
    roots: BTreeMap<RootIdent, RootRecord>,
    host_snapshots: BTreeMap<HostSnapshotIdent, HostSnapshotRecord>,
    disk_snapshots: Vec<DiskSnapshotRecord>,
    next_storage_row: u64,
    next_journal_id: u64,
    next_disk_snapshot_id: u64,
}

impl Tables {
    /// Create an empty table set.
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Storages
    // =========================================================================

    /// Look up one storage by ident.
    pub fn storage(&self, ident: StorageIdent) -> Option<StorageRecord> {
        self.storages.get(&ident).cloned()
    }

    /// Look up one storage, erroring when it is missing.
    pub fn storage_required(&self, ident: StorageIdent) -> Result<StorageRecord> {
        self.storage(ident)
            .ok_or_else(|| Error::internal(format!("storage {ident} not found")))
    }

    /// All non-`Recycled` storages of a root, in insertion order.
    pub fn storages_for_root(&self, root: RootIdent) -> Vec<StorageRecord> {
        let mut rows: Vec<StorageRecord> = self
            .storages
            .values()
            .filter(|s| s.root_id == root && s.status != StorageStatus::Recycled)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.row_id);
        rows
    }

    /// All non-`Recycled` storages backed by the given image file.
    pub fn live_storages_on_path(&self, path: &Path) -> Vec<StorageRecord> {
        let mut rows: Vec<StorageRecord> = self
            .storages
            .values()
            .filter(|s| s.image_path == path && s.status != StorageStatus::Recycled)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.row_id);
        rows
    }

    /// Count storages on the image file that reclamation does not own yet.
    pub fn live_snapshot_count_on_path(&self, path: &Path) -> usize {
        self.storages
            .values()
            .filter(|s| s.image_path == path && !s.status.is_recycle())
            .count()
    }

    /// Readable storages backing a locator, ordered by begin timestamp.
    pub fn readable_storages_by_locator(&self, locator: LocatorId) -> Vec<StorageRecord> {
        let mut rows: Vec<StorageRecord> = self
            .storages
            .values()
            .filter(|s| {
                s.locator_id == Some(locator)
                    && !StorageStatus::NOT_READABLE.contains(&s.status)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.begin_timestamp);
        rows
    }

    /// Insert a new storage row, assigning its row id.
    pub fn insert_storage(&mut self, mut record: StorageRecord) -> Result<StorageRecord> {
        if self.storages.contains_key(&record.ident) {
            return Err(Error::duplicate_ident(record.ident));
        }
        self.next_storage_row += 1;
        record.row_id = self.next_storage_row;
        debug!(storage = %record, "storage row inserted");
        self.storages.insert(record.ident, record.clone());
        Ok(record)
    }

    /// Move a storage through the lifecycle DAG.
    pub fn set_storage_status(&mut self, ident: StorageIdent, status: StorageStatus) -> Result<()> {
        let record = self
            .storages
            .get_mut(&ident)
            .ok_or_else(|| Error::internal(format!("storage {ident} not found")))?;
        if !record.status.can_transition_to(status) {
            return Err(Error::internal(format!(
                "storage {ident} cannot move from {} to {}",
                record.status, status
            )));
        }
        debug!(%ident, from = %record.status, to = %status, "storage status");
        record.status = status;
        Ok(())
    }

    /// Rewrite a storage's parent link.
    pub fn set_storage_parent(
        &mut self,
        ident: StorageIdent,
        parent: Option<StorageIdent>,
    ) -> Result<()> {
        let record = self
            .storages
            .get_mut(&ident)
            .ok_or_else(|| Error::internal(format!("storage {ident} not found")))?;
        record.parent_ident = parent;
        Ok(())
    }

    /// Sever the locator linkage of a storage.
    pub fn clear_storage_locator(&mut self, ident: StorageIdent) -> Result<()> {
        let record = self
            .storages
            .get_mut(&ident)
            .ok_or_else(|| Error::internal(format!("storage {ident} not found")))?;
        record.locator_id = None;
        Ok(())
    }

    /// Move a storage into another root (used when detaching merged roots).
    pub fn set_storage_root(&mut self, ident: StorageIdent, root: RootIdent) -> Result<()> {
        let record = self
            .storages
            .get_mut(&ident)
            .ok_or_else(|| Error::internal(format!("storage {ident} not found")))?;
        record.root_id = root;
        Ok(())
    }

    // =========================================================================
    // Journals
    // =========================================================================

    /// Append a journal entry for a root, assigning its append id.
    pub fn append_journal(&mut self, root: RootIdent, payload: JournalPayload) -> JournalRecord {
        self.next_journal_id += 1;
        let record = JournalRecord {
            id: self.next_journal_id,
            token: JournalToken::new(),
            root_id: root,
            produced_timestamp: now_micros(),
            consumed_timestamp: None,
            payload,
            children_idents: Vec::new(),
        };
        debug!(token = %record.token, %root, "journal appended");
        self.journals.insert(record.id, record.clone());
        self.journal_tokens.insert(record.token, record.id);
        record
    }

    /// Look up a journal entry by token.
    pub fn journal_by_token(&self, token: JournalToken) -> Option<JournalRecord> {
        self.journal_tokens
            .get(&token)
            .and_then(|id| self.journals.get(id))
            .cloned()
    }

    /// Mark a journal entry consumed. Each entry is consumed exactly once.
    pub fn consume_journal(&mut self, token: JournalToken) -> Result<JournalRecord> {
        let id = *self
            .journal_tokens
            .get(&token)
            .ok_or_else(|| Error::validation(format!("journal token {token} not found")))?;
        let record = self.journals.get_mut(&id).expect("token index consistent");
        if record.consumed_timestamp.is_some() {
            return Err(Error::validation(format!(
                "journal token {token} already consumed"
            )));
        }
        record.consumed_timestamp = Some(now_micros());
        debug!(%token, "journal consumed");
        Ok(record.clone())
    }

    /// Unconsumed create-kind journals of a root, in append order.
    pub fn unconsumed_create_journals(&self, root: RootIdent) -> Vec<JournalRecord> {
        self.journals
            .values()
            .filter(|j| j.root_id == root && j.is_unconsumed() && j.payload.is_create_kind())
            .cloned()
            .collect()
    }

    /// Unconsumed destroy journals of a root, in append order.
    pub fn unconsumed_destroy_journals(&self, root: RootIdent) -> Vec<JournalRecord> {
        self.journals
            .values()
            .filter(|j| {
                j.root_id == root
                    && j.is_unconsumed()
                    && matches!(j.payload, JournalPayload::Destroy { .. })
            })
            .cloned()
            .collect()
    }

    /// Record a live child that the journal's node must adopt when it
    /// materialises.
    pub fn add_journal_child(&mut self, token: JournalToken, child: StorageIdent) -> Result<()> {
        let id = *self
            .journal_tokens
            .get(&token)
            .ok_or_else(|| Error::validation(format!("journal token {token} not found")))?;
        let record = self.journals.get_mut(&id).expect("token index consistent");
        if !record.children_idents.contains(&child) {
            record.children_idents.push(child);
        }
        Ok(())
    }

    // =========================================================================
    // Roots
    // =========================================================================

    /// Create a new root with the given hash policy.
    pub fn insert_root(&mut self, hash_kind: HashKind) -> RootRecord {
        let record = RootRecord {
            ident: RootIdent::new(),
            hash_kind,
            valid: true,
        };
        info!(root = %record, "root created");
        self.roots.insert(record.ident, record.clone());
        record
    }

    /// Look up one root.
    pub fn root(&self, ident: RootIdent) -> Option<RootRecord> {
        self.roots.get(&ident).cloned()
    }

    /// All valid roots.
    pub fn valid_roots(&self) -> Vec<RootRecord> {
        self.roots.values().filter(|r| r.valid).cloned().collect()
    }

    /// The distinguished recycle root, created on first use.
    pub fn recycle_root(&mut self) -> RootRecord {
        let ident = recycle_root_ident();
        if let Some(existing) = self.roots.get(&ident) {
            return existing.clone();
        }
        let record = RootRecord {
            ident,
            hash_kind: HashKind::Unknown,
            valid: true,
        };
        info!(root = %record, "recycle root created");
        self.roots.insert(ident, record.clone());
        record
    }

    /// Invalidate an emptied root. The recycle root can never be invalidated.
    pub fn set_root_invalid(&mut self, ident: RootIdent) -> Result<()> {
        if ident == recycle_root_ident() {
            return Err(Error::internal("recycle root cannot be invalidated"));
        }
        let record = self
            .roots
            .get_mut(&ident)
            .ok_or_else(|| Error::internal(format!("root {ident} not found")))?;
        record.valid = false;
        info!(root = %ident, "root invalidated");
        Ok(())
    }

    // =========================================================================
    // Host and disk snapshots
    // =========================================================================

    /// Register a host snapshot.
    pub fn insert_host_snapshot(&mut self, record: HostSnapshotRecord) {
        self.host_snapshots.insert(record.ident, record);
    }

    /// Look up one host snapshot.
    pub fn host_snapshot(&self, ident: HostSnapshotIdent) -> Option<HostSnapshotRecord> {
        self.host_snapshots.get(&ident).cloned()
    }

    /// Flip a host snapshot's validity.
    pub fn set_host_snapshot_valid(&mut self, ident: HostSnapshotIdent, valid: bool) -> Result<()> {
        let record = self
            .host_snapshots
            .get_mut(&ident)
            .ok_or_else(|| Error::internal(format!("host snapshot {ident} not found")))?;
        record.valid = valid;
        Ok(())
    }

    /// Register a logical disk snapshot beneath a host snapshot.
    pub fn insert_disk_snapshot(
        &mut self,
        host_snapshot: HostSnapshotIdent,
        locator_id: LocatorId,
        disk_index: u32,
    ) -> DiskSnapshotRecord {
        self.next_disk_snapshot_id += 1;
        let record = DiskSnapshotRecord {
            id: self.next_disk_snapshot_id,
            host_snapshot,
            locator_id,
            disk_index,
        };
        self.disk_snapshots.push(record.clone());
        record
    }

    /// Disk snapshots beneath a host snapshot, ordered by disk index.
    pub fn disk_snapshots_of_host(&self, ident: HostSnapshotIdent) -> Vec<DiskSnapshotRecord> {
        let mut rows: Vec<DiskSnapshotRecord> = self
            .disk_snapshots
            .iter()
            .filter(|d| d.host_snapshot == ident)
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.disk_index);
        rows
    }

    /// Host snapshots whose disk snapshots reference the locator.
    pub fn host_snapshots_by_locator(&self, locator: LocatorId) -> Vec<HostSnapshotRecord> {
        let mut seen = Vec::new();
        for disk in self.disk_snapshots.iter().filter(|d| d.locator_id == locator) {
            if seen.iter().any(|s: &HostSnapshotRecord| s.ident == disk.host_snapshot) {
                continue;
            }
            if let Some(host) = self.host_snapshots.get(&disk.host_snapshot) {
                seen.push(host.clone());
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snaptree_core::{HostSnapshotKind, StorageKind};
    use std::path::PathBuf;

    fn storage(root: RootIdent, path: &str) -> StorageRecord {
        StorageRecord {
            row_id: 0,
            ident: StorageIdent::new(),
            root_id: root,
            locator_id: None,
            kind: StorageKind::Qcow,
            status: StorageStatus::Storage,
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
    fn test_insert_assigns_row_ids_in_order() {
        let mut tables = Tables::new();
        let root = tables.insert_root(HashKind::None).ident;
        let a = tables.insert_storage(storage(root, "/mnt/s/a.qcow")).unwrap();
        let b = tables.insert_storage(storage(root, "/mnt/s/b.qcow")).unwrap();
        assert!(a.row_id < b.row_id);

        let rows = tables.storages_for_root(root);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].ident, a.ident);
    }

    #[test]
    fn test_insert_rejects_duplicate_ident() {
        let mut tables = Tables::new();
        let root = tables.insert_root(HashKind::None).ident;
        let record = storage(root, "/mnt/s/a.qcow");
        tables.insert_storage(record.clone()).unwrap();
        assert!(tables.insert_storage(record).is_err());
    }

    #[test]
    fn test_recycled_rows_are_filtered() {
        let mut tables = Tables::new();
        let root = tables.insert_root(HashKind::None).ident;
        let a = tables.insert_storage(storage(root, "/mnt/s/a.qcow")).unwrap();
        tables
            .set_storage_status(a.ident, StorageStatus::Recycling)
            .unwrap();
        tables
            .set_storage_status(a.ident, StorageStatus::Recycled)
            .unwrap();
        assert!(tables.storages_for_root(root).is_empty());
        assert!(tables
            .live_storages_on_path(Path::new("/mnt/s/a.qcow"))
            .is_empty());
    }

    #[test]
    fn test_status_transition_is_checked() {
        let mut tables = Tables::new();
        let root = tables.insert_root(HashKind::None).ident;
        let a = tables.insert_storage(storage(root, "/mnt/s/a.qcow")).unwrap();
        let err = tables
            .set_storage_status(a.ident, StorageStatus::Creating)
            .unwrap_err();
        assert!(err.to_string().contains("cannot move"));
    }

    #[test]
    fn test_live_snapshot_count_excludes_recycling() {
        let mut tables = Tables::new();
        let root = tables.insert_root(HashKind::None).ident;
        let path = "/mnt/s/shared.qcow";
        let a = tables.insert_storage(storage(root, path)).unwrap();
        tables.insert_storage(storage(root, path)).unwrap();
        assert_eq!(tables.live_snapshot_count_on_path(Path::new(path)), 2);

        tables
            .set_storage_status(a.ident, StorageStatus::Recycling)
            .unwrap();
        assert_eq!(tables.live_snapshot_count_on_path(Path::new(path)), 1);
    }

    #[test]
    fn test_journal_append_order_and_consumption() {
        let mut tables = Tables::new();
        let root = tables.insert_root(HashKind::None).ident;
        let j1 = tables.append_journal(
            root,
            JournalPayload::CreateFromQcow {
                new_ident: StorageIdent::new(),
                source_ident: StorageIdent::new(),
            },
        );
        let j2 = tables.append_journal(
            root,
            JournalPayload::CreateFromQcow {
                new_ident: StorageIdent::new(),
                source_ident: StorageIdent::new(),
            },
        );
        let pending = tables.unconsumed_create_journals(root);
        assert_eq!(pending.len(), 2);
        assert!(pending[0].id < pending[1].id);

        tables.consume_journal(j1.token).unwrap();
        let pending = tables.unconsumed_create_journals(root);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].token, j2.token);

        // consumed exactly once
        assert!(tables.consume_journal(j1.token).is_err());
    }

    #[test]
    fn test_destroy_journals_are_separate() {
        let mut tables = Tables::new();
        let root = tables.insert_root(HashKind::None).ident;
        tables.append_journal(root, JournalPayload::Destroy { idents: vec![] });
        assert!(tables.unconsumed_create_journals(root).is_empty());
        assert_eq!(tables.unconsumed_destroy_journals(root).len(), 1);
    }

    #[test]
    fn test_recycle_root_is_idempotent_and_protected() {
        let mut tables = Tables::new();
        let first = tables.recycle_root();
        let second = tables.recycle_root();
        assert_eq!(first.ident, second.ident);
        assert!(tables.set_root_invalid(first.ident).is_err());
    }

    #[test]
    fn test_host_snapshots_by_locator_dedups() {
        let mut tables = Tables::new();
        let host = HostSnapshotRecord {
            ident: HostSnapshotIdent::new(),
            kind: HostSnapshotKind::Normal,
            valid: true,
            begin_timestamp: 100,
            end_timestamp: 100,
        };
        tables.insert_host_snapshot(host.clone());
        let locator = LocatorId(7);
        tables.insert_disk_snapshot(host.ident, locator, 0);
        tables.insert_disk_snapshot(host.ident, locator, 1);
        assert_eq!(tables.host_snapshots_by_locator(locator).len(), 1);
        assert!(tables.host_snapshots_by_locator(LocatorId(8)).is_empty());
    }

    #[test]
    fn test_readable_storages_sorted_by_begin() {
        let mut tables = Tables::new();
        let root = tables.insert_root(HashKind::None).ident;
        let locator = LocatorId(1);

        let mut late = storage(root, "/mnt/s/late.cdp");
        late.kind = StorageKind::Cdp;
        late.locator_id = Some(locator);
        late.begin_timestamp = 1500;
        late.end_timestamp = 1700;

        let mut early = storage(root, "/mnt/s/early.cdp");
        early.kind = StorageKind::Cdp;
        early.locator_id = Some(locator);
        early.begin_timestamp = 1000;
        early.end_timestamp = 1500;

        let mut hidden = storage(root, "/mnt/s/hidden.qcow");
        hidden.locator_id = Some(locator);
        hidden.status = StorageStatus::Creating;

        tables.insert_storage(late).unwrap();
        tables.insert_storage(early).unwrap();
        tables.insert_storage(hidden).unwrap();

        let rows = tables.readable_storages_by_locator(locator);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].begin_timestamp, 1000);
        assert_eq!(rows[1].begin_timestamp, 1500);
    }
}
