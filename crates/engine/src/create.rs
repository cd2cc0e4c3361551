//! Snapshot creator
//!
//! Consumes a normal-create journal entry, materialises the new storage
//! row, and opens a read/write chain on it. The whole metadata step runs
//! under the root locker in a single catalog transaction; the external
//! create call happens after the chain is acquired.

use crate::actions::StorageActions;
use crate::chain::{ChainMode, StorageChain};
use crate::handle::OpenOutcome;
use crate::service::SnapshotService;
use crate::tree::StorageTree;
use snaptree_core::{
    now_micros, Error, JournalPayload, JournalToken, Result, StorageIdent, StorageRecord,
    StorageStatus,
};
use std::path::{Path, PathBuf};

/// Parameters of a create call.
#[derive(Debug, Clone)]
pub struct CreateStorageRequest {
    /// Handle to register the write chain under.
    pub handle: String,
    /// Token of the normal-create journal to consume.
    pub token: JournalToken,
    /// Pid of the external caller, for tracing.
    pub caller_pid: u32,
    /// Free-form trace string from the caller.
    pub trace: String,
}

/// Whether a child QCOW snapshot may live in its parent's image file.
///
/// All four must hold: same virtual disk size, same folder, the parent is
/// QCOW, and the parent is past its file-creation states.
fn can_reuse_parent_file(parent: &StorageRecord, disk_bytes: u64, folder: &Path) -> bool {
    parent.kind == snaptree_core::StorageKind::Qcow
        && parent.disk_bytes == disk_bytes
        && parent.image_path.parent() == Some(folder)
        && !matches!(
            parent.status,
            StorageStatus::Creating | StorageStatus::DataWriting
        )
}

fn image_file_name(folder: &Path, ident: StorageIdent, extension: &str) -> PathBuf {
    folder.join(format!("{ident}.{extension}"))
}

pub(crate) fn create_storage(
    service: &SnapshotService,
    request: CreateStorageRequest,
) -> Result<OpenOutcome> {
    let caller_name = format!(
        "create new snapshot storage : <{}> pid:{} trace:{} handle:{}",
        request.token, request.caller_pid, request.trace, request.handle
    );
    service.handles.ensure_vacant(&request.handle)?;

    // resolve the journal's root before locking it
    let root_id = service
        .catalog
        .snapshot()
        .journal_by_token(request.token)
        .ok_or_else(|| Error::validation(format!("journal token {} not found", request.token)))?
        .root_id;

    let _root_guard = service.lockers.acquire(root_id, &caller_name)?;

    let (disk_bytes, chain_storages) = service.catalog.transaction(|tx| {
        let journal = tx
            .journal_by_token(request.token)
            .ok_or_else(|| Error::validation(format!("journal token {} not found", request.token)))?;
        let JournalPayload::NormalCreate {
            new_ident,
            parent_ident,
            parent_timestamp,
            kind,
            disk_bytes,
            storage_folder,
        } = journal.payload.clone()
        else {
            return Err(Error::validation(format!(
                "journal token {} is not a normal-create entry",
                request.token
            )));
        };

        tx.consume_journal(request.token)?;

        // prospective tree without this journal: it was just consumed
        let tree = StorageTree::build(
            tx.storages_for_root(root_id),
            &tx.unconsumed_create_journals(root_id),
        )?;

        // the relied parent is the nearest *persisted* ancestor of the
        // declared parent; a declared parent that is still pending (or a
        // pending-only ancestry) leaves the new row parentless for now
        let relied = match parent_ident {
            None => None,
            Some(declared) => {
                let idx = tree.get(declared).ok_or_else(|| {
                    Error::internal(format!("declared parent {declared} not in tree"))
                })?;
                tree.real_chain_to_root(idx).last().cloned()
            }
        };

        let image_path = if parent_ident.is_none() {
            image_file_name(&storage_folder, new_ident, kind.extension())
        } else if kind == snaptree_core::StorageKind::Cdp {
            image_file_name(&storage_folder, new_ident, "cdp")
        } else {
            match &relied {
                Some(parent) if can_reuse_parent_file(parent, disk_bytes, &storage_folder) => {
                    parent.image_path.clone()
                }
                _ => image_file_name(&storage_folder, new_ident, "qcow"),
            }
        };

        let now = now_micros();
        let record = tx.insert_storage(StorageRecord {
            row_id: 0,
            ident: new_ident,
            root_id,
            locator_id: None,
            kind,
            status: StorageStatus::Creating,
            disk_bytes,
            image_path,
            full_hash_path: None,
            inc_hash_path: None,
            begin_timestamp: now,
            end_timestamp: now,
            parent_ident: relied.as_ref().map(|r| r.ident),
            parent_timestamp,
            file_level_deduplication: false,
        })?;

        // a still-pending declared parent must adopt this node when it
        // materialises
        if let Some(declared) = parent_ident {
            for pending in tx.unconsumed_create_journals(root_id) {
                if pending.payload.new_ident() == Some(declared) {
                    tx.add_journal_child(pending.token, new_ident)?;
                }
            }
        }

        // children recorded on this journal were superseded by the new
        // node: rewrite their parent link
        for child in &journal.children_idents {
            if tx.storage(*child).is_some() {
                tx.set_storage_parent(*child, Some(new_ident))?;
            }
        }

        let mut chain_storages = relied
            .as_ref()
            .map(|r| {
                let idx = tree.get(r.ident).expect("relied parent is in tree");
                tree.real_chain_to_root(idx)
            })
            .unwrap_or_default();
        chain_storages.push(record);
        Ok((disk_bytes, chain_storages))
    })?;

    let _tree_guard = service.tree_locker.lock();
    let chain = StorageChain::from_storages(ChainMode::ReadWrite, &caller_name, None, chain_storages)
        .acquire(service.references.clone())?;

    let flag = StorageActions::generate_flag(request.caller_pid, &request.trace);
    let (raw_handle, endpoint) = match service.actions.create_disk_snapshot(&chain, disk_bytes, &flag)
    {
        Ok(opened) => opened,
        Err(e) => {
            chain.release();
            return Err(e);
        }
    };

    service
        .handles
        .register(&request.handle, chain, raw_handle.clone(), endpoint.clone())?;
    Ok(OpenOutcome {
        handle: request.handle,
        raw_handle,
        endpoint,
    })
}
