//! Chain open operations
//!
//! Opening a storage (or every disk of a host snapshot) builds the
//! prospective tree under the root locker, walks from the target node to
//! the root collecting real storages, and acquires a read chain before the
//! external open call.

use crate::actions::StorageActions;
use crate::chain::{AcquiredChain, ChainMode, StorageChain};
use crate::handle::OpenOutcome;
use crate::service::SnapshotService;
use crate::tree::StorageTree;
use snaptree_catalog::Tables;
use snaptree_core::{
    Error, HostSnapshotIdent, HostSnapshotRecord, Result, RootIdent, StorageIdent, StorageRecord,
    Timestamp,
};

/// Parameters for opening one storage.
#[derive(Debug, Clone)]
pub struct OpenStorageRequest {
    /// Target storage.
    pub storage_ident: StorageIdent,
    /// Root the storage belongs to.
    pub root_id: RootIdent,
    /// Moment within a CDP target; `None` means its full range (or, for a
    /// QCOW target, its single instant).
    pub timestamp: Option<Timestamp>,
    /// Handle to register the chain under.
    pub handle: String,
    /// Pid of the external caller, for tracing.
    pub caller_pid: u32,
    /// Free-form trace string from the caller.
    pub trace: String,
}

/// Parameters for opening every disk of a host snapshot.
#[derive(Debug, Clone)]
pub struct OpenHostSnapshotRequest {
    /// Target host snapshot.
    pub host_snapshot_ident: HostSnapshotIdent,
    /// Moment within a CDP host snapshot; `None` means its latest instant.
    /// Must be `None` for normal host snapshots.
    pub timestamp: Option<Timestamp>,
    /// Handle prefix; each disk registers under `{handle}:{disk_index}`.
    pub handle: String,
    /// Pid of the external caller, for tracing.
    pub caller_pid: u32,
    /// Free-form trace string from the caller.
    pub trace: String,
}

/// One opened disk of a host snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskOpenOutcome {
    /// Index of the disk within the host.
    pub disk_index: u32,
    /// The open result for this disk.
    pub outcome: OpenOutcome,
}

fn chain_timestamp(storage: &StorageRecord, requested: Option<Timestamp>) -> Result<Option<Timestamp>> {
    if storage.is_cdp_file() {
        return Ok(requested);
    }
    debug_assert_eq!(storage.begin_timestamp, storage.end_timestamp);
    match requested {
        None => Ok(Some(storage.begin_timestamp)),
        Some(t) if t == storage.begin_timestamp => Ok(Some(t)),
        Some(t) => Err(Error::disk_snapshot_storage_invalid(format!(
            "{storage} does not describe timestamp {t}"
        ))),
    }
}

/// Build and acquire a read chain ending at `storage`. Must run under the
/// root locker.
fn acquire_read_chain(
    service: &SnapshotService,
    tables: &Tables,
    storage: &StorageRecord,
    timestamp: Option<Timestamp>,
    caller_name: &str,
) -> Result<AcquiredChain> {
    if storage.status == snaptree_core::StorageStatus::Recycled {
        return Err(Error::disk_snapshot_storage_invalid(format!(
            "{storage} is recycled"
        )));
    }
    let timestamp = chain_timestamp(storage, timestamp)?;

    let _tree_guard = service.tree_locker.lock();
    let tree = StorageTree::build(
        tables.storages_for_root(storage.root_id),
        &tables.unconsumed_create_journals(storage.root_id),
    )?;
    let idx = tree.get(storage.ident).ok_or_else(|| {
        Error::disk_snapshot_storage_invalid(format!("{storage} not present in its tree"))
    })?;
    let chain_storages = tree.real_chain_to_root(idx);

    StorageChain::from_storages(ChainMode::Read, caller_name, timestamp, chain_storages)
        .acquire(service.references.clone())
}

fn open_chain_as_handle(
    service: &SnapshotService,
    chain: AcquiredChain,
    handle: &str,
    caller_pid: u32,
    trace: &str,
) -> Result<OpenOutcome> {
    let flag = StorageActions::generate_flag(caller_pid, trace);
    let (raw_handle, endpoint) = match service.actions.open_disk_snapshot(&chain, &flag) {
        Ok(opened) => opened,
        Err(e) => {
            chain.release();
            return Err(e);
        }
    };
    service
        .handles
        .register(handle, chain, raw_handle.clone(), endpoint.clone())?;
    Ok(OpenOutcome {
        handle: handle.to_string(),
        raw_handle,
        endpoint,
    })
}

pub(crate) fn open_storage(
    service: &SnapshotService,
    request: OpenStorageRequest,
) -> Result<OpenOutcome> {
    let caller_name = format!(
        "open snapshot storage : <{}> pid:{} trace:{} handle:{}",
        request.storage_ident, request.caller_pid, request.trace, request.handle
    );
    service.handles.ensure_vacant(&request.handle)?;

    let _root_guard = service.lockers.acquire(request.root_id, &caller_name)?;
    let tables = service.catalog.snapshot();
    let storage = tables.storage(request.storage_ident).ok_or_else(|| {
        Error::disk_snapshot_storage_invalid(format!(
            "storage {} does not exist",
            request.storage_ident
        ))
    })?;
    if storage.root_id != request.root_id {
        return Err(Error::validation(format!(
            "storage {} does not belong to root {}",
            request.storage_ident, request.root_id
        )));
    }

    let chain = acquire_read_chain(service, &tables, &storage, request.timestamp, &caller_name)?;
    open_chain_as_handle(
        service,
        chain,
        &request.handle,
        request.caller_pid,
        &request.trace,
    )
}

/// Resolve the host snapshot and the effective timestamp for the request.
fn resolve_host_snapshot(
    tables: &Tables,
    ident: HostSnapshotIdent,
    requested: Option<Timestamp>,
) -> Result<(HostSnapshotRecord, Timestamp)> {
    let host = tables
        .host_snapshot(ident)
        .ok_or_else(|| Error::validation(format!("host snapshot {ident} does not exist")))?;

    if host.is_cdp() {
        let timestamp = requested.unwrap_or(host.end_timestamp);
        if !host.valid {
            return Err(Error::host_snapshot_invalid(ident, format!("{host} invalid")));
        }
        if timestamp < host.begin_timestamp {
            return Err(Error::host_snapshot_invalid(
                ident,
                format!("{timestamp} before {host} begin {}", host.begin_timestamp),
            ));
        }
        if timestamp > host.end_timestamp {
            return Err(Error::host_snapshot_invalid(
                ident,
                format!("{timestamp} after {host} end {}", host.end_timestamp),
            ));
        }
        Ok((host, timestamp))
    } else {
        if requested.is_some() {
            return Err(Error::validation(
                "timestamp is only meaningful for cdp host snapshots",
            ));
        }
        if !host.valid {
            return Err(Error::host_snapshot_invalid(ident, format!("{host} invalid")));
        }
        let begin = host.begin_timestamp;
        Ok((host, begin))
    }
}

/// The storage whose interval contains the timestamp, or its closest
/// predecessor when the timestamp falls in a gap.
fn find_storage_for_timestamp(
    storages: &[StorageRecord],
    timestamp: Timestamp,
) -> Result<StorageRecord> {
    let mut prev: Option<&StorageRecord> = None;
    for storage in storages {
        if timestamp < storage.begin_timestamp {
            return Ok(prev.unwrap_or(storage).clone());
        } else if timestamp <= storage.end_timestamp {
            return Ok(storage.clone());
        }
        prev = Some(storage);
    }
    prev.cloned()
        .ok_or_else(|| Error::disk_snapshot_storage_invalid("no storages back the locator"))
}

fn readable_storages(
    tables: &Tables,
    locator: snaptree_core::LocatorId,
) -> Result<Vec<StorageRecord>> {
    let storages = tables.readable_storages_by_locator(locator);
    if storages.is_empty() {
        return Err(Error::disk_snapshot_storage_invalid(format!(
            "no readable storage backs {locator}"
        )));
    }
    Ok(storages)
}

pub(crate) fn open_host_snapshot(
    service: &SnapshotService,
    request: OpenHostSnapshotRequest,
) -> Result<Vec<DiskOpenOutcome>> {
    let tables = service.catalog.snapshot();
    let (_, timestamp) =
        resolve_host_snapshot(&tables, request.host_snapshot_ident, request.timestamp)?;

    let disks = tables.disk_snapshots_of_host(request.host_snapshot_ident);
    let mut outcomes = Vec::with_capacity(disks.len());

    for disk in disks {
        let caller_name = format!(
            "open host snapshot : <{}|{}> disk:{} pid:{} trace:{}",
            request.host_snapshot_ident, timestamp, disk.disk_index, request.caller_pid,
            request.trace
        );
        let root_id = readable_storages(&tables, disk.locator_id)?[0].root_id;

        let _root_guard = service.lockers.acquire(root_id, &caller_name)?;
        // re-check under the locker against the latest state
        let tables = service.catalog.snapshot();
        resolve_host_snapshot(&tables, request.host_snapshot_ident, request.timestamp)?;

        let storages = readable_storages(&tables, disk.locator_id)?;
        let target = find_storage_for_timestamp(&storages, timestamp)?;

        let handle = format!("{}:{}", request.handle, disk.disk_index);
        service.handles.ensure_vacant(&handle)?;
        let chain = acquire_read_chain(service, &tables, &target, Some(timestamp), &caller_name)?;
        let outcome = open_chain_as_handle(
            service,
            chain,
            &handle,
            request.caller_pid,
            &request.trace,
        )?;
        outcomes.push(DiskOpenOutcome {
            disk_index: disk.disk_index,
            outcome,
        });
    }
    Ok(outcomes)
}
