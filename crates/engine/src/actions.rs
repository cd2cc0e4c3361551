//! Storage actions
//!
//! Gate-checked file operations plus the translation layer between chains
//! and the image daemon's call shapes. Every operation validates its paths
//! against the valid-directory gate before and after touching anything.
//!
//! Daemon failures are wrapped into the domain error taxonomy here, with a
//! fixed code per operation; raw code [`CDP_FILE_NO_CONTENT`] from a range
//! query is translated into an empty-range success instead of an error.

use crate::chain::AcquiredChain;
use crate::image::{
    CdpSeek, ImageRpcError, ImageService, MergeCdpRequest, MergeQcowTypeBRequest, SnapshotImage,
    CDP_FILE_NO_CONTENT,
};
use crate::valid_dir::ValidDirectories;
use snaptree_core::error::{
    CODE_DELETE_DISK_SNAPSHOT_FAILED, CODE_FAILED, CODE_QUERY_CDP_TIMESTAMP_RANGE_FAILED,
};
use snaptree_core::{Error, HashKind, Result, StorageRecord, Timestamp};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const QCOW_AUX_SUFFIXES: &[&str] = &["hash", "full_hash", "map", "snmap", "binmap"];
const CDP_AUX_SUFFIXES: &[&str] = &["readmap", "map"];

fn external(operation: &'static str, code: i32) -> impl Fn(ImageRpcError) -> Error {
    move |e| Error::external(operation, code, e.raw_code, e.message)
}

fn io_error(context: &str, e: std::io::Error) -> Error {
    Error::internal(format!("{context}: {e}"))
}

/// File and daemon operations used by open, create and reclamation.
pub struct StorageActions {
    images: Arc<dyn ImageService>,
    directories: Arc<ValidDirectories>,
}

impl StorageActions {
    /// Create the façade over a daemon connection and the directory gate.
    pub fn new(images: Arc<dyn ImageService>, directories: Arc<ValidDirectories>) -> Self {
        Self { images, directories }
    }

    /// Render the trace flag attached to open/create daemon calls.
    pub fn generate_flag(caller_pid: u32, trace: &str) -> String {
        format!("PiD{caller_pid} {trace}")
    }

    // =========================================================================
    // File removal
    // =========================================================================

    /// Delete a CDP file and its auxiliary files.
    pub fn remove_cdp_file(&self, path: &Path) -> Result<()> {
        self.directories.check_path(path)?;
        remove_file_if_exists(path)?;
        remove_aux_files(path, CDP_AUX_SUFFIXES)?;
        self.directories.check_path(path)?;
        Ok(())
    }

    /// Delete a QCOW file and its auxiliary files.
    pub fn remove_qcow_file(&self, path: &Path) -> Result<()> {
        self.directories.check_path(path)?;
        remove_file_if_exists(path)?;
        remove_aux_files(path, QCOW_AUX_SUFFIXES)?;
        self.directories.check_path(path)?;
        Ok(())
    }

    /// Delete one snapshot inside a QCOW file, plus its auxiliary files.
    ///
    /// Related data such as hash files must already be merged or known to
    /// be unneeded before this is called.
    pub fn delete_qcow_snapshot(&self, path: &Path, snapshot_name: &str) -> Result<()> {
        self.directories.check_path(path)?;
        self.images
            .delete_snapshot_in_qcow_file(path, snapshot_name)
            .map_err(external(
                "delete_snapshot_in_qcow_file",
                CODE_DELETE_DISK_SNAPSHOT_FAILED,
            ))?;
        for suffix in QCOW_AUX_SUFFIXES {
            let aux = aux_path(path, snapshot_name, suffix);
            remove_file_if_exists(&aux)?;
        }
        self.directories.check_path(path)?;
        Ok(())
    }

    // =========================================================================
    // CDP timestamp helpers
    // =========================================================================

    /// Usable timestamp range of a CDP file; `None` when it has no content.
    pub fn query_cdp_timestamp_range(
        &self,
        path: &Path,
        discard_dirty: bool,
    ) -> Result<Option<(Timestamp, Timestamp)>> {
        match self.images.query_cdp_file_timestamp_range(path, discard_dirty) {
            Ok(range) => Ok(Some(range)),
            Err(e) if e.raw_code == CDP_FILE_NO_CONTENT => Ok(None),
            Err(e) => Err(external(
                "query_cdp_file_timestamp_range",
                CODE_QUERY_CDP_TIMESTAMP_RANGE_FAILED,
            )(e)),
        }
    }

    /// Latest usable timestamp of a CDP file.
    pub fn query_cdp_last_timestamp(&self, path: &Path) -> Result<Option<Timestamp>> {
        Ok(self.query_cdp_timestamp_range(path, false)?.map(|r| r.1))
    }

    /// Snap a logical timestamp onto one the CDP file actually recorded.
    pub fn relocate_cdp_timestamp(
        &self,
        path: &Path,
        timestamp: Timestamp,
    ) -> Result<Option<Timestamp>> {
        let Some((begin, end)) = self.query_cdp_timestamp_range(path, false)? else {
            return Ok(None);
        };
        if timestamp <= begin {
            Ok(Some(begin))
        } else if timestamp >= end {
            Ok(Some(end))
        } else {
            self.images
                .query_cdp_file_timestamp(path, timestamp, CdpSeek::Forwards)
                .map(Some)
                .map_err(external("query_cdp_file_timestamp", CODE_FAILED))
        }
    }

    /// Render a CDP read selector: `all`, `$~t`, `t~$` or `a~b`.
    pub fn format_cdp_timestamp_for_read(
        &self,
        begin: Option<Timestamp>,
        end: Option<Timestamp>,
    ) -> Result<String> {
        let fmt = |t: Timestamp| {
            self.images
                .format_cdp_file_timestamp(t)
                .map_err(external("format_cdp_file_timestamp", CODE_FAILED))
        };
        match (begin, end) {
            (None, None) => Ok("all".to_string()),
            (None, Some(end)) => Ok(format!("$~{}", fmt(end)?)),
            (Some(begin), None) => Ok(format!("{}~$", fmt(begin)?)),
            (Some(begin), Some(end)) => Ok(format!("{}~{}", fmt(begin)?, fmt(end)?)),
        }
    }

    // =========================================================================
    // Chain conversion and open/create/close
    // =========================================================================

    /// Convert a chain into the image list the daemon opens.
    ///
    /// Returns the virtual disk size of the tail plus one image per key
    /// storage. A CDP tail is cut at the chain's timestamp (relocated onto
    /// a recorded instant); a CDP middle is cut at its successor's declared
    /// parent timestamp.
    pub fn convert_chain_to_images(
        &self,
        chain: &AcquiredChain,
    ) -> Result<(u64, Vec<SnapshotImage>)> {
        let storages = chain.storages();
        debug_assert!(!storages.is_empty());
        let last = storages.len() - 1;
        let mut disk_bytes = 0;
        let mut images = Vec::with_capacity(storages.len());

        for (idx, storage) in storages.iter().enumerate() {
            if idx == last {
                disk_bytes = storage.disk_bytes;
                if storage.is_cdp_file() {
                    images.push(self.cdp_image(storage, chain.timestamp(), true)?);
                } else {
                    images.push(qcow_image(storage));
                }
            } else if storage.is_cdp_file() {
                images.push(self.cdp_image(storage, storages[idx + 1].parent_timestamp, false)?);
            } else {
                images.push(qcow_image(storage));
            }
        }
        Ok((disk_bytes, images))
    }

    fn cdp_image(
        &self,
        storage: &StorageRecord,
        timestamp: Option<Timestamp>,
        relocate: bool,
    ) -> Result<SnapshotImage> {
        let path = storage.image_path.as_path();
        let end = match (timestamp, relocate) {
            (Some(t), true) => self.relocate_cdp_timestamp(path, t)?,
            (Some(t), false) => Some(t),
            (None, true) => self.query_cdp_last_timestamp(path)?,
            (None, false) => None,
        };
        Ok(SnapshotImage {
            file_path: storage.image_path.clone(),
            snapshot_name: self.format_cdp_timestamp_for_read(None, end)?,
        })
    }

    /// Create the tail image of a write chain and open it on the daemon.
    pub fn create_disk_snapshot(
        &self,
        chain: &AcquiredChain,
        disk_bytes: u64,
        flag: &str,
    ) -> Result<(String, String)> {
        for storage in chain.storages() {
            self.directories.check_path(&storage.image_path)?;
        }
        let (_, images) = self.convert_chain_to_images(chain)?;
        self.images
            .create_disk_snapshot(&images, disk_bytes, flag)
            .map_err(external("create_disk_snapshot", CODE_FAILED))
    }

    /// Open a read chain on the daemon.
    pub fn open_disk_snapshot(&self, chain: &AcquiredChain, flag: &str) -> Result<(String, String)> {
        self.is_all_images_exist(chain.storages(), true)?;
        let (_, images) = self.convert_chain_to_images(chain)?;
        self.images
            .open_disk_snapshot(&images, flag)
            .map_err(external("open_disk_snapshot", CODE_FAILED))
    }

    /// Close a chain on the daemon.
    pub fn close_disk_snapshot(&self, raw_handle: &str, endpoint: &str) -> Result<()> {
        self.images
            .close_disk_snapshot(raw_handle, endpoint)
            .map_err(external("close_disk_snapshot", CODE_FAILED))
    }

    // =========================================================================
    // Merge operations
    // =========================================================================

    /// Fold a run of CDP storages into the tail of a read/write chain.
    pub fn merge_cdp_to_qcow(
        &self,
        hash_kind: HashKind,
        rw_chain: &AcquiredChain,
        cdp_storages: &[StorageRecord],
    ) -> Result<()> {
        let (disk_bytes, rw_chain_images) = self.convert_chain_to_images(rw_chain)?;
        let new_storage = rw_chain.tail();
        debug_assert!(!new_storage.is_cdp_file());
        debug_assert!(!cdp_storages.is_empty());
        for storage in cdp_storages {
            debug_assert!(storage.is_cdp_file());
            debug_assert_eq!(storage.disk_bytes, disk_bytes);
        }

        let request = MergeCdpRequest {
            disk_bytes,
            cdp_files: cdp_storages.iter().map(|s| s.image_path.clone()).collect(),
            new_snapshot_hash_path: match hash_kind {
                HashKind::None => None,
                _ => new_storage.inc_hash_path.clone(),
            },
            rw_chain_images,
        };
        debug_assert!(
            hash_kind == HashKind::None || request.new_snapshot_hash_path.is_some()
        );
        self.images
            .merge_cdp_to_qcow(&request)
            .map_err(external("merge_cdp_to_qcow", CODE_FAILED))
    }

    /// In-file QCOW merge: no data moves, only hash data is folded into the
    /// children.
    pub fn merge_qcow_snapshot_type_a(
        &self,
        hash_kind: HashKind,
        children: &[StorageRecord],
        merge_storage: &StorageRecord,
    ) -> Result<()> {
        if hash_kind == HashKind::None {
            return Ok(());
        }
        let src_hash = merge_storage
            .full_hash_path
            .as_ref()
            .or(merge_storage.inc_hash_path.as_ref())
            .ok_or_else(|| {
                Error::internal(format!("{merge_storage} carries no hash data to merge"))
            })?;

        for child in children {
            debug_assert!(!child.is_cdp_file());
            if child.full_hash_path.is_some() {
                continue; // full hash already covers the merged range
            }
            let dst = child.inc_hash_path.as_ref().ok_or_else(|| {
                Error::internal(format!("{child} carries no incremental hash"))
            })?;
            self.images
                .merge_qcow_hash_file(src_hash, dst, merge_storage.disk_bytes)
                .map_err(external("merge_qcow_hash_file", CODE_FAILED))?;
        }
        Ok(())
    }

    /// Cross-file QCOW merge: data moves from the merged snapshot's file
    /// into the write chain's tail.
    pub fn merge_qcow_snapshot_type_b(
        &self,
        hash_kind: HashKind,
        write_chain: &AcquiredChain,
        merge_storage: &StorageRecord,
    ) -> Result<()> {
        debug_assert!(!merge_storage.is_cdp_file());
        let storages = write_chain.storages();
        if storages.len() != 2 {
            return Err(Error::internal(format!(
                "type-b merge expects a two-element write chain, got {}",
                storages.len()
            )));
        }
        let prev = &storages[0];
        let new = &storages[1];
        debug_assert_eq!(new.disk_bytes, merge_storage.disk_bytes);

        let request = MergeQcowTypeBRequest {
            disk_bytes: merge_storage.disk_bytes,
            new_file: new.image_path.clone(),
            new_ident: new.ident.to_string(),
            new_full_hash_path: new.full_hash_path.clone(),
            new_inc_hash_path: new.inc_hash_path.clone(),
            current_file: merge_storage.image_path.clone(),
            current_ident: merge_storage.ident.to_string(),
            current_full_hash_path: merge_storage.full_hash_path.clone(),
            current_inc_hash_path: merge_storage.inc_hash_path.clone(),
            prev_file: prev.image_path.clone(),
            prev_ident: prev.ident.to_string(),
        };
        if hash_kind == HashKind::None {
            debug_assert!(request.new_full_hash_path.is_none());
            debug_assert!(request.new_inc_hash_path.is_none());
        }
        self.images
            .merge_qcow_snapshot_type_b(&request)
            .map_err(external("merge_qcow_snapshot_type_b", CODE_FAILED))
    }

    // =========================================================================
    // Existence checks
    // =========================================================================

    /// Whether a storage file exists inside a valid directory.
    pub fn is_file_exist(&self, path: &Path, raise: bool) -> Result<bool> {
        let exists = self.directories.is_include(path) && path.is_file();
        if !exists && raise {
            return Err(Error::StorageImageFileNotExist {
                path: path.to_path_buf(),
            });
        }
        Ok(exists)
    }

    /// Whether every image file of the given storages exists.
    pub fn is_all_images_exist(&self, storages: &[StorageRecord], raise: bool) -> Result<bool> {
        let mut paths: Vec<&Path> = storages.iter().map(|s| s.image_path.as_path()).collect();
        paths.sort();
        paths.dedup();
        for path in paths {
            if !self.is_file_exist(path, raise)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn qcow_image(storage: &StorageRecord) -> SnapshotImage {
    SnapshotImage {
        file_path: storage.image_path.clone(),
        snapshot_name: storage.ident.to_string(),
    }
}

fn aux_path(path: &Path, snapshot_name: &str, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!("_{snapshot_name}.{suffix}"));
    PathBuf::from(name)
}

fn remove_file_if_exists(path: &Path) -> Result<()> {
    if path.is_file() {
        debug!(path = %path.display(), "removing file");
        fs::remove_file(path).map_err(|e| io_error("remove file", e))?;
    }
    Ok(())
}

/// Remove `{path}_*.{suffix}` siblings for each suffix.
fn remove_aux_files(path: &Path, suffixes: &[&str]) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(());
    };
    let prefix = format!("{file_name}_");
    let entries = match fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(_) => return Ok(()), // directory already gone
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if !name.starts_with(&prefix) {
            continue;
        }
        if suffixes.iter().any(|s| name.ends_with(&format!(".{s}"))) {
            remove_file_if_exists(&entry.path())?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeImageService;
    use std::fs::File;

    fn gate_for(dir: &Path) -> Arc<ValidDirectories> {
        let gate = ValidDirectories::new();
        gate.add_directory(dir).unwrap();
        Arc::new(gate)
    }

    fn actions(dir: &Path) -> (StorageActions, Arc<FakeImageService>) {
        let images = Arc::new(FakeImageService::new());
        let actions = StorageActions::new(images.clone(), gate_for(dir));
        (actions, images)
    }

    fn deep_tempdir() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("mnt/storage/pool0");
        fs::create_dir_all(&deep).unwrap();
        (dir, deep)
    }

    #[test]
    fn test_remove_qcow_file_sweeps_aux_files() {
        let (_guard, dir) = deep_tempdir();
        let (actions, _) = actions(&dir);

        let image = dir.join("a.qcow");
        File::create(&image).unwrap();
        let aux = dir.join("a.qcow_snap1.hash");
        File::create(&aux).unwrap();
        let unrelated = dir.join("b.qcow");
        File::create(&unrelated).unwrap();

        actions.remove_qcow_file(&image).unwrap();
        assert!(!image.exists());
        assert!(!aux.exists());
        assert!(unrelated.exists());
    }

    #[test]
    fn test_remove_cdp_file_only_sweeps_cdp_suffixes() {
        let (_guard, dir) = deep_tempdir();
        let (actions, _) = actions(&dir);

        let image = dir.join("a.cdp");
        File::create(&image).unwrap();
        let readmap = dir.join("a.cdp_x.readmap");
        File::create(&readmap).unwrap();
        let hash = dir.join("a.cdp_x.hash");
        File::create(&hash).unwrap();

        actions.remove_cdp_file(&image).unwrap();
        assert!(!image.exists());
        assert!(!readmap.exists());
        assert!(hash.exists());
    }

    #[test]
    fn test_remove_outside_valid_directory_is_rejected() {
        let (_guard, dir) = deep_tempdir();
        let (actions, _) = actions(&dir);
        let err = actions
            .remove_qcow_file(Path::new("/somewhere/else/a.qcow"))
            .unwrap_err();
        assert!(matches!(err, Error::StorageDirectoryInvalid { .. }));
    }

    #[test]
    fn test_delete_qcow_snapshot_strips_per_snapshot_aux() {
        let (_guard, dir) = deep_tempdir();
        let (actions, images) = actions(&dir);

        let image = dir.join("a.qcow");
        File::create(&image).unwrap();
        let mine = dir.join("a.qcow_snap1.map");
        File::create(&mine).unwrap();
        let other = dir.join("a.qcow_snap2.map");
        File::create(&other).unwrap();

        actions.delete_qcow_snapshot(&image, "snap1").unwrap();
        assert!(!mine.exists());
        assert!(other.exists());
        assert_eq!(images.deleted_qcow_snapshots(), vec!["snap1".to_string()]);
    }

    #[test]
    fn test_delete_qcow_snapshot_in_use_is_retryable() {
        let (_guard, dir) = deep_tempdir();
        let (actions, images) = actions(&dir);
        images.fail_delete_snapshot_with(-2);

        let image = dir.join("a.qcow");
        File::create(&image).unwrap();
        let err = actions.delete_qcow_snapshot(&image, "snap1").unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_no_content_range_becomes_empty_success() {
        let (_guard, dir) = deep_tempdir();
        let (actions, images) = actions(&dir);
        let path = dir.join("a.cdp");
        images.set_cdp_range(&path, None);
        assert_eq!(actions.query_cdp_timestamp_range(&path, false).unwrap(), None);
        assert_eq!(actions.query_cdp_last_timestamp(&path).unwrap(), None);
    }

    #[test]
    fn test_relocate_clamps_to_range_edges() {
        let (_guard, dir) = deep_tempdir();
        let (actions, images) = actions(&dir);
        let path = dir.join("a.cdp");
        images.set_cdp_range(&path, Some((1000, 1700)));

        assert_eq!(actions.relocate_cdp_timestamp(&path, 500).unwrap(), Some(1000));
        assert_eq!(actions.relocate_cdp_timestamp(&path, 2000).unwrap(), Some(1700));
        // interior timestamps go through the daemon's correction
        assert_eq!(actions.relocate_cdp_timestamp(&path, 1200).unwrap(), Some(1200));
    }

    #[test]
    fn test_format_selector_forms() {
        let (_guard, dir) = deep_tempdir();
        let (actions, _) = actions(&dir);
        assert_eq!(actions.format_cdp_timestamp_for_read(None, None).unwrap(), "all");
        assert_eq!(
            actions.format_cdp_timestamp_for_read(None, Some(5)).unwrap(),
            "$~5"
        );
        assert_eq!(
            actions.format_cdp_timestamp_for_read(Some(3), None).unwrap(),
            "3~$"
        );
        assert_eq!(
            actions.format_cdp_timestamp_for_read(Some(3), Some(5)).unwrap(),
            "3~5"
        );
    }
}
