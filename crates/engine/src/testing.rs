//! Test doubles
//!
//! A recording in-memory [`ImageService`] used by unit and integration
//! tests. Calls are recorded for assertion; selected operations can be
//! forced to fail with a raw daemon code.

use crate::image::{
    CdpSeek, ImageRpcError, ImageService, MergeCdpRequest, MergeQcowTypeBRequest, RpcResult,
    SnapshotImage, CDP_FILE_NO_CONTENT,
};
use parking_lot::Mutex;
use snaptree_core::Timestamp;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
struct FakeState {
    cdp_ranges: HashMap<PathBuf, Option<(Timestamp, Timestamp)>>,
    delete_snapshot_failure: Option<i64>,
    merge_cdp_failure: Option<i64>,
    merge_type_b_failure: Option<i64>,
    deleted_snapshots: Vec<String>,
    merged_cdp: Vec<MergeCdpRequest>,
    merged_type_b: Vec<MergeQcowTypeBRequest>,
    merged_hash: Vec<(PathBuf, PathBuf)>,
    created: Vec<Vec<SnapshotImage>>,
    opened: Vec<Vec<SnapshotImage>>,
    closed: Vec<(String, String)>,
    next_handle: u64,
}

/// Recording fake of the image/logic daemon.
#[derive(Debug, Default)]
pub struct FakeImageService {
    state: Mutex<FakeState>,
}

impl FakeImageService {
    /// Create a fake with no recorded calls and no forced failures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the timestamp range of a CDP file; `None` marks it empty.
    pub fn set_cdp_range(&self, path: &Path, range: Option<(Timestamp, Timestamp)>) {
        self.state.lock().cdp_ranges.insert(path.to_path_buf(), range);
    }

    /// Force snapshot deletion to fail with the given raw code.
    pub fn fail_delete_snapshot_with(&self, raw_code: i64) {
        self.state.lock().delete_snapshot_failure = Some(raw_code);
    }

    /// Force CDP merges to fail with the given raw code.
    pub fn fail_merge_cdp_with(&self, raw_code: i64) {
        self.state.lock().merge_cdp_failure = Some(raw_code);
    }

    /// Force type-B merges to fail with the given raw code.
    pub fn fail_merge_type_b_with(&self, raw_code: i64) {
        self.state.lock().merge_type_b_failure = Some(raw_code);
    }

    /// Snapshot names deleted from QCOW files, in call order.
    pub fn deleted_qcow_snapshots(&self) -> Vec<String> {
        self.state.lock().deleted_snapshots.clone()
    }

    /// Recorded CDP merge requests.
    pub fn merge_cdp_requests(&self) -> Vec<MergeCdpRequest> {
        self.state.lock().merged_cdp.clone()
    }

    /// Recorded type-B merge requests.
    pub fn merge_type_b_requests(&self) -> Vec<MergeQcowTypeBRequest> {
        self.state.lock().merged_type_b.clone()
    }

    /// Recorded hash merges as `(src, dst)` pairs.
    pub fn hash_merges(&self) -> Vec<(PathBuf, PathBuf)> {
        self.state.lock().merged_hash.clone()
    }

    /// Number of create calls.
    pub fn create_count(&self) -> usize {
        self.state.lock().created.len()
    }

    /// Number of open calls.
    pub fn open_count(&self) -> usize {
        self.state.lock().opened.len()
    }

    /// Image lists passed to open calls.
    pub fn opened_images(&self) -> Vec<Vec<SnapshotImage>> {
        self.state.lock().opened.clone()
    }

    /// Handles passed to close calls.
    pub fn closed_handles(&self) -> Vec<(String, String)> {
        self.state.lock().closed.clone()
    }

    fn next_endpoint(state: &mut FakeState) -> (String, String) {
        state.next_handle += 1;
        (
            format!("raw-{}", state.next_handle),
            format!("endpoint-{}", state.next_handle),
        )
    }
}

impl ImageService for FakeImageService {
    fn create_disk_snapshot(
        &self,
        images: &[SnapshotImage],
        _disk_bytes: u64,
        _flag: &str,
    ) -> RpcResult<(String, String)> {
        let mut state = self.state.lock();
        state.created.push(images.to_vec());
        Ok(Self::next_endpoint(&mut state))
    }

    fn open_disk_snapshot(
        &self,
        images: &[SnapshotImage],
        _flag: &str,
    ) -> RpcResult<(String, String)> {
        let mut state = self.state.lock();
        state.opened.push(images.to_vec());
        Ok(Self::next_endpoint(&mut state))
    }

    fn close_disk_snapshot(&self, raw_handle: &str, endpoint: &str) -> RpcResult<()> {
        self.state
            .lock()
            .closed
            .push((raw_handle.to_string(), endpoint.to_string()));
        Ok(())
    }

    fn delete_snapshot_in_qcow_file(&self, path: &Path, snapshot_name: &str) -> RpcResult<()> {
        let mut state = self.state.lock();
        if let Some(code) = state.delete_snapshot_failure {
            return Err(ImageRpcError::new(
                code,
                format!("delete {snapshot_name} in {} refused", path.display()),
            ));
        }
        state.deleted_snapshots.push(snapshot_name.to_string());
        Ok(())
    }

    fn query_cdp_file_timestamp_range(
        &self,
        path: &Path,
        _discard_dirty: bool,
    ) -> RpcResult<(Timestamp, Timestamp)> {
        let state = self.state.lock();
        match state.cdp_ranges.get(path) {
            Some(Some(range)) => Ok(*range),
            _ => Err(ImageRpcError::new(
                CDP_FILE_NO_CONTENT,
                format!("{} has no content", path.display()),
            )),
        }
    }

    fn query_cdp_file_timestamp(
        &self,
        _path: &Path,
        timestamp: Timestamp,
        _seek: CdpSeek,
    ) -> RpcResult<Timestamp> {
        Ok(timestamp)
    }

    fn format_cdp_file_timestamp(&self, timestamp: Timestamp) -> RpcResult<String> {
        Ok(timestamp.to_string())
    }

    fn merge_cdp_to_qcow(&self, request: &MergeCdpRequest) -> RpcResult<()> {
        let mut state = self.state.lock();
        if let Some(code) = state.merge_cdp_failure {
            return Err(ImageRpcError::new(code, "cdp merge refused"));
        }
        state.merged_cdp.push(request.clone());
        Ok(())
    }

    fn merge_qcow_hash_file(&self, src: &Path, dst: &Path, _disk_bytes: u64) -> RpcResult<()> {
        self.state
            .lock()
            .merged_hash
            .push((src.to_path_buf(), dst.to_path_buf()));
        Ok(())
    }

    fn merge_qcow_snapshot_type_b(&self, request: &MergeQcowTypeBRequest) -> RpcResult<()> {
        let mut state = self.state.lock();
        if let Some(code) = state.merge_type_b_failure {
            return Err(ImageRpcError::new(code, "type-b merge refused"));
        }
        state.merged_type_b.push(request.clone());
        Ok(())
    }
}
