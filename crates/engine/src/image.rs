//! Image/logic daemon interface
//!
//! The engine never touches image file contents itself; it drives a
//! synchronous RPC daemon through [`ImageService`]. Implementations speak
//! whatever transport the deployment uses; the engine only sees raw result
//! codes, which [`crate::actions::StorageActions`] translates into the
//! domain error taxonomy.

use snaptree_core::Timestamp;
use std::fmt;
use std::path::{Path, PathBuf};

/// Raw daemon code: the CDP file holds no usable content.
///
/// Translated to an empty timestamp range rather than surfaced as an error.
pub const CDP_FILE_NO_CONTENT: i64 = 0x1A;

/// Failure reported by the daemon, before domain translation.
#[derive(Debug, Clone)]
pub struct ImageRpcError {
    /// Raw code from the daemon.
    pub raw_code: i64,
    /// Daemon-provided detail.
    pub message: String,
}

impl ImageRpcError {
    /// Create an error with a raw code and message.
    pub fn new(raw_code: i64, message: impl Into<String>) -> Self {
        Self {
            raw_code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ImageRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "raw code {}: {}", self.raw_code, self.message)
    }
}

impl std::error::Error for ImageRpcError {}

/// Result of a raw daemon call.
pub type RpcResult<T> = std::result::Result<T, ImageRpcError>;

/// Seek direction for CDP timestamp correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CdpSeek {
    /// Snap to the next recorded instant at or after the requested one.
    Forwards,
    /// Snap to the last recorded instant at or before the requested one.
    Backwards,
}

/// One openable image: a file plus the snapshot selector within it.
///
/// For QCOW files the selector is the snapshot name; for CDP files it is a
/// formatted timestamp range (`all`, `$~t`, `t~$` or `a~b`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotImage {
    /// Image file path.
    pub file_path: PathBuf,
    /// Snapshot name or formatted CDP range.
    pub snapshot_name: String,
}

/// Parameters for folding a run of CDP files into a QCOW snapshot.
#[derive(Debug, Clone)]
pub struct MergeCdpRequest {
    /// Virtual disk size shared by every participant.
    pub disk_bytes: u64,
    /// The CDP files being folded, oldest first.
    pub cdp_files: Vec<PathBuf>,
    /// Hash file of the merge target, absent under a no-hash policy.
    pub new_snapshot_hash_path: Option<PathBuf>,
    /// Images of the read/write chain ending in the merge target.
    pub rw_chain_images: Vec<SnapshotImage>,
}

/// Parameters for moving one QCOW snapshot into its parent's file.
#[derive(Debug, Clone)]
pub struct MergeQcowTypeBRequest {
    /// Virtual disk size shared by every participant.
    pub disk_bytes: u64,
    /// File receiving the merged data.
    pub new_file: PathBuf,
    /// Snapshot name of the merge target.
    pub new_ident: String,
    /// Full hash file of the merge target, if any.
    pub new_full_hash_path: Option<PathBuf>,
    /// Incremental hash file of the merge target, if any.
    pub new_inc_hash_path: Option<PathBuf>,
    /// File the merged snapshot currently lives in.
    pub current_file: PathBuf,
    /// Snapshot name of the merged snapshot.
    pub current_ident: String,
    /// Full hash file of the merged snapshot, if any.
    pub current_full_hash_path: Option<PathBuf>,
    /// Incremental hash file of the merged snapshot, if any.
    pub current_inc_hash_path: Option<PathBuf>,
    /// File of the snapshot preceding the merge target.
    pub prev_file: PathBuf,
    /// Snapshot name of the preceding snapshot.
    pub prev_ident: String,
}

/// Synchronous façade over the external image/logic daemon.
///
/// Every method blocks on the remote call. Methods must only be invoked
/// outside the root locker; the reclamation engine executes them from work
/// items after releasing the critical section.
pub trait ImageService: Send + Sync {
    /// Create the tail image of a write chain and open the whole chain.
    /// Returns the raw handle and the opaque endpoint.
    fn create_disk_snapshot(
        &self,
        images: &[SnapshotImage],
        disk_bytes: u64,
        flag: &str,
    ) -> RpcResult<(String, String)>;

    /// Open a read chain. Returns the raw handle and the opaque endpoint.
    fn open_disk_snapshot(&self, images: &[SnapshotImage], flag: &str)
        -> RpcResult<(String, String)>;

    /// Close a previously opened chain.
    fn close_disk_snapshot(&self, raw_handle: &str, endpoint: &str) -> RpcResult<()>;

    /// Delete one snapshot inside a QCOW file.
    ///
    /// Raw code `-2` means the snapshot is in use and the call may be
    /// retried later.
    fn delete_snapshot_in_qcow_file(&self, path: &Path, snapshot_name: &str) -> RpcResult<()>;

    /// Timestamp range recorded in a CDP file.
    ///
    /// Raw code [`CDP_FILE_NO_CONTENT`] means the file has no usable data.
    fn query_cdp_file_timestamp_range(
        &self,
        path: &Path,
        discard_dirty: bool,
    ) -> RpcResult<(Timestamp, Timestamp)>;

    /// Snap a logical timestamp to one actually recorded in the CDP file.
    fn query_cdp_file_timestamp(
        &self,
        path: &Path,
        timestamp: Timestamp,
        seek: CdpSeek,
    ) -> RpcResult<Timestamp>;

    /// Render a timestamp in the daemon's CDP selector syntax.
    fn format_cdp_file_timestamp(&self, timestamp: Timestamp) -> RpcResult<String>;

    /// Fold a run of CDP files into the tail of a read/write chain.
    fn merge_cdp_to_qcow(&self, request: &MergeCdpRequest) -> RpcResult<()>;

    /// Merge an incremental hash file into another.
    fn merge_qcow_hash_file(&self, src: &Path, dst: &Path, disk_bytes: u64) -> RpcResult<()>;

    /// Move a snapshot's data across QCOW files into the merge target.
    fn merge_qcow_snapshot_type_b(&self, request: &MergeQcowTypeBRequest) -> RpcResult<()>;
}
