//! Unified error type
//!
//! All public engine APIs return [`Result`]. Variants fall into four
//! categories:
//!
//! - **Validation**: bad request payload; surfaced with a distinguished
//!   transport status, never retried.
//! - **Domain**: the snapshot-engine error taxonomy (`HostSnapshotInvalid`,
//!   `StorageLockerRepeatGet`, ...). Surfaced to the caller and logged once
//!   at the service boundary.
//! - **External**: failures reported by the image/logic daemon, wrapped with
//!   a per-operation code. A `-2` from snapshot deletion means "in use" and
//!   is retryable.
//! - **Internal**: unexpected failure; logged with context and surfaced as a
//!   generic error.

use crate::types::{HostSnapshotIdent, RootIdent, StorageIdent};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for snaptree operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Transport status for generic failures.
pub const STATUS_DEFAULT: u16 = 555;
/// Transport status for validation failures.
pub const STATUS_VALIDATION: u16 = 556;

/// Operation code: generic failure.
pub const CODE_FAILED: i32 = 5001;
/// Operation code: deleting a snapshot inside a QCOW file failed.
pub const CODE_DELETE_DISK_SNAPSHOT_FAILED: i32 = 5002;
/// Operation code: querying a CDP file's timestamp range failed.
pub const CODE_QUERY_CDP_TIMESTAMP_RANGE_FAILED: i32 = 5003;

/// Raw daemon code meaning "snapshot is in use, retry later".
pub const RAW_CODE_SNAPSHOT_IN_USE: i64 = -2;

/// Error type for the snaptree engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad request payload.
    #[error("validation error: {message}")]
    Validation {
        /// What is wrong with the request.
        message: String,
    },

    /// The host snapshot is flagged invalid, or the requested timestamp
    /// falls outside its interval.
    #[error("host snapshot {ident} not available: {debug}")]
    HostSnapshotInvalid {
        /// The host snapshot in question.
        ident: HostSnapshotIdent,
        /// Developer-facing detail.
        debug: String,
    },

    /// No readable storage backs the requested disk snapshot.
    #[error("disk snapshot storage not available: {debug}")]
    DiskSnapshotStorageInvalid {
        /// Developer-facing detail.
        debug: String,
    },

    /// No locker is registered for the root.
    #[error("storage locker for root {root} does not exist")]
    StorageLockerNotExist {
        /// The unknown root.
        root: RootIdent,
    },

    /// The caller already holds (or is waiting on) the root locker.
    #[error("storage locker for root {root} repeatedly acquired by {caller}")]
    StorageLockerRepeatGet {
        /// The root whose locker was re-entered.
        root: RootIdent,
        /// The offending caller identity.
        caller: String,
    },

    /// The path does not lie under any mounted storage directory.
    #[error("path {path:?} not in a valid storage directory")]
    StorageDirectoryInvalid {
        /// The rejected path.
        path: PathBuf,
    },

    /// A second writer reservation was attempted on the same image file.
    #[error("image file {path:?} is already being written")]
    StorageReferenceRepeated {
        /// The contended image file.
        path: PathBuf,
    },

    /// A required storage file is missing on disk.
    #[error("storage file {path:?} does not exist")]
    StorageImageFileNotExist {
        /// The missing file.
        path: PathBuf,
    },

    /// An identifier that must be unique is already registered.
    #[error("ident {ident} already registered")]
    TaskIdentDuplicate {
        /// The duplicated identifier.
        ident: String,
    },

    /// Failure reported by the image/logic daemon.
    #[error("image service operation {operation} failed (code {code}, raw {raw_code}): {message}")]
    External {
        /// Name of the daemon operation.
        operation: &'static str,
        /// Fixed per-operation code from the error table.
        code: i32,
        /// Raw code returned by the daemon.
        raw_code: i64,
        /// Daemon-provided detail.
        message: String,
    },

    /// Unexpected internal failure.
    #[error("internal error: {message}")]
    Internal {
        /// What went wrong.
        message: String,
    },
}

impl Error {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    /// Create a `HostSnapshotInvalid` error.
    pub fn host_snapshot_invalid(ident: HostSnapshotIdent, debug: impl Into<String>) -> Self {
        Error::HostSnapshotInvalid {
            ident,
            debug: debug.into(),
        }
    }

    /// Create a `DiskSnapshotStorageInvalid` error.
    pub fn disk_snapshot_storage_invalid(debug: impl Into<String>) -> Self {
        Error::DiskSnapshotStorageInvalid {
            debug: debug.into(),
        }
    }

    /// Create an `External` error from a daemon failure.
    pub fn external(
        operation: &'static str,
        code: i32,
        raw_code: i64,
        message: impl Into<String>,
    ) -> Self {
        Error::External {
            operation,
            code,
            raw_code,
            message: message.into(),
        }
    }

    /// Create an `Internal` error.
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Create a `TaskIdentDuplicate` error for a storage ident.
    pub fn duplicate_ident(ident: StorageIdent) -> Self {
        Error::TaskIdentDuplicate {
            ident: ident.to_string(),
        }
    }

    /// Whether this is a validation error (fix the input, do not retry).
    pub fn is_validation_error(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }

    /// Whether this error belongs to the domain taxonomy.
    pub fn is_domain_error(&self) -> bool {
        matches!(
            self,
            Error::HostSnapshotInvalid { .. }
                | Error::DiskSnapshotStorageInvalid { .. }
                | Error::StorageLockerNotExist { .. }
                | Error::StorageLockerRepeatGet { .. }
                | Error::StorageDirectoryInvalid { .. }
                | Error::StorageReferenceRepeated { .. }
                | Error::StorageImageFileNotExist { .. }
                | Error::TaskIdentDuplicate { .. }
        )
    }

    /// Whether the operation may succeed if retried later.
    ///
    /// Only the daemon's "snapshot in use" answer qualifies; everything else
    /// requires an input or state change first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::External { raw_code, .. } if *raw_code == RAW_CODE_SNAPSHOT_IN_USE
        )
    }

    /// Status reported on the wire for this error.
    pub fn transport_status(&self) -> u16 {
        match self {
            Error::Validation { .. } => STATUS_VALIDATION,
            _ => STATUS_DEFAULT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_status() {
        let e = Error::validation("missing token");
        assert!(e.is_validation_error());
        assert!(!e.is_domain_error());
        assert_eq!(e.transport_status(), STATUS_VALIDATION);
    }

    #[test]
    fn test_domain_errors_use_default_status() {
        let e = Error::StorageLockerNotExist {
            root: RootIdent::new(),
        };
        assert!(e.is_domain_error());
        assert_eq!(e.transport_status(), STATUS_DEFAULT);
    }

    #[test]
    fn test_in_use_is_retryable() {
        let in_use = Error::external(
            "delete_snapshot_in_qcow_file",
            CODE_DELETE_DISK_SNAPSHOT_FAILED,
            RAW_CODE_SNAPSHOT_IN_USE,
            "snapshot busy",
        );
        let fatal = Error::external(
            "delete_snapshot_in_qcow_file",
            CODE_DELETE_DISK_SNAPSHOT_FAILED,
            1,
            "io error",
        );
        assert!(in_use.is_retryable());
        assert!(!fatal.is_retryable());
        assert!(!Error::internal("boom").is_retryable());
    }

    #[test]
    fn test_display_contains_context() {
        let e = Error::StorageReferenceRepeated {
            path: PathBuf::from("/mnt/storage/a.qcow"),
        };
        assert!(e.to_string().contains("a.qcow"));

        let e = Error::external("query_cdp_file_timestamp_range", 5003, 7, "bad file");
        let shown = e.to_string();
        assert!(shown.contains("query_cdp_file_timestamp_range"));
        assert!(shown.contains("5003"));
    }
}
