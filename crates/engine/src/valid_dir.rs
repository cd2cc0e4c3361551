//! Valid storage directory gate
//!
//! Every storage file must lie under a mounted storage directory. Mounting
//! and health checks belong to other components; this service only records
//! which directories are currently valid and answers containment queries.
//!
//! Mutations are exclusive; queries are shared-read and memoized in a
//! bounded cache that is invalidated on every mutation.

use parking_lot::{Mutex, RwLock};
use snaptree_core::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

const CACHE_CAPACITY: usize = 100 * 1024;

/// Process-wide set of valid storage directories.
#[derive(Debug, Default)]
pub struct ValidDirectories {
    directories: RwLock<HashSet<PathBuf>>,
    cache: Mutex<HashMap<PathBuf, bool>>,
}

impl ValidDirectories {
    /// Create an empty gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a storage directory.
    ///
    /// The directory must be absolute and at least three levels deep:
    /// mount roots like `/mnt` are never valid storage directories.
    pub fn add_directory(&self, directory: impl Into<PathBuf>) -> Result<()> {
        let directory = directory.into();
        if !directory.is_absolute() || directory.components().count() <= 3 {
            return Err(Error::validation(format!(
                "{} is not a usable storage directory",
                directory.display()
            )));
        }
        self.directories.write().insert(directory);
        self.cache.lock().clear();
        Ok(())
    }

    /// Deregister a storage directory. Unknown directories are ignored.
    pub fn remove_directory(&self, directory: impl AsRef<Path>) {
        self.directories.write().remove(directory.as_ref());
        self.cache.lock().clear();
    }

    /// Whether the file path lies under any valid directory.
    pub fn is_include(&self, path: &Path) -> bool {
        {
            let mut cache = self.cache.lock();
            if let Some(hit) = cache.get(path) {
                return *hit;
            }
            if cache.len() >= CACHE_CAPACITY {
                cache.clear();
            }
        }
        let answer = {
            let directories = self.directories.read();
            directories.iter().any(|d| path.starts_with(d))
        };
        self.cache.lock().insert(path.to_path_buf(), answer);
        answer
    }

    /// Check a file path, erroring with `StorageDirectoryInvalid` when it
    /// lies outside every valid directory.
    pub fn check_path(&self, path: &Path) -> Result<()> {
        debug_assert!(path.is_absolute());
        if self.is_include(path) {
            Ok(())
        } else {
            Err(Error::StorageDirectoryInvalid {
                path: path.to_path_buf(),
            })
        }
    }
}
