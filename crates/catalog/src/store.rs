//! Catalog: published snapshots plus serialized transactions

use crate::tables::Tables;
use parking_lot::{Mutex, RwLock};
use snaptree_core::Result;
use std::sync::Arc;

/// Transactional metadata store.
///
/// Readers take cheap `Arc` snapshots of the current table set and never
/// block. Writers run one at a time: a transaction clones the tables,
/// mutates the clone, and swaps it in atomically when the closure succeeds.
#[derive(Debug, Default)]
pub struct Catalog {
    current: RwLock<Arc<Tables>>,
    commit_lock: Mutex<()>,
}

impl Catalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// An immutable snapshot of all tables.
    pub fn snapshot(&self) -> Arc<Tables> {
        self.current.read().clone()
    }

    /// Run a transaction.
    ///
    /// All mutations inside the closure become visible atomically when it
    /// returns `Ok`; an `Err` discards every mutation. Transactions are
    /// serialized, so the closure observes the latest committed state.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let _commit = self.commit_lock.lock();
        let mut draft = Tables::clone(&self.current.read());
        let value = f(&mut draft)?;
        *self.current.write() = Arc::new(draft);
        Ok(value)
    }
}
