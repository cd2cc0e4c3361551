//! Per-root lockers
//!
//! All metadata mutation for a root must run under its locker; IO inside
//! the critical section is restricted to the catalog. Each locker tracks
//! the identities of callers currently holding or waiting on it, so a
//! caller re-entering its own lock is detected instead of deadlocking.
//!
//! The registry itself is guarded by a reader/writer lock; new roots
//! register a locker on creation and deregister on invalidation.

use parking_lot::{Condvar, Mutex, RwLock};
use snaptree_core::{Error, Result, RootIdent};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct LockState {
    locked: bool,
    callers: HashSet<String>,
}

/// Exclusive lock for one root, with caller identity tracking.
#[derive(Debug, Default)]
struct RootLocker {
    state: Mutex<LockState>,
    unlocked: Condvar,
}

impl RootLocker {
    fn acquire(self: &Arc<Self>, root: RootIdent, caller: &str) -> Result<RootLockGuard> {
        let mut state = self.state.lock();
        if state.callers.contains(caller) {
            return Err(Error::StorageLockerRepeatGet {
                root,
                caller: caller.to_string(),
            });
        }
        state.callers.insert(caller.to_string());
        while state.locked {
            self.unlocked.wait(&mut state);
        }
        state.locked = true;
        drop(state);
        Ok(RootLockGuard {
            locker: Arc::clone(self),
            root,
            caller: caller.to_string(),
        })
    }

    fn release(&self, caller: &str) {
        let mut state = self.state.lock();
        state.locked = false;
        state.callers.remove(caller);
        drop(state);
        self.unlocked.notify_one();
    }
}

/// RAII guard for a held root locker; releases on every exit path.
#[must_use = "dropping the guard releases the root locker"]
pub struct RootLockGuard {
    locker: Arc<RootLocker>,
    root: RootIdent,
    caller: String,
}

impl RootLockGuard {
    /// The root this guard locks.
    pub fn root(&self) -> RootIdent {
        self.root
    }
}

impl Drop for RootLockGuard {
    fn drop(&mut self) {
        self.locker.release(&self.caller);
    }
}

impl std::fmt::Debug for RootLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootLockGuard")
            .field("root", &self.root)
            .field("caller", &self.caller)
            .finish()
    }
}

/// Registry of per-root lockers.
#[derive(Debug, Default)]
pub struct RootLockerManager {
    lockers: RwLock<HashMap<RootIdent, Arc<RootLocker>>>,
}

impl RootLockerManager {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the locker of a root, blocking until it is free.
    ///
    /// Fails with `StorageLockerNotExist` when the root is unknown and with
    /// `StorageLockerRepeatGet` when the caller already holds or awaits the
    /// locker. Acquisition is not cancellable; callers wrap with a timeout
    /// if they need one.
    pub fn acquire(&self, root: RootIdent, caller: &str) -> Result<RootLockGuard> {
        let locker = {
            let lockers = self.lockers.read();
            lockers
                .get(&root)
                .cloned()
                .ok_or(Error::StorageLockerNotExist { root })?
        };
        locker.acquire(root, caller)
    }

    /// Register a locker for a newly created root.
    pub fn add_locker(&self, root: RootIdent) {
        let mut lockers = self.lockers.write();
        if lockers.contains_key(&root) {
            debug!(%root, "repeat add locker");
            return;
        }
        lockers.insert(root, Arc::new(RootLocker::default()));
        info!(%root, "add locker");
    }

    /// Deregister the locker of an invalidated root.
    pub fn remove_locker(&self, root: RootIdent) {
        let removed = self.lockers.write().remove(&root);
        let Some(locker) = removed else { return };
        let state = locker.state.lock();
        if !state.callers.is_empty() {
            warn!(%root, callers = ?state.callers, "callers not empty when removing locker");
        }
        drop(state);
        info!(%root, "remove locker");
    }

    /// Whether a locker is registered for the root.
    pub fn contains(&self, root: RootIdent) -> bool {
        self.lockers.read().contains_key(&root)
    }
}
