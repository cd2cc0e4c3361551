//! Reclamation engine
//!
//! Per-root scanner that deletes or merges obsolete storage while never
//! breaking live references. One *collect pass* over a root:
//!
//! 1. Under the root locker, in one catalog transaction, analyse the tree
//!    and produce a work list (marking selected storages `Recycling`).
//! 2. Release the locker and execute the work against files and the image
//!    daemon.
//! 3. Re-enter the locker and commit every work result in a single
//!    transaction.
//!
//! Work items never raise from `work()`; they record success and let the
//!    commit phase translate it into status transitions. A failed commit
//! leaves the `Recycling` markers in place for the next pass.

mod collector;
mod works;

pub use collector::StorageCollector;
