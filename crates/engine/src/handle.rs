//! Handle pool
//!
//! Maps opaque external handles to an acquired chain plus the raw handle
//! and endpoint returned by the image daemon. Open registers, close pops;
//! a handle that is still registered when the pool is torn down indicates
//! an owner that never closed, and its chain is released with a warning.

use crate::chain::AcquiredChain;
use dashmap::DashMap;
use snaptree_core::{Error, Result};
use tracing::warn;

/// Result of an open or create operation, as returned on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOutcome {
    /// The caller-visible handle registered in the pool.
    pub handle: String,
    /// Raw handle returned by the image daemon.
    pub raw_handle: String,
    /// Opaque endpoint the caller performs IO against.
    pub endpoint: String,
}

#[derive(Debug)]
struct HandleEntry {
    chain: AcquiredChain,
    raw_handle: String,
    endpoint: String,
}

/// Registry of open handles.
#[derive(Debug, Default)]
pub struct HandleManager {
    entries: DashMap<String, HandleEntry>,
}

impl HandleManager {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail with `TaskIdentDuplicate` when the handle is already in use.
    pub fn ensure_vacant(&self, handle: &str) -> Result<()> {
        if self.entries.contains_key(handle) {
            return Err(Error::TaskIdentDuplicate {
                ident: handle.to_string(),
            });
        }
        Ok(())
    }

    /// Register an opened chain under a handle.
    ///
    /// The chain is released before erroring when the handle is taken.
    pub fn register(
        &self,
        handle: &str,
        chain: AcquiredChain,
        raw_handle: String,
        endpoint: String,
    ) -> Result<()> {
        match self.entries.entry(handle.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                chain.release();
                Err(Error::TaskIdentDuplicate {
                    ident: handle.to_string(),
                })
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(HandleEntry {
                    chain,
                    raw_handle,
                    endpoint,
                });
                Ok(())
            }
        }
    }

    /// Remove a handle, returning its chain and endpoint for closing.
    pub fn pop(&self, handle: &str) -> Result<(AcquiredChain, String, String)> {
        let (_, entry) = self
            .entries
            .remove(handle)
            .ok_or_else(|| Error::validation(format!("handle {handle} does not exist")))?;
        Ok((entry.chain, entry.raw_handle, entry.endpoint))
    }

    /// Number of registered handles.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no handles are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for HandleManager {
    fn drop(&mut self) {
        for entry in self.entries.iter() {
            warn!(handle = %entry.key(), "handle dropped without close");
        }
    }
}
