//! The seam to the external broadcast layer.
//!
//! The driver only ever writes through [`Broadcast`]. It does not know the
//! transport; an EPICS gateway, a file, or an in-memory table all fit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use bss_core::PublishError;

pub trait Broadcast: Send {
    /// Writes one field.
    fn publish(&mut self, handle: &str, value: &str) -> Result<(), PublishError>;

    /// Writes many fields, continuing past failures. One result per write,
    /// in input order.
    fn publish_many(&mut self, writes: &[(String, String)]) -> Vec<Result<(), PublishError>> {
        writes
            .iter()
            .map(|(handle, value)| self.publish(handle, value))
            .collect()
    }

    /// Values the layer already holds, handle → value. Empty when the layer
    /// cannot tell.
    fn current(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

#[derive(Debug, Default)]
struct Table {
    values: BTreeMap<String, String>,
    writes: Vec<(String, String)>,
    rejected: BTreeSet<String>,
    unreachable: bool,
}

/// In-process broadcast table. Clones share the same table, so a caller can
/// hand one clone to the driver and inspect another.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroadcast {
    table: Arc<Mutex<Table>>,
}

impl MemoryBroadcast {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Table>, PublishError> {
        self.table
            .lock()
            .map_err(|_| PublishError::Unreachable("memory table poisoned".to_owned()))
    }

    /// Current value of `handle`.
    pub fn get(&self, handle: &str) -> Option<String> {
        self.lock().ok()?.values.get(handle).cloned()
    }

    pub fn values(&self) -> BTreeMap<String, String> {
        self.lock().map(|t| t.values.clone()).unwrap_or_default()
    }

    /// Every accepted write since creation or the last [`Self::clear_writes`].
    pub fn writes(&self) -> Vec<(String, String)> {
        self.lock().map(|t| t.writes.clone()).unwrap_or_default()
    }

    pub fn clear_writes(&self) {
        if let Ok(mut t) = self.lock() {
            t.writes.clear();
        }
    }

    /// Refuse future writes to `handle` until [`Self::accept`] is called.
    pub fn reject(&self, handle: &str) {
        if let Ok(mut t) = self.lock() {
            t.rejected.insert(handle.to_owned());
        }
    }

    pub fn accept(&self, handle: &str) {
        if let Ok(mut t) = self.lock() {
            t.rejected.remove(handle);
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        if let Ok(mut t) = self.lock() {
            t.unreachable = unreachable;
        }
    }
}

impl Broadcast for MemoryBroadcast {
    fn publish(&mut self, handle: &str, value: &str) -> Result<(), PublishError> {
        let mut t = self.lock()?;
        if t.unreachable {
            return Err(PublishError::Unreachable("memory table offline".to_owned()));
        }
        if t.rejected.contains(handle) {
            return Err(PublishError::Rejected {
                handle: handle.to_owned(),
                reason: "write refused".to_owned(),
            });
        }
        t.values.insert(handle.to_owned(), value.to_owned());
        t.writes.push((handle.to_owned(), value.to_owned()));
        Ok(())
    }

    fn current(&self) -> BTreeMap<String, String> {
        self.values()
    }
}
