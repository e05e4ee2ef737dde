//! Handle table mapping opaque session handles to shared session state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

/// Opaque, process-unique session identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u64);

impl Handle {
    /// Rebuild a handle from the number a host handed back over IPC.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Arena of entries keyed by [`Handle`].
///
/// Handles come from a monotonically increasing counter starting at 1, so a
/// value is never issued twice even after its entry is forgotten.
pub struct Registry<T> {
    entries: Mutex<HashMap<Handle, Arc<T>>>,
    next_id: AtomicU64,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a fresh handle, build the entry for it and store it. The
    /// entry resolves as soon as this returns.
    pub fn register(&self, build: impl FnOnce(Handle) -> T) -> (Handle, Arc<T>) {
        let handle = Handle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(build(handle));
        self.lock().insert(handle, Arc::clone(&entry));
        (handle, entry)
    }

    pub fn resolve(&self, handle: Handle) -> Option<Arc<T>> {
        self.lock().get(&handle).cloned()
    }

    /// Drop the registry's reference to an entry.
    pub fn forget(&self, handle: Handle) -> Option<Arc<T>> {
        self.lock().remove(&handle)
    }

    /// Remove every entry matching `predicate`, returning how many went.
    pub fn forget_where(&self, mut predicate: impl FnMut(&T) -> bool) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !predicate(&**entry));
        before - entries.len()
    }

    /// All registered handles in ascending order.
    pub fn handles(&self) -> Vec<Handle> {
        let mut handles: Vec<Handle> = self.lock().keys().copied().collect();
        handles.sort();
        handles
    }

    pub fn entries(&self) -> Vec<Arc<T>> {
        self.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Handle, Arc<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}
