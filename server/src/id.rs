//! Sequential id allocation with free-list reuse.

use parking_lot::Mutex;
use std::collections::HashSet;

/// Allocates monotonically increasing u32 ids starting at 1, preferring to
/// reclaim ids previously marked reusable. Zero is reserved as "absent".
#[derive(Debug, Default)]
pub struct IdAllocator {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    current: u32,
    reusable: HashSet<u32>,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a reusable id if any is available, otherwise the next fresh id.
    /// The order in which reusable ids are handed back is unspecified.
    pub fn next(&self) -> u32 {
        let mut inner = self.inner.lock();
        if let Some(&id) = inner.reusable.iter().next() {
            inner.reusable.remove(&id);
            return id;
        }
        inner.current += 1;
        inner.current
    }

    /// Marks an id as reusable. Reusable ids are handed out in priority over
    /// fresh ones.
    pub fn reuse(&self, id: u32) {
        self.inner.lock().reusable.insert(id);
    }
}
