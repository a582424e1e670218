//! Entries hidden by an optimistic delete that has not committed yet

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
pub struct PendingDeletions {
    ids: Arc<Mutex<HashSet<i64>>>,
}

impl PendingDeletions {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<i64>> {
        self.ids.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns false if the id was already pending.
    pub fn insert(&self, id: i64) -> bool {
        self.lock().insert(id)
    }

    pub fn remove(&self, id: i64) -> bool {
        self.lock().remove(&id)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.lock().contains(&id)
    }
}
