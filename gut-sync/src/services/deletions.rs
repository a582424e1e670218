/// Deferred Deletes
/// Optimistic deletion with an undo window. The entry is hidden at once;
/// the real delete runs through the coordinator when the window elapses.
use super::scheduler::{Scheduler, TaskHandle};
use crate::sync::{SyncContext, SyncCoordinator};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

type Handles = Arc<Mutex<HashMap<i64, TaskHandle>>>;

fn lock(handles: &Handles) -> MutexGuard<'_, HashMap<i64, TaskHandle>> {
    handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct DeferredDeletes {
    coordinator: SyncCoordinator,
    scheduler: Arc<dyn Scheduler>,
    window: Duration,
    context: watch::Receiver<SyncContext>,
    handles: Handles,
}

impl DeferredDeletes {
    pub fn new(
        coordinator: SyncCoordinator,
        scheduler: Arc<dyn Scheduler>,
        window: Duration,
        context: watch::Receiver<SyncContext>,
    ) -> Self {
        Self {
            coordinator,
            scheduler,
            window,
            context,
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Hide the entry and schedule its deletion. Returns false if a delete
    /// is already pending for it.
    pub fn request(&self, id: i64) -> bool {
        if !self.coordinator.pending().insert(id) {
            return false;
        }

        let coordinator = self.coordinator.clone();
        let context = self.context.clone();
        let handles = Arc::clone(&self.handles);

        let task = async move {
            lock(&handles).remove(&id);

            // Context at commit time, not at request time
            let ctx = *context.borrow();
            match coordinator.delete_entry(ctx, id).await {
                Ok(removed) => tracing::debug!("Deferred delete of entry {} committed ({})", id, removed),
                Err(e) => tracing::error!("Deferred delete of entry {} failed: {}", id, e),
            }
            coordinator.pending().remove(id);
        }
        .boxed();

        // Held across scheduling so the task cannot look for its handle first
        let mut handles = lock(&self.handles);
        let handle = self.scheduler.schedule(self.window, task);
        handles.insert(id, handle);
        drop(handles);

        tracing::debug!("Entry {} pending delete for {:?}", id, self.window);
        true
    }

    /// Cancel a pending delete and make the entry visible again.
    /// Returns false once the delete has started or if none was pending.
    pub fn undo(&self, id: i64) -> bool {
        let Some(handle) = lock(&self.handles).remove(&id) else {
            return false;
        };
        if !handle.cancel() {
            return false;
        }

        self.coordinator.pending().remove(id);
        tracing::debug!("Delete of entry {} undone", id);
        true
    }

    pub fn is_pending(&self, id: i64) -> bool {
        self.coordinator.pending().contains(id)
    }
}
