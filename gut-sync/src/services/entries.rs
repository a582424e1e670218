//! Entries service
//!
//! The facade the rest of the application uses for entry CRUD. Owns the
//! published `SyncContext` and hides which mode is active.

use super::deletions::DeferredDeletes;
use super::scheduler::Scheduler;
use crate::config::DEFAULT_TIMELINE_LIMIT;
use crate::database::{Entry, Payload, SyncState};
use crate::error::Result;
use crate::remote::ImageUpload;
use crate::sync::{
    spawn_sync_loop, ClaimReport, SaveOutcome, SyncContext, SyncCoordinator, SyncLoopHandle,
    SyncReport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Service for managing entries
#[derive(Clone)]
pub struct EntryRepository {
    coordinator: SyncCoordinator,
    context: Arc<watch::Sender<SyncContext>>,
    deletes: Arc<DeferredDeletes>,
    timeline_limit: u32,
}

impl EntryRepository {
    pub fn new(
        coordinator: SyncCoordinator,
        scheduler: Arc<dyn Scheduler>,
        undo_window: Duration,
    ) -> Self {
        let (context, receiver) = watch::channel(SyncContext::local());
        let deletes = DeferredDeletes::new(coordinator.clone(), scheduler, undo_window, receiver);

        Self {
            coordinator,
            context: Arc::new(context),
            deletes: Arc::new(deletes),
            timeline_limit: DEFAULT_TIMELINE_LIMIT,
        }
    }

    pub fn with_timeline_limit(mut self, limit: u32) -> Self {
        self.timeline_limit = limit;
        self
    }

    /// Current context snapshot
    pub fn context(&self) -> SyncContext {
        *self.context.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncContext> {
        self.context.subscribe()
    }

    fn publish(&self, ctx: SyncContext) {
        self.context.send_replace(ctx);
    }

    /// Check the session, publish the mode and claim anonymous entries.
    /// Must complete before the timeline is first shown.
    pub async fn initialize(&self) -> Result<SyncContext> {
        tracing::info!("Initializing entry repository");

        let ctx = self.coordinator.detect_mode().await?.with_online(self.context().online);
        self.publish(ctx);

        let claimed = self.coordinator.claim_anonymous(ctx).await?;
        self.log_claim(claimed);

        Ok(ctx)
    }

    /// Re-read the session; a fresh login claims anonymous entries.
    pub async fn refresh_auth(&self) -> Result<SyncContext> {
        let before = self.context();
        let after = self.coordinator.refresh_auth(before).await?;
        self.publish(after);

        let new_login =
            after.authenticated && (!before.authenticated || before.user_id != after.user_id);
        if new_login {
            tracing::info!("User {} signed in", after.user_id);
            let claimed = self.coordinator.claim_anonymous(after).await?;
            self.log_claim(claimed);
        }

        Ok(after)
    }

    fn log_claim(&self, report: ClaimReport) {
        if report.claimed > 0 {
            tracing::info!(
                "Claimed {} anonymous entries, {} pushed",
                report.claimed,
                report.synced
            );
        }
    }

    /// Connectivity changes; going online wakes the background loop.
    pub fn set_online(&self, online: bool) {
        self.context.send_modify(|ctx| *ctx = ctx.with_online(online));
    }

    pub fn logout(&self) {
        tracing::info!("Signing out");
        self.context.send_modify(|ctx| *ctx = ctx.logged_out());
    }

    /// Unsaved entry owned by the current user
    pub fn new_entry(&self, event_at: impl Into<String>, payload: Payload) -> Entry {
        Entry::new(self.context().user_id, event_at, payload)
    }

    pub async fn get_entries(&self, limit: u32) -> Result<Vec<Entry>> {
        self.coordinator.get_entries(self.context(), limit).await
    }

    /// Timeline with the configured default limit
    pub async fn timeline(&self) -> Result<Vec<Entry>> {
        self.get_entries(self.timeline_limit).await
    }

    pub async fn get_entry(&self, id: i64) -> Result<Option<Entry>> {
        self.coordinator.get_entry(self.context(), id).await
    }

    pub async fn save_entry(&self, entry: Entry) -> Result<SaveOutcome> {
        self.coordinator.save_entry(self.context(), entry, None).await
    }

    pub async fn save_entry_with_image(&self, entry: Entry, image: ImageUpload) -> Result<SaveOutcome> {
        self.coordinator
            .save_entry(self.context(), entry, Some(image))
            .await
    }

    /// Delete right away, without an undo window.
    pub async fn delete_entry(&self, id: i64) -> Result<bool> {
        self.coordinator.delete_entry(self.context(), id).await
    }

    /// Hide now, delete once the undo window passes.
    pub fn request_delete(&self, id: i64) -> bool {
        self.deletes.request(id)
    }

    pub fn undo_delete(&self, id: i64) -> bool {
        self.deletes.undo(id)
    }

    pub fn is_pending_delete(&self, id: i64) -> bool {
        self.deletes.is_pending(id)
    }

    pub fn undo_window(&self) -> Duration {
        self.deletes.window()
    }

    pub async fn delete_all(&self) -> Result<u64> {
        tracing::info!("Deleting all entries");
        self.coordinator.delete_all(self.context()).await
    }

    pub async fn sync_now(&self) -> Result<SyncReport> {
        self.coordinator.sync_now(self.context()).await
    }

    pub async fn sync_state(&self, id: i64) -> Result<SyncState> {
        if self.deletes.is_pending(id) {
            return Ok(SyncState::PendingDelete);
        }
        Ok(match self.coordinator.local().get_entry(id).await? {
            Some(entry) => entry.sync_state(),
            None => SyncState::Deleted,
        })
    }

    pub async fn last_sync_at(&self) -> Result<Option<String>> {
        self.coordinator.last_sync_at().await
    }

    pub(crate) async fn list_drafts(&self) -> Result<Vec<Entry>> {
        self.coordinator.list_drafts(self.context()).await
    }

    pub fn start_background_sync(&self, interval: Duration) -> SyncLoopHandle {
        spawn_sync_loop(self.coordinator.clone(), self.subscribe(), interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{EntryKind, LocalStore, ANONYMOUS_USER_ID};
    use crate::remote::{AuthStatus, MemoryRemoteStore};
    use crate::services::scheduler::ManualScheduler;
    use crate::sync::Mode;

    async fn create_test_repo(
        remote: Arc<MemoryRemoteStore>,
    ) -> (EntryRepository, ManualScheduler) {
        let local = LocalStore::open_in_memory().await.unwrap();
        let scheduler = ManualScheduler::new();
        let coordinator = SyncCoordinator::new(local, remote);
        let repo = EntryRepository::new(
            coordinator,
            Arc::new(scheduler.clone()),
            Duration::from_secs(5),
        );
        (repo, scheduler)
    }

    #[tokio::test]
    async fn test_unreachable_server_means_local_mode() {
        let remote = Arc::new(MemoryRemoteStore::default());
        remote.set_reachable(false);
        let (repo, _scheduler) = create_test_repo(remote.clone()).await;

        let ctx = repo.initialize().await.unwrap();
        assert_eq!(ctx.mode, Mode::Local);

        // Coming back later does not switch modes before restart
        remote.set_reachable(true);
        remote.set_auth(AuthStatus::signed_in(2, "sam"));
        let ctx = repo.refresh_auth().await.unwrap();
        assert_eq!(ctx.mode, Mode::Local);
        assert_eq!(ctx.user_id, ANONYMOUS_USER_ID);
    }

    #[tokio::test]
    async fn test_login_claims_anonymous_entries() {
        let remote = Arc::new(MemoryRemoteStore::default());
        let (repo, _scheduler) = create_test_repo(remote.clone()).await;
        repo.initialize().await.unwrap();

        let entry = repo.new_entry("2024-03-01 09:00:00", Payload::empty(EntryKind::Drink));
        let saved = repo.save_entry(entry).await.unwrap().entry;
        assert_eq!(repo.sync_state(saved.id.unwrap()).await.unwrap(), SyncState::LocalOnly);
        assert!(remote.entries().is_empty());

        remote.set_auth(AuthStatus::signed_in(2, "sam"));
        let ctx = repo.refresh_auth().await.unwrap();
        assert!(ctx.can_sync());

        let timeline = repo.timeline().await.unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].user_id, 2);
        assert_eq!(remote.entries().len(), 1);
        assert_eq!(remote.entries()[0].user_id, 2);
    }

    #[tokio::test]
    async fn test_sync_state_follows_deletion() {
        let remote = Arc::new(MemoryRemoteStore::signed_in(2, "sam"));
        let (repo, scheduler) = create_test_repo(remote).await;
        repo.initialize().await.unwrap();

        let entry = repo.new_entry("2024-03-01 09:00:00", Payload::empty(EntryKind::Stool));
        let id = repo.save_entry(entry).await.unwrap().entry.id.unwrap();
        assert_eq!(repo.sync_state(id).await.unwrap(), SyncState::Synced);

        assert!(repo.request_delete(id));
        assert_eq!(repo.sync_state(id).await.unwrap(), SyncState::PendingDelete);
        assert!(repo.get_entry(id).await.unwrap().is_none());

        scheduler.advance(repo.undo_window()).await;
        assert_eq!(repo.sync_state(id).await.unwrap(), SyncState::Deleted);
    }

    #[tokio::test]
    async fn test_logout_stops_syncing() {
        let remote = Arc::new(MemoryRemoteStore::signed_in(2, "sam"));
        let (repo, _scheduler) = create_test_repo(remote.clone()).await;
        repo.initialize().await.unwrap();

        repo.logout();
        assert!(!repo.context().can_sync());

        let entry = repo.new_entry("2024-03-01 09:00:00", Payload::empty(EntryKind::Activity));
        assert_eq!(entry.user_id, ANONYMOUS_USER_ID);
        repo.save_entry(entry).await.unwrap();
        assert!(remote.entries().is_empty());
    }
}
