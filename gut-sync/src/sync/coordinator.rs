//! Sync coordinator
//!
//! The only component that talks to the remote store. It decides whether a
//! write reaches the network, merges remote and local views, uploads the
//! unsynced backlog and claims anonymous entries on login.

use super::context::{Mode, SyncContext};
use super::merge::{merge_entries, sort_timeline};
use super::pending::PendingDeletions;
use crate::config::{DRAFT_LIST_LIMIT, LAST_SYNC_SETTING, SYNC_REFRESH_LIMIT};
use crate::database::{
    now_timestamp, DraftFilter, Entry, LocalStore, Rekeyed, User, ANONYMOUS_USER_ID,
};
use crate::error::{AppError, Result};
use crate::remote::{AuthStatus, ImageUpload, RemoteStore, SaveReceipt};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Result of a save: the locally persisted entry, plus the remote failure
/// if the server copy could not be written.
#[derive(Debug)]
pub struct SaveOutcome {
    pub entry: Entry,
    pub remote_error: Option<AppError>,
}

impl SaveOutcome {
    pub fn is_synced(&self) -> bool {
        self.entry.synced
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// The pass ran to the end
    Completed,
    /// Sync is not possible in the current context
    Inert,
    /// Another pass was already running
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub status: SyncStatus,
    pub uploaded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl SyncReport {
    fn new(status: SyncStatus) -> Self {
        Self {
            status,
            uploaded: 0,
            failed: 0,
            skipped: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClaimReport {
    pub claimed: usize,
    pub synced: usize,
}

/// Holds the in-flight flag for the lifetime of an upload pass.
struct InFlightGuard(Arc<AtomicBool>);

impl InFlightGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct SyncCoordinator {
    local: LocalStore,
    remote: Arc<dyn RemoteStore>,
    pending: PendingDeletions,
    in_flight: Arc<AtomicBool>,
}

impl SyncCoordinator {
    pub fn new(local: LocalStore, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            local,
            remote,
            pending: PendingDeletions::new(),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn pending(&self) -> &PendingDeletions {
        &self.pending
    }

    /// Determine the operating mode from the "who am I" endpoint.
    pub async fn detect_mode(&self) -> Result<SyncContext> {
        let check = self.remote.check_auth().await;
        if let Err(e) = &check {
            tracing::warn!("Server unreachable, running in local mode: {}", e);
        }

        self.ensure_anonymous_user().await?;
        if let Ok(status) = &check {
            self.cache_profile(status).await?;
        }

        let ctx = SyncContext::from_auth_check(&check);
        tracing::info!(
            "Operating mode {:?} (authenticated: {}, user: {})",
            ctx.mode,
            ctx.authenticated,
            ctx.user_id
        );
        Ok(ctx)
    }

    /// Re-read the session. Local mode stays local until restart.
    pub async fn refresh_auth(&self, ctx: SyncContext) -> Result<SyncContext> {
        if ctx.mode == Mode::Local {
            return Ok(ctx);
        }

        match self.remote.check_auth().await {
            Ok(status) => {
                self.cache_profile(&status).await?;
                Ok(ctx.with_auth(&status))
            }
            Err(e) => {
                tracing::warn!("Auth refresh failed, keeping current session: {}", e);
                Ok(ctx)
            }
        }
    }

    async fn ensure_anonymous_user(&self) -> Result<()> {
        if self.local.get_user(ANONYMOUS_USER_ID).await?.is_none() {
            self.local.put_user(&User::anonymous()).await?;
        }
        Ok(())
    }

    async fn cache_profile(&self, status: &AuthStatus) -> Result<()> {
        if let Some(user) = status.profile() {
            self.local.put_user(&user).await?;
        }
        Ok(())
    }

    fn is_hidden(&self, entry: &Entry) -> bool {
        entry.id.is_some_and(|id| self.pending.contains(id))
    }

    /// Server copy as the current user's synced entry
    fn adopt_remote(mut entry: Entry, user_id: i64) -> Entry {
        entry.user_id = user_id;
        entry.synced = true;
        entry.local_only = false;
        entry.server_id = entry.id;
        entry
    }

    /// Timeline for the current user: merged with the server when possible,
    /// local otherwise. Remote failures are logged, never returned.
    pub async fn get_entries(&self, ctx: SyncContext, limit: u32) -> Result<Vec<Entry>> {
        if !ctx.can_sync() {
            return self.local_timeline(ctx, limit).await;
        }

        let (remote, unsynced) = tokio::join!(
            self.remote.list(limit),
            self.local.list_unsynced(Some(ctx.user_id))
        );
        let unsynced = unsynced?;

        let remote = match remote {
            Ok(remote) => remote,
            Err(e) => {
                tracing::warn!("Remote fetch failed, showing local entries: {}", e);
                return self.local_timeline(ctx, limit).await;
            }
        };

        let remote: Vec<Entry> = remote
            .into_iter()
            .map(|entry| Self::adopt_remote(entry, ctx.user_id))
            .collect();
        self.refresh_cache(&remote).await;

        let mut merged = merge_entries(remote, unsynced);
        merged.retain(|entry| !entry.is_draft() && !self.is_hidden(entry));
        sort_timeline(&mut merged);
        Ok(merged)
    }

    async fn local_timeline(&self, ctx: SyncContext, limit: u32) -> Result<Vec<Entry>> {
        let mut entries = self
            .local
            .list_entries(limit, Some(ctx.user_id), DraftFilter::Exclude)
            .await?;
        entries.retain(|entry| !self.is_hidden(entry));
        sort_timeline(&mut entries);
        Ok(entries)
    }

    /// Cache server copies without clobbering unsynced local edits.
    async fn refresh_cache(&self, remote: &[Entry]) -> usize {
        let mut written = 0;
        for entry in remote {
            match self.local.cache_remote_entry(entry).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!("Failed to cache server entry {:?}: {}", entry.id, e),
            }
        }
        tracing::debug!("Refreshed {} of {} cached entries", written, remote.len());
        written
    }

    /// Local copy first, then the server when syncing is possible.
    pub async fn get_entry(&self, ctx: SyncContext, id: i64) -> Result<Option<Entry>> {
        if self.pending.contains(id) {
            return Ok(None);
        }
        if let Some(entry) = self.local.get_entry(id).await? {
            return Ok(Some(entry));
        }
        // Negative ids are local and unknown to the server
        if !ctx.can_sync() || id < 0 {
            return Ok(None);
        }

        match self.remote.get(id).await {
            Ok(entry) => {
                let entry = Self::adopt_remote(entry, ctx.user_id);
                self.refresh_cache(std::slice::from_ref(&entry)).await;
                Ok(Some(entry))
            }
            Err(AppError::RemoteNotFound(_)) => Ok(None),
            Err(e) => {
                tracing::warn!("Remote lookup of entry {} failed: {}", id, e);
                Ok(None)
            }
        }
    }

    pub async fn list_drafts(&self, ctx: SyncContext) -> Result<Vec<Entry>> {
        let mut drafts = self
            .local
            .list_entries(DRAFT_LIST_LIMIT, Some(ctx.user_id), DraftFilter::Only)
            .await?;
        drafts.retain(|entry| !self.is_hidden(entry));
        Ok(drafts)
    }

    /// Persist locally, then push to the server when allowed.
    ///
    /// Only a local failure is an error; a remote failure leaves the entry
    /// unsynced and is reported in the outcome.
    pub async fn save_entry(
        &self,
        ctx: SyncContext,
        mut entry: Entry,
        image: Option<ImageUpload>,
    ) -> Result<SaveOutcome> {
        let is_new = entry.id.is_none();

        entry.synced = false;
        if is_new || entry.is_anonymous() {
            entry.local_only = true;
        }
        if entry.created_at.is_none() {
            entry.created_at = Some(now_timestamp());
        }

        let id = self.local.put_entry(&entry).await?;
        entry.id = Some(id);

        if entry.is_anonymous() || entry.is_draft() || !ctx.can_sync() {
            tracing::debug!("Entry {} saved locally only", id);
            return Ok(SaveOutcome {
                entry,
                remote_error: None,
            });
        }

        let target = if entry.local_only {
            None
        } else {
            entry.server_id.or(entry.id.filter(|id| *id > 0))
        };

        match self.push(&entry, target, image).await {
            Ok(Some(rekeyed)) => Ok(SaveOutcome {
                entry: rekeyed.entry,
                remote_error: None,
            }),
            Ok(None) => Ok(SaveOutcome {
                entry,
                remote_error: None,
            }),
            Err(e) if e.is_remote() => {
                tracing::warn!("Entry {} kept locally, server save failed: {}", id, e);
                Ok(SaveOutcome {
                    entry,
                    remote_error: Some(e),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Send one entry to the server under `target` (`None` creates).
    ///
    /// Returns `None` when the entry was deleted while the request was in
    /// flight; the fresh server copy is then removed again.
    async fn push(
        &self,
        entry: &Entry,
        target: Option<i64>,
        image: Option<ImageUpload>,
    ) -> Result<Option<Rekeyed>> {
        let mut outgoing = entry.clone();
        outgoing.id = target;

        let receipt = self.remote.save(&outgoing, image).await?;
        self.finish_remote_save(entry, receipt).await
    }

    async fn finish_remote_save(&self, entry: &Entry, receipt: SaveReceipt) -> Result<Option<Rekeyed>> {
        let local_id = entry
            .id
            .ok_or_else(|| AppError::InvalidEntry("uploaded entry without local id".to_string()))?;

        let mut saved = entry.clone();
        saved.id = Some(receipt.id);
        saved.server_id = Some(receipt.id);
        saved.synced = true;
        saved.local_only = false;
        if receipt.image_path.is_some() {
            saved.data.image_path = receipt.image_path;
        }

        // A row queued for deletion under the server id would take this one with it
        let blocked = self.pending.contains(local_id)
            || (receipt.id != local_id && self.pending.contains(receipt.id));

        // The row may have been deleted meanwhile; edits are checked inside
        let rekeyed = if blocked {
            None
        } else {
            self.local.replace_entry(local_id, entry, &saved).await?
        };

        let Some(rekeyed) = rekeyed else {
            tracing::info!(
                "Entry {} went away during upload, removing server copy {}",
                local_id,
                receipt.id
            );
            if let Err(e) = self.remote.delete(receipt.id).await {
                tracing::warn!("Failed to remove orphaned server entry {}: {}", receipt.id, e);
            }
            return Ok(None);
        };

        if receipt.id != local_id {
            tracing::debug!("Entry {} is now server entry {}", local_id, receipt.id);
        }
        Ok(Some(rekeyed))
    }

    /// Best-effort remote delete, then always a local delete.
    pub async fn delete_entry(&self, ctx: SyncContext, id: i64) -> Result<bool> {
        let existing = self.local.get_entry(id).await?;

        if ctx.can_sync() {
            let remote_id = match &existing {
                Some(entry) if entry.local_only || entry.is_anonymous() => None,
                Some(entry) => entry.server_id.or(Some(id).filter(|id| *id > 0)),
                None => Some(id).filter(|id| *id > 0),
            };

            if let Some(remote_id) = remote_id {
                match self.remote.delete(remote_id).await {
                    Ok(()) => tracing::debug!("Deleted server entry {}", remote_id),
                    Err(AppError::RemoteNotFound(_)) => {
                        tracing::debug!("Server entry {} was already gone", remote_id)
                    }
                    Err(e) => tracing::warn!(
                        "Remote delete of {} failed, deleting locally anyway: {}",
                        remote_id,
                        e
                    ),
                }
            }
        }

        self.local.delete_entry(id).await
    }

    /// Wipe everything. When syncing, the server must agree first.
    pub async fn delete_all(&self, ctx: SyncContext) -> Result<u64> {
        if ctx.can_sync() {
            self.remote.delete_all().await?;
        }
        self.local.clear_all().await
    }

    /// Hand anonymous entries to the signed-in user and push them.
    ///
    /// Ownership moves in a single statement, so running this again after a
    /// partial push finds nothing left to claim; unpushed entries stay
    /// unsynced for the background loop.
    pub async fn claim_anonymous(&self, ctx: SyncContext) -> Result<ClaimReport> {
        if !ctx.authenticated || ctx.user_id == ANONYMOUS_USER_ID {
            return Ok(ClaimReport::default());
        }

        let ids = self.local.claim_anonymous(ctx.user_id).await?;
        let mut report = ClaimReport {
            claimed: ids.len(),
            synced: 0,
        };
        if ids.is_empty() {
            return Ok(report);
        }
        tracing::info!("Claimed {} anonymous entries for user {}", ids.len(), ctx.user_id);

        if !ctx.can_sync() {
            return Ok(report);
        }
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            tracing::debug!("Sync pass running, claimed entries left for it");
            return Ok(report);
        };

        let mut queue = VecDeque::from(ids);
        while let Some(id) = queue.pop_front() {
            if self.pending.contains(id) {
                continue;
            }
            // Earlier pushes re-key rows, so what sits at `id` may have changed
            let Some(entry) = self.local.get_entry(id).await? else {
                continue;
            };
            if entry.synced || entry.is_draft() || entry.user_id != ctx.user_id {
                continue;
            }

            match self.push(&entry, None, None).await {
                Ok(Some(rekeyed)) => {
                    if rekeyed.entry.synced {
                        report.synced += 1;
                    }
                    queue.extend(rekeyed.displaced);
                }
                Ok(None) => {}
                Err(e) if e.is_remote() => {
                    tracing::warn!("Claimed entry {} not pushed yet: {}", id, e)
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    /// Upload every unsynced entry of the current user.
    pub async fn sync_now(&self, ctx: SyncContext) -> Result<SyncReport> {
        if !ctx.can_sync() {
            return Ok(SyncReport::new(SyncStatus::Inert));
        }
        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            tracing::debug!("Sync already in flight, skipping");
            return Ok(SyncReport::new(SyncStatus::Busy));
        };

        let unsynced = self.local.list_unsynced(Some(ctx.user_id)).await?;
        let mut queue: VecDeque<i64> = unsynced.iter().filter_map(|entry| entry.id).collect();
        let mut report = SyncReport::new(SyncStatus::Completed);

        while let Some(id) = queue.pop_front() {
            if self.pending.contains(id) {
                report.skipped += 1;
                continue;
            }
            // Fresh copy: the listing may be stale by now
            let Some(entry) = self.local.get_entry(id).await? else {
                continue;
            };
            if entry.synced || entry.user_id != ctx.user_id {
                continue;
            }
            if entry.is_draft() {
                report.skipped += 1;
                continue;
            }

            match self.upload_entry(&entry).await {
                Ok(Some(rekeyed)) => {
                    if rekeyed.entry.synced {
                        report.uploaded += 1;
                    } else {
                        report.skipped += 1;
                    }
                    queue.extend(rekeyed.displaced);
                }
                Ok(None) => report.skipped += 1,
                Err(e) if e.is_remote() => {
                    tracing::warn!("Upload of entry {} failed: {}", id, e);
                    report.failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        match self.remote.list(SYNC_REFRESH_LIMIT).await {
            Ok(remote) => {
                let remote: Vec<Entry> = remote
                    .into_iter()
                    .map(|entry| Self::adopt_remote(entry, ctx.user_id))
                    .collect();
                self.refresh_cache(&remote).await;
            }
            Err(e) => tracing::warn!("Post-sync refresh failed: {}", e),
        }

        self.local
            .set_setting(LAST_SYNC_SETTING, &now_timestamp())
            .await?;

        tracing::info!(
            "Sync pass finished: {} uploaded, {} failed, {} skipped",
            report.uploaded,
            report.failed,
            report.skipped
        );
        Ok(report)
    }

    /// Create or update one entry, asking the server when unsure.
    async fn upload_entry(&self, entry: &Entry) -> Result<Option<Rekeyed>> {
        let target = if entry.local_only {
            None
        } else if let Some(server_id) = entry.server_id {
            Some(server_id)
        } else {
            let id = entry
                .id
                .ok_or_else(|| AppError::InvalidEntry("unsynced entry without id".to_string()))?;
            if id < 0 {
                None
            } else {
                match self.remote.get(id).await {
                    Ok(_) => Some(id),
                    Err(AppError::RemoteNotFound(_)) => None,
                    Err(e) => return Err(e),
                }
            }
        };

        self.push(entry, target, None).await
    }

    pub async fn last_sync_at(&self) -> Result<Option<String>> {
        self.local.get_setting(LAST_SYNC_SETTING).await
    }
}
