//! Drafts service
//!
//! Extracted entries wait here for review. Drafts never leave the device;
//! committing one sends it down the normal save path.

use super::entries::EntryRepository;
use super::extraction::{normalize_candidate, CandidateEntry, EntryExtractor, ExtractionInput};
use crate::database::Entry;
use crate::error::Result;
use crate::sync::SaveOutcome;
use chrono::Utc;

#[derive(Clone)]
pub struct DraftManager {
    entries: EntryRepository,
}

impl DraftManager {
    pub fn new(entries: EntryRepository) -> Self {
        Self { entries }
    }

    /// Persist an entry as a draft.
    pub async fn stage(&self, mut entry: Entry) -> Result<Entry> {
        entry.data.is_draft = true;
        let outcome = self.entries.save_entry(entry).await?;
        tracing::debug!("Staged draft {:?}", outcome.entry.id);
        Ok(outcome.entry)
    }

    /// Normalize extracted candidates and stage the usable ones.
    ///
    /// `offset_minutes` is the client's UTC offset as reported by the host
    /// (UTC = local + offset).
    pub async fn stage_candidates(
        &self,
        candidates: Vec<CandidateEntry>,
        offset_minutes: i32,
    ) -> Result<Vec<Entry>> {
        let now = Utc::now().naive_utc();
        let user_id = self.entries.context().user_id;
        let total = candidates.len();

        let mut staged = Vec::with_capacity(total);
        for candidate in candidates {
            let normalized = match normalize_candidate(candidate, offset_minutes, now) {
                Ok(normalized) => normalized,
                Err(e) => {
                    tracing::warn!("Dropping extracted candidate: {}", e);
                    continue;
                }
            };
            staged.push(self.stage(normalized.into_entry(user_id)).await?);
        }

        tracing::info!("Staged {} of {} extracted entries", staged.len(), total);
        Ok(staged)
    }

    pub async fn extract_and_stage(
        &self,
        extractor: &dyn EntryExtractor,
        input: ExtractionInput,
        offset_minutes: i32,
    ) -> Result<Vec<Entry>> {
        let candidates = extractor.extract(input).await?;
        self.stage_candidates(candidates, offset_minutes).await
    }

    pub async fn list_drafts(&self) -> Result<Vec<Entry>> {
        self.entries.list_drafts().await
    }

    /// Accept a draft; from here on it syncs like any other entry.
    pub async fn commit(&self, mut entry: Entry) -> Result<SaveOutcome> {
        entry.data.is_draft = false;
        let outcome = self.entries.save_entry(entry).await?;
        tracing::info!("Committed draft as entry {:?}", outcome.entry.id);
        Ok(outcome)
    }

    /// Hide the draft now and delete it after the undo window.
    pub fn discard(&self, entry: &Entry) -> bool {
        match entry.id {
            Some(id) => self.entries.request_delete(id),
            None => false,
        }
    }

    pub fn undo(&self, id: i64) -> bool {
        self.entries.undo_delete(id)
    }
}
