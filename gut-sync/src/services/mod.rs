//! Services module
//!
//! Facades over the sync coordinator plus the scheduling and extraction
//! pieces they depend on.

pub mod deletions;
pub mod drafts;
pub mod entries;
pub mod extraction;
pub mod scheduler;
pub mod users;

pub use deletions::DeferredDeletes;
pub use drafts::DraftManager;
pub use entries::EntryRepository;
pub use extraction::{
    normalize_candidate, CandidateEntry, EntryExtractor, ExtractionInput, NormalizedCandidate,
};
pub use scheduler::{ManualScheduler, Scheduler, TaskHandle, TokioScheduler};
pub use users::UserService;
