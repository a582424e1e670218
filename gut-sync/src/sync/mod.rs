//! Synchronization core
//!
//! Mode decision, merge, upload passes and the background loop.

pub mod context;
pub mod coordinator;
pub mod merge;
pub mod pending;
pub mod sync_loop;

pub use context::{Mode, SyncContext};
pub use coordinator::{ClaimReport, SaveOutcome, SyncCoordinator, SyncReport, SyncStatus};
pub use merge::{merge_entries, sort_timeline};
pub use pending::PendingDeletions;
pub use sync_loop::{spawn_sync_loop, SyncLoopHandle};
