//! In-process remote store
//!
//! Behaves like the tracker API without a network: ids are server-assigned,
//! unauthenticated calls are rejected and reachability can be switched off.
//! Every call is recorded so callers can assert on what was sent.

use super::{AuthStatus, ImageUpload, RemoteStore, SaveReceipt};
use crate::database::{now_timestamp, Entry};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

const FIRST_SERVER_ID: i64 = 1;

/// A request as seen by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    CheckAuth,
    List(u32),
    Get(i64),
    /// `id` is the record being updated, `None` for a create
    Save { id: Option<i64>, user_id: i64 },
    Delete(i64),
    DeleteAll,
}

struct State {
    entries: BTreeMap<i64, Entry>,
    next_id: i64,
    reachable: bool,
    fail_saves: bool,
    auth: AuthStatus,
    calls: Vec<RemoteCall>,
}

pub struct MemoryRemoteStore {
    state: Mutex<State>,
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new(AuthStatus::anonymous())
    }
}

impl MemoryRemoteStore {
    pub fn new(auth: AuthStatus) -> Self {
        Self {
            state: Mutex::new(State {
                entries: BTreeMap::new(),
                next_id: FIRST_SERVER_ID,
                reachable: true,
                fail_saves: false,
                auth,
                calls: Vec::new(),
            }),
        }
    }

    pub fn signed_in(user_id: i64, username: &str) -> Self {
        Self::new(AuthStatus::signed_in(user_id, username))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub fn set_auth(&self, auth: AuthStatus) {
        self.lock().auth = auth;
    }

    /// Make every save answer 500 while set.
    pub fn set_fail_saves(&self, fail: bool) {
        self.lock().fail_saves = fail;
    }

    /// Id the next created record gets, as if other clients had used the rest.
    pub fn set_next_id(&self, id: i64) {
        self.lock().next_id = id;
    }

    /// Seed a record directly, as if another device had saved it.
    pub fn insert(&self, mut entry: Entry) -> i64 {
        let mut state = self.lock();
        let id = match entry.id {
            Some(id) => {
                state.next_id = state.next_id.max(id + 1);
                id
            }
            None => {
                let id = state.next_id;
                state.next_id += 1;
                id
            }
        };
        entry.id = Some(id);
        entry.server_id = Some(id);
        entry.synced = true;
        entry.local_only = false;
        state.entries.insert(id, entry);
        id
    }

    pub fn entry(&self, id: i64) -> Option<Entry> {
        self.lock().entries.get(&id).cloned()
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.lock().entries.values().cloned().collect()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Record the call and fail the way the network would.
    fn begin(&self, call: RemoteCall, needs_auth: bool) -> Result<MutexGuard<'_, State>> {
        let mut state = self.lock();
        state.calls.push(call);

        if !state.reachable {
            return Err(AppError::NetworkUnavailable(
                "connection refused".to_string(),
            ));
        }
        if needs_auth && !state.auth.authenticated {
            return Err(AppError::RemoteRejected {
                status: 401,
                message: "Unauthorized".to_string(),
            });
        }
        Ok(state)
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn check_auth(&self) -> Result<AuthStatus> {
        let state = self.begin(RemoteCall::CheckAuth, false)?;
        Ok(state.auth.clone())
    }

    async fn list(&self, limit: u32) -> Result<Vec<Entry>> {
        let state = self.begin(RemoteCall::List(limit), true)?;
        let mut entries: Vec<Entry> = state.entries.values().cloned().collect();
        entries.sort_by(|a, b| b.event_at.cmp(&a.event_at).then(b.id.cmp(&a.id)));
        entries.truncate(limit as usize);
        Ok(entries)
    }

    async fn get(&self, id: i64) -> Result<Entry> {
        let state = self.begin(RemoteCall::Get(id), true)?;
        state
            .entries
            .get(&id)
            .cloned()
            .ok_or(AppError::RemoteNotFound(id))
    }

    async fn save(&self, entry: &Entry, image: Option<ImageUpload>) -> Result<SaveReceipt> {
        let mut state = self.begin(
            RemoteCall::Save {
                id: entry.id,
                user_id: entry.user_id,
            },
            true,
        )?;

        if state.fail_saves {
            return Err(AppError::RemoteRejected {
                status: 500,
                message: "Internal Server Error".to_string(),
            });
        }

        let id = match entry.id {
            Some(id) => id,
            None => {
                let id = state.next_id;
                state.next_id += 1;
                id
            }
        };

        let mut stored = entry.clone();
        stored.id = Some(id);
        stored.server_id = Some(id);
        stored.user_id = state.auth.user_id.unwrap_or(entry.user_id);
        stored.synced = true;
        stored.local_only = false;
        stored.data.is_draft = false;
        if stored.created_at.is_none() {
            stored.created_at = Some(now_timestamp());
        }

        stored.data.image_path = match image {
            Some(image) => Some(format!("uploads/{}", image.file_name)),
            None => state
                .entries
                .get(&id)
                .and_then(|existing| existing.data.image_path.clone())
                .or(stored.data.image_path),
        };

        let image_path = stored.data.image_path.clone();
        state.entries.insert(id, stored);

        Ok(SaveReceipt { id, image_path })
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let mut state = self.begin(RemoteCall::Delete(id), true)?;
        state
            .entries
            .remove(&id)
            .map(|_| ())
            .ok_or(AppError::RemoteNotFound(id))
    }

    async fn delete_all(&self) -> Result<()> {
        let mut state = self.begin(RemoteCall::DeleteAll, true)?;
        state.entries.clear();
        Ok(())
    }
}
