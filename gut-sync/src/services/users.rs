//! Users service
//!
//! Locally cached profiles. The anonymous user always exists; other
//! profiles are cached from the server during auth checks.

use crate::database::{AiConfig, LocalStore, User, ANONYMOUS_USER_ID};
use crate::error::Result;

#[derive(Clone)]
pub struct UserService {
    store: LocalStore,
}

impl UserService {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Cached profile for `id`. The anonymous user is synthesized if the
    /// store has not seen it yet.
    pub async fn current_user(&self, id: i64) -> Result<Option<User>> {
        match self.store.get_user(id).await? {
            Some(user) => Ok(Some(user)),
            None if id == ANONYMOUS_USER_ID => Ok(Some(User::anonymous())),
            None => Ok(None),
        }
    }

    /// Update AI settings and the debug flag. Returns `None` when no
    /// profile is cached for `id`.
    pub async fn update_preferences(
        &self,
        id: i64,
        ai_config: Option<AiConfig>,
        debug_mode: bool,
    ) -> Result<Option<User>> {
        let Some(mut user) = self.current_user(id).await? else {
            tracing::warn!("No cached profile for user {}", id);
            return Ok(None);
        };

        user.ai_config = ai_config;
        user.debug_mode = debug_mode;
        self.store.put_user(&user).await?;

        tracing::info!("Updated preferences for user {}", id);
        Ok(Some(user))
    }
}
