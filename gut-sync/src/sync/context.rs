//! Operating mode and session state
//!
//! `SyncContext` is a plain value. It changes only through the transition
//! functions below and is handed by value into every coordinator call.

use crate::database::ANONYMOUS_USER_ID;
use crate::error::Result;
use crate::remote::AuthStatus;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Server unreachable at startup; nothing leaves the device until restart
    Local,
    /// Server reachable; syncing depends on authentication
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncContext {
    pub mode: Mode,
    pub authenticated: bool,
    pub user_id: i64,
    pub online: bool,
}

impl Default for SyncContext {
    fn default() -> Self {
        Self::local()
    }
}

impl SyncContext {
    pub fn local() -> Self {
        Self {
            mode: Mode::Local,
            authenticated: false,
            user_id: ANONYMOUS_USER_ID,
            online: true,
        }
    }

    /// Derive the context from the startup check of the "who am I" endpoint.
    pub fn from_auth_check(check: &Result<AuthStatus>) -> Self {
        match check {
            Ok(status) => Self::local().with_auth(status).switch_mode(Mode::Hybrid),
            Err(_) => Self::local(),
        }
    }

    fn switch_mode(self, mode: Mode) -> Self {
        Self { mode, ..self }
    }

    pub fn with_online(self, online: bool) -> Self {
        Self { online, ..self }
    }

    /// Apply a fresh auth status. An authenticated answer without a user id
    /// is treated as unauthenticated.
    pub fn with_auth(self, status: &AuthStatus) -> Self {
        match status.user_id {
            Some(user_id) if status.authenticated && user_id != ANONYMOUS_USER_ID => Self {
                authenticated: true,
                user_id,
                ..self
            },
            _ => self.logged_out(),
        }
    }

    pub fn logged_out(self) -> Self {
        Self {
            authenticated: false,
            user_id: ANONYMOUS_USER_ID,
            ..self
        }
    }

    /// Gate for every remote call
    pub fn can_sync(&self) -> bool {
        self.mode == Mode::Hybrid && self.authenticated && self.online
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    #[test]
    fn test_auth_check_outcomes() {
        let signed_in = SyncContext::from_auth_check(&Ok(AuthStatus::signed_in(4, "kim")));
        assert_eq!(signed_in.mode, Mode::Hybrid);
        assert_eq!(signed_in.user_id, 4);
        assert!(signed_in.can_sync());

        let anonymous = SyncContext::from_auth_check(&Ok(AuthStatus::anonymous()));
        assert_eq!(anonymous.mode, Mode::Hybrid);
        assert!(!anonymous.can_sync());

        let unreachable =
            SyncContext::from_auth_check(&Err(AppError::NetworkUnavailable("timeout".into())));
        assert_eq!(unreachable.mode, Mode::Local);
        assert!(!unreachable.can_sync());
    }

    #[test]
    fn test_local_mode_never_syncs() {
        let ctx = SyncContext::local()
            .with_auth(&AuthStatus::signed_in(4, "kim"))
            .with_online(true);
        assert!(ctx.authenticated);
        assert!(!ctx.can_sync());
    }

    #[test]
    fn test_transitions() {
        let ctx = SyncContext::from_auth_check(&Ok(AuthStatus::signed_in(4, "kim")));

        let offline = ctx.with_online(false);
        assert!(!offline.can_sync());
        assert!(offline.with_online(true).can_sync());

        let out = ctx.logged_out();
        assert_eq!(out.user_id, ANONYMOUS_USER_ID);
        assert_eq!(out.mode, Mode::Hybrid);

        let missing_id = AuthStatus {
            authenticated: true,
            ..AuthStatus::default()
        };
        assert!(!ctx.with_auth(&missing_id).authenticated);
    }
}
