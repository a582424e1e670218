//! Error types for the sync core
//!
//! All errors use thiserror for structured error handling.
//! Remote failures are kept apart from local ones so callers can degrade
//! to the local store instead of failing outright.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("Server rejected request ({status}): {message}")]
    RemoteRejected { status: u16, message: String },

    #[error("Entry not found on server: {0}")]
    RemoteNotFound(i64),

    #[error("Invalid server response: {0}")]
    InvalidResponse(String),

    #[error("Migration {version} failed: {message}")]
    Migration { version: i32, message: String },

    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// True for failures of the remote side that the local store can absorb.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            AppError::NetworkUnavailable(_)
                | AppError::RemoteRejected { .. }
                | AppError::RemoteNotFound(_)
                | AppError::InvalidResponse(_)
        )
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AppError::InvalidResponse(err.to_string())
        } else if let Some(status) = err.status() {
            AppError::RemoteRejected {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            AppError::NetworkUnavailable(err.to_string())
        }
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_classification() {
        assert!(AppError::NetworkUnavailable("offline".into()).is_remote());
        assert!(AppError::RemoteNotFound(4).is_remote());
        assert!(AppError::RemoteRejected {
            status: 401,
            message: "Unauthorized".into()
        }
        .is_remote());
        assert!(!AppError::InvalidEntry("bad".into()).is_remote());
        assert!(!AppError::Config("bad".into()).is_remote());
    }

    #[test]
    fn test_serializes_as_message() {
        let err = AppError::RemoteNotFound(12);
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"Entry not found on server: 12\"");
    }
}
