//! Remote store
//!
//! Client side of the tracker API. Every call may fail; failures come back
//! as typed errors and the sync coordinator decides what to do with them.

pub mod http;
pub mod memory;

pub use http::HttpRemoteStore;
pub use memory::{MemoryRemoteStore, RemoteCall};

use crate::database::{normalize_timestamp, AiConfig, Entry, EntryData, EntryKind, User};
use crate::database::ANONYMOUS_USER_ID;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Answer of the "who am I" endpoint
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AuthStatus {
    #[serde(default, deserialize_with = "de_flag")]
    pub authenticated: bool,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub ai_config: Option<Value>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default, deserialize_with = "de_flag")]
    pub debug_mode: bool,
}

impl AuthStatus {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn signed_in(user_id: i64, username: &str) -> Self {
        Self {
            authenticated: true,
            user_id: Some(user_id),
            username: Some(username.to_string()),
            ..Self::default()
        }
    }

    /// Local profile to cache for an authenticated session.
    pub fn profile(&self) -> Option<User> {
        let id = self.user_id.filter(|id| self.authenticated && *id != ANONYMOUS_USER_ID)?;

        let ai_config = self
            .ai_config
            .clone()
            .and_then(|value| serde_json::from_value::<AiConfig>(value).ok())
            .or_else(|| {
                self.api_key.clone().map(|key| AiConfig {
                    provider: "openai".to_string(),
                    api_key: Some(key),
                    base_url: None,
                    model: None,
                })
            });

        Some(User {
            id,
            username: self
                .username
                .clone()
                .unwrap_or_else(|| format!("user-{}", id)),
            ai_config,
            debug_mode: self.debug_mode,
        })
    }
}

/// Server acknowledgement of a save
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SaveReceipt {
    #[serde(deserialize_with = "de_id")]
    pub id: i64,
    #[serde(default)]
    pub image_path: Option<String>,
}

/// Image attached to a save
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Authoritative entry store on the server.
///
/// `save` updates the record at `entry.id` when it is set and creates a new
/// record otherwise.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn check_auth(&self) -> Result<AuthStatus>;

    async fn list(&self, limit: u32) -> Result<Vec<Entry>>;

    async fn get(&self, id: i64) -> Result<Entry>;

    async fn save(&self, entry: &Entry, image: Option<ImageUpload>) -> Result<SaveReceipt>;

    async fn delete(&self, id: i64) -> Result<()>;

    async fn delete_all(&self) -> Result<()>;
}

/// Entry as the server sends it
#[derive(Debug, Deserialize)]
pub(crate) struct RemoteEntry {
    #[serde(deserialize_with = "de_id")]
    id: i64,
    #[serde(default, deserialize_with = "de_opt_id")]
    user_id: Option<i64>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, alias = "recorded_at")]
    event_at: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    created_at: Option<String>,
}

impl RemoteEntry {
    pub fn into_entry(self) -> Result<Entry> {
        let kind: EntryKind = self.kind.parse()?;
        let event_at = normalize_timestamp(&self.event_at).unwrap_or(self.event_at);
        let created_at = self
            .created_at
            .map(|raw| normalize_timestamp(&raw).unwrap_or(raw));

        Ok(Entry {
            id: Some(self.id),
            server_id: Some(self.id),
            user_id: self.user_id.unwrap_or(ANONYMOUS_USER_ID),
            event_at,
            data: EntryData::from_value(kind, self.data),
            created_at,
            synced: true,
            local_only: false,
        })
    }
}

fn value_to_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Ids arrive as numbers or numeric strings depending on the server driver.
fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    let value = Value::deserialize(deserializer)?;
    value_to_id(&value)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid id: {}", value)))
}

fn de_opt_id<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<i64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(value_to_id(&value))
}

fn de_flag<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        Value::String(s) => matches!(s.trim(), "1" | "true"),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_remote_entry_tolerates_server_quirks() {
        let remote: RemoteEntry = serde_json::from_value(json!({
            "id": "17",
            "user_id": "3",
            "type": "drink",
            "recorded_at": "2024-05-01T07:30",
            "data": "{\"amount_liters\": 0.5}",
            "created_at": "2024-05-01 07:31:00"
        }))
        .unwrap();

        let entry = remote.into_entry().unwrap();
        assert_eq!(entry.id, Some(17));
        assert_eq!(entry.server_id, Some(17));
        assert_eq!(entry.user_id, 3);
        assert_eq!(entry.event_at, "2024-05-01 07:30:00");
        assert!(entry.synced);
        assert_eq!(entry.data.to_value()["amount_liters"], json!(0.5));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let remote: RemoteEntry = serde_json::from_value(json!({
            "id": 1,
            "type": "meditation",
            "event_at": "2024-05-01 07:30:00",
            "data": {}
        }))
        .unwrap();

        assert!(remote.into_entry().is_err());
    }

    #[test]
    fn test_auth_status_profile() {
        let status: AuthStatus = serde_json::from_value(json!({
            "authenticated": true,
            "user_id": "8",
            "api_key": "sk-test",
            "debug_mode": 1
        }))
        .unwrap();

        let user = status.profile().unwrap();
        assert_eq!(user.id, 8);
        assert_eq!(user.username, "user-8");
        assert!(user.debug_mode);
        assert_eq!(
            user.ai_config.and_then(|c| c.api_key).as_deref(),
            Some("sk-test")
        );

        let unauthenticated: AuthStatus = serde_json::from_value(json!({ "authenticated": false })).unwrap();
        assert!(unauthenticated.profile().is_none());
    }

    #[test]
    fn test_save_receipt_accepts_string_id() {
        let receipt: SaveReceipt =
            serde_json::from_value(json!({ "message": "Entry saved", "id": "42", "image_path": null }))
                .unwrap();
        assert_eq!(receipt.id, 42);
        assert_eq!(receipt.image_path, None);
    }
}
