//! Database models
//!
//! Rust structs representing the entries, users and typed payloads kept in
//! the local cache. Payloads are a tagged union keyed by the entry kind;
//! fields the client does not understand are carried along untouched.

use crate::error::{AppError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// Owner id of entries created before any login
pub const ANONYMOUS_USER_ID: i64 = 0;

pub const ANONYMOUS_USERNAME: &str = "anonymous";

/// Canonical naive UTC timestamp format used for `event_at` and `created_at`
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const TIMESTAMP_INPUT_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.fZ",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
];

/// Parse any timestamp form the client or server has ever written.
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.naive_utc());
    }
    TIMESTAMP_INPUT_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
}

pub fn format_timestamp(value: NaiveDateTime) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

/// Rewrite a timestamp into the canonical format, if it can be parsed at all.
pub fn normalize_timestamp(value: &str) -> Option<String> {
    parse_timestamp(value).map(format_timestamp)
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now().naive_utc())
}

/// Closed set of record kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Food,
    Drink,
    Stool,
    Sleep,
    Symptom,
    Activity,
}

impl EntryKind {
    pub const ALL: [EntryKind; 6] = [
        EntryKind::Food,
        EntryKind::Drink,
        EntryKind::Stool,
        EntryKind::Sleep,
        EntryKind::Symptom,
        EntryKind::Activity,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntryKind::Food => "food",
            EntryKind::Drink => "drink",
            EntryKind::Stool => "stool",
            EntryKind::Sleep => "sleep",
            EntryKind::Symptom => "symptom",
            EntryKind::Activity => "activity",
        }
    }

    /// Payload keys owned by the typed struct for this kind
    fn payload_fields(self) -> &'static [&'static str] {
        match self {
            EntryKind::Food => &["notes"],
            EntryKind::Drink => &["notes", "amount_liters"],
            EntryKind::Stool => &["bristol_score", "notes"],
            EntryKind::Sleep => &["duration_hours", "quality", "bedtime"],
            EntryKind::Symptom => &["notes", "mood_score"],
            EntryKind::Activity => &["duration_minutes", "intensity", "notes"],
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "food" => Ok(EntryKind::Food),
            "drink" => Ok(EntryKind::Drink),
            "stool" => Ok(EntryKind::Stool),
            "sleep" => Ok(EntryKind::Sleep),
            "symptom" | "mood" => Ok(EntryKind::Symptom),
            "activity" => Ok(EntryKind::Activity),
            other => Err(AppError::InvalidEntry(format!("Unknown entry type: {}", other))),
        }
    }
}

/// Numeric payload fields arrive as numbers, numeric strings or empty form values.
mod lenient {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    fn as_number<E: Error>(value: Value) -> Result<Option<f64>, E> {
        match value {
            Value::Null => Ok(None),
            Value::Number(n) => Ok(n.as_f64()),
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(Some)
                .map_err(|_| E::custom(format!("expected a number, got {:?}", s))),
            other => Err(E::custom(format!("expected a number, got {}", other))),
        }
    }

    pub fn opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        as_number(Value::deserialize(deserializer)?)
    }

    pub fn opt_int<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<i64>,
    {
        match as_number::<D::Error>(Value::deserialize(deserializer)?)? {
            None => Ok(None),
            Some(n) if n.fract() != 0.0 => {
                Err(D::Error::custom(format!("expected a whole number, got {}", n)))
            }
            Some(n) => T::try_from(n as i64)
                .map(Some)
                .map_err(|_| D::Error::custom(format!("number out of range: {}", n))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FoodData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrinkData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_f64",
        skip_serializing_if = "Option::is_none"
    )]
    pub amount_liters: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoolData {
    /// Bristol stool scale, 1-7
    #[serde(
        default,
        deserialize_with = "lenient::opt_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub bristol_score: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SleepData {
    #[serde(
        default,
        deserialize_with = "lenient::opt_f64",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration_hours: Option<f64>,
    /// Subjective quality, 1-5
    #[serde(
        default,
        deserialize_with = "lenient::opt_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub quality: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bedtime: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymptomData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::opt_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub mood_score: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityData {
    #[serde(
        default,
        deserialize_with = "lenient::opt_int",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Kind-specific payload of an entry
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Food(FoodData),
    Drink(DrinkData),
    Stool(StoolData),
    Sleep(SleepData),
    Symptom(SymptomData),
    Activity(ActivityData),
}

impl Payload {
    pub fn empty(kind: EntryKind) -> Self {
        match kind {
            EntryKind::Food => Payload::Food(FoodData::default()),
            EntryKind::Drink => Payload::Drink(DrinkData::default()),
            EntryKind::Stool => Payload::Stool(StoolData::default()),
            EntryKind::Sleep => Payload::Sleep(SleepData::default()),
            EntryKind::Symptom => Payload::Symptom(SymptomData::default()),
            EntryKind::Activity => Payload::Activity(ActivityData::default()),
        }
    }

    pub fn kind(&self) -> EntryKind {
        match self {
            Payload::Food(_) => EntryKind::Food,
            Payload::Drink(_) => EntryKind::Drink,
            Payload::Stool(_) => EntryKind::Stool,
            Payload::Sleep(_) => EntryKind::Sleep,
            Payload::Symptom(_) => EntryKind::Symptom,
            Payload::Activity(_) => EntryKind::Activity,
        }
    }

    pub fn notes(&self) -> Option<&str> {
        match self {
            Payload::Food(d) => d.notes.as_deref(),
            Payload::Drink(d) => d.notes.as_deref(),
            Payload::Stool(d) => d.notes.as_deref(),
            Payload::Sleep(_) => None,
            Payload::Symptom(d) => d.notes.as_deref(),
            Payload::Activity(d) => d.notes.as_deref(),
        }
    }

    fn decode(kind: EntryKind, fields: &Map<String, Value>) -> serde_json::Result<Self> {
        let value = Value::Object(fields.clone());
        Ok(match kind {
            EntryKind::Food => Payload::Food(serde_json::from_value(value)?),
            EntryKind::Drink => Payload::Drink(serde_json::from_value(value)?),
            EntryKind::Stool => Payload::Stool(serde_json::from_value(value)?),
            EntryKind::Sleep => Payload::Sleep(serde_json::from_value(value)?),
            EntryKind::Symptom => Payload::Symptom(serde_json::from_value(value)?),
            EntryKind::Activity => Payload::Activity(serde_json::from_value(value)?),
        })
    }

    fn encode(&self) -> serde_json::Result<Value> {
        match self {
            Payload::Food(d) => serde_json::to_value(d),
            Payload::Drink(d) => serde_json::to_value(d),
            Payload::Stool(d) => serde_json::to_value(d),
            Payload::Sleep(d) => serde_json::to_value(d),
            Payload::Symptom(d) => serde_json::to_value(d),
            Payload::Activity(d) => serde_json::to_value(d),
        }
    }
}

/// The `data` object of an entry
#[derive(Debug, Clone, PartialEq)]
pub struct EntryData {
    pub payload: Payload,
    /// Server-resolved path of an uploaded image
    pub image_path: Option<String>,
    /// Staged entry awaiting user confirmation
    pub is_draft: bool,
    /// Fields this client does not model, preserved verbatim
    pub extra: Map<String, Value>,
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => matches!(s.trim(), "1" | "true"),
        _ => false,
    }
}

impl EntryData {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            image_path: None,
            is_draft: false,
            extra: Map::new(),
        }
    }

    pub fn kind(&self) -> EntryKind {
        self.payload.kind()
    }

    /// Decode a stored or received `data` value for the given kind.
    ///
    /// Never fails: a payload that does not match the typed shape is kept
    /// whole in `extra` so re-saving it loses nothing.
    pub fn from_value(kind: EntryKind, value: Value) -> Self {
        let mut fields = match value {
            Value::Object(map) => map,
            Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                _ if raw.trim().is_empty() => Map::new(),
                _ => {
                    let mut map = Map::new();
                    map.insert("raw".to_string(), Value::String(raw));
                    map
                }
            },
            _ => Map::new(),
        };

        let is_draft = fields.remove("is_draft").is_some_and(|v| truthy(&v));
        let image_path = match fields.remove("image_path") {
            Some(Value::String(path)) if !path.is_empty() => Some(path),
            Some(Value::Null) | Some(Value::String(_)) | None => None,
            Some(other) => {
                fields.insert("image_path".to_string(), other);
                None
            }
        };

        match Payload::decode(kind, &fields) {
            Ok(payload) => {
                for field in kind.payload_fields() {
                    fields.remove(*field);
                }
                Self {
                    payload,
                    image_path,
                    is_draft,
                    extra: fields,
                }
            }
            Err(e) => {
                tracing::warn!("Keeping undecodable {} payload verbatim: {}", kind, e);
                Self {
                    payload: Payload::empty(kind),
                    image_path,
                    is_draft,
                    extra: fields,
                }
            }
        }
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.extra.clone();
        if let Ok(Value::Object(fields)) = self.payload.encode() {
            map.extend(fields);
        }
        if let Some(path) = &self.image_path {
            map.insert("image_path".to_string(), Value::String(path.clone()));
        }
        if self.is_draft {
            map.insert("is_draft".to_string(), Value::Bool(true));
        }
        Value::Object(map)
    }
}

impl Serialize for EntryData {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

/// Where an entry stands relative to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Owned by the anonymous user, never transmitted
    LocalOnly,
    /// Local copy is ahead of (or unknown to) the server
    PendingSync,
    Synced,
    /// Optimistically hidden, delete not yet committed
    PendingDelete,
    Deleted,
}

/// One logged health event
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Local row id, replaced by the server id once synced
    pub id: Option<i64>,
    /// Id the server is known to hold this record under
    pub server_id: Option<i64>,
    pub user_id: i64,
    /// Moment the event happened, naive UTC
    pub event_at: String,
    pub data: EntryData,
    /// Row insertion time, assigned by the store when absent
    pub created_at: Option<String>,
    pub synced: bool,
    /// Must be created fresh on the server rather than updated
    pub local_only: bool,
}

impl Entry {
    pub fn new(user_id: i64, event_at: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: None,
            server_id: None,
            user_id,
            event_at: event_at.into(),
            data: EntryData::new(payload),
            created_at: None,
            synced: false,
            local_only: user_id == ANONYMOUS_USER_ID,
        }
    }

    pub fn kind(&self) -> EntryKind {
        self.data.kind()
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id == ANONYMOUS_USER_ID
    }

    pub fn is_draft(&self) -> bool {
        self.data.is_draft
    }

    pub fn event_time(&self) -> Option<NaiveDateTime> {
        parse_timestamp(&self.event_at)
    }

    /// Same owner, time and contents. Ids and sync flags are ignored.
    pub fn same_content(&self, other: &Entry) -> bool {
        let canonical = |entry: &Entry| {
            normalize_timestamp(&entry.event_at).unwrap_or_else(|| entry.event_at.clone())
        };
        self.user_id == other.user_id
            && self.data == other.data
            && canonical(self) == canonical(other)
    }

    pub fn sync_state(&self) -> SyncState {
        if self.is_anonymous() {
            SyncState::LocalOnly
        } else if self.synced {
            SyncState::Synced
        } else {
            SyncState::PendingSync
        }
    }
}

impl Serialize for Entry {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Entry", 9)?;
        state.serialize_field("id", &self.id)?;
        state.serialize_field("server_id", &self.server_id)?;
        state.serialize_field("user_id", &self.user_id)?;
        state.serialize_field("type", self.kind().as_str())?;
        state.serialize_field("event_at", &self.event_at)?;
        state.serialize_field("data", &self.data)?;
        state.serialize_field("created_at", &self.created_at)?;
        state.serialize_field("synced", &self.synced)?;
        state.serialize_field("local_only", &self.local_only)?;
        state.end()
    }
}

/// Row shape of the `entries` table
#[derive(Debug, FromRow)]
pub(crate) struct EntryRow {
    pub id: i64,
    pub server_id: Option<i64>,
    pub user_id: i64,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub event_at: String,
    pub data: String,
    pub created_at: String,
    pub synced: bool,
    pub local_only: bool,
}

impl TryFrom<EntryRow> for Entry {
    type Error = AppError;

    fn try_from(row: EntryRow) -> Result<Self> {
        let kind: EntryKind = row.kind.parse()?;
        let value = serde_json::from_str(&row.data).unwrap_or(Value::String(row.data));
        Ok(Entry {
            id: Some(row.id),
            server_id: row.server_id,
            user_id: row.user_id,
            event_at: row.event_at,
            data: EntryData::from_value(kind, value),
            created_at: Some(row.created_at),
            synced: row.synced && row.user_id != ANONYMOUS_USER_ID,
            local_only: row.local_only,
        })
    }
}

/// AI provider settings attached to a user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_provider() -> String {
    "openai".to_string()
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            base_url: None,
            model: None,
        }
    }
}

/// Locally cached user profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub ai_config: Option<AiConfig>,
    pub debug_mode: bool,
}

impl User {
    pub fn anonymous() -> Self {
        Self {
            id: ANONYMOUS_USER_ID,
            username: ANONYMOUS_USERNAME.to_string(),
            ai_config: None,
            debug_mode: false,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct UserRow {
    pub id: i64,
    pub username: String,
    pub ai_config: Option<String>,
    pub debug_mode: bool,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        let ai_config = row.ai_config.as_deref().and_then(|raw| {
            serde_json::from_str(raw)
                .map_err(|e| tracing::warn!("Ignoring unreadable AI config for user {}: {}", row.id, e))
                .ok()
        });
        User {
            id: row.id,
            username: row.username,
            ai_config,
            debug_mode: row.debug_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_timestamp_forms() {
        let expected = NaiveDateTime::parse_from_str("2024-03-01 08:30:00", TIMESTAMP_FORMAT).unwrap();

        assert_eq!(parse_timestamp("2024-03-01 08:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T08:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T08:30:00.000Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T08:30"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T10:30:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn test_kind_accepts_mood_alias() {
        assert_eq!("mood".parse::<EntryKind>().unwrap(), EntryKind::Symptom);
        assert_eq!(" Drink ".parse::<EntryKind>().unwrap(), EntryKind::Drink);
        assert!("snack".parse::<EntryKind>().is_err());
    }

    #[test]
    fn test_entry_data_splits_known_and_unknown_fields() {
        let data = EntryData::from_value(
            EntryKind::Drink,
            json!({
                "notes": "Green tea",
                "amount_liters": "0.25",
                "image_path": "uploads/img_1.png",
                "is_draft": 1,
                "temperature": "hot"
            }),
        );

        match &data.payload {
            Payload::Drink(drink) => {
                assert_eq!(drink.notes.as_deref(), Some("Green tea"));
                assert_eq!(drink.amount_liters, Some(0.25));
            }
            other => panic!("unexpected payload {:?}", other),
        }
        assert!(data.is_draft);
        assert_eq!(data.image_path.as_deref(), Some("uploads/img_1.png"));
        assert_eq!(data.extra.get("temperature"), Some(&json!("hot")));
        assert!(!data.extra.contains_key("notes"));

        let value = data.to_value();
        assert_eq!(value["amount_liters"], json!(0.25));
        assert_eq!(value["is_draft"], json!(true));
        assert_eq!(value["temperature"], json!("hot"));
    }

    #[test]
    fn test_undecodable_payload_is_preserved() {
        let original = json!({ "bristol_score": "very loose", "notes": "after lunch" });
        let data = EntryData::from_value(EntryKind::Stool, original.clone());

        assert_eq!(data.payload, Payload::Stool(StoolData::default()));
        assert_eq!(data.to_value(), original);
    }

    #[test]
    fn test_string_and_array_data_are_tolerated() {
        let from_string = EntryData::from_value(EntryKind::Food, json!("{\"notes\":\"Apple\"}"));
        assert_eq!(from_string.payload.notes(), Some("Apple"));

        // PHP encodes an empty assoc array as []
        let from_array = EntryData::from_value(EntryKind::Food, json!([]));
        assert_eq!(from_array.payload, Payload::Food(FoodData::default()));
    }

    #[test]
    fn test_sync_state_derivation() {
        let mut entry = Entry::new(ANONYMOUS_USER_ID, "2024-01-01 10:00:00", Payload::empty(EntryKind::Food));
        assert!(entry.local_only);
        assert_eq!(entry.sync_state(), SyncState::LocalOnly);

        entry.user_id = 7;
        assert_eq!(entry.sync_state(), SyncState::PendingSync);

        entry.synced = true;
        assert_eq!(entry.sync_state(), SyncState::Synced);
    }

    #[test]
    fn test_entry_serializes_with_type_tag() {
        let entry = Entry::new(
            3,
            "2024-01-01 10:00:00",
            Payload::Sleep(SleepData {
                duration_hours: Some(7.5),
                quality: Some(4),
                bedtime: None,
            }),
        );

        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["type"], json!("sleep"));
        assert_eq!(value["data"]["duration_hours"], json!(7.5));
        assert_eq!(value["data"]["quality"], json!(4));
    }
}
