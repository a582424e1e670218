//! Ordered migration chain
//!
//! SQL steps are applied as a unit. Row steps run once per stored entry and
//! may fail per row without affecting the others.

use super::models::{normalize_timestamp, now_timestamp};
use serde_json::Value;

/// Entry columns visible to row steps
#[derive(Debug, Clone)]
pub(crate) struct RawEntry {
    pub id: i64,
    pub event_at: String,
    pub created_at: String,
    pub data: Value,
    original_data: String,
}

impl RawEntry {
    pub fn new(id: i64, event_at: String, created_at: String, data: String) -> Self {
        let value = serde_json::from_str(&data).unwrap_or_else(|_| Value::String(data.clone()));
        Self {
            id,
            event_at,
            created_at,
            data: value,
            original_data: data,
        }
    }

    /// Text to write back for `data`, byte-identical when the step left it alone.
    pub fn data_text(&self) -> String {
        let unchanged = match serde_json::from_str::<Value>(&self.original_data) {
            Ok(original) => original == self.data,
            Err(_) => self.data == Value::String(self.original_data.clone()),
        };
        if unchanged {
            self.original_data.clone()
        } else {
            self.data.to_string()
        }
    }
}

/// Returns whether the row changed, or why it could not be migrated.
pub(crate) type RowStep = fn(&mut RawEntry) -> Result<bool, String>;

pub(crate) enum Step {
    Sql(&'static str),
    Rows(RowStep),
}

pub(crate) struct Migration {
    pub version: i32,
    pub name: &'static str,
    pub step: Step,
}

impl Migration {
    pub fn row_step(&self) -> Option<RowStep> {
        match self.step {
            Step::Rows(step) => Some(step),
            Step::Sql(_) => None,
        }
    }
}

pub(crate) fn all() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            name: "initial schema",
            step: Step::Sql(include_str!("migrations/001_initial_schema.sql")),
        },
        Migration {
            version: 2,
            name: "normalize timestamps",
            step: Step::Rows(normalize_timestamps),
        },
        Migration {
            version: 3,
            name: "lift recorded_at",
            step: Step::Rows(lift_recorded_at),
        },
        Migration {
            version: 4,
            name: "sync columns",
            step: Step::Sql(include_str!("migrations/004_sync_columns.sql")),
        },
        Migration {
            version: 5,
            name: "local id range",
            step: Step::Sql(include_str!("migrations/005_local_id_range.sql")),
        },
    ]
}

/// Rewrite ISO-style `event_at` and `created_at` values into the canonical form.
fn normalize_timestamps(row: &mut RawEntry) -> Result<bool, String> {
    let mut changed = false;

    // Empty event_at is filled from the payload by the next step
    if !row.event_at.trim().is_empty() {
        let normalized = normalize_timestamp(&row.event_at)
            .ok_or_else(|| format!("unparseable event_at {:?}", row.event_at))?;
        if normalized != row.event_at {
            row.event_at = normalized;
            changed = true;
        }
    }

    if row.created_at.trim().is_empty() {
        row.created_at = now_timestamp();
        changed = true;
    } else {
        let normalized = normalize_timestamp(&row.created_at)
            .ok_or_else(|| format!("unparseable created_at {:?}", row.created_at))?;
        if normalized != row.created_at {
            row.created_at = normalized;
            changed = true;
        }
    }

    Ok(changed)
}

/// Older clients kept the event time as `recorded_at` inside the payload.
fn lift_recorded_at(row: &mut RawEntry) -> Result<bool, String> {
    let Value::Object(fields) = &mut row.data else {
        return Err("payload is not a JSON object".to_string());
    };

    let Some(recorded_at) = fields.remove("recorded_at") else {
        if row.event_at.trim().is_empty() {
            return Err("entry has no event_at".to_string());
        }
        return Ok(false);
    };

    if row.event_at.trim().is_empty() {
        let raw = recorded_at.as_str().unwrap_or_default();
        row.event_at = normalize_timestamp(raw)
            .ok_or_else(|| format!("unparseable recorded_at {:?}", recorded_at))?;
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(event_at: &str, created_at: &str, data: &str) -> RawEntry {
        RawEntry::new(1, event_at.to_string(), created_at.to_string(), data.to_string())
    }

    #[test]
    fn test_chain_is_ordered_and_dense() {
        let versions: Vec<i32> = all().iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_normalize_timestamps() {
        let mut row = raw("2024-03-01T08:30", "2024-03-01T08:31:10.250Z", "{}");

        assert_eq!(normalize_timestamps(&mut row), Ok(true));
        assert_eq!(row.event_at, "2024-03-01 08:30:00");
        assert_eq!(row.created_at, "2024-03-01 08:31:10");

        // Already canonical rows are left alone
        assert_eq!(normalize_timestamps(&mut row), Ok(false));
    }

    #[test]
    fn test_normalize_rejects_garbage() {
        let mut row = raw("last tuesday", "2024-03-01 08:31:00", "{}");
        assert!(normalize_timestamps(&mut row).is_err());
        assert_eq!(row.event_at, "last tuesday");
    }

    #[test]
    fn test_lift_recorded_at() {
        let mut row = raw("", "2024-03-01 08:31:00", r#"{"recorded_at":"2024-02-01T07:00","notes":"Oats"}"#);

        assert_eq!(lift_recorded_at(&mut row), Ok(true));
        assert_eq!(row.event_at, "2024-02-01 07:00:00");
        assert_eq!(row.data, json!({ "notes": "Oats" }));
    }

    #[test]
    fn test_lift_keeps_existing_event_at() {
        let mut row = raw(
            "2024-02-02 09:00:00",
            "2024-03-01 08:31:00",
            r#"{"recorded_at":"2024-02-01T07:00"}"#,
        );

        assert_eq!(lift_recorded_at(&mut row), Ok(true));
        assert_eq!(row.event_at, "2024-02-02 09:00:00");
        assert_eq!(row.data, json!({}));
    }

    #[test]
    fn test_untouched_data_is_written_back_verbatim() {
        let row = raw("2024-02-02 09:00:00", "", r#"{ "notes" : "spacing kept" }"#);
        assert_eq!(row.data_text(), r#"{ "notes" : "spacing kept" }"#);

        let mut row = raw("", "", "not json");
        assert!(lift_recorded_at(&mut row).is_err());
        assert_eq!(row.data_text(), "not json");
    }
}
