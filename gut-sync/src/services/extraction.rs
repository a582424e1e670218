//! Candidate entries from an extraction service
//!
//! The extractor itself (natural language, image or voice) lives outside
//! this crate. Its candidates carry local times and are normalized here
//! before they are staged as drafts.

use crate::database::{
    format_timestamp, parse_timestamp, Entry, EntryData, EntryKind, Payload,
};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One extracted record, shaped like an entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEntry {
    #[serde(rename = "type")]
    pub kind: String,
    /// Client-local time as produced by the extractor
    #[serde(default)]
    pub event_at: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone)]
pub enum ExtractionInput {
    Text(String),
    Image { mime_type: String, bytes: Vec<u8> },
    Audio { mime_type: String, bytes: Vec<u8> },
}

#[async_trait]
pub trait EntryExtractor: Send + Sync {
    async fn extract(&self, input: ExtractionInput) -> Result<Vec<CandidateEntry>>;
}

/// Candidate converted to UTC with a typed payload
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedCandidate {
    pub event_at: String,
    pub data: EntryData,
}

impl NormalizedCandidate {
    pub fn kind(&self) -> EntryKind {
        self.data.kind()
    }

    pub fn into_entry(self, user_id: i64) -> Entry {
        let mut entry = Entry::new(user_id, self.event_at, Payload::empty(self.data.kind()));
        entry.data = self.data;
        entry
    }
}

/// Normalize a candidate.
///
/// `offset_minutes` follows the browser convention: UTC = local + offset.
/// A bare date (midnight) is moved to noon, an unreadable time becomes
/// `now_utc`, and sleep entries get a bedtime of wake time minus duration.
pub fn normalize_candidate(
    candidate: CandidateEntry,
    offset_minutes: i32,
    now_utc: NaiveDateTime,
) -> Result<NormalizedCandidate> {
    let kind: EntryKind = candidate.kind.parse()?;
    let local = candidate
        .event_at
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| AppError::InvalidEntry("candidate without event_at".to_string()))?;

    let event_utc = match parse_timestamp(&local) {
        Some(local) => {
            let local = if local.time() == NaiveTime::MIN {
                local.date().and_time(NaiveTime::from_hms_opt(12, 0, 0).unwrap_or(NaiveTime::MIN))
            } else {
                local
            };
            local + Duration::minutes(i64::from(offset_minutes))
        }
        None => {
            tracing::warn!("Unreadable candidate time {:?}, using now", local);
            now_utc
        }
    };

    let mut data = EntryData::from_value(kind, candidate.data);
    if let Payload::Sleep(sleep) = &mut data.payload {
        if let Some(hours) = sleep.duration_hours.filter(|h| *h > 0.0) {
            let asleep = Duration::seconds((hours * 3_600.0).round() as i64);
            sleep.bedtime = Some(format_timestamp(event_utc - asleep));
        }
    }

    Ok(NormalizedCandidate {
        event_at: format_timestamp(event_utc),
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn now() -> NaiveDateTime {
        parse_timestamp("2024-06-01 15:00:00").unwrap()
    }

    fn candidate(kind: &str, event_at: Option<&str>, data: Value) -> CandidateEntry {
        CandidateEntry {
            kind: kind.to_string(),
            event_at: event_at.map(str::to_string),
            data,
        }
    }

    #[test]
    fn test_local_time_converted_to_utc() {
        // UTC+2 reports an offset of -120
        let normalized = normalize_candidate(
            candidate("food", Some("2024-06-01 08:30:00"), json!({ "notes": "Eggs" })),
            -120,
            now(),
        )
        .unwrap();

        assert_eq!(normalized.event_at, "2024-06-01 06:30:00");
        assert_eq!(normalized.kind(), EntryKind::Food);
    }

    #[test]
    fn test_midnight_becomes_noon() {
        let normalized =
            normalize_candidate(candidate("drink", Some("2024-05-31 00:00:00"), json!({})), 60, now())
                .unwrap();
        assert_eq!(normalized.event_at, "2024-05-31 13:00:00");
    }

    #[test]
    fn test_garbage_time_becomes_now() {
        let normalized =
            normalize_candidate(candidate("stool", Some("after lunch"), json!({})), 0, now()).unwrap();
        assert_eq!(normalized.event_at, "2024-06-01 15:00:00");
    }

    #[test]
    fn test_sleep_bedtime_from_duration() {
        let normalized = normalize_candidate(
            candidate("sleep", Some("2024-06-01 07:00:00"), json!({ "duration_hours": "7.5" })),
            0,
            now(),
        )
        .unwrap();

        match normalized.data.payload {
            Payload::Sleep(sleep) => {
                assert_eq!(sleep.bedtime.as_deref(), Some("2024-05-31 23:30:00"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_unusable_candidates_rejected() {
        assert!(normalize_candidate(candidate("food", None, json!({})), 0, now()).is_err());
        assert!(normalize_candidate(candidate("weather", Some("2024-06-01 07:00:00"), json!({})), 0, now()).is_err());
    }
}
