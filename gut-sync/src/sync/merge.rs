//! Merging remote and local views of the timeline

use crate::database::Entry;
use chrono::NaiveDateTime;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Merge a remote listing with the local unsynced set, one entry per id.
///
/// Remote entries go in first; an unsynced local entry replaces the remote
/// entry with the same id, since anything unsynced is newer than the server.
/// Entries without an id cannot collide and are kept as-is.
pub fn merge_entries(remote: Vec<Entry>, unsynced: Vec<Entry>) -> Vec<Entry> {
    let mut merged: Vec<Entry> = Vec::with_capacity(remote.len() + unsynced.len());
    let mut positions: HashMap<i64, usize> = HashMap::new();

    let tagged_remote = remote.into_iter().map(|mut entry| {
        entry.synced = true;
        entry
    });

    for entry in tagged_remote.chain(unsynced) {
        match entry.id.and_then(|id| positions.get(&id).copied()) {
            Some(index) => merged[index] = entry,
            None => {
                if let Some(id) = entry.id {
                    positions.insert(id, merged.len());
                }
                merged.push(entry);
            }
        }
    }

    merged
}

/// Newest first. Entries with unparseable timestamps compare equal to each
/// other and sort after every valid one; the sort is stable.
pub fn sort_timeline(entries: &mut [Entry]) {
    entries.sort_by(|a, b| compare_event_times(a.event_time(), b.event_time()));
}

fn compare_event_times(a: Option<NaiveDateTime>, b: Option<NaiveDateTime>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{FoodData, Payload};

    fn entry(id: i64, event_at: &str, notes: &str, synced: bool) -> Entry {
        let mut entry = Entry::new(
            1,
            event_at,
            Payload::Food(FoodData {
                notes: Some(notes.to_string()),
            }),
        );
        entry.id = Some(id);
        entry.synced = synced;
        entry.local_only = false;
        entry
    }

    fn notes(entries: &[Entry]) -> Vec<&str> {
        entries.iter().filter_map(|e| e.data.payload.notes()).collect()
    }

    #[test]
    fn test_local_unsynced_wins() {
        let remote = vec![
            entry(1, "2024-01-01 08:00:00", "A", true),
            entry(2, "2024-01-02 08:00:00", "B", true),
        ];
        let unsynced = vec![
            entry(1, "2024-01-01 08:00:00", "A edited", false),
            entry(3, "2024-01-03 08:00:00", "C", false),
        ];

        let mut merged = merge_entries(remote, unsynced);
        sort_timeline(&mut merged);

        assert_eq!(notes(&merged), vec!["C", "B", "A edited"]);
        assert!(!merged[2].synced);
    }

    #[test]
    fn test_invalid_timestamps_sort_last_and_stable() {
        let mut entries = vec![
            entry(1, "garbage", "first bad", false),
            entry(2, "2024-01-01 08:00:00", "tie one", false),
            entry(3, "", "second bad", false),
            entry(4, "2024-01-01 08:00:00", "tie two", false),
            entry(5, "2024-02-01 08:00:00", "newest", false),
        ];

        sort_timeline(&mut entries);

        assert_eq!(
            notes(&entries),
            vec!["newest", "tie one", "tie two", "first bad", "second bad"]
        );
    }
}
