//! Local entry cache
//!
//! Persistent store of entries, users and settings on the client device.
//! Every operation is a single statement or a single transaction; there is
//! no isolation across operations.

use super::models::*;
use super::{create_memory_pool, create_pool};
use crate::error::{AppError, Result};
use sqlx::sqlite::SqliteConnection;
use sqlx::SqlitePool;
use std::path::Path;

const ENTRY_COLUMNS: &str =
    "id, server_id, user_id, type, event_at, data, created_at, synced, local_only";

/// What `replace_entry` left behind
#[derive(Debug, Clone, PartialEq)]
pub struct Rekeyed {
    /// The row as now stored under the server id
    pub entry: Entry,
    /// New local id of an unrelated row that held the server id
    pub displaced: Option<i64>,
}

/// Which entries a listing returns with respect to drafts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftFilter {
    Exclude,
    Only,
    Include,
}

impl DraftFilter {
    fn clause(self) -> &'static str {
        match self {
            DraftFilter::Exclude => " AND is_draft = 0",
            DraftFilter::Only => " AND is_draft = 1",
            DraftFilter::Include => "",
        }
    }
}

/// SQLite-backed store for the local cache
#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating and migrating if needed) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(create_pool(path).await?))
    }

    pub async fn open_in_memory() -> Result<Self> {
        Ok(Self::new(create_memory_pool().await?))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert or update an entry, returning its id.
    ///
    /// New entries get the next local id and a `created_at` of now when none
    /// is set; updates never touch `created_at`. Local ids count down from -1
    /// so they never meet an id the server hands out.
    pub async fn put_entry(&self, entry: &Entry) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        let id = write_entry(&mut conn, entry).await?;
        tracing::debug!("Stored entry {} (synced: {})", id, entry.synced && !entry.is_anonymous());
        Ok(id)
    }

    /// Get an entry by local id
    pub async fn get_entry(&self, id: i64) -> Result<Option<Entry>> {
        let row = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {} FROM entries WHERE id = ?",
            ENTRY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Entry::try_from).transpose()
    }

    /// List entries newest first, optionally for one user only.
    pub async fn list_entries(
        &self,
        limit: u32,
        user_id: Option<i64>,
        drafts: DraftFilter,
    ) -> Result<Vec<Entry>> {
        let mut sql = format!("SELECT {} FROM entries WHERE 1 = 1", ENTRY_COLUMNS);
        if user_id.is_some() {
            sql.push_str(" AND user_id = ?");
        }
        sql.push_str(drafts.clause());
        sql.push_str(" ORDER BY event_at DESC, id DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, EntryRow>(&sql);
        if let Some(user_id) = user_id {
            query = query.bind(user_id);
        }
        let rows = query.bind(i64::from(limit)).fetch_all(&self.pool).await?;

        Ok(decode_rows(rows))
    }

    /// Entries whose local copy has not reached the server, oldest first.
    /// Drafts are included; callers decide whether to push them.
    pub async fn list_unsynced(&self, user_id: Option<i64>) -> Result<Vec<Entry>> {
        let mut sql = format!("SELECT {} FROM entries WHERE synced = 0", ENTRY_COLUMNS);
        if user_id.is_some() {
            sql.push_str(" AND user_id = ?");
        }
        sql.push_str(" ORDER BY created_at, ABS(id)");

        let mut query = sqlx::query_as::<_, EntryRow>(&sql);
        if let Some(user_id) = user_id {
            query = query.bind(user_id);
        }
        let rows = query.fetch_all(&self.pool).await?;

        Ok(decode_rows(rows))
    }

    pub async fn count_entries(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Store a server copy unless the local row holds an unsynced edit.
    ///
    /// Returns whether the row was written.
    pub async fn cache_remote_entry(&self, entry: &Entry) -> Result<bool> {
        let id = entry
            .id
            .ok_or_else(|| AppError::InvalidEntry("remote entry without id".to_string()))?;
        if entry.is_anonymous() {
            return Ok(false);
        }

        let written = sqlx::query(
            r#"
            INSERT INTO entries
                (id, server_id, user_id, type, event_at, data, created_at, synced, local_only, is_draft)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, 0, ?)
            ON CONFLICT(id) DO UPDATE SET
                server_id = excluded.server_id,
                user_id = excluded.user_id,
                type = excluded.type,
                event_at = excluded.event_at,
                data = excluded.data,
                synced = 1,
                local_only = 0,
                is_draft = excluded.is_draft
            WHERE entries.synced = 1
            "#,
        )
        .bind(id)
        .bind(entry.server_id.unwrap_or(id))
        .bind(entry.user_id)
        .bind(entry.kind().as_str())
        .bind(canonical_event_at(entry))
        .bind(entry.data.to_value().to_string())
        .bind(entry.created_at.clone().unwrap_or_else(now_timestamp))
        .bind(entry.is_draft())
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;

        Ok(written)
    }

    /// Re-key an uploaded entry under the id the server assigned it.
    ///
    /// `uploaded` is the copy that was sent. When the row no longer matches
    /// it, the local edit wins: the row keeps its contents, takes the server
    /// id and stays unsynced. A different record already holding the server
    /// id is moved to a fresh local id, never overwritten.
    ///
    /// Returns `None`, writing nothing, if the row at `old_id` no longer exists.
    pub async fn replace_entry(
        &self,
        old_id: i64,
        uploaded: &Entry,
        saved: &Entry,
    ) -> Result<Option<Rekeyed>> {
        let new_id = saved
            .id
            .ok_or_else(|| AppError::InvalidEntry("replacement entry without id".to_string()))?;

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {} FROM entries WHERE id = ?",
            ENTRY_COLUMNS
        ))
        .bind(old_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let current = Entry::try_from(row)?;

        let displaced = if new_id != old_id {
            let displaced = make_room(&mut tx, new_id).await?;
            sqlx::query("DELETE FROM entries WHERE id = ?")
                .bind(old_id)
                .execute(&mut *tx)
                .await?;
            displaced
        } else {
            None
        };

        let entry = if current.same_content(uploaded) {
            saved.clone()
        } else {
            tracing::info!("Entry {} changed during upload, keeping the local edit", old_id);
            let mut kept = Entry {
                id: Some(new_id),
                server_id: Some(new_id),
                synced: false,
                local_only: false,
                ..current
            };
            if kept.data.image_path.is_none() {
                kept.data.image_path = saved.data.image_path.clone();
            }
            kept
        };
        write_entry(&mut tx, &entry).await?;

        tx.commit().await?;

        tracing::debug!("Replaced entry {} with {}", old_id, new_id);
        Ok(Some(Rekeyed { entry, displaced }))
    }

    /// Returns whether a row was removed.
    pub async fn delete_entry(&self, id: i64) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM entries WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        tracing::debug!("Deleted entry {} ({} rows)", id, rows);
        Ok(rows > 0)
    }

    pub async fn clear_all(&self) -> Result<u64> {
        let rows = sqlx::query("DELETE FROM entries")
            .execute(&self.pool)
            .await?
            .rows_affected();

        tracing::info!("Cleared {} local entries", rows);
        Ok(rows)
    }

    /// Hand every anonymous entry to `user_id` in one statement.
    ///
    /// Claimed rows are marked for creation on the server. Returns their ids;
    /// a second call finds nothing left to claim.
    pub async fn claim_anonymous(&self, user_id: i64) -> Result<Vec<i64>> {
        if user_id == ANONYMOUS_USER_ID {
            return Err(AppError::InvalidEntry(
                "cannot claim entries for the anonymous user".to_string(),
            ));
        }

        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE entries SET user_id = ?, synced = 0, local_only = 1
            WHERE user_id = ?
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(ANONYMOUS_USER_ID)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    pub async fn put_user(&self, user: &User) -> Result<()> {
        let ai_config = user.ai_config.as_ref().map(serde_json::to_string).transpose()?;

        sqlx::query(
            r#"
            INSERT INTO users (id, username, ai_config, debug_mode) VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                username = excluded.username,
                ai_config = excluded.ai_config,
                debug_mode = excluded.debug_mode
            "#,
        )
        .bind(user.id)
        .bind(&user.username)
        .bind(ai_config)
        .bind(user.debug_mode)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Stored user {} ({})", user.id, user.username);
        Ok(())
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, ai_config, debug_mode FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(User::from))
    }

    /// Get/set settings
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Set setting: {} = {}", key, value);
        Ok(())
    }

    pub async fn delete_setting(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn canonical_event_at(entry: &Entry) -> String {
    normalize_timestamp(&entry.event_at).unwrap_or_else(|| entry.event_at.clone())
}

/// Upsert on one connection so it can share a caller's transaction.
async fn write_entry(conn: &mut SqliteConnection, entry: &Entry) -> Result<i64> {
    let synced = entry.synced && !entry.is_anonymous();
    let event_at = canonical_event_at(entry);
    let data = entry.data.to_value().to_string();
    let created_at = entry.created_at.clone().unwrap_or_else(now_timestamp);

    let id = match entry.id {
        Some(id) => {
            sqlx::query(
                r#"
                INSERT INTO entries
                    (id, server_id, user_id, type, event_at, data, created_at, synced, local_only, is_draft)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    server_id = excluded.server_id,
                    user_id = excluded.user_id,
                    type = excluded.type,
                    event_at = excluded.event_at,
                    data = excluded.data,
                    synced = excluded.synced,
                    local_only = excluded.local_only,
                    is_draft = excluded.is_draft
                "#,
            )
            .bind(id)
            .bind(entry.server_id)
            .bind(entry.user_id)
            .bind(entry.kind().as_str())
            .bind(&event_at)
            .bind(&data)
            .bind(&created_at)
            .bind(synced)
            .bind(entry.local_only)
            .bind(entry.is_draft())
            .execute(&mut *conn)
            .await?;
            id
        }
        None => {
            sqlx::query_scalar(
                r#"
                INSERT INTO entries
                    (id, server_id, user_id, type, event_at, data, created_at, synced, local_only, is_draft)
                VALUES ((SELECT MIN(COALESCE(MIN(id), 0), 0) - 1 FROM entries), ?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(entry.server_id)
            .bind(entry.user_id)
            .bind(entry.kind().as_str())
            .bind(&event_at)
            .bind(&data)
            .bind(&created_at)
            .bind(synced)
            .bind(entry.local_only)
            .bind(entry.is_draft())
            .fetch_one(&mut *conn)
            .await?
        }
    };

    Ok(id)
}

/// Clear `id` for a server record about to be written there.
///
/// A synced copy of that same server record is dropped. Anything else is a
/// different record and moves to a fresh local id, flagged for creation;
/// returns that id.
async fn make_room(conn: &mut SqliteConnection, id: i64) -> Result<Option<i64>> {
    let occupant: Option<(Option<i64>, bool)> =
        sqlx::query_as("SELECT server_id, synced FROM entries WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;

    match occupant {
        None => Ok(None),
        Some((server_id, true)) if server_id == Some(id) => {
            sqlx::query("DELETE FROM entries WHERE id = ?")
                .bind(id)
                .execute(&mut *conn)
                .await?;
            Ok(None)
        }
        Some(_) => {
            let moved: i64 = sqlx::query_scalar(
                r#"
                UPDATE entries
                SET id = (SELECT MIN(COALESCE(MIN(id), 0), 0) - 1 FROM entries),
                    server_id = NULL,
                    synced = 0,
                    local_only = 1
                WHERE id = ?
                RETURNING id
                "#,
            )
            .bind(id)
            .fetch_one(&mut *conn)
            .await?;

            tracing::warn!("Entry {} moved to {} to make room for server entry {}", id, moved, id);
            Ok(Some(moved))
        }
    }
}

/// Rows with an unknown kind are skipped rather than failing the listing.
fn decode_rows(rows: Vec<EntryRow>) -> Vec<Entry> {
    rows.into_iter()
        .filter_map(|row| {
            let id = row.id;
            Entry::try_from(row)
                .map_err(|e| tracing::warn!("Skipping unreadable entry {}: {}", id, e))
                .ok()
        })
        .collect()
}
