//! Database schema and migrations
//!
//! This module handles database initialization and schema migrations.
//! Row-level steps that fail for a single entry leave that entry untouched,
//! record it in `migration_backlog` and are retried on every open.

use super::migrations::{self, Migration, RawEntry, RowStep, Step};
use crate::error::{AppError, Result};
use sqlx::sqlite::{SqlitePool, SqliteConnection};
use sqlx::Row;

type EntryColumns = (i64, String, String, String);

/// Initialize database with schema
pub async fn initialize_database(pool: &SqlitePool) -> Result<()> {
    tracing::info!("Initializing database schema");

    create_bookkeeping(pool).await?;
    retry_backlog(pool).await?;

    let current_version = current_version(pool).await?;
    tracing::info!("Current database version: {}", current_version);

    apply_migrations(pool, current_version, i32::MAX).await?;

    tracing::info!("Database initialization complete");
    Ok(())
}

/// Apply migrations up to and including `target`, for seeding legacy layouts.
#[cfg(test)]
pub(crate) async fn migrate_to(pool: &SqlitePool, target: i32) -> Result<()> {
    create_bookkeeping(pool).await?;
    let current_version = current_version(pool).await?;
    apply_migrations(pool, current_version, target).await
}

async fn create_bookkeeping(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS migration_backlog (
            version INTEGER NOT NULL,
            entry_id INTEGER NOT NULL,
            error TEXT NOT NULL,
            failed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (version, entry_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn current_version(pool: &SqlitePool) -> Result<i32> {
    let version: i32 = sqlx::query("SELECT COALESCE(MAX(version), 0) FROM migrations")
        .fetch_one(pool)
        .await?
        .get(0);
    Ok(version)
}

async fn apply_migrations(pool: &SqlitePool, current_version: i32, target: i32) -> Result<()> {
    for migration in migrations::all() {
        if migration.version <= current_version || migration.version > target {
            continue;
        }

        tracing::info!(
            "Applying migration version {} ({})",
            migration.version,
            migration.name
        );

        match migration.step {
            Step::Sql(sql) => apply_sql(pool, &migration, sql).await?,
            Step::Rows(step) => apply_rows(pool, &migration, step).await?,
        }

        tracing::info!("Migration version {} applied successfully", migration.version);
    }

    Ok(())
}

async fn apply_sql(pool: &SqlitePool, migration: &Migration, sql: &str) -> Result<()> {
    let failed = |e: sqlx::Error| AppError::Migration {
        version: migration.version,
        message: e.to_string(),
    };

    // Dropping the transaction on error rolls the whole step back
    let mut tx = pool.begin().await?;

    for statement in sql.split(';').filter(|s| !is_blank(s)) {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(failed)?;
    }

    record_version(&mut tx, migration.version).await?;
    tx.commit().await?;
    Ok(())
}

/// True for fragments holding nothing but whitespace and `--` comments.
fn is_blank(statement: &str) -> bool {
    statement
        .lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with("--"))
}

async fn apply_rows(pool: &SqlitePool, migration: &Migration, step: RowStep) -> Result<()> {
    let mut tx = pool.begin().await?;

    let rows: Vec<EntryColumns> =
        sqlx::query_as("SELECT id, event_at, created_at, data FROM entries ORDER BY id")
            .fetch_all(&mut *tx)
            .await?;

    let total = rows.len();
    let mut changed = 0;
    let mut failed = 0;

    for (id, event_at, created_at, data) in rows {
        let mut row = RawEntry::new(id, event_at, created_at, data);
        match step(&mut row) {
            Ok(true) => {
                write_row(&mut tx, &row).await?;
                changed += 1;
            }
            Ok(false) => {}
            Err(message) => {
                tracing::warn!(
                    "Migration {} skipped entry {}: {}",
                    migration.version,
                    id,
                    message
                );
                record_backlog(&mut tx, migration.version, id, &message).await?;
                failed += 1;
            }
        }
    }

    record_version(&mut tx, migration.version).await?;
    tx.commit().await?;

    tracing::info!(
        "Migration {} touched {} of {} entries ({} deferred)",
        migration.version,
        changed,
        total,
        failed
    );
    Ok(())
}

/// Re-run row steps for entries that failed on a previous open.
async fn retry_backlog(pool: &SqlitePool) -> Result<()> {
    let pending: Vec<(i32, i64)> =
        sqlx::query_as("SELECT version, entry_id FROM migration_backlog ORDER BY version, entry_id")
            .fetch_all(pool)
            .await?;

    if pending.is_empty() {
        return Ok(());
    }

    tracing::info!("Retrying {} deferred migration rows", pending.len());

    let chain = migrations::all();
    let mut resolved = 0;
    let mut tx = pool.begin().await?;

    for (version, entry_id) in pending {
        let step = chain
            .iter()
            .find(|m| m.version == version)
            .and_then(Migration::row_step);

        let row: Option<EntryColumns> =
            sqlx::query_as("SELECT id, event_at, created_at, data FROM entries WHERE id = ?")
                .bind(entry_id)
                .fetch_optional(&mut *tx)
                .await?;

        let (Some(step), Some((id, event_at, created_at, data))) = (step, row) else {
            // Entry deleted since, or the step no longer exists
            clear_backlog(&mut tx, version, entry_id).await?;
            continue;
        };

        let mut row = RawEntry::new(id, event_at, created_at, data);
        match step(&mut row) {
            Ok(changed) => {
                if changed {
                    write_row(&mut tx, &row).await?;
                }
                clear_backlog(&mut tx, version, entry_id).await?;
                resolved += 1;
            }
            Err(message) => {
                tracing::debug!("Entry {} still fails migration {}: {}", entry_id, version, message);
                record_backlog(&mut tx, version, entry_id, &message).await?;
            }
        }
    }

    tx.commit().await?;

    if resolved > 0 {
        tracing::info!("Resolved {} deferred migration rows", resolved);
    }
    Ok(())
}

async fn write_row(conn: &mut SqliteConnection, row: &RawEntry) -> Result<()> {
    sqlx::query("UPDATE entries SET event_at = ?, created_at = ?, data = ? WHERE id = ?")
        .bind(&row.event_at)
        .bind(&row.created_at)
        .bind(row.data_text())
        .bind(row.id)
        .execute(conn)
        .await?;
    Ok(())
}

async fn record_version(conn: &mut SqliteConnection, version: i32) -> Result<()> {
    sqlx::query("INSERT INTO migrations (version) VALUES (?)")
        .bind(version)
        .execute(conn)
        .await?;
    Ok(())
}

async fn record_backlog(
    conn: &mut SqliteConnection,
    version: i32,
    entry_id: i64,
    error: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO migration_backlog (version, entry_id, error) VALUES (?, ?, ?)
        ON CONFLICT(version, entry_id) DO UPDATE SET
            error = excluded.error,
            failed_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(version)
    .bind(entry_id)
    .bind(error)
    .execute(conn)
    .await?;
    Ok(())
}

async fn clear_backlog(conn: &mut SqliteConnection, version: i32, entry_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM migration_backlog WHERE version = ? AND entry_id = ?")
        .bind(version)
        .bind(entry_id)
        .execute(conn)
        .await?;
    Ok(())
}
