use std::collections::HashSet;

use libsql::params;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::PathsConfig;
use crate::db::{Database, DbError};
use crate::legacy;

struct Migration {
    version: &'static str,
    sql: &'static str,
}

static MIGRATIONS: &[Migration] = &[
    Migration {
        version: "001_initial",
        sql: include_str!("../../../migrations/001_initial.sql"),
    },
    Migration {
        version: "002_ai_status",
        sql: include_str!("../../../migrations/002_ai_status.sql"),
    },
];

const CREATE_SCHEMA_MIGRATIONS: &str = "CREATE TABLE IF NOT EXISTS schema_migrations (version TEXT PRIMARY KEY, applied_at TEXT NOT NULL)";

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("migration failed: {0}")]
    LibSql(#[from] libsql::Error),
}

async fn apply_migrations(
    conn: &libsql::Connection,
    migrations: &[Migration],
) -> Result<(), MigrationError> {
    conn.execute(CREATE_SCHEMA_MIGRATIONS, ()).await?;

    let mut applied = HashSet::new();
    let mut rows = conn
        .query("SELECT version FROM schema_migrations", ())
        .await?;
    while let Some(row) = rows.next().await? {
        let version: String = row.get(0)?;
        applied.insert(version);
    }

    for migration in migrations {
        if applied.contains(migration.version) {
            continue;
        }

        let tx = conn.transaction().await?;
        tx.execute_batch(migration.sql).await?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))",
            params![migration.version],
        )
        .await?;
        tx.commit().await?;
        info!(version = migration.version, "applied migration");
    }

    Ok(())
}

pub async fn run_migrations(db: &Database) -> Result<(), MigrationError> {
    let conn = db.connection().await?;
    apply_migrations(&conn, MIGRATIONS).await
}

/// Whether a schema step (SQL migration or one-time data import) was recorded.
pub(crate) async fn is_applied(db: &Database, version: &str) -> Result<bool, MigrationError> {
    let conn = db.connection().await?;
    conn.execute(CREATE_SCHEMA_MIGRATIONS, ()).await?;
    let mut rows = conn
        .query(
            "SELECT 1 FROM schema_migrations WHERE version = ?1",
            params![version],
        )
        .await?;
    Ok(rows.next().await?.is_some())
}

pub(crate) async fn mark_applied(db: &Database, version: &str) -> Result<(), MigrationError> {
    let conn = db.connection().await?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version, applied_at) VALUES (?1, strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))",
        params![version],
    )
    .await?;
    Ok(())
}

/// Brings a store up to date: SQL migrations first, then the one-time legacy
/// file imports. Must run before any checkpoint is read.
///
/// A malformed legacy file is logged and left unmarked so it can be fixed and
/// picked up on the next start.
pub async fn bootstrap(db: &Database, paths: &PathsConfig) -> Result<(), MigrationError> {
    run_migrations(db).await?;

    if let Some(path) = &paths.legacy_checkpoint {
        match legacy::import_legacy_checkpoints(db, path).await {
            Ok(outcome) => info!(path = %path.display(), ?outcome, "legacy checkpoint import"),
            Err(legacy::LegacyImportError::Migration(err)) => return Err(err),
            Err(err) => warn!(path = %path.display(), error = %err, "legacy checkpoint import skipped"),
        }
    }

    if let Some(path) = &paths.legacy_metadata {
        match legacy::import_legacy_metadata(db, path, paths.legacy_provider).await {
            Ok(outcome) => info!(path = %path.display(), ?outcome, "legacy metadata import"),
            Err(legacy::LegacyImportError::Migration(err)) => return Err(err),
            Err(err) => warn!(path = %path.display(), error = %err, "legacy metadata import skipped"),
        }
    }

    Ok(())
}
