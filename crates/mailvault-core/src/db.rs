use std::{path::Path, sync::Arc, time::Duration};

use libsql::{Builder, Connection, Database as LibSqlDatabase};
use thiserror::Error;

/// How long a connection waits on a locked database before giving up.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Database {
    inner: Arc<LibSqlDatabase>,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to build database: {0}")]
    Build(libsql::Error),
    #[error("failed to open connection: {0}")]
    Connect(libsql::Error),
    #[error("failed to execute statement: {0}")]
    Statement(libsql::Error),
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },
}

impl Database {
    /// Opens (or creates) the archive database at `database_path`.
    ///
    /// File-backed databases are switched to WAL journaling so dashboard reads
    /// proceed while a sync run holds the write lock.
    pub async fn new(database_path: &Path) -> Result<Self, DbError> {
        let path_str = database_path.to_string_lossy().to_string();
        let in_memory = path_str == ":memory:";

        if !in_memory {
            if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|source| DbError::CreateDir {
                    path: parent.display().to_string(),
                    source,
                })?;
            }
        }

        let inner = Builder::new_local(path_str)
            .build()
            .await
            .map_err(DbError::Build)?;
        let db = Self {
            inner: Arc::new(inner),
        };

        if !in_memory {
            let conn = db.connection().await?;
            pragma(&conn, "PRAGMA journal_mode = WAL").await?;
        }

        Ok(db)
    }

    pub async fn connection(&self) -> Result<Connection, DbError> {
        let conn = self.inner.connect().map_err(DbError::Connect)?;
        pragma(
            &conn,
            &format!("PRAGMA busy_timeout = {}", BUSY_TIMEOUT.as_millis()),
        )
        .await?;
        Ok(conn)
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        let conn = self.connection().await?;
        let mut rows = conn
            .query("SELECT 1", ())
            .await
            .map_err(DbError::Statement)?;
        let _ = rows.next().await.map_err(DbError::Statement)?;
        Ok(())
    }
}

// Some pragmas answer with a row, so they go through `query` and get drained.
async fn pragma(conn: &Connection, sql: &str) -> Result<(), DbError> {
    let mut rows = conn.query(sql, ()).await.map_err(DbError::Statement)?;
    while rows.next().await.map_err(DbError::Statement)?.is_some() {}
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn single_string(conn: &Connection, sql: &str) -> String {
        let mut rows = conn.query(sql, ()).await.expect("query pragma");
        rows.next()
            .await
            .expect("row present")
            .expect("row")
            .get::<String>(0)
            .expect("get value")
    }

    #[tokio::test]
    async fn file_database_uses_wal_journal() {
        let dir = TempDir::new().expect("temp dir");
        let db_path = dir.path().join("archive.db");

        let db = Database::new(&db_path).await.expect("create db");
        let conn = db.connection().await.expect("open connection");
        let mode = single_string(&conn, "PRAGMA journal_mode").await;
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn creates_missing_parent_directories() {
        let dir = TempDir::new().expect("temp dir");
        let db_path = dir.path().join("nested").join("data").join("archive.db");

        let db = Database::new(&db_path).await.expect("create db");
        db.health_check().await.expect("health check passes");
        assert!(db_path.parent().expect("parent").exists());
    }

    #[tokio::test]
    async fn memory_database_passes_health_check() {
        let db = Database::new(Path::new(":memory:")).await.expect("create db");
        db.health_check().await.expect("health check passes");
    }
}
