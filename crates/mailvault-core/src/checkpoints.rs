use chrono::{DateTime, Utc};
use libsql::{Row, params};
use serde::Serialize;
use thiserror::Error;

use crate::db::{Database, DbError};
use crate::types::{NativeTimestamp, Provider, now_rfc3339};

/// The high-water mark of a provider's incremental sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub provider: Provider,
    pub value: NativeTimestamp,
    /// Native id of the message that produced the mark, when known.
    pub message_id: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn new(provider: Provider, value: NativeTimestamp) -> Self {
        Self {
            provider,
            value,
            message_id: None,
            updated_at: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("checkpoint value '{value}' is not a valid {provider} timestamp")]
    InvalidValue { provider: Provider, value: String },
}

#[derive(Clone)]
pub struct CheckpointRepository {
    db: Database,
}

impl CheckpointRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn get(&self, provider: Provider) -> Result<Option<Checkpoint>, CheckpointError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT provider, value, message_id, updated_at FROM checkpoints WHERE provider = ?1",
                params![provider.as_str()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_checkpoint(provider, row).map(Some),
            None => Ok(None),
        }
    }

    /// Persists the checkpoint unless the stored one is already further ahead.
    /// Returns whether the stored value changed.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<bool, CheckpointError> {
        let position = checkpoint
            .value
            .position()
            .ok_or_else(|| CheckpointError::InvalidValue {
                provider: checkpoint.provider,
                value: checkpoint.value.native_value(),
            })?;

        let conn = self.db.connection().await?;
        let changed = conn
            .execute(
                "INSERT INTO checkpoints (provider, value, position, message_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(provider) DO UPDATE SET
                    value = excluded.value,
                    position = excluded.position,
                    message_id = excluded.message_id,
                    updated_at = excluded.updated_at
                 WHERE excluded.position > checkpoints.position",
                params![
                    checkpoint.provider.as_str(),
                    checkpoint.value.native_value(),
                    position,
                    checkpoint.message_id.clone(),
                    now_rfc3339()
                ],
            )
            .await?;

        Ok(changed > 0)
    }

    /// Explicit reset; the only way a checkpoint moves backwards.
    pub async fn reset(&self, provider: Provider) -> Result<bool, CheckpointError> {
        let conn = self.db.connection().await?;
        let removed = conn
            .execute(
                "DELETE FROM checkpoints WHERE provider = ?1",
                params![provider.as_str()],
            )
            .await?;
        Ok(removed > 0)
    }

    pub async fn reset_all(&self) -> Result<u64, CheckpointError> {
        let conn = self.db.connection().await?;
        Ok(conn.execute("DELETE FROM checkpoints", ()).await?)
    }
}

fn row_to_checkpoint(provider: Provider, row: Row) -> Result<Checkpoint, CheckpointError> {
    let value: String = row.get(1)?;
    let updated_at: String = row.get(3)?;
    let native = NativeTimestamp::from_native(provider, &value)
        .ok_or(CheckpointError::InvalidValue { provider, value })?;

    Ok(Checkpoint {
        provider,
        value: native,
        message_id: row.get(2)?,
        updated_at: Some(DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc)),
    })
}
