use std::{collections::BTreeMap, path::PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ai::{Classification, Extraction};
use crate::db::{Database, DbError};
use crate::types::{AiStatus, Capability, NativeTimestamp, Provider, now_rfc3339};

const MESSAGE_COLUMNS: &str = "provider, message_id, sender, to_json, cc_json, bcc_json, subject, received_at, file_path, classification_status, extraction_status, classification_json, extraction_json, ai_error, ai_processed_at, created_at, updated_at";

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 500;

/// Everything the archive knows about one downloaded message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub provider: Provider,
    pub message_id: String,
    pub sender: Option<String>,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: Option<String>,
    pub received_at: Option<NativeTimestamp>,
    pub file_path: PathBuf,
    pub classification_status: AiStatus,
    pub extraction_status: AiStatus,
    pub classification: Option<Classification>,
    pub extraction: Option<Extraction>,
    pub ai_error: Option<String>,
    pub ai_processed_at: Option<DateTime<Utc>>,
}

impl MessageRecord {
    pub fn new(provider: Provider, message_id: impl Into<String>, file_path: PathBuf) -> Self {
        Self {
            provider,
            message_id: message_id.into(),
            sender: None,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: None,
            received_at: None,
            file_path,
            classification_status: AiStatus::NotAttempted,
            extraction_status: AiStatus::NotAttempted,
            classification: None,
            extraction: None,
            ai_error: None,
            ai_processed_at: None,
        }
    }

    pub fn status(&self, capability: Capability) -> AiStatus {
        match capability {
            Capability::Classification => self.classification_status,
            Capability::Extraction => self.extraction_status,
        }
    }
}

/// A stored record plus bookkeeping timestamps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchivedMessage {
    #[serde(flatten)]
    pub record: MessageRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    Updated,
    /// The record existed under a different file path and now points at the new one.
    PathHealed { previous: PathBuf },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub not_attempted: u64,
    pub success: u64,
    pub failed: u64,
    pub disabled: u64,
    pub skipped: u64,
}

impl StatusCounts {
    fn add(&mut self, status: AiStatus, count: u64) {
        let slot = match status {
            AiStatus::NotAttempted => &mut self.not_attempted,
            AiStatus::Success => &mut self.success,
            AiStatus::Failed => &mut self.failed,
            AiStatus::Disabled => &mut self.disabled,
            AiStatus::Skipped => &mut self.skipped,
        };
        *slot += count;
    }

    pub fn total(&self) -> u64 {
        self.not_attempted + self.success + self.failed + self.disabled + self.skipped
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AiStats {
    pub total: u64,
    pub classification: StatusCounts,
    pub extraction: StatusCounts,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveStats {
    pub total_archived: u64,
    pub classified: u64,
    pub extracted: u64,
    pub categories: BTreeMap<String, u64>,
    pub providers: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageQuery {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    /// Substring match against subject and sender.
    pub search: Option<String>,
    pub category: Option<String>,
    pub provider: Option<Provider>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessagePage {
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
    pub items: Vec<ArchivedMessage>,
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("invalid stored value: {0}")]
    InvalidValue(String),
    #[error("message not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct MessageRepository {
    db: Database,
}

impl MessageRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn exists(&self, provider: Provider, message_id: &str) -> Result<bool, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "SELECT 1 FROM messages WHERE provider = ?1 AND message_id = ?2 LIMIT 1",
                params![provider.as_str(), message_id],
            )
            .await?;

        Ok(rows.next().await?.is_some())
    }

    pub async fn get(
        &self,
        provider: Provider,
        message_id: &str,
    ) -> Result<Option<ArchivedMessage>, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE provider = ?1 AND message_id = ?2"
                ),
                params![provider.as_str(), message_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_message(row).map(Some),
            None => Ok(None),
        }
    }

    /// Inserts the record, or updates the existing row for the same
    /// `(provider, message_id)`. Never produces a second row.
    pub async fn record(&self, record: &MessageRecord) -> Result<RecordOutcome, MessageError> {
        let to_json = serde_json::to_string(&record.to)?;
        let cc_json = serde_json::to_string(&record.cc)?;
        let bcc_json = serde_json::to_string(&record.bcc)?;
        let classification_json = record
            .classification
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let extraction_json = record
            .extraction
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let category = record.classification.as_ref().map(|c| c.category.clone());
        let received_at = record.received_at.as_ref().map(NativeTimestamp::native_value);
        let received_position = record.received_at.as_ref().and_then(NativeTimestamp::position);
        let file_path = record.file_path.to_string_lossy().to_string();
        let ai_processed_at = record.ai_processed_at.map(to_rfc3339);
        let now = now_rfc3339();

        let conn = self.db.connection().await?;
        let tx = conn.transaction().await?;

        let mut rows = tx
            .query(
                "SELECT file_path FROM messages WHERE provider = ?1 AND message_id = ?2",
                params![record.provider.as_str(), record.message_id.as_str()],
            )
            .await?;
        let previous_path: Option<String> = match rows.next().await? {
            Some(row) => Some(row.get(0)?),
            None => None,
        };
        drop(rows);

        tx.execute(
            "INSERT INTO messages (
                provider, message_id, sender, to_json, cc_json, bcc_json, subject, received_at, received_position, file_path,
                classification_status, extraction_status, classification_json, extraction_json, category, ai_error, ai_processed_at,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?18)
             ON CONFLICT(provider, message_id) DO UPDATE SET
                sender = COALESCE(excluded.sender, messages.sender),
                to_json = excluded.to_json,
                cc_json = excluded.cc_json,
                bcc_json = excluded.bcc_json,
                subject = COALESCE(excluded.subject, messages.subject),
                received_at = COALESCE(excluded.received_at, messages.received_at),
                received_position = COALESCE(excluded.received_position, messages.received_position),
                file_path = excluded.file_path,
                classification_status = excluded.classification_status,
                extraction_status = excluded.extraction_status,
                classification_json = excluded.classification_json,
                extraction_json = excluded.extraction_json,
                category = excluded.category,
                ai_error = excluded.ai_error,
                ai_processed_at = excluded.ai_processed_at,
                updated_at = excluded.updated_at",
            params![
                record.provider.as_str(),
                record.message_id.as_str(),
                record.sender.clone(),
                to_json,
                cc_json,
                bcc_json,
                record.subject.clone(),
                received_at,
                received_position,
                file_path.clone(),
                record.classification_status.as_str(),
                record.extraction_status.as_str(),
                classification_json,
                extraction_json,
                category,
                record.ai_error.clone(),
                ai_processed_at,
                now
            ],
        )
        .await?;
        tx.commit().await?;

        Ok(match previous_path {
            None => RecordOutcome::Inserted,
            Some(previous) if previous != file_path => RecordOutcome::PathHealed {
                previous: PathBuf::from(previous),
            },
            Some(_) => RecordOutcome::Updated,
        })
    }

    pub async fn by_ai_status(
        &self,
        capability: Capability,
        status: AiStatus,
    ) -> Result<Vec<ArchivedMessage>, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE {} = ?1 ORDER BY received_position ASC",
                    capability.status_column()
                ),
                params![status.as_str()],
            )
            .await?;
        collect_messages(&mut rows).await
    }

    /// Records whose classification or extraction failed or was disabled,
    /// oldest first.
    pub async fn needing_reanalysis(
        &self,
        provider: Option<Provider>,
    ) -> Result<Vec<ArchivedMessage>, MessageError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages
                     WHERE (classification_status IN ('failed', 'disabled') OR extraction_status IN ('failed', 'disabled'))
                       AND (?1 IS NULL OR provider = ?1)
                     ORDER BY received_position ASC"
                ),
                params![provider.map(|p| p.as_str().to_string())],
            )
            .await?;
        collect_messages(&mut rows).await
    }

    pub async fn ai_stats(&self) -> Result<AiStats, MessageError> {
        let conn = self.db.connection().await?;
        let mut stats = AiStats::default();

        for capability in [Capability::Classification, Capability::Extraction] {
            let column = capability.status_column();
            let mut rows = conn
                .query(
                    &format!("SELECT {column}, COUNT(*) FROM messages GROUP BY {column}"),
                    (),
                )
                .await?;
            while let Some(row) = rows.next().await? {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                let status = status.parse::<AiStatus>().map_err(MessageError::InvalidValue)?;
                let counts = match capability {
                    Capability::Classification => &mut stats.classification,
                    Capability::Extraction => &mut stats.extraction,
                };
                counts.add(status, count as u64);
            }
        }

        stats.total = stats.classification.total();
        Ok(stats)
    }

    pub async fn stats(&self) -> Result<ArchiveStats, MessageError> {
        let conn = self.db.connection().await?;
        let mut stats = ArchiveStats::default();

        let mut rows = conn
            .query(
                "SELECT COUNT(*),
                        COALESCE(SUM(CASE WHEN classification_json IS NOT NULL THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN extraction_status = 'success' THEN 1 ELSE 0 END), 0)
                 FROM messages",
                (),
            )
            .await?;
        if let Some(row) = rows.next().await? {
            stats.total_archived = row.get::<i64>(0)? as u64;
            stats.classified = row.get::<i64>(1)? as u64;
            stats.extracted = row.get::<i64>(2)? as u64;
        }
        drop(rows);

        let mut rows = conn
            .query(
                "SELECT category, COUNT(*) FROM messages WHERE category IS NOT NULL GROUP BY category",
                (),
            )
            .await?;
        while let Some(row) = rows.next().await? {
            stats
                .categories
                .insert(row.get::<String>(0)?, row.get::<i64>(1)? as u64);
        }
        drop(rows);

        let mut rows = conn
            .query("SELECT provider, COUNT(*) FROM messages GROUP BY provider", ())
            .await?;
        while let Some(row) = rows.next().await? {
            stats
                .providers
                .insert(row.get::<String>(0)?, row.get::<i64>(1)? as u64);
        }

        Ok(stats)
    }

    /// Newest-first page of archived messages.
    pub async fn list(&self, query: &MessageQuery) -> Result<MessagePage, MessageError> {
        let limit = query
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let offset = query.offset.unwrap_or(0);
        let search = query
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{s}%"));
        let category = query.category.clone().filter(|c| !c.is_empty());
        let provider = query.provider.map(|p| p.as_str().to_string());

        const FILTER: &str = "(?1 IS NULL OR subject LIKE ?1 OR sender LIKE ?1)
             AND (?2 IS NULL OR category = ?2)
             AND (?3 IS NULL OR provider = ?3)";

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT COUNT(*) FROM messages WHERE {FILTER}"),
                params![search.clone(), category.clone(), provider.clone()],
            )
            .await?;
        let total = match rows.next().await? {
            Some(row) => row.get::<i64>(0)? as u64,
            None => 0,
        };
        drop(rows);

        let mut rows = conn
            .query(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE {FILTER}
                     ORDER BY received_position DESC, created_at DESC
                     LIMIT ?4 OFFSET ?5"
                ),
                params![search, category, provider, limit as i64, offset as i64],
            )
            .await?;
        let items = collect_messages(&mut rows).await?;

        Ok(MessagePage {
            total,
            limit,
            offset,
            items,
        })
    }

    /// Removes every archived message row. Files on disk are left alone.
    pub async fn delete_all(&self) -> Result<u64, MessageError> {
        let conn = self.db.connection().await?;
        Ok(conn.execute("DELETE FROM messages", ()).await?)
    }
}

async fn collect_messages(rows: &mut libsql::Rows) -> Result<Vec<ArchivedMessage>, MessageError> {
    let mut messages = Vec::new();
    while let Some(row) = rows.next().await? {
        messages.push(row_to_message(row)?);
    }
    Ok(messages)
}

fn row_to_message(row: Row) -> Result<ArchivedMessage, MessageError> {
    let provider: String = row.get(0)?;
    let provider: Provider = provider
        .parse()
        .map_err(|e: crate::types::UnknownProvider| MessageError::InvalidValue(e.to_string()))?;
    let to_json: String = row.get(3)?;
    let cc_json: String = row.get(4)?;
    let bcc_json: String = row.get(5)?;
    let received_at: Option<String> = row.get(7)?;
    let file_path: String = row.get(8)?;
    let classification_status: String = row.get(9)?;
    let extraction_status: String = row.get(10)?;
    let classification_json: Option<String> = row.get(11)?;
    let extraction_json: Option<String> = row.get(12)?;
    let ai_processed_at: Option<String> = row.get(14)?;
    let created_at: String = row.get(15)?;
    let updated_at: String = row.get(16)?;

    let record = MessageRecord {
        provider,
        message_id: row.get(1)?,
        sender: row.get(2)?,
        to: serde_json::from_str(&to_json)?,
        cc: serde_json::from_str(&cc_json)?,
        bcc: serde_json::from_str(&bcc_json)?,
        subject: row.get(6)?,
        received_at: received_at.and_then(|value| NativeTimestamp::from_native(provider, &value)),
        file_path: PathBuf::from(file_path),
        classification_status: classification_status
            .parse()
            .map_err(MessageError::InvalidValue)?,
        extraction_status: extraction_status
            .parse()
            .map_err(MessageError::InvalidValue)?,
        classification: classification_json
            .map(|json| serde_json::from_str(&json))
            .transpose()?,
        extraction: extraction_json
            .map(|json| serde_json::from_str(&json))
            .transpose()?,
        ai_error: row.get(13)?,
        ai_processed_at: match ai_processed_at {
            Some(value) => Some(DateTime::parse_from_rfc3339(&value)?.with_timezone(&Utc)),
            None => None,
        },
    };

    Ok(ArchivedMessage {
        record,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
