//! One-time imports from the file-based layout that predates the database.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::ai::{Classification, Extraction};
use crate::checkpoints::{Checkpoint, CheckpointError, CheckpointRepository};
use crate::db::Database;
use crate::messages::{MessageError, MessageRecord, MessageRepository};
use crate::migrations::{MigrationError, is_applied, mark_applied};
use crate::types::{AiStatus, NativeTimestamp, Provider};

pub const LEGACY_CHECKPOINT_MARKER: &str = "legacy_checkpoint_file";
pub const LEGACY_METADATA_MARKER: &str = "legacy_metadata_file";

#[derive(Debug, Error)]
pub enum LegacyImportError {
    #[error("schema tracking error: {0}")]
    Migration(#[from] MigrationError),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("legacy checkpoint file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("message error: {0}")]
    Message(#[from] MessageError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyImport {
    AlreadyApplied,
    NoFile,
    Checkpoints { providers: Vec<Provider> },
    Metadata { imported: u64, duplicates: u64, invalid: u64 },
}

#[derive(Debug, Default, Deserialize)]
struct LegacyCheckpointFile {
    gmail: Option<LegacyGmailCheckpoint>,
    m365: Option<LegacyGraphCheckpoint>,
}

#[derive(Debug, Deserialize)]
struct LegacyGmailCheckpoint {
    last_internal_date: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct LegacyGraphCheckpoint {
    last_received_time: Option<String>,
}

/// Moves the old `checkpoint.json` marks into the checkpoints table.
///
/// Guarded by a `schema_migrations` marker so it runs at most once. Imported
/// values go through the normal monotonic save, so a newer database
/// checkpoint is never overwritten.
pub async fn import_legacy_checkpoints(
    db: &Database,
    path: &Path,
) -> Result<LegacyImport, LegacyImportError> {
    if is_applied(db, LEGACY_CHECKPOINT_MARKER).await? {
        return Ok(LegacyImport::AlreadyApplied);
    }

    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(LegacyImport::NoFile);
        }
        Err(source) => {
            return Err(LegacyImportError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let file: LegacyCheckpointFile = serde_json::from_str(&contents)?;
    let repo = CheckpointRepository::new(db.clone());
    let mut providers = Vec::new();

    let gmail_value = file
        .gmail
        .and_then(|g| g.last_internal_date)
        .and_then(|value| match value {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        });
    if let Some(ms) = gmail_value {
        repo.save(&Checkpoint::new(
            Provider::Gmail,
            NativeTimestamp::EpochMillis(ms),
        ))
        .await?;
        providers.push(Provider::Gmail);
    }

    if let Some(received) = file.m365.and_then(|m| m.last_received_time) {
        match NativeTimestamp::from_native(Provider::M365, &received) {
            Some(value) => {
                repo.save(&Checkpoint::new(Provider::M365, value)).await?;
                providers.push(Provider::M365);
            }
            None => warn!(value = %received, "ignoring unparseable legacy m365 checkpoint"),
        }
    }

    mark_applied(db, LEGACY_CHECKPOINT_MARKER).await?;
    Ok(LegacyImport::Checkpoints { providers })
}

#[derive(Debug, Deserialize)]
struct LegacyMetadataLine {
    message_id: Option<String>,
    subject: Option<String>,
    from: Option<String>,
    to: Option<Value>,
    date: Option<String>,
    classification: Option<Value>,
    extraction: Option<Value>,
    file_path: Option<String>,
}

/// Imports the old JSONL metadata log, one archived message per line.
///
/// Lines that already exist in the store are counted as duplicates; lines
/// without an id or file path are counted as invalid.
pub async fn import_legacy_metadata(
    db: &Database,
    path: &Path,
    provider: Provider,
) -> Result<LegacyImport, LegacyImportError> {
    if is_applied(db, LEGACY_METADATA_MARKER).await? {
        return Ok(LegacyImport::AlreadyApplied);
    }

    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(LegacyImport::NoFile);
        }
        Err(source) => {
            return Err(LegacyImportError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let repo = MessageRepository::new(db.clone());
    let (mut imported, mut duplicates, mut invalid) = (0u64, 0u64, 0u64);

    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let parsed: LegacyMetadataLine = match serde_json::from_str(line) {
            Ok(parsed) => parsed,
            Err(err) => {
                debug!(line = index + 1, error = %err, "skipping malformed legacy line");
                invalid += 1;
                continue;
            }
        };
        let Some(record) = legacy_record(provider, parsed) else {
            invalid += 1;
            continue;
        };

        if repo.exists(provider, &record.message_id).await? {
            duplicates += 1;
            continue;
        }
        repo.record(&record).await?;
        imported += 1;
    }

    mark_applied(db, LEGACY_METADATA_MARKER).await?;
    Ok(LegacyImport::Metadata {
        imported,
        duplicates,
        invalid,
    })
}

fn legacy_record(provider: Provider, line: LegacyMetadataLine) -> Option<MessageRecord> {
    let message_id = line.message_id.filter(|id| !id.is_empty())?;
    let file_path = line.file_path.filter(|p| !p.is_empty())?;

    let mut record = MessageRecord::new(provider, message_id, PathBuf::from(file_path));
    record.subject = line.subject;
    record.sender = line.from;
    record.to = match line.to {
        Some(Value::String(s)) => s
            .split(',')
            .map(|addr| addr.trim().to_string())
            .filter(|addr| !addr.is_empty())
            .collect(),
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };
    record.received_at = line
        .date
        .as_deref()
        .and_then(parse_legacy_date)
        .map(|at| NativeTimestamp::for_provider(provider, at));

    record.classification = line
        .classification
        .and_then(|v| serde_json::from_value::<Classification>(v).ok());
    if record.classification.is_some() {
        record.classification_status = AiStatus::Success;
    }
    record.extraction = line
        .extraction
        .and_then(|v| serde_json::from_value::<Extraction>(v).ok());
    if record.extraction.is_some() {
        record.extraction_status = AiStatus::Success;
    }

    Some(record)
}

fn parse_legacy_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
