//! The persistence seam used by the sync orchestrator.
//!
//! [`ArchiveStore`] is what a sync run needs from durable storage: dedup
//! lookups, record writes and checkpoint reads/writes. [`LibSqlStore`] backs
//! it with the message and checkpoint repositories.

use async_trait::async_trait;
use thiserror::Error;

use crate::checkpoints::{Checkpoint, CheckpointError, CheckpointRepository};
use crate::db::Database;
use crate::messages::{
    AiStats, ArchivedMessage, MessageError, MessageRecord, MessageRepository, RecordOutcome,
};
use crate::types::Provider;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message store error: {0}")]
    Message(#[from] MessageError),
    #[error("checkpoint store error: {0}")]
    Checkpoint(#[from] CheckpointError),
}

#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn exists(&self, provider: Provider, message_id: &str) -> Result<bool, StoreError>;

    async fn get(
        &self,
        provider: Provider,
        message_id: &str,
    ) -> Result<Option<ArchivedMessage>, StoreError>;

    async fn record(&self, record: &MessageRecord) -> Result<RecordOutcome, StoreError>;

    async fn get_checkpoint(&self, provider: Provider) -> Result<Option<Checkpoint>, StoreError>;

    /// Monotonic: returns `false` when the stored checkpoint is already ahead.
    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<bool, StoreError>;

    async fn records_for_reanalysis(
        &self,
        provider: Option<Provider>,
    ) -> Result<Vec<ArchivedMessage>, StoreError>;

    async fn ai_stats(&self) -> Result<AiStats, StoreError>;
}

#[derive(Clone)]
pub struct LibSqlStore {
    messages: MessageRepository,
    checkpoints: CheckpointRepository,
}

impl LibSqlStore {
    pub fn new(db: Database) -> Self {
        Self {
            messages: MessageRepository::new(db.clone()),
            checkpoints: CheckpointRepository::new(db),
        }
    }

    pub fn messages(&self) -> &MessageRepository {
        &self.messages
    }

    pub fn checkpoints(&self) -> &CheckpointRepository {
        &self.checkpoints
    }

    /// Factory reset: forgets every archived message and checkpoint.
    pub async fn reset_all(&self) -> Result<(u64, u64), StoreError> {
        let messages = self.messages.delete_all().await?;
        let checkpoints = self.checkpoints.reset_all().await?;
        tracing::warn!(messages, checkpoints, "archive store reset");
        Ok((messages, checkpoints))
    }
}

#[async_trait]
impl ArchiveStore for LibSqlStore {
    async fn exists(&self, provider: Provider, message_id: &str) -> Result<bool, StoreError> {
        Ok(self.messages.exists(provider, message_id).await?)
    }

    async fn get(
        &self,
        provider: Provider,
        message_id: &str,
    ) -> Result<Option<ArchivedMessage>, StoreError> {
        Ok(self.messages.get(provider, message_id).await?)
    }

    async fn record(&self, record: &MessageRecord) -> Result<RecordOutcome, StoreError> {
        Ok(self.messages.record(record).await?)
    }

    async fn get_checkpoint(&self, provider: Provider) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.checkpoints.get(provider).await?)
    }

    async fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<bool, StoreError> {
        Ok(self.checkpoints.save(checkpoint).await?)
    }

    async fn records_for_reanalysis(
        &self,
        provider: Option<Provider>,
    ) -> Result<Vec<ArchivedMessage>, StoreError> {
        Ok(self.messages.needing_reanalysis(provider).await?)
    }

    async fn ai_stats(&self) -> Result<AiStats, StoreError> {
        Ok(self.messages.ai_stats().await?)
    }
}
