pub mod ai;
pub mod archive;
pub mod checkpoints;
pub mod config;
pub mod content;
pub mod db;
pub mod legacy;
pub mod messages;
pub mod migrations;
pub mod providers;
pub mod retry;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod types;
pub mod webhook;

pub use ai::{AiPipeline, Classification, Extraction, LLMClient, LLMError};
pub use archive::{ArchiveError, ArchiveWriter};
pub use checkpoints::{Checkpoint, CheckpointRepository};
pub use config::Config;
pub use db::Database;
pub use messages::{ArchivedMessage, MessageQuery, MessageRecord, MessageRepository};
pub use migrations::{bootstrap, run_migrations};
pub use providers::{MailProvider, ProviderError};
pub use store::{ArchiveStore, LibSqlStore, StoreError};
pub use sync::{SyncContext, SyncError, SyncReport, SyncRequest, SyncStatus};
pub use telemetry::{TelemetryError, TelemetryGuard, init_logging, init_telemetry};
pub use types::{AiStatus, Capability, NativeTimestamp, Provider};
pub use webhook::WebhookClient;
