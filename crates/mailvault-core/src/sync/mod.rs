//! One sync run: authenticate, resolve the window, enumerate, then process
//! messages strictly one at a time while tracking the checkpoint.

mod context;
mod orchestrator;
mod report;
mod window;

use thiserror::Error;

use crate::archive::ArchiveError;
use crate::providers::ProviderError;
use crate::store::StoreError;
use crate::webhook::WebhookError;

pub use context::{ActiveRun, ProviderFactory, RunGuard, SyncContext, SyncStatus};
pub use report::{RunMode, SyncProgress, SyncReport};
pub use window::{ResolvedWindow, SyncRequest, WindowSource, resolve_window, start_of_local_day};

/// Run-level failures. Per-message problems never surface here; they are
/// counted in the [`SyncReport`] instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync run is already in progress ({run_id})")]
    AlreadyRunning { run_id: String },
    /// Credentials are unusable. Progress made before the failure is kept
    /// and the checkpoint has been flushed.
    #[error("authentication failed: {message}")]
    Auth {
        message: String,
        partial: Box<SyncReport>,
    },
    #[error("provider error: {0}")]
    Provider(ProviderError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("webhook configuration error: {0}")]
    Webhook(#[from] WebhookError),
}
