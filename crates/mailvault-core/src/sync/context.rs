use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use super::report::{SyncProgress, SyncReport};
use super::window::SyncRequest;
use super::{SyncError, orchestrator};
use crate::ai::AiPipeline;
use crate::archive::ArchiveWriter;
use crate::config::{Config, SyncConfig};
use crate::providers::{MailProvider, build_provider};
use crate::store::ArchiveStore;
use crate::types::Provider;
use crate::webhook::WebhookClient;

/// Builds the provider handler for a run.
pub type ProviderFactory = Arc<dyn Fn(Provider) -> Arc<dyn MailProvider> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct ActiveRun {
    pub run_id: String,
    pub provider: Provider,
    pub local_only: bool,
    pub started_at: DateTime<Utc>,
    pub progress: SyncProgress,
    pub cancel_requested: bool,
}

/// Read-only snapshot for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub running: bool,
    pub current: Option<ActiveRun>,
    pub last_report: Option<SyncReport>,
    pub last_error: Option<String>,
}

#[derive(Default)]
struct RunState {
    current: Option<(ActiveRun, CancellationToken)>,
    last_report: Option<SyncReport>,
    last_error: Option<String>,
}

/// Everything a sync run needs, passed explicitly. At most one run holds
/// the [`RunGuard`] at a time.
pub struct SyncContext {
    pub(crate) store: Arc<dyn ArchiveStore>,
    pub(crate) providers: ProviderFactory,
    pub(crate) ai: Arc<AiPipeline>,
    pub(crate) archive: ArchiveWriter,
    pub(crate) webhook: Option<WebhookClient>,
    pub(crate) settings: SyncConfig,
    state: Arc<Mutex<RunState>>,
}

impl SyncContext {
    pub fn new(
        store: Arc<dyn ArchiveStore>,
        providers: ProviderFactory,
        ai: Arc<AiPipeline>,
        archive: ArchiveWriter,
        settings: SyncConfig,
    ) -> Self {
        Self {
            store,
            providers,
            ai,
            archive,
            webhook: None,
            settings,
            state: Arc::new(Mutex::new(RunState::default())),
        }
    }

    pub fn with_webhook(mut self, webhook: Option<WebhookClient>) -> Self {
        self.webhook = webhook;
        self
    }

    /// Wires the real providers, AI pipeline, download directory and webhook.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn ArchiveStore>,
        http: reqwest::Client,
    ) -> Result<Self, SyncError> {
        let webhook = WebhookClient::from_config(&config.webhook, http.clone())?;
        let ai = Arc::new(AiPipeline::from_config(&config.ai, http.clone()));
        let provider_config = config.clone();
        let providers: ProviderFactory =
            Arc::new(move |provider| build_provider(provider, &provider_config, http.clone()));

        Ok(Self::new(
            store,
            providers,
            ai,
            ArchiveWriter::new(config.paths.download_dir.clone()),
            config.sync.clone(),
        )
        .with_webhook(webhook))
    }

    pub fn store(&self) -> &Arc<dyn ArchiveStore> {
        &self.store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claims the single run slot.
    pub fn begin(&self, request: &SyncRequest) -> Result<RunGuard, SyncError> {
        let mut state = self.lock();
        if let Some((active, _)) = &state.current {
            return Err(SyncError::AlreadyRunning {
                run_id: active.run_id.clone(),
            });
        }
        let run_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        state.current = Some((
            ActiveRun {
                run_id: run_id.clone(),
                provider: request.provider,
                local_only: request.local_only,
                started_at: Utc::now(),
                progress: SyncProgress::default(),
                cancel_requested: false,
            },
            cancel.clone(),
        ));
        Ok(RunGuard {
            state: self.state.clone(),
            run_id,
            cancel,
        })
    }

    pub async fn run(&self, request: SyncRequest) -> Result<SyncReport, SyncError> {
        let guard = self.begin(&request)?;
        self.run_guarded(guard, request).await
    }

    /// Executes a run whose slot was already claimed with [`begin`].
    ///
    /// [`begin`]: SyncContext::begin
    pub async fn run_guarded(
        &self,
        guard: RunGuard,
        request: SyncRequest,
    ) -> Result<SyncReport, SyncError> {
        let span = info_span!(
            "sync_run",
            run_id = %guard.run_id(),
            provider = %request.provider,
            local_only = request.local_only
        );
        let result = orchestrator::execute(self, &guard, &request)
            .instrument(span)
            .await;

        let mut state = self.lock();
        match &result {
            Ok(report) => {
                state.last_report = Some(report.clone());
                state.last_error = None;
            }
            Err(err) => {
                if let SyncError::Auth { partial, .. } = err {
                    state.last_report = Some(partial.as_ref().clone());
                }
                state.last_error = Some(err.to_string());
            }
        }
        drop(state);
        drop(guard);
        result
    }

    /// Asks the running sync to stop at the next message boundary.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock();
        match state.current.as_mut() {
            Some((active, token)) => {
                token.cancel();
                active.cancel_requested = true;
                info!(run_id = %active.run_id, "sync cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().current.is_some()
    }

    pub fn status(&self) -> SyncStatus {
        let state = self.lock();
        SyncStatus {
            running: state.current.is_some(),
            current: state.current.as_ref().map(|(active, _)| active.clone()),
            last_report: state.last_report.clone(),
            last_error: state.last_error.clone(),
        }
    }

    pub(crate) fn update_progress(&self, guard: &RunGuard, report: &SyncReport) {
        let mut state = self.lock();
        match state.current.as_mut() {
            Some((active, _)) if active.run_id == guard.run_id => {
                active.progress = report.progress();
            }
            _ => warn!(run_id = %guard.run_id, "progress update for a run that no longer holds the slot"),
        }
    }
}

/// Holds the run slot; releasing it on drop lets the next run start.
pub struct RunGuard {
    state: Arc<Mutex<RunState>>,
    run_id: String,
    cancel: CancellationToken,
}

impl RunGuard {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state
            .current
            .as_ref()
            .is_some_and(|(active, _)| active.run_id == self.run_id)
        {
            state.current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::MockLLMClient;
    use crate::config::AiConfig;
    use crate::db::Database;
    use crate::migrations::run_migrations;
    use crate::providers::{FetchWindow, MessageDescriptor, ProviderError, RawMessage};
    use crate::store::LibSqlStore;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct EmptyMailbox;

    #[async_trait]
    impl MailProvider for EmptyMailbox {
        fn provider(&self) -> Provider {
            Provider::Gmail
        }

        async fn authenticate(&self) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn list_candidate_ids(
            &self,
            _window: &FetchWindow,
            _search: Option<&str>,
        ) -> Result<Vec<MessageDescriptor>, ProviderError> {
            Ok(Vec::new())
        }

        async fn fetch_raw(&self, descriptor: &MessageDescriptor) -> Result<RawMessage, ProviderError> {
            Err(ProviderError::NotFound(descriptor.id.clone()))
        }
    }

    async fn context(dir: &TempDir) -> SyncContext {
        let db = Database::new(&dir.path().join("archive.db")).await.expect("db");
        run_migrations(&db).await.expect("migrations");
        SyncContext::new(
            Arc::new(LibSqlStore::new(db)),
            Arc::new(|_: Provider| Arc::new(EmptyMailbox) as Arc<dyn MailProvider>),
            Arc::new(AiPipeline::new(&AiConfig::default(), Arc::new(MockLLMClient::new()))),
            ArchiveWriter::new(dir.path().join("downloads")),
            SyncConfig::default(),
        )
    }

    #[tokio::test]
    async fn only_one_run_may_hold_the_slot() {
        let dir = TempDir::new().expect("temp dir");
        let ctx = context(&dir).await;
        let request = SyncRequest::new(Provider::Gmail);

        let guard = ctx.begin(&request).expect("first run");
        assert!(ctx.is_running());
        assert!(matches!(
            ctx.begin(&request),
            Err(SyncError::AlreadyRunning { run_id }) if run_id == guard.run_id()
        ));

        drop(guard);
        assert!(!ctx.is_running());
        ctx.begin(&request).expect("slot released");
    }

    #[tokio::test]
    async fn cancel_reaches_the_active_guard() {
        let dir = TempDir::new().expect("temp dir");
        let ctx = context(&dir).await;
        assert!(!ctx.cancel(), "nothing to cancel");

        let guard = ctx.begin(&SyncRequest::new(Provider::Gmail)).expect("run");
        assert!(ctx.cancel());
        assert!(guard.is_cancelled());
        assert!(ctx.status().current.expect("active").cancel_requested);
    }

    #[tokio::test]
    async fn finished_runs_leave_a_report_in_status() {
        let dir = TempDir::new().expect("temp dir");
        let ctx = context(&dir).await;

        let report = ctx.run(SyncRequest::new(Provider::Gmail)).await.expect("run");
        let status = ctx.status();
        assert!(!status.running);
        assert_eq!(status.last_report.expect("report").run_id, report.run_id);
        assert!(status.last_error.is_none());
    }
}
