use std::path::PathBuf;

use chrono::{DateTime, Local, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::context::{RunGuard, SyncContext};
use super::report::{RunMode, SyncReport};
use super::window::{SyncRequest, resolve_window};
use super::SyncError;
use crate::ai::{AiRun, Classification, Extraction};
use crate::archive::{
    ArchiveError, FileLocation, archive_filename, embed_ai_headers, slug_filename,
};
use crate::checkpoints::Checkpoint;
use crate::content::ParsedEmail;
use crate::messages::MessageRecord;
use crate::providers::{MailProvider, MessageDescriptor, ProviderError, retry_transient};
use crate::store::{ArchiveStore, StoreError};
use crate::types::{AiStatus, NativeTimestamp, Provider};

pub(crate) async fn execute(
    ctx: &SyncContext,
    guard: &RunGuard,
    request: &SyncRequest,
) -> Result<SyncReport, SyncError> {
    if request.local_only {
        reanalyze(ctx, guard, request).await
    } else {
        fetch(ctx, guard, request).await
    }
}

#[derive(Debug)]
enum MessageOutcome {
    Downloaded { received: Option<NativeTimestamp> },
    AlreadyArchived { received: Option<NativeTimestamp>, healed: bool },
    Filtered { received: Option<NativeTimestamp>, category: String },
    /// Deleted upstream between listing and fetching.
    Vanished,
}

#[derive(Debug, Error)]
enum MessageFailure {
    #[error("{0}")]
    Auth(String),
    #[error("fetch failed: {error}")]
    Fetch {
        error: ProviderError,
        received: Option<NativeTimestamp>,
    },
    #[error("artifact write failed: {error}")]
    Write {
        error: ArchiveError,
        received: Option<NativeTimestamp>,
    },
    #[error("persisting record failed: {error}")]
    Persist {
        error: StoreError,
        received: Option<NativeTimestamp>,
    },
}

impl MessageFailure {
    fn received(&self) -> Option<&NativeTimestamp> {
        match self {
            MessageFailure::Auth(_) => None,
            MessageFailure::Fetch { received, .. }
            | MessageFailure::Write { received, .. }
            | MessageFailure::Persist { received, .. } => received.as_ref(),
        }
    }
}

struct Observed {
    position: i64,
    value: NativeTimestamp,
    message_id: String,
}

/// Tracks the highest persisted receipt time and writes it in batches.
///
/// After a per-message failure the tracker stops accepting new marks, and
/// drops pending ones at or beyond the failed message, so the next
/// incremental run covers it again.
struct CheckpointTracker {
    provider: Provider,
    enabled: bool,
    frozen: bool,
    stored: Option<i64>,
    pending: Vec<Observed>,
}

impl CheckpointTracker {
    fn new(provider: Provider, enabled: bool, stored: Option<&Checkpoint>) -> Self {
        Self {
            provider,
            enabled,
            frozen: false,
            stored: stored.and_then(|c| c.value.position()),
            pending: Vec::new(),
        }
    }

    fn observe(&mut self, value: Option<&NativeTimestamp>, message_id: &str) {
        if !self.enabled || self.frozen {
            return;
        }
        let Some(value) = value else {
            return;
        };
        if let Some(position) = value.position() {
            self.pending.push(Observed {
                position,
                value: value.clone(),
                message_id: message_id.to_string(),
            });
        }
    }

    fn freeze(&mut self, failed_at: Option<&NativeTimestamp>) {
        if self.frozen {
            return;
        }
        self.frozen = true;
        if let Some(failed) = failed_at.and_then(NativeTimestamp::position) {
            self.pending.retain(|observed| observed.position < failed);
        }
    }

    async fn flush(&mut self, store: &dyn ArchiveStore) -> Result<(), StoreError> {
        if !self.enabled {
            return Ok(());
        }
        let Some(best) = self.pending.iter().max_by_key(|o| o.position) else {
            return Ok(());
        };
        if self.stored.is_none_or(|stored| best.position > stored) {
            let checkpoint = Checkpoint {
                provider: self.provider,
                value: best.value.clone(),
                message_id: Some(best.message_id.clone()),
                updated_at: None,
            };
            if store.save_checkpoint(&checkpoint).await? {
                debug!(checkpoint = %checkpoint.value.native_value(), "checkpoint saved");
            }
            self.stored = Some(best.position);
        }
        self.pending.clear();
        Ok(())
    }
}

/// Per-message AI results, ready to be stored.
struct Enrichment {
    classification_status: AiStatus,
    classification: Option<Classification>,
    extraction_status: AiStatus,
    extraction: Option<Extraction>,
    errors: Vec<String>,
    /// Category that matched `skip_categories`.
    filtered: Option<String>,
}

impl Enrichment {
    fn attempted(&self) -> bool {
        self.classification_status != AiStatus::NotAttempted
            || self.extraction_status != AiStatus::NotAttempted
    }

    fn ai_error(&self) -> Option<String> {
        (!self.errors.is_empty()).then(|| self.errors.join("; "))
    }
}

async fn enrich(
    ai: &mut AiRun<'_>,
    classify: bool,
    extract: bool,
    message_id: &str,
    email: &ParsedEmail,
    apply_skip: bool,
) -> Enrichment {
    let mut out = Enrichment {
        classification_status: AiStatus::NotAttempted,
        classification: None,
        extraction_status: AiStatus::NotAttempted,
        extraction: None,
        errors: Vec::new(),
        filtered: None,
    };

    if classify {
        let outcome = ai.classify(message_id, email).await;
        out.classification_status = outcome.status;
        out.classification = outcome.value;
        out.errors.extend(outcome.error);
        if apply_skip {
            if let Some(classification) = &out.classification {
                if ai.should_skip(classification) {
                    out.filtered = Some(classification.category.clone());
                    return out;
                }
            }
        }
    } else {
        out.classification = Some(ai.fallback_classification(email));
    }
    if extract {
        let outcome = ai.extract(message_id, email).await;
        out.extraction_status = outcome.status;
        out.extraction = outcome.value;
        out.errors.extend(outcome.error);
    }
    out
}

fn artifact_name(
    rename: bool,
    subject: Option<&str>,
    received: Option<DateTime<Utc>>,
    message_id: &str,
    classification: Option<&Classification>,
) -> String {
    if rename {
        slug_filename(
            subject,
            received,
            message_id,
            classification.map(|c| c.category.as_str()),
        )
    } else {
        archive_filename(subject, received, message_id)
    }
}

fn parse_or_empty(message_id: &str, bytes: &[u8]) -> ParsedEmail {
    ParsedEmail::parse(bytes).unwrap_or_else(|err| {
        warn!(message_id, error = %err, "message body unparseable; archiving raw bytes");
        ParsedEmail::default()
    })
}

fn provider_failure(err: ProviderError, report: SyncReport) -> SyncError {
    match err {
        ProviderError::Auth(message) => {
            error!(error = %message, "provider authentication failed; aborting run");
            SyncError::Auth {
                message,
                partial: Box::new(report),
            }
        }
        other => {
            error!(error = %other, "provider unavailable; aborting run");
            SyncError::Provider(other)
        }
    }
}

async fn fetch(
    ctx: &SyncContext,
    guard: &RunGuard,
    request: &SyncRequest,
) -> Result<SyncReport, SyncError> {
    let provider = (ctx.providers)(request.provider);
    let mut report = SyncReport::new(guard.run_id(), request.provider, RunMode::Fetch);

    if let Err(err) = provider.authenticate().await {
        return Err(provider_failure(err, report));
    }

    let stored = ctx.store.get_checkpoint(request.provider).await?;
    let resolved = resolve_window(
        request,
        stored.as_ref(),
        ctx.settings.default_window,
        Local::now().date_naive(),
    );
    report.window_source = Some(resolved.source);
    info!(
        window = ?resolved.window,
        source = ?resolved.source,
        advances_checkpoint = resolved.advances_checkpoint,
        "fetch window resolved"
    );

    let candidates = match provider
        .list_candidate_ids(&resolved.window, request.query.as_deref())
        .await
    {
        Ok(candidates) => candidates,
        Err(err) => return Err(provider_failure(err, report)),
    };
    report.candidates = candidates.len();
    ctx.update_progress(guard, &report);
    info!(candidates = candidates.len(), "starting download");

    ctx.archive.ensure_dir().await?;
    let mut ai = ctx.ai.start_run(request.classify, request.extract).await;
    let mut tracker =
        CheckpointTracker::new(request.provider, resolved.advances_checkpoint, stored.as_ref());
    let batch_size = ctx.settings.batch_size.max(1);
    let mut since_flush = 0usize;

    for descriptor in &candidates {
        if guard.is_cancelled() {
            report.cancelled = true;
            info!(processed = report.processed, "sync cancelled at message boundary");
            break;
        }
        report.processed += 1;

        match process_message(ctx, provider.as_ref(), request, &mut ai, descriptor).await {
            Ok(MessageOutcome::Downloaded { received }) => {
                report.downloaded += 1;
                tracker.observe(received.as_ref(), &descriptor.id);
                since_flush += 1;
                if since_flush >= batch_size {
                    since_flush = 0;
                    if let Err(err) = tracker.flush(ctx.store.as_ref()).await {
                        warn!(error = %err, "checkpoint save failed; will retry at the next batch");
                    }
                }
            }
            Ok(MessageOutcome::AlreadyArchived { received, healed }) => {
                report.skipped += 1;
                if healed {
                    report.healed += 1;
                }
                tracker.observe(received.as_ref(), &descriptor.id);
            }
            Ok(MessageOutcome::Filtered { received, category }) => {
                debug!(message_id = %descriptor.id, category = %category, "skipped by category filter");
                report.skipped += 1;
                report.filtered += 1;
                tracker.observe(received.as_ref(), &descriptor.id);
            }
            Ok(MessageOutcome::Vanished) => {
                report.skipped += 1;
            }
            Err(MessageFailure::Auth(message)) => {
                error!(message_id = %descriptor.id, error = %message, "authentication lost mid-run; aborting");
                if let Err(err) = tracker.flush(ctx.store.as_ref()).await {
                    warn!(error = %err, "checkpoint flush failed during abort");
                }
                report.ai = ai.report();
                report.checkpoint = ctx.store.get_checkpoint(request.provider).await.ok().flatten();
                report.finished_at = Some(Utc::now());
                return Err(SyncError::Auth {
                    message,
                    partial: Box::new(report),
                });
            }
            Err(failure) => {
                report.failed += 1;
                if !report.checkpoint_frozen {
                    warn!(
                        message_id = %descriptor.id,
                        error = %failure,
                        "message failed; checkpoint frozen for the rest of the run"
                    );
                } else {
                    warn!(message_id = %descriptor.id, error = %failure, "message failed");
                }
                tracker.freeze(failure.received().or(descriptor.received.as_ref()));
                report.checkpoint_frozen = true;
            }
        }
        ctx.update_progress(guard, &report);
    }

    tracker.flush(ctx.store.as_ref()).await?;
    report.ai = ai.report();
    report.checkpoint = ctx.store.get_checkpoint(request.provider).await?;
    report.finished_at = Some(Utc::now());
    ctx.update_progress(guard, &report);
    for line in report.summary() {
        info!("{line}");
    }
    Ok(report)
}

async fn process_message(
    ctx: &SyncContext,
    provider: &dyn MailProvider,
    request: &SyncRequest,
    ai: &mut AiRun<'_>,
    descriptor: &MessageDescriptor,
) -> Result<MessageOutcome, MessageFailure> {
    let message_id = descriptor.id.as_str();

    let existing = ctx
        .store
        .get(request.provider, message_id)
        .await
        .map_err(|error| MessageFailure::Persist {
            error,
            received: descriptor.received.clone(),
        })?;
    if let Some(existing) = existing {
        let received = existing.record.received_at.clone();
        let healed = heal_existing(ctx, existing.record).await?;
        debug!(message_id, healed, "already archived");
        return Ok(MessageOutcome::AlreadyArchived { received, healed });
    }

    let raw = match retry_transient(ctx.settings.fetch_policy(), "fetch message", || {
        provider.fetch_raw(descriptor)
    })
    .await
    {
        Ok(raw) => raw,
        Err(ProviderError::NotFound(_)) => {
            warn!(message_id, "message no longer exists upstream; skipping");
            return Ok(MessageOutcome::Vanished);
        }
        Err(ProviderError::Auth(message)) => return Err(MessageFailure::Auth(message)),
        Err(error) => {
            return Err(MessageFailure::Fetch {
                error,
                received: descriptor.received.clone(),
            });
        }
    };
    let received = raw
        .native_timestamp
        .clone()
        .or_else(|| descriptor.received.clone());

    let email = parse_or_empty(message_id, &raw.bytes);
    let enrichment = enrich(ai, request.classify, request.extract, message_id, &email, true).await;
    if let Some(category) = &enrichment.filtered {
        info!(message_id, category = %category, "category is configured to be skipped; not archiving");
        return Ok(MessageOutcome::Filtered {
            received,
            category: category.clone(),
        });
    }

    let received_utc = received.as_ref().and_then(NativeTimestamp::to_utc).or(email.date);
    let filename = artifact_name(
        request.rename,
        email.subject.as_deref(),
        received_utc,
        message_id,
        enrichment.classification.as_ref(),
    );
    let write_failure = |error: ArchiveError| MessageFailure::Write {
        error,
        received: received.clone(),
    };
    let bytes = if request.embed && enrichment.attempted() {
        embed_ai_headers(
            &raw.bytes,
            enrichment.classification.as_ref(),
            enrichment.extraction.as_ref(),
        )
        .map_err(write_failure)?
    } else {
        raw.bytes
    };
    let path = ctx
        .archive
        .write(&filename, &bytes)
        .await
        .map_err(write_failure)?;

    let ai_error = enrichment.ai_error();
    let ai_processed_at = enrichment.attempted().then(Utc::now);
    let record = MessageRecord {
        provider: request.provider,
        message_id: message_id.to_string(),
        sender: email.sender,
        to: email.to,
        cc: email.cc,
        bcc: email.bcc,
        subject: email.subject,
        received_at: received.clone(),
        file_path: path.clone(),
        classification_status: enrichment.classification_status,
        extraction_status: enrichment.extraction_status,
        classification: enrichment.classification,
        extraction: enrichment.extraction,
        ai_error,
        ai_processed_at,
    };
    ctx.store
        .record(&record)
        .await
        .map_err(|error| MessageFailure::Persist {
            error,
            received: received.clone(),
        })?;

    info!(
        message_id,
        path = %path.display(),
        category = record.classification.as_ref().map(|c| c.category.as_str()),
        classification = %record.classification_status,
        extraction = %record.extraction_status,
        "message archived"
    );

    if let Some(webhook) = &ctx.webhook {
        webhook.deliver(&path).await;
    }

    Ok(MessageOutcome::Downloaded { received })
}

/// Points an existing record at its artifact's current location.
async fn heal_existing(ctx: &SyncContext, mut record: MessageRecord) -> Result<bool, MessageFailure> {
    match ctx.archive.heal_path(&record.file_path).await {
        FileLocation::Present => Ok(false),
        FileLocation::Moved(current) => {
            let previous = std::mem::replace(&mut record.file_path, current);
            ctx.store
                .record(&record)
                .await
                .map_err(|error| MessageFailure::Persist {
                    error,
                    received: record.received_at.clone(),
                })?;
            info!(
                message_id = %record.message_id,
                from = %previous.display(),
                to = %record.file_path.display(),
                "archived file moved; path healed"
            );
            Ok(true)
        }
        FileLocation::Missing => {
            warn!(
                message_id = %record.message_id,
                path = %record.file_path.display(),
                "archived file is missing; not re-downloading"
            );
            Ok(false)
        }
    }
}

#[derive(Debug, Error)]
enum ReanalysisFailure {
    #[error("archived file missing at {0}")]
    Missing(PathBuf),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Reanalyzed {
    healed: bool,
    updated: bool,
}

async fn reanalyze(
    ctx: &SyncContext,
    guard: &RunGuard,
    request: &SyncRequest,
) -> Result<SyncReport, SyncError> {
    let mut report = SyncReport::new(guard.run_id(), request.provider, RunMode::LocalOnly);
    let records = ctx.store.records_for_reanalysis(Some(request.provider)).await?;
    report.candidates = records.len();
    ctx.update_progress(guard, &report);
    info!(records = records.len(), "starting local re-analysis");

    let mut ai = ctx.ai.start_run(request.classify, request.extract).await;
    for archived in records {
        if guard.is_cancelled() {
            report.cancelled = true;
            info!(processed = report.processed, "re-analysis cancelled");
            break;
        }
        report.processed += 1;
        let message_id = archived.record.message_id.clone();

        match reanalyze_record(ctx, request, &mut ai, archived.record).await {
            Ok(outcome) => {
                if outcome.healed {
                    report.healed += 1;
                }
                if outcome.updated {
                    report.reanalyzed += 1;
                } else {
                    report.skipped += 1;
                }
            }
            Err(err) => {
                report.failed += 1;
                warn!(message_id, error = %err, "re-analysis failed");
            }
        }
        ctx.update_progress(guard, &report);
    }

    report.ai = ai.report();
    report.checkpoint = ctx.store.get_checkpoint(request.provider).await?;
    report.finished_at = Some(Utc::now());
    for line in report.summary() {
        info!("{line}");
    }
    Ok(report)
}

async fn reanalyze_record(
    ctx: &SyncContext,
    request: &SyncRequest,
    ai: &mut AiRun<'_>,
    mut record: MessageRecord,
) -> Result<Reanalyzed, ReanalysisFailure> {
    let (path, healed) = match ctx.archive.heal_path(&record.file_path).await {
        FileLocation::Present => (record.file_path.clone(), false),
        FileLocation::Moved(current) => (current, true),
        FileLocation::Missing => return Err(ReanalysisFailure::Missing(record.file_path)),
    };
    record.file_path = path.clone();

    let classify = request.classify && record.classification_status.needs_reanalysis();
    let extract = request.extract && record.extraction_status.needs_reanalysis();
    if !classify && !extract {
        if healed {
            ctx.store.record(&record).await?;
        }
        return Ok(Reanalyzed {
            healed,
            updated: false,
        });
    }

    let bytes = ctx.archive.read(&path).await?;
    let email = parse_or_empty(&record.message_id, &bytes);
    let enrichment = enrich(ai, classify, extract, &record.message_id, &email, false).await;

    if classify {
        record.classification_status = enrichment.classification_status;
        if enrichment.classification.is_some() {
            record.classification = enrichment.classification.clone();
        }
    } else if record.classification.is_none() {
        record.classification = enrichment.classification.clone();
    }
    if extract {
        record.extraction_status = enrichment.extraction_status;
        if enrichment.extraction.is_some() {
            record.extraction = enrichment.extraction.clone();
        }
    }
    record.ai_error = enrichment.ai_error();
    record.ai_processed_at = Some(Utc::now());

    if request.embed || request.rename {
        let bytes = if request.embed {
            embed_ai_headers(&bytes, record.classification.as_ref(), record.extraction.as_ref())?
        } else {
            bytes
        };
        let filename = if request.rename {
            let received = record
                .received_at
                .as_ref()
                .and_then(NativeTimestamp::to_utc)
                .or(email.date);
            artifact_name(
                true,
                record.subject.as_deref(),
                received,
                &record.message_id,
                record.classification.as_ref(),
            )
        } else {
            path.file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| archive_filename(record.subject.as_deref(), None, &record.message_id))
        };
        record.file_path = ctx.archive.replace(&path, &filename, &bytes).await?;
    }

    ctx.store.record(&record).await?;
    info!(
        message_id = %record.message_id,
        classification = %record.classification_status,
        extraction = %record.extraction_status,
        "record re-analyzed"
    );
    Ok(Reanalyzed {
        healed,
        updated: true,
    })
}
