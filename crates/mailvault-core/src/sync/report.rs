use chrono::{DateTime, Utc};
use serde::Serialize;

use super::window::WindowSource;
use crate::ai::AiRunReport;
use crate::checkpoints::Checkpoint;
use crate::types::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Fetch,
    LocalOnly,
}

/// Counters surfaced while a run is in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncProgress {
    pub candidates: usize,
    pub processed: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// End-of-run summary. Mailbox totals and AI capability health are kept
/// apart so an unreachable model endpoint is not mistaken for an empty
/// mailbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub provider: Provider,
    pub mode: RunMode,
    pub window_source: Option<WindowSource>,
    pub candidates: usize,
    pub processed: usize,
    pub downloaded: usize,
    /// Already archived, vanished upstream, or filtered by category.
    pub skipped: usize,
    /// Subset of `skipped` dropped by the skip-category filter.
    pub filtered: usize,
    pub healed: usize,
    pub failed: usize,
    /// Records rewritten by local-only re-analysis.
    pub reanalyzed: usize,
    pub cancelled: bool,
    /// A per-message failure stopped checkpoint advancement.
    pub checkpoint_frozen: bool,
    pub checkpoint: Option<Checkpoint>,
    pub ai: AiRunReport,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncReport {
    pub fn new(run_id: impl Into<String>, provider: Provider, mode: RunMode) -> Self {
        Self {
            run_id: run_id.into(),
            provider,
            mode,
            window_source: None,
            candidates: 0,
            processed: 0,
            downloaded: 0,
            skipped: 0,
            filtered: 0,
            healed: 0,
            failed: 0,
            reanalyzed: 0,
            cancelled: false,
            checkpoint_frozen: false,
            checkpoint: None,
            ai: AiRunReport::default(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn progress(&self) -> SyncProgress {
        SyncProgress {
            candidates: self.candidates,
            processed: self.processed,
            downloaded: self.downloaded,
            skipped: self.skipped,
            failed: self.failed,
        }
    }

    pub fn summary(&self) -> Vec<String> {
        let mut lines = vec![format!(
            "{} {}: processed {} of {} candidates, downloaded {}, skipped {} ({} filtered), healed {}, failed {}{}",
            self.provider,
            match self.mode {
                RunMode::Fetch => "sync",
                RunMode::LocalOnly => "re-analysis",
            },
            self.processed,
            self.candidates,
            self.downloaded,
            self.skipped,
            self.filtered,
            self.healed,
            self.failed,
            if self.cancelled { " (cancelled)" } else { "" },
        )];
        if self.mode == RunMode::LocalOnly {
            lines.push(format!("re-analyzed {} records", self.reanalyzed));
        }
        match &self.checkpoint {
            Some(checkpoint) => lines.push(format!(
                "checkpoint: {}{}",
                checkpoint.value.native_value(),
                if self.checkpoint_frozen { " (frozen after a failure)" } else { "" }
            )),
            None => lines.push("checkpoint: none".to_string()),
        }
        lines.extend(self.ai.summary());
        lines
    }
}
