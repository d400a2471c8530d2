use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoints::Checkpoint;
use crate::config::DefaultWindow;
use crate::providers::FetchWindow;
use crate::types::Provider;

/// One sync invocation, as asked for by the CLI or the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub provider: Provider,
    /// Resume from the stored checkpoint.
    #[serde(default)]
    pub incremental: bool,
    /// Messages received on or after this local date.
    #[serde(default)]
    pub since: Option<NaiveDate>,
    #[serde(default)]
    pub after_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    /// Provider-side free-text search.
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub classify: bool,
    #[serde(default)]
    pub extract: bool,
    #[serde(default)]
    pub rename: bool,
    #[serde(default)]
    pub embed: bool,
    /// Re-run AI over archived messages without contacting the provider.
    #[serde(default)]
    pub local_only: bool,
}

impl SyncRequest {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            incremental: false,
            since: None,
            after_id: None,
            message_id: None,
            query: None,
            classify: false,
            extract: false,
            rename: false,
            embed: false,
            local_only: false,
        }
    }

    pub fn incremental(mut self) -> Self {
        self.incremental = true;
        self
    }

    pub fn with_ai(mut self, classify: bool, extract: bool) -> Self {
        self.classify = classify;
        self.extract = extract;
        self
    }

    fn search(&self) -> Option<&str> {
        self.query.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }
}

/// Which input decided the fetch window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowSource {
    MessageId,
    AfterId,
    Since,
    Checkpoint,
    Today,
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedWindow {
    pub window: FetchWindow,
    pub source: WindowSource,
    /// Whether a complete pass over this window may move the checkpoint.
    pub advances_checkpoint: bool,
}

pub fn start_of_local_day(date: NaiveDate) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::MIN);
    Local
        .from_local_datetime(&midnight)
        .earliest()
        .map(|at| at.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&midnight))
}

/// Picks the window by precedence: message id, after-id, since date, stored
/// checkpoint (incremental runs only), then the configured default.
///
/// The checkpoint only moves for unfiltered windows that start at or before
/// it, so a run never leaves a gap behind the mark.
pub fn resolve_window(
    request: &SyncRequest,
    checkpoint: Option<&Checkpoint>,
    default: DefaultWindow,
    today: NaiveDate,
) -> ResolvedWindow {
    let mark = checkpoint.and_then(|c| c.value.to_utc());
    let unfiltered = request.search().is_none();
    let covers_mark = |start: DateTime<Utc>| unfiltered && mark.is_none_or(|mark| start <= mark);

    if let Some(id) = request.message_id.as_deref().filter(|id| !id.is_empty()) {
        return ResolvedWindow {
            window: FetchWindow::Single(id.to_string()),
            source: WindowSource::MessageId,
            advances_checkpoint: false,
        };
    }
    if let Some(id) = request.after_id.as_deref().filter(|id| !id.is_empty()) {
        return ResolvedWindow {
            window: FetchWindow::AfterId(id.to_string()),
            source: WindowSource::AfterId,
            advances_checkpoint: false,
        };
    }
    if let Some(date) = request.since {
        let start = start_of_local_day(date);
        return ResolvedWindow {
            window: FetchWindow::Since(start),
            source: WindowSource::Since,
            advances_checkpoint: covers_mark(start),
        };
    }
    if request.incremental {
        if let Some(mark) = mark {
            return ResolvedWindow {
                window: FetchWindow::Since(mark),
                source: WindowSource::Checkpoint,
                advances_checkpoint: unfiltered,
            };
        }
    }
    match default {
        DefaultWindow::Today => {
            let start = start_of_local_day(today);
            ResolvedWindow {
                window: FetchWindow::Since(start),
                source: WindowSource::Today,
                advances_checkpoint: covers_mark(start),
            }
        }
        DefaultWindow::All => ResolvedWindow {
            window: FetchWindow::Unbounded,
            source: WindowSource::All,
            advances_checkpoint: unfiltered,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NativeTimestamp;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn checkpoint_at(at: DateTime<Utc>) -> Checkpoint {
        Checkpoint::new(Provider::Gmail, NativeTimestamp::EpochMillis(at.timestamp_millis()))
    }

    #[test]
    fn message_id_beats_everything() {
        let mut request = SyncRequest::new(Provider::Gmail).incremental();
        request.message_id = Some("m1".into());
        request.after_id = Some("m0".into());
        request.since = Some(day(2024, 1, 1));

        let resolved = resolve_window(&request, None, DefaultWindow::Today, day(2024, 6, 1));
        assert_eq!(resolved.window, FetchWindow::Single("m1".into()));
        assert_eq!(resolved.source, WindowSource::MessageId);
        assert!(!resolved.advances_checkpoint);
    }

    #[test]
    fn after_id_beats_since_and_checkpoint() {
        let mut request = SyncRequest::new(Provider::Gmail).incremental();
        request.after_id = Some("m0".into());
        request.since = Some(day(2024, 1, 1));

        let resolved = resolve_window(&request, None, DefaultWindow::All, day(2024, 6, 1));
        assert_eq!(resolved.window, FetchWindow::AfterId("m0".into()));
    }

    #[test]
    fn since_beats_checkpoint() {
        let mut request = SyncRequest::new(Provider::Gmail).incremental();
        request.since = Some(day(2024, 1, 1));
        let mark = start_of_local_day(day(2024, 3, 1));

        let resolved = resolve_window(
            &request,
            Some(&checkpoint_at(mark)),
            DefaultWindow::Today,
            day(2024, 6, 1),
        );
        assert_eq!(resolved.window, FetchWindow::Since(start_of_local_day(day(2024, 1, 1))));
        assert_eq!(resolved.source, WindowSource::Since);
        assert!(resolved.advances_checkpoint);
    }

    #[test]
    fn incremental_resumes_from_checkpoint() {
        let request = SyncRequest::new(Provider::Gmail).incremental();
        let mark = start_of_local_day(day(2024, 3, 1));

        let resolved = resolve_window(
            &request,
            Some(&checkpoint_at(mark)),
            DefaultWindow::Today,
            day(2024, 6, 1),
        );
        assert_eq!(resolved.window, FetchWindow::Since(mark));
        assert_eq!(resolved.source, WindowSource::Checkpoint);
        assert!(resolved.advances_checkpoint);
    }

    #[test]
    fn non_incremental_runs_ignore_checkpoint_and_use_default() {
        let request = SyncRequest::new(Provider::Gmail);
        let mark = start_of_local_day(day(2024, 3, 1));
        let today = day(2024, 6, 1);

        let resolved = resolve_window(&request, Some(&checkpoint_at(mark)), DefaultWindow::Today, today);
        assert_eq!(resolved.window, FetchWindow::Since(start_of_local_day(today)));
        assert_eq!(resolved.source, WindowSource::Today);
        // Starting after the mark would leave a gap.
        assert!(!resolved.advances_checkpoint);

        let resolved = resolve_window(&request, Some(&checkpoint_at(mark)), DefaultWindow::All, today);
        assert_eq!(resolved.window, FetchWindow::Unbounded);
        assert!(resolved.advances_checkpoint);
    }

    #[test]
    fn incremental_without_checkpoint_falls_back_to_default() {
        let request = SyncRequest::new(Provider::M365).incremental();
        let resolved = resolve_window(&request, None, DefaultWindow::Today, day(2024, 6, 1));
        assert_eq!(resolved.source, WindowSource::Today);
        assert!(resolved.advances_checkpoint);
    }

    #[test]
    fn searches_never_move_the_checkpoint() {
        let mut request = SyncRequest::new(Provider::Gmail);
        request.query = Some("from:billing".into());
        let resolved = resolve_window(&request, None, DefaultWindow::All, day(2024, 6, 1));
        assert!(!resolved.advances_checkpoint);
    }
}
