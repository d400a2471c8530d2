use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use super::error::{AiErrorKind, LLMError};
use crate::types::Capability;

/// Per-run failure tracking for one AI capability.
///
/// Network and auth failures share one streak counter and trip quickly;
/// server errors trip after a longer streak. Any reply from the endpoint
/// other than a server error clears both streaks. Once disabled, a breaker
/// stays disabled for the rest of the run.
#[derive(Debug, Clone)]
pub struct CapabilityBreaker {
    capability: Capability,
    fast_trip_threshold: u32,
    server_error_threshold: u32,
    fast_trip_streak: u32,
    server_streak: u32,
    disabled_reason: Option<String>,
    successes: u32,
    failures: u32,
    disabled_skips: u32,
    errors_by_kind: BTreeMap<AiErrorKind, u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityReport {
    pub capability: Capability,
    pub enabled: bool,
    pub disabled_reason: Option<String>,
    pub successes: u32,
    pub failures: u32,
    /// Messages that got `disabled` status without a call being made.
    pub disabled_skips: u32,
    pub errors_by_kind: BTreeMap<AiErrorKind, u32>,
}

impl CapabilityReport {
    pub fn summary(&self) -> String {
        let mut line = if let Some(reason) = &self.disabled_reason {
            format!("{}: disabled ({reason})", self.capability)
        } else {
            format!(
                "{}: {} succeeded, {} failed",
                self.capability, self.successes, self.failures
            )
        };
        if !self.errors_by_kind.is_empty() {
            let breakdown = self
                .errors_by_kind
                .iter()
                .map(|(kind, count)| format!("{kind}: {count}"))
                .collect::<Vec<_>>()
                .join(", ");
            line.push_str(&format!(" [{breakdown}]"));
        }
        line
    }
}

impl CapabilityBreaker {
    pub fn new(capability: Capability, fast_trip_threshold: u32, server_error_threshold: u32) -> Self {
        Self {
            capability,
            fast_trip_threshold: fast_trip_threshold.max(1),
            server_error_threshold: server_error_threshold.max(1),
            fast_trip_streak: 0,
            server_streak: 0,
            disabled_reason: None,
            successes: 0,
            failures: 0,
            disabled_skips: 0,
            errors_by_kind: BTreeMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.disabled_reason.is_none()
    }

    pub fn disabled_reason(&self) -> Option<&str> {
        self.disabled_reason.as_deref()
    }

    pub fn record_success(&mut self) {
        self.successes += 1;
        self.fast_trip_streak = 0;
        self.server_streak = 0;
    }

    /// Counts a failed call. Returns `true` when this failure tripped the
    /// breaker.
    pub fn record_failure(&mut self, err: &LLMError) -> bool {
        let kind = err.kind();
        self.failures += 1;
        *self.errors_by_kind.entry(kind).or_default() += 1;

        if !self.is_enabled() {
            return false;
        }

        match kind {
            AiErrorKind::Network | AiErrorKind::Auth => {
                self.fast_trip_streak += 1;
                self.server_streak = 0;
                warn!(
                    capability = %self.capability,
                    kind = %kind,
                    streak = self.fast_trip_streak,
                    error = %err,
                    "model endpoint failure"
                );
                if self.fast_trip_streak >= self.fast_trip_threshold {
                    let reason = match kind {
                        AiErrorKind::Auth => "authentication failed",
                        _ => "endpoint unreachable",
                    };
                    self.trip(format!("{reason}: {err}"));
                    return true;
                }
            }
            AiErrorKind::Server => {
                self.fast_trip_streak = 0;
                self.server_streak += 1;
                warn!(
                    capability = %self.capability,
                    streak = self.server_streak,
                    error = %err,
                    "model server error"
                );
                if self.server_streak >= self.server_error_threshold {
                    self.trip(format!(
                        "{} consecutive server errors: {err}",
                        self.server_streak
                    ));
                    return true;
                }
            }
            AiErrorKind::RateLimit | AiErrorKind::Parse | AiErrorKind::Other => {
                self.fast_trip_streak = 0;
                self.server_streak = 0;
                warn!(capability = %self.capability, kind = %kind, error = %err, "model call failed");
            }
        }
        false
    }

    /// Disables without counting a call, e.g. after a failed health probe.
    pub fn disable(&mut self, reason: impl Into<String>) {
        if self.is_enabled() {
            self.trip(reason.into());
        }
    }

    pub fn record_disabled_skip(&mut self) {
        self.disabled_skips += 1;
    }

    fn trip(&mut self, reason: String) {
        error!(capability = %self.capability, reason = %reason, "disabling AI capability for this run");
        self.disabled_reason = Some(reason);
    }

    pub fn report(&self) -> CapabilityReport {
        CapabilityReport {
            capability: self.capability,
            enabled: self.is_enabled(),
            disabled_reason: self.disabled_reason.clone(),
            successes: self.successes,
            failures: self.failures,
            disabled_skips: self.disabled_skips,
            errors_by_kind: self.errors_by_kind.clone(),
        }
    }
}
