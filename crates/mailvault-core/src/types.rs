use std::{cmp::Ordering, fmt, str::FromStr};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Remote mailbox families the archiver can pull from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gmail,
    M365,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::Gmail, Provider::M365];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Gmail => "gmail",
            Provider::M365 => "m365",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown provider '{0}'")]
pub struct UnknownProvider(pub String);

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gmail" => Ok(Provider::Gmail),
            "m365" | "outlook" | "graph" => Ok(Provider::M365),
            other => Err(UnknownProvider(other.to_string())),
        }
    }
}

/// A timestamp in the form the provider reports it.
///
/// Gmail hands out epoch milliseconds, Graph hands out ISO-8601 strings. Both
/// are kept verbatim for checkpoints and compared through [`position`].
///
/// [`position`]: NativeTimestamp::position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum NativeTimestamp {
    EpochMillis(i64),
    Iso8601(String),
}

impl NativeTimestamp {
    /// Milliseconds since the Unix epoch, `None` if the ISO form doesn't parse.
    pub fn position(&self) -> Option<i64> {
        match self {
            NativeTimestamp::EpochMillis(ms) => Some(*ms),
            NativeTimestamp::Iso8601(value) => DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|dt| dt.timestamp_millis()),
        }
    }

    pub fn to_utc(&self) -> Option<DateTime<Utc>> {
        self.position()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }

    /// The verbatim provider value, as stored in checkpoints.
    pub fn native_value(&self) -> String {
        match self {
            NativeTimestamp::EpochMillis(ms) => ms.to_string(),
            NativeTimestamp::Iso8601(value) => value.clone(),
        }
    }

    /// Rebuilds a timestamp from its stored native value for `provider`.
    pub fn from_native(provider: Provider, value: &str) -> Option<Self> {
        match provider {
            Provider::Gmail => value.trim().parse().ok().map(NativeTimestamp::EpochMillis),
            Provider::M365 => {
                let ts = NativeTimestamp::Iso8601(value.trim().to_string());
                ts.position().map(|_| ts)
            }
        }
    }

    pub fn for_provider(provider: Provider, at: DateTime<Utc>) -> Self {
        match provider {
            Provider::Gmail => NativeTimestamp::EpochMillis(at.timestamp_millis()),
            Provider::M365 => {
                NativeTimestamp::Iso8601(at.to_rfc3339_opts(SecondsFormat::Secs, true))
            }
        }
    }

    /// Orders by position; unparseable values sort first.
    pub fn cmp_position(&self, other: &Self) -> Ordering {
        self.position().cmp(&other.position())
    }
}

/// Per-capability outcome recorded on every archived message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiStatus {
    NotAttempted,
    Success,
    Failed,
    Disabled,
    Skipped,
}

impl AiStatus {
    pub const ALL: [AiStatus; 5] = [
        AiStatus::NotAttempted,
        AiStatus::Success,
        AiStatus::Failed,
        AiStatus::Disabled,
        AiStatus::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AiStatus::NotAttempted => "not_attempted",
            AiStatus::Success => "success",
            AiStatus::Failed => "failed",
            AiStatus::Disabled => "disabled",
            AiStatus::Skipped => "skipped",
        }
    }

    pub fn needs_reanalysis(&self) -> bool {
        matches!(self, AiStatus::Failed | AiStatus::Disabled)
    }
}

impl fmt::Display for AiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AiStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AiStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown ai status '{s}'"))
    }
}

/// The two model-backed enrichments applied to each message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Classification,
    Extraction,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Classification => "classification",
            Capability::Extraction => "extraction",
        }
    }

    pub(crate) fn status_column(&self) -> &'static str {
        match self {
            Capability::Classification => "classification_status",
            Capability::Extraction => "extraction_status",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
