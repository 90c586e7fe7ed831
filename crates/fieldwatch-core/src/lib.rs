//! Canonical record and read-view types for Fieldwatch.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const CRATE_NAME: &str = "fieldwatch-core";

/// Sentinel written whenever an upstream timestamp is absent or unparsable.
pub const EPOCH_TIMESTAMP: &str = "1970-01-01 00:00:00";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Canonical problem record, fully replaced on every sync cycle that
/// re-observes its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub label: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    pub severity: String,
    pub status: String,
    pub timeframe: String,
    pub action_taken: String,
    pub costusd: String,
    pub savedusd: String,
    pub recommended_contact: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_at: String,
    pub updated_at: String,
    pub creator_id: String,
    pub creator_name: String,
    pub version: String,
}

/// Photo keyed by the submission that produced it; never overwritten once
/// stored. Joined to issues by `title == Issue.label`, a soft string match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub submission_id: String,
    pub title: String,
    pub label: Option<String>,
    pub image: Vec<u8>,
}

/// Action/resolution record attached to an issue. `entity_problem` is a soft
/// reference: it may name an issue id the store has never seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub key: String,
    pub submission_date: String,
    pub entity_problem: Option<String>,
    pub action_role: Option<String>,
    pub action_status: Option<String>,
    pub action_action_taken: Option<String>,
    pub action_image: Option<Vec<u8>>,
    pub action_resolution_costusd: Option<String>,
    pub action_resolution_timeframe: Option<String>,
    pub action_recommended_contact: Option<String>,
    pub submitter_name: Option<String>,
}

/// Issue enriched for readers: status recomputed against the response count,
/// image joined by label and base64-encoded.
#[derive(Debug, Clone, Serialize)]
pub struct IssueView {
    #[serde(flatten)]
    pub issue: Issue,
    /// Base64 photo bytes; `None` (an explicit JSON null) when no image row
    /// matched the issue label.
    pub image: Option<String>,
}

/// Response as served to readers, attachment base64-encoded. Field names
/// mirror the persisted upstream casing consumers already depend on.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseView {
    #[serde(rename = "KEY")]
    pub key: String,
    #[serde(rename = "SubmissionDate")]
    pub submission_date: String,
    pub entity_problem: Option<String>,
    pub action_role: Option<String>,
    pub action_status: Option<String>,
    pub action_action_taken: Option<String>,
    pub action_image: Option<String>,
    pub action_resolution_costusd: Option<String>,
    pub action_resolution_timeframe: Option<String>,
    pub action_recommended_contact: Option<String>,
    #[serde(rename = "SubmitterName")]
    pub submitter_name: Option<String>,
}

/// Read-side status vocabulary. Anything outside it collapses to `New`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueStatus {
    New,
    Open,
    Waiting,
    Fixed,
}

impl IssueStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "open" => Self::Open,
            "waiting" => Self::Waiting,
            "fixed" => Self::Fixed,
            _ => Self::New,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Open => "open",
            Self::Waiting => "waiting",
            Self::Fixed => "fixed",
        }
    }
}

/// Status reported to readers: an issue nobody has responded to is always
/// `new`, whatever the stored value says.
pub fn effective_status(stored: &str, has_responses: bool) -> &'static str {
    if !has_responses {
        return IssueStatus::New.as_str();
    }
    IssueStatus::parse(stored).as_str()
}

/// Normalize an upstream timestamp to `YYYY-MM-DD HH:MM:SS` (UTC).
///
/// Accepts RFC 3339 (offsets are converted to UTC), naive ISO-8601 with `T`
/// or space separators and optional fractional seconds, and bare dates
/// (taken as midnight). Anything else, including empty input, yields
/// [`EPOCH_TIMESTAMP`] rather than an error.
pub fn normalize_timestamp(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return EPOCH_TIMESTAMP.to_string();
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return dt.with_timezone(&Utc).format(TIMESTAMP_FORMAT).to_string();
    }

    let stripped = raw.trim_end_matches('Z');
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(stripped, format) {
            return dt.format(TIMESTAMP_FORMAT).to_string();
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(stripped, "%Y-%m-%d") {
        return date.and_time(NaiveTime::MIN).format(TIMESTAMP_FORMAT).to_string();
    }

    warn!(raw, "unparsable upstream timestamp, using epoch sentinel");
    EPOCH_TIMESTAMP.to_string()
}
