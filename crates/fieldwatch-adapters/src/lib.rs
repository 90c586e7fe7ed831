//! Normalizers mapping raw ODK Central payloads into canonical records.
//!
//! Upstream payloads are partially malformed often enough that everything
//! here is tolerant: records lacking identity are dropped with a warning,
//! issue text fields fall back to fixed defaults, response fields stay null
//! when absent, and bad geometry or timestamps resolve to documented
//! sentinels instead of errors.

use std::collections::BTreeMap;

use fieldwatch_core::{normalize_timestamp, Image, Issue, Response};
use fieldwatch_storage::RemoteClient;
use serde_json::Value as JsonValue;
use tracing::warn;

pub const CRATE_NAME: &str = "fieldwatch-adapters";

pub const PROBLEMS_DATASET: &str = "problems";
pub const RESPONSE_FORM: &str = "address_problem";
pub const REPORT_FORM: &str = "report_problem";

pub fn entities_endpoint(project_id: &str) -> String {
    format!("v1/projects/{project_id}/datasets/{PROBLEMS_DATASET}.svc/Entities")
}

pub fn responses_endpoint(project_id: &str) -> String {
    format!("v1/projects/{project_id}/forms/{RESPONSE_FORM}.svc/Submissions")
}

pub fn reports_endpoint(project_id: &str) -> String {
    format!("v1/projects/{project_id}/forms/{REPORT_FORM}.svc/Submissions")
}

pub fn attachment_endpoint(
    project_id: &str,
    form: &str,
    submission_id: &str,
    filename: &str,
) -> String {
    format!("v1/projects/{project_id}/forms/{form}/submissions/{submission_id}/attachments/{filename}")
}

/// Map one raw entity into a canonical [`Issue`]. Records without an id are
/// unusable and dropped.
pub fn parse_entity(raw: &JsonValue) -> Option<Issue> {
    let Some(id) = record_id(raw) else {
        warn!("entity without __id skipped");
        return None;
    };
    let system = raw.get("__system").cloned().unwrap_or(JsonValue::Null);
    let (latitude, longitude) =
        parse_geometry(raw.get("geometry").and_then(JsonValue::as_str).unwrap_or(""));
    Some(Issue {
        id,
        label: text_field(raw, "label", "Untitled Issue"),
        kind: text_field(raw, "type", "Unknown"),
        description: text_field(raw, "description", "No Description"),
        severity: text_field(raw, "severity", "Not Specified"),
        status: text_field(raw, "status", "new"),
        timeframe: text_field(raw, "timeframe", "No Timeframe"),
        action_taken: text_field(raw, "action_taken", "No Action Taken"),
        costusd: text_field(raw, "costusd", "0"),
        savedusd: text_field(raw, "savedusd", "N/A"),
        recommended_contact: text_field(raw, "recommended_contact", "No Contact"),
        latitude,
        longitude,
        created_at: normalize_timestamp(&text_field(&system, "createdAt", "")),
        updated_at: normalize_timestamp(&text_field(&system, "updatedAt", "")),
        creator_id: text_field(&system, "creatorId", "Unknown"),
        creator_name: text_field(&system, "creatorName", "Unknown"),
        version: text_field(&system, "version", "No Version"),
    })
}

/// Normalize a full entity batch, keyed by id. When the same id appears
/// twice in one batch the later record wins.
pub fn normalize_entities(payload: &JsonValue) -> BTreeMap<String, Issue> {
    let mut issues = BTreeMap::new();
    for raw in batch(payload) {
        if let Some(issue) = parse_entity(raw) {
            issues.insert(issue.id.clone(), issue);
        }
    }
    issues
}

/// Split a whitespace-separated geometry string and take the first two
/// tokens as latitude then longitude. Any shortfall or parse failure yields
/// a fully-null pair, never a partial one.
pub fn parse_geometry(raw: &str) -> (Option<f64>, Option<f64>) {
    let mut tokens = raw.split_whitespace();
    let (Some(first), Some(second)) = (tokens.next(), tokens.next()) else {
        return (None, None);
    };
    match (first.parse::<f64>(), second.parse::<f64>()) {
        (Ok(latitude), Ok(longitude)) => (Some(latitude), Some(longitude)),
        _ => {
            warn!(raw, "invalid geometry, storing null coordinates");
            (None, None)
        }
    }
}

/// Pure half of response normalization: the canonical record (attachment
/// still empty) plus the attachment filename when the action names one.
pub fn parse_response(submission: &JsonValue) -> Option<(Response, Option<String>)> {
    let Some(key) = record_id(submission) else {
        warn!("submission without __id skipped");
        return None;
    };
    let system = submission.get("__system").cloned().unwrap_or(JsonValue::Null);
    let action = submission.get("action").cloned().unwrap_or(JsonValue::Null);
    let filename = opt_text(&action, "image").filter(|f| !f.is_empty());
    let response = Response {
        key,
        submission_date: normalize_timestamp(&text_field(&system, "submissionDate", "")),
        entity_problem: submission
            .get("entity")
            .and_then(|entity| opt_text(entity, "problem")),
        action_role: opt_text(&action, "role"),
        action_status: opt_text(&action, "status"),
        action_action_taken: opt_text(&action, "action_taken"),
        action_image: None,
        action_resolution_costusd: opt_text(&action, "resolution_costusd"),
        action_resolution_timeframe: opt_text(&action, "resolution_timeframe"),
        action_recommended_contact: opt_text(&action, "recommended_contact"),
        submitter_name: opt_text(&system, "submitterName"),
    };
    Some((response, filename))
}

/// Normalize a response batch, resolving named attachments through the
/// client. A failed download keeps the response and emits it without an
/// image; one bad attachment never drops the record.
pub async fn resolve_responses(
    client: &RemoteClient,
    project_id: &str,
    payload: &JsonValue,
) -> Vec<Response> {
    let mut responses = Vec::new();
    for submission in batch(payload) {
        let Some((mut response, filename)) = parse_response(submission) else {
            continue;
        };
        if let Some(filename) = filename {
            let endpoint =
                attachment_endpoint(project_id, RESPONSE_FORM, &response.key, &filename);
            match client.get_bytes(&endpoint).await {
                Ok(bytes) => response.action_image = Some(bytes),
                Err(error) => warn!(
                    submission = %response.key,
                    %error,
                    "attachment download failed, keeping response without image"
                ),
            }
        }
        responses.push(response);
    }
    responses
}

/// A report submission that names a photo, before the download happens.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingImage {
    pub submission_id: String,
    pub title: String,
    pub label: Option<String>,
    pub filename: String,
}

/// Pure half of image resolution: only submissions naming an image filename
/// produce a candidate; the rest are skipped with a warning.
pub fn parse_report(submission: &JsonValue) -> Option<PendingImage> {
    let Some(submission_id) = record_id(submission) else {
        warn!("report submission without __id skipped");
        return None;
    };
    let problem = submission.get("problem").cloned().unwrap_or(JsonValue::Null);
    let Some(filename) = opt_text(&problem, "problem_image").filter(|f| !f.is_empty()) else {
        warn!(submission = %submission_id, "report submission carries no image");
        return None;
    };
    Some(PendingImage {
        title: text_field(&problem, "problem_title", "Untitled Image"),
        label: opt_text(&problem, "problem_label"),
        submission_id,
        filename,
    })
}

/// Download every named report image, keyed by submission id. A failed
/// download skips that one submission, not the batch.
pub async fn resolve_images(
    client: &RemoteClient,
    project_id: &str,
    payload: &JsonValue,
) -> BTreeMap<String, Image> {
    let mut images = BTreeMap::new();
    for submission in batch(payload) {
        let Some(pending) = parse_report(submission) else {
            continue;
        };
        let endpoint = attachment_endpoint(
            project_id,
            REPORT_FORM,
            &pending.submission_id,
            &pending.filename,
        );
        match client.get_bytes(&endpoint).await {
            Ok(bytes) => {
                images.insert(
                    pending.submission_id.clone(),
                    Image {
                        submission_id: pending.submission_id,
                        title: pending.title,
                        label: pending.label,
                        image: bytes,
                    },
                );
            }
            Err(error) => warn!(
                submission = %pending.submission_id,
                %error,
                "image download failed, skipping submission"
            ),
        }
    }
    images
}

/// Records arrive under a `value` wrapper (OData convention); a missing or
/// non-array wrapper reads as an empty batch.
fn batch(payload: &JsonValue) -> &[JsonValue] {
    payload
        .get("value")
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn record_id(record: &JsonValue) -> Option<String> {
    record
        .get("__id")
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ToString::to_string)
}

/// Text with a fixed default: strings pass through, stray numbers and bools
/// are stringified, anything else (including null) takes the default.
fn text_field(record: &JsonValue, key: &str, default: &str) -> String {
    match record.get(key) {
        Some(JsonValue::String(s)) => s.clone(),
        Some(JsonValue::Number(n)) => n.to_string(),
        Some(JsonValue::Bool(b)) => b.to_string(),
        _ => default.to_string(),
    }
}

/// Null-preserving variant for the sparser response fields.
fn opt_text(record: &JsonValue, key: &str) -> Option<String> {
    match record.get(key)? {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_with_geometry_maps_to_issue() {
        let raw = json!({
            "__id": "E1",
            "label": "Pothole",
            "geometry": "1.23 4.56 0"
        });
        let issue = parse_entity(&raw).expect("issue");
        assert_eq!(issue.id, "E1");
        assert_eq!(issue.label, "Pothole");
        assert_eq!(issue.latitude, Some(1.23));
        assert_eq!(issue.longitude, Some(4.56));
    }

    #[test]
    fn entity_defaults_fill_missing_fields() {
        let issue = parse_entity(&json!({ "__id": "E2" })).expect("issue");
        assert_eq!(issue.label, "Untitled Issue");
        assert_eq!(issue.kind, "Unknown");
        assert_eq!(issue.description, "No Description");
        assert_eq!(issue.severity, "Not Specified");
        assert_eq!(issue.status, "new");
        assert_eq!(issue.timeframe, "No Timeframe");
        assert_eq!(issue.action_taken, "No Action Taken");
        assert_eq!(issue.costusd, "0");
        assert_eq!(issue.savedusd, "N/A");
        assert_eq!(issue.recommended_contact, "No Contact");
        assert_eq!(issue.creator_id, "Unknown");
        assert_eq!(issue.version, "No Version");
        assert_eq!(issue.created_at, fieldwatch_core::EPOCH_TIMESTAMP);
        assert_eq!(issue.latitude, None);
        assert_eq!(issue.longitude, None);
    }

    #[test]
    fn entity_without_id_is_dropped() {
        assert!(parse_entity(&json!({ "label": "orphan" })).is_none());
        assert!(parse_entity(&json!({ "__id": "" })).is_none());
        assert!(parse_entity(&json!({ "__id": "   " })).is_none());
    }

    #[test]
    fn numeric_upstream_values_are_stringified() {
        let raw = json!({
            "__id": "E3",
            "costusd": 120,
            "savedusd": 3.5,
            "__system": { "version": 7 }
        });
        let issue = parse_entity(&raw).expect("issue");
        assert_eq!(issue.costusd, "120");
        assert_eq!(issue.savedusd, "3.5");
        assert_eq!(issue.version, "7");
    }

    #[test]
    fn system_metadata_dates_normalize() {
        let raw = json!({
            "__id": "E4",
            "__system": {
                "createdAt": "2024-05-14T10:30:00.000Z",
                "updatedAt": "nonsense",
                "creatorName": "Amina"
            }
        });
        let issue = parse_entity(&raw).expect("issue");
        assert_eq!(issue.created_at, "2024-05-14 10:30:00");
        assert_eq!(issue.updated_at, fieldwatch_core::EPOCH_TIMESTAMP);
        assert_eq!(issue.creator_name, "Amina");
    }

    #[test]
    fn later_duplicate_id_wins_within_a_batch() {
        let payload = json!({ "value": [
            { "__id": "E1", "label": "first" },
            { "__id": "E1", "label": "second" },
        ]});
        let issues = normalize_entities(&payload);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues["E1"].label, "second");
    }

    #[test]
    fn missing_value_wrapper_is_an_empty_batch() {
        assert!(normalize_entities(&json!({})).is_empty());
        assert!(normalize_entities(&json!({ "value": "oops" })).is_empty());
    }

    #[test]
    fn malformed_geometry_never_yields_partial_coordinates() {
        for raw in ["", "1.23", "abc def", "1.23 east", "north 4.56"] {
            assert_eq!(parse_geometry(raw), (None, None), "{raw}");
        }
        assert_eq!(parse_geometry("1.23 4.56"), (Some(1.23), Some(4.56)));
        assert_eq!(
            parse_geometry("  -0.5   36.9  1800  "),
            (Some(-0.5), Some(36.9))
        );
    }

    #[test]
    fn response_fields_stay_null_when_absent() {
        let submission = json!({
            "__id": "R1",
            "entity": { "problem": "E1" },
            "__system": { "submissionDate": "2024-05-15T08:00:00Z", "submitterName": "Joe" }
        });
        let (response, filename) = parse_response(&submission).expect("response");
        assert_eq!(response.key, "R1");
        assert_eq!(response.entity_problem.as_deref(), Some("E1"));
        assert_eq!(response.submission_date, "2024-05-15 08:00:00");
        assert_eq!(response.submitter_name.as_deref(), Some("Joe"));
        assert!(response.action_role.is_none());
        assert!(response.action_status.is_none());
        assert!(response.action_image.is_none());
        assert!(filename.is_none());
    }

    #[test]
    fn response_action_group_maps_through() {
        let submission = json!({
            "__id": "R2",
            "action": {
                "role": "monitor",
                "status": "fixed",
                "action_taken": "patched",
                "resolution_costusd": "40",
                "resolution_timeframe": "1 week",
                "recommended_contact": "Roads Dept",
                "image": "after.jpg"
            }
        });
        let (response, filename) = parse_response(&submission).expect("response");
        assert_eq!(response.action_role.as_deref(), Some("monitor"));
        assert_eq!(response.action_status.as_deref(), Some("fixed"));
        assert_eq!(response.action_action_taken.as_deref(), Some("patched"));
        assert_eq!(response.action_resolution_costusd.as_deref(), Some("40"));
        assert_eq!(filename.as_deref(), Some("after.jpg"));
    }

    #[test]
    fn response_without_id_is_dropped() {
        assert!(parse_response(&json!({ "action": { "role": "x" } })).is_none());
    }

    #[test]
    fn report_without_filename_is_skipped() {
        assert!(parse_report(&json!({ "__id": "S1" })).is_none());
        assert!(parse_report(&json!({ "__id": "S1", "problem": {} })).is_none());
        assert!(
            parse_report(&json!({ "__id": "S1", "problem": { "problem_image": "" } })).is_none()
        );
    }

    #[test]
    fn report_with_filename_becomes_pending_image() {
        let submission = json!({
            "__id": "S1",
            "problem": {
                "problem_title": "Pothole",
                "problem_label": "Pothole",
                "problem_image": "photo.jpg"
            }
        });
        let pending = parse_report(&submission).expect("pending image");
        assert_eq!(
            pending,
            PendingImage {
                submission_id: "S1".to_string(),
                title: "Pothole".to_string(),
                label: Some("Pothole".to_string()),
                filename: "photo.jpg".to_string(),
            }
        );
    }

    #[test]
    fn report_title_defaults_when_absent() {
        let submission = json!({
            "__id": "S2",
            "problem": { "problem_image": "photo.jpg" }
        });
        let pending = parse_report(&submission).expect("pending image");
        assert_eq!(pending.title, "Untitled Image");
        assert!(pending.label.is_none());
    }

    #[test]
    fn endpoints_follow_the_remote_layout() {
        assert_eq!(
            entities_endpoint("2"),
            "v1/projects/2/datasets/problems.svc/Entities"
        );
        assert_eq!(
            responses_endpoint("2"),
            "v1/projects/2/forms/address_problem.svc/Submissions"
        );
        assert_eq!(
            reports_endpoint("2"),
            "v1/projects/2/forms/report_problem.svc/Submissions"
        );
        assert_eq!(
            attachment_endpoint("2", RESPONSE_FORM, "R1", "after.jpg"),
            "v1/projects/2/forms/address_problem/submissions/R1/attachments/after.jpg"
        );
    }
}
