//! Per-source webhook payload parsers — map a provider's JSON body into an
//! [`IssueEvent`], or `None` for actions the webhook server should silently
//! 200 rather than deliver.
//!
//! Grounded in the dispatcher's "decode into typed structures via a generic
//! helper" design note (spec §9): each parser pulls only the fields it
//! needs out of an untyped `serde_json::Value` rather than deriving
//! `Deserialize` on the provider's full payload shape, since only a few
//! event/action combinations are ever emitted.

use chrono::Utc;
use fab_core::error::{Error, Result};
use fab_core::types::{IssueEvent, IssueEventType};
use serde_json::Value;

/// `X-GitHub-Event: issue_comment` with `action=created`, or
/// `X-GitHub-Event: issues` with `action` in `{opened, edited}`.
/// Any other event/action pair is not an error — it's simply not forwarded.
pub fn parse_github_payload(
    project: &str,
    event_header: &str,
    body: &[u8],
) -> Result<Option<IssueEvent>> {
    let v: Value = serde_json::from_slice(body)?;
    let action = v.get("action").and_then(Value::as_str).unwrap_or("");

    match event_header {
        "issue_comment" if action == "created" => {
            let issue = v
                .get("issue")
                .ok_or_else(|| Error::Invalid("github payload missing issue".into()))?;
            let comment = v
                .get("comment")
                .ok_or_else(|| Error::Invalid("github payload missing comment".into()))?;
            Ok(Some(IssueEvent {
                event_type: IssueEventType::Comment,
                source: "github".into(),
                project: project.into(),
                issue_id: issue_number(issue)?,
                comment_id: comment.get("id").map(|id| id.to_string()),
                author: string_field(comment, "user.login").unwrap_or_default(),
                body: string_field(comment, "body").unwrap_or_default(),
                title: string_field(issue, "title"),
                timestamp: Utc::now(),
            }))
        }
        "issues" if action == "opened" || action == "edited" => {
            let issue = v
                .get("issue")
                .ok_or_else(|| Error::Invalid("github payload missing issue".into()))?;
            let event_type = if action == "opened" {
                IssueEventType::Created
            } else {
                IssueEventType::Updated
            };
            Ok(Some(IssueEvent {
                event_type,
                source: "github".into(),
                project: project.into(),
                issue_id: issue_number(issue)?,
                comment_id: None,
                author: string_field(issue, "user.login").unwrap_or_default(),
                body: string_field(issue, "body").unwrap_or_default(),
                title: string_field(issue, "title"),
                timestamp: Utc::now(),
            }))
        }
        _ => Ok(None),
    }
}

/// Linear sends `{action, type, data}`. Only `action=create` on
/// `type=Comment` or `type=Issue` is forwarded, mirroring GitHub's
/// created/opened/edited set.
pub fn parse_linear_payload(project: &str, body: &[u8]) -> Result<Option<IssueEvent>> {
    let v: Value = serde_json::from_slice(body)?;
    let action = v.get("action").and_then(Value::as_str).unwrap_or("");
    let data_type = v.get("type").and_then(Value::as_str).unwrap_or("");
    let data = v
        .get("data")
        .ok_or_else(|| Error::Invalid("linear payload missing data".into()))?;

    match (data_type, action) {
        ("Comment", "create") => Ok(Some(IssueEvent {
            event_type: IssueEventType::Comment,
            source: "linear".into(),
            project: project.into(),
            issue_id: string_field(data, "issue.id")
                .ok_or_else(|| Error::Invalid("linear comment missing issue id".into()))?,
            comment_id: string_field(data, "id"),
            author: string_field(data, "user.name").unwrap_or_default(),
            body: string_field(data, "body").unwrap_or_default(),
            title: None,
            timestamp: Utc::now(),
        })),
        ("Issue", "create") | ("Issue", "update") => {
            let event_type = if action == "create" {
                IssueEventType::Created
            } else {
                IssueEventType::Updated
            };
            Ok(Some(IssueEvent {
                event_type,
                source: "linear".into(),
                project: project.into(),
                issue_id: string_field(data, "id")
                    .ok_or_else(|| Error::Invalid("linear issue missing id".into()))?,
                comment_id: None,
                author: string_field(data, "creator.name").unwrap_or_default(),
                body: string_field(data, "description").unwrap_or_default(),
                title: string_field(data, "title"),
                timestamp: Utc::now(),
            }))
        }
        _ => Ok(None),
    }
}

/// The generic endpoint accepts an `IssueEvent` JSON body directly.
pub fn parse_generic_payload(body: &[u8]) -> Result<IssueEvent> {
    Ok(serde_json::from_slice(body)?)
}

fn issue_number(issue: &Value) -> Result<String> {
    issue
        .get("number")
        .map(|n| n.to_string())
        .ok_or_else(|| Error::Invalid("issue payload missing number".into()))
}

/// Reads a possibly-nested field via a `.`-separated path, e.g. `"user.login"`.
fn string_field(v: &Value, path: &str) -> Option<String> {
    let mut cur = v;
    for part in path.split('.') {
        cur = cur.get(part)?;
    }
    cur.as_str().map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn github_issue_comment_created_maps_to_comment_event() {
        let body = br#"{
            "action": "created",
            "issue": {"number": 123, "title": "bug"},
            "comment": {"id": 99, "body": "hi there", "user": {"login": "alice"}}
        }"#;
        let ev = parse_github_payload("p", "issue_comment", body)
            .unwrap()
            .unwrap();
        assert_eq!(ev.event_type, IssueEventType::Comment);
        assert_eq!(ev.issue_id, "123");
        assert_eq!(ev.comment_id.as_deref(), Some("99"));
        assert_eq!(ev.author, "alice");
        assert_eq!(ev.body, "hi there");
    }

    #[test]
    fn github_issues_opened_maps_to_created_event() {
        let body = br#"{
            "action": "opened",
            "issue": {"number": 7, "title": "t", "body": "b", "user": {"login": "bob"}}
        }"#;
        let ev = parse_github_payload("p", "issues", body).unwrap().unwrap();
        assert_eq!(ev.event_type, IssueEventType::Created);
    }

    #[test]
    fn github_unhandled_action_is_silently_dropped() {
        let body = br#"{"action": "closed", "issue": {"number": 1}}"#;
        let ev = parse_github_payload("p", "issues", body).unwrap();
        assert!(ev.is_none());
    }

    #[test]
    fn github_unhandled_event_header_is_silently_dropped() {
        let body = br#"{"action": "created"}"#;
        let ev = parse_github_payload("p", "pull_request", body).unwrap();
        assert!(ev.is_none());
    }

    #[test]
    fn linear_comment_create_maps_to_comment_event() {
        let body = br#"{
            "action": "create",
            "type": "Comment",
            "data": {"id": "c1", "body": "hi", "issue": {"id": "ISSUE-1"}, "user": {"name": "alice"}}
        }"#;
        let ev = parse_linear_payload("p", body).unwrap().unwrap();
        assert_eq!(ev.event_type, IssueEventType::Comment);
        assert_eq!(ev.issue_id, "ISSUE-1");
        assert_eq!(ev.comment_id.as_deref(), Some("c1"));
    }

    #[test]
    fn generic_payload_is_issue_event_json() {
        let body = br#"{
            "type": "created",
            "source": "generic",
            "project": "p",
            "issue_id": "1",
            "comment_id": null,
            "author": "a",
            "body": "b",
            "title": null,
            "timestamp": "2026-01-01T00:00:00Z"
        }"#;
        let ev = parse_generic_payload(body).unwrap();
        assert_eq!(ev.source, "generic");
        assert_eq!(ev.event_type, IssueEventType::Created);
    }
}
