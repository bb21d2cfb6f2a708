//! Normalizes a platform push payload into a [`CanonicalEvent`].

use serde_json::Value;

use crate::error::ParseError;
use crate::types::CanonicalEvent;

/// Header naming the platform event kind.
pub const EVENT_HEADER: &str = "x-github-event";

const BRANCH_REF_PREFIX: &str = "refs/heads/";

/// Parse the raw delivery body.
///
/// `event_type` comes from the delivery headers, not the payload: payload
/// shape alone does not identify the event kind. A payload without
/// `repository.name` or `ref` is rejected outright instead of producing a
/// half-filled event.
pub fn parse(raw_body: &[u8], event_type: &str) -> Result<CanonicalEvent, ParseError> {
    let payload: Value =
        serde_json::from_slice(raw_body).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    let repository = payload
        .get("repository")
        .filter(|r| r.is_object())
        .ok_or(ParseError::MissingField("repository"))?;
    let repository_name = str_at(repository, &["name"])
        .ok_or(ParseError::MissingField("repository.name"))?;
    let git_ref = str_at(&payload, &["ref"]).ok_or(ParseError::MissingField("ref"))?;

    let head_commit = payload.get("head_commit").filter(|c| c.is_object());
    let commit_field = |path: &[&str]| head_commit.and_then(|c| str_at(c, path));

    Ok(CanonicalEvent {
        event_type: event_type.to_string(),
        repository_name,
        repository_url: str_at(repository, &["html_url"]).or_else(|| str_at(repository, &["url"])),
        clone_url: str_at(repository, &["clone_url"]),
        branch: branch_from_ref(&git_ref).to_string(),
        commit_id: commit_field(&["id"]).or_else(|| str_at(&payload, &["after"])),
        commit_message: commit_field(&["message"]),
        author_name: commit_field(&["author", "name"]),
        author_email: commit_field(&["author", "email"]),
        timestamp: commit_field(&["timestamp"]),
    })
}

/// `refs/heads/feature/x` → `feature/x`. Other refs (tags, notes) are
/// returned unchanged so they never match a branch filter.
pub fn branch_from_ref(git_ref: &str) -> &str {
    git_ref.strip_prefix(BRANCH_REF_PREFIX).unwrap_or(git_ref)
}

fn str_at(value: &Value, path: &[&str]) -> Option<String> {
    path.iter()
        .try_fold(value, |v, key| v.get(key))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}
