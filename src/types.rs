use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub deploy_script: String,
    /// Notification endpoint. Kept under its historical name on the wire.
    pub slack_webhook: String,
    pub secret: Option<String>,
}

impl Project {
    /// Copy of the project safe to show on diagnostic endpoints.
    pub fn redacted(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "deploy_script": self.deploy_script,
            "slack_webhook": self.slack_webhook,
            "has_secret": self.secret.is_some(),
        })
    }
}

/// Input for `ProjectStore::create`. A missing secret is generated by the store.
#[derive(Debug, Clone, Deserialize)]
pub struct NewProject {
    pub name: String,
    pub deploy_script: String,
    /// Empty disables notifications.
    #[serde(default)]
    pub slack_webhook: String,
    #[serde(default)]
    pub secret: Option<String>,
}

/// Partial update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectUpdate {
    pub name: Option<String>,
    pub deploy_script: Option<String>,
    pub slack_webhook: Option<String>,
    /// `Some(None)` clears the secret, disabling signature checks.
    #[serde(default, with = "double_option")]
    pub secret: Option<Option<String>>,
}

mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer).map(Some)
    }
}

/// Platform-agnostic record extracted from a delivery payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalEvent {
    pub event_type: String,
    pub repository_name: String,
    pub repository_url: Option<String>,
    pub clone_url: Option<String>,
    pub branch: String,
    pub commit_id: Option<String>,
    pub commit_message: Option<String>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub timestamp: Option<String>,
}

/// Result of processing one delivery, attached to its event row and notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        exit_code: i32,
        duration_ms: u64,
        output: String,
    },
    Failure {
        detail: String,
        exit_code: Option<i32>,
        timed_out: bool,
        output: String,
    },
    Skipped {
        reason: String,
    },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::Failure { .. } => "failure",
            Outcome::Skipped { .. } => "skipped",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            Outcome::Success { duration_ms, .. } => format!("exited with status 0 in {duration_ms}ms"),
            Outcome::Failure { detail, .. } => detail.clone(),
            Outcome::Skipped { reason } => reason.clone(),
        }
    }

    /// Script output, empty for skipped deliveries.
    pub fn output(&self) -> &str {
        match self {
            Outcome::Success { output, .. } | Outcome::Failure { output, .. } => output,
            Outcome::Skipped { .. } => "",
        }
    }
}

/// An event row about to be written. `id` and `created_at` are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub project_name: String,
    pub event: CanonicalEvent,
    pub outcome: String,
    pub outcome_detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: i64,
    pub project_name: String,
    pub repository_name: Option<String>,
    pub repository_url: Option<String>,
    pub clone_url: Option<String>,
    pub event_type: Option<String>,
    pub branch: Option<String>,
    pub commit_message: Option<String>,
    pub commit_id: Option<String>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub timestamp: Option<String>,
    pub outcome: Option<String>,
    pub outcome_detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn from_new(id: i64, new: NewWebhookEvent, created_at: DateTime<Utc>) -> Self {
        let NewWebhookEvent {
            project_name,
            event,
            outcome,
            outcome_detail,
        } = new;
        Self {
            id,
            project_name,
            repository_name: Some(event.repository_name),
            repository_url: event.repository_url,
            clone_url: event.clone_url,
            event_type: Some(event.event_type),
            branch: Some(event.branch),
            commit_message: event.commit_message,
            commit_id: event.commit_id,
            author_name: event.author_name,
            author_email: event.author_email,
            timestamp: event.timestamp,
            outcome: Some(outcome),
            outcome_detail: Some(outcome_detail),
            created_at,
        }
    }
}

/// Where a delivery's processing stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchState {
    Received,
    Verified,
    Filtered,
    Executed,
    Notified,
    RejectedAuth,
    RejectedFilter,
    ExecutionFailed,
}

/// What the dispatcher reports back to the HTTP layer for an accepted delivery.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReport {
    pub state: DispatchState,
    pub event_id: i64,
    pub project: String,
    pub branch: String,
    pub event_type: String,
    pub outcome: Outcome,
}
