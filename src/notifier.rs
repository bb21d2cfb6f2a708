//! Outcome notifications.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::NotifyError;
use crate::types::{CanonicalEvent, Outcome};

/// Everything a notification describes.
#[derive(Debug, Clone)]
pub struct Notification {
    pub project: String,
    pub event: CanonicalEvent,
    pub outcome: Outcome,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, endpoint: &str, notification: &Notification) -> Result<(), NotifyError>;
}

/// Posts Slack Block Kit messages to an incoming-webhook URL.
pub struct SlackNotifier {
    client: reqwest::Client,
    output_limit: usize,
}

impl SlackNotifier {
    pub fn new(timeout: Duration, output_limit: usize) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("deployhook/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            output_limit,
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, endpoint: &str, notification: &Notification) -> Result<(), NotifyError> {
        let payload = slack_payload(notification, self.output_limit);
        let response = self.client.post(endpoint).json(&payload).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body: truncate(&body, 200),
            });
        }
        debug!(%status, "notification delivered");
        Ok(())
    }
}

/// Build the Block Kit message for a notification.
pub fn slack_payload(n: &Notification, output_limit: usize) -> Value {
    let when = Local::now().format("%d %b, %Y %I:%M %p").to_string();
    let commit = n
        .event
        .commit_id
        .as_deref()
        .map(|id| id.chars().take(12).collect::<String>())
        .unwrap_or_else(|| "N/A".to_string());
    let author = match (&n.event.author_name, &n.event.author_email) {
        (Some(name), Some(email)) => format!("{name} <{email}>"),
        (Some(name), None) => name.clone(),
        (None, Some(email)) => email.clone(),
        (None, None) => "N/A".to_string(),
    };
    let message = n.event.commit_message.as_deref().unwrap_or("N/A");

    let mut response = format!("{}: {}", capitalize(n.outcome.label()), n.outcome.detail());
    let output = n.outcome.output();
    if !output.is_empty() {
        response.push_str(&format!("\n```{}```", truncate(output, output_limit)));
    }

    let field = |label: &str, value: &str| json!({ "type": "mrkdwn", "text": format!("*{label}:*\n{value}") });

    json!({
        "text": format!(
            "[{}] {} on {}: {}",
            n.project, n.event.event_type, n.event.branch, n.outcome.label()
        ),
        "blocks": [
            {
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": format!("*[{}]* - Git Event Notification", n.project)
                }
            },
            {
                "type": "section",
                "fields": [
                    field("Event Type", &capitalize(&n.event.event_type)),
                    field("When", &when),
                    field("Branch", &capitalize(&n.event.branch)),
                    field("Commit", &commit),
                    field("Author", &author),
                    field("Commit Message", message),
                ]
            },
            {
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": format!("*Deployment Script Response:*\n{response}")
                }
            }
        ]
    })
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Keep the last `limit` characters; the tail of a deploy log is where errors are.
fn truncate(s: &str, limit: usize) -> String {
    let count = s.chars().count();
    if count <= limit {
        return s.to_string();
    }
    let tail: String = s.chars().skip(count - limit).collect();
    format!("…{tail}")
}
