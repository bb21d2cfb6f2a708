//! Project routing table and event audit log.
//!
//! Callers only see the [`ProjectStore`] and [`EventStore`] traits; the
//! backing mechanism (SQLite file or in-memory map) is picked at startup.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::StoreError;
use crate::types::{NewProject, NewWebhookEvent, Project, ProjectUpdate, WebhookEvent};

/// Number of random bytes in a generated project secret.
pub const SECRET_BYTES: usize = 32;

#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Look a project up by name, ignoring ASCII case.
    async fn get(&self, name: &str) -> Result<Project, StoreError>;

    /// Insert a project, generating a secret when none is supplied.
    async fn create(&self, project: NewProject) -> Result<Project, StoreError>;

    async fn list(&self) -> Result<Vec<Project>, StoreError>;

    async fn update(&self, id: i64, update: ProjectUpdate) -> Result<Project, StoreError>;
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event row. The store assigns `id` and `created_at`.
    async fn record(&self, event: NewWebhookEvent) -> Result<WebhookEvent, StoreError>;

    /// Most recent events first.
    async fn recent(&self, limit: usize) -> Result<Vec<WebhookEvent>, StoreError>;
}

/// A store serving both projects and events.
pub trait Store: ProjectStore + EventStore {}

impl<T: ProjectStore + EventStore> Store for T {}

/// Fresh project secret from the OS CSPRNG, hex encoded (256 bits).
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Trim and validate caller input, filling in a generated secret.
pub(crate) fn prepare_new(project: NewProject) -> Result<NewProject, StoreError> {
    let name = project.name.trim().to_string();
    if name.is_empty() {
        return Err(StoreError::Invalid("name must not be empty".into()));
    }
    if project.deploy_script.trim().is_empty() {
        return Err(StoreError::Invalid("deploy_script must not be empty".into()));
    }
    let secret = match project.secret {
        Some(s) if !s.is_empty() => s,
        _ => generate_secret(),
    };
    Ok(NewProject {
        name,
        deploy_script: project.deploy_script.trim().to_string(),
        slack_webhook: project.slack_webhook.trim().to_string(),
        secret: Some(secret),
    })
}

/// Apply a partial update in place.
pub(crate) fn apply_update(project: &mut Project, update: ProjectUpdate) -> Result<(), StoreError> {
    if let Some(name) = update.name {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(StoreError::Invalid("name must not be empty".into()));
        }
        project.name = name;
    }
    if let Some(script) = update.deploy_script {
        project.deploy_script = script.trim().to_string();
    }
    if let Some(endpoint) = update.slack_webhook {
        project.slack_webhook = endpoint.trim().to_string();
    }
    if let Some(secret) = update.secret {
        project.secret = secret.filter(|s| !s.is_empty());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn created_projects_get_distinct_wide_secrets() {
        let store = MemoryStore::new();
        let mut secrets = HashSet::new();
        for i in 0..100 {
            let project = store
                .create(NewProject {
                    name: format!("project-{i}"),
                    deploy_script: "/srv/deploy.sh".into(),
                    slack_webhook: String::new(),
                    secret: None,
                })
                .await
                .unwrap();
            secrets.insert(project.secret.unwrap());
        }
        assert_eq!(secrets.len(), 100);
        for s in &secrets {
            assert_eq!(s.len(), SECRET_BYTES * 2);
            assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn prepare_keeps_supplied_secret() {
        let prepared = prepare_new(NewProject {
            name: "  site ".into(),
            deploy_script: "/srv/deploy.sh".into(),
            slack_webhook: "https://hooks.example.com/x".into(),
            secret: Some("given".into()),
        })
        .unwrap();
        assert_eq!(prepared.name, "site");
        assert_eq!(prepared.secret.as_deref(), Some("given"));
    }

    #[test]
    fn prepare_rejects_blank_name() {
        let err = prepare_new(NewProject {
            name: "   ".into(),
            deploy_script: "/srv/deploy.sh".into(),
            slack_webhook: String::new(),
            secret: None,
        })
        .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }
}
