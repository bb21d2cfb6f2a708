use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{apply_update, prepare_new, EventStore, ProjectStore};
use crate::error::StoreError;
use crate::types::{NewProject, NewWebhookEvent, Project, ProjectUpdate, WebhookEvent};

const MAX_EVENTS: usize = 1000;

#[derive(Default)]
struct Inner {
    projects: HashMap<i64, Project>,
    events: VecDeque<WebhookEvent>,
    next_project_id: i64,
    next_event_id: i64,
}

impl Inner {
    fn find_by_name(&self, name: &str) -> Option<&Project> {
        self.projects
            .values()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

/// Non-durable store, for tests and for deployments seeded purely from the
/// environment. Contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn get(&self, name: &str) -> Result<Project, StoreError> {
        let inner = self.inner.read().await;
        inner
            .find_by_name(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn create(&self, project: NewProject) -> Result<Project, StoreError> {
        let project = prepare_new(project)?;

        // Check and insert under one write lock so two creates cannot race.
        let mut inner = self.inner.write().await;
        if inner.find_by_name(&project.name).is_some() {
            return Err(StoreError::DuplicateName(project.name));
        }
        inner.next_project_id += 1;
        let created = Project {
            id: inner.next_project_id,
            name: project.name,
            deploy_script: project.deploy_script,
            slack_webhook: project.slack_webhook,
            secret: project.secret,
        };
        inner.projects.insert(created.id, created.clone());
        Ok(created)
    }

    async fn list(&self) -> Result<Vec<Project>, StoreError> {
        let inner = self.inner.read().await;
        let mut items: Vec<Project> = inner.projects.values().cloned().collect();
        items.sort_by_key(|p| p.id);
        Ok(items)
    }

    async fn update(&self, id: i64, update: ProjectUpdate) -> Result<Project, StoreError> {
        let mut inner = self.inner.write().await;
        let mut project = inner
            .projects
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply_update(&mut project, update)?;

        if let Some(other) = inner.find_by_name(&project.name) {
            if other.id != id {
                return Err(StoreError::DuplicateName(project.name));
            }
        }
        inner.projects.insert(id, project.clone());
        Ok(project)
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn record(&self, event: NewWebhookEvent) -> Result<WebhookEvent, StoreError> {
        let mut inner = self.inner.write().await;
        inner.next_event_id += 1;
        let stored = WebhookEvent::from_new(inner.next_event_id, event, Utc::now());
        if inner.events.len() >= MAX_EVENTS {
            inner.events.pop_front();
        }
        inner.events.push_back(stored.clone());
        Ok(stored)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<WebhookEvent>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.events.iter().rev().take(limit).cloned().collect())
    }
}
