//! SQLite implementation of [`ProjectStore`] and [`EventStore`].
//!
//! # Schema Versioning
//!
//! A `schema_version` table records the applied version. To change the
//! schema, bump `CURRENT_SCHEMA_VERSION` and add a step to `run_migrations`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use tracing::warn;

use super::{apply_update, prepare_new, EventStore, ProjectStore};
use crate::error::StoreError;
use crate::types::{NewProject, NewWebhookEvent, Project, ProjectUpdate, WebhookEvent};

const CURRENT_SCHEMA_VERSION: i64 = 2;

const PROJECT_COLUMNS: &str = "id, name, deploy_script, slack_webhook, secret";

const EVENT_COLUMNS: &str = "id, project_name, repository_name, repository_url, clone_url, \
     event_type, branch, commit_message, commit_id, author_name, author_email, timestamp, \
     outcome, outcome_detail, created_at";

/// SQLite-backed store.
///
/// rusqlite is synchronous, so every query runs on `spawn_blocking`. The
/// single connection behind a mutex serializes writes.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and bring its schema up to date.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let path_str = path.to_string_lossy();

        if path_str != ":memory:" {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::storage(
                        "create database directory",
                        format!("{}: {e}", parent.display()),
                    )
                })?;
            }
        }

        let conn = Connection::open(path)
            .map_err(|e| StoreError::storage("open database", e.to_string()))?;

        // The database holds webhook secrets.
        #[cfg(unix)]
        if path_str != ":memory:" {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
                warn!(error = %e, "failed to restrict database file permissions");
            }
        }

        conn.execute_batch(
            r#"
            PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| StoreError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| StoreError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), StoreError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::storage(
                "schema version",
                format!(
                    "database schema version {from_version} is newer than supported version \
                     {CURRENT_SCHEMA_VERSION}"
                ),
            ));
        }
        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS projects (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                    deploy_script TEXT NOT NULL,
                    slack_webhook TEXT NOT NULL,
                    secret TEXT
                );

                CREATE TABLE IF NOT EXISTS webhook_events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_name TEXT NOT NULL,
                    repository_name TEXT,
                    repository_url TEXT,
                    clone_url TEXT,
                    event_type TEXT,
                    branch TEXT,
                    commit_message TEXT,
                    commit_id TEXT,
                    author_name TEXT,
                    author_email TEXT,
                    timestamp TEXT,
                    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
                );
                "#,
            )
            .map_err(|e| StoreError::storage("migration v1", e.to_string()))?;
        }

        // v2: record what happened to each delivery.
        if from_version < 2 {
            conn.execute_batch(
                r#"
                ALTER TABLE webhook_events ADD COLUMN outcome TEXT;
                ALTER TABLE webhook_events ADD COLUMN outcome_detail TEXT;
                CREATE INDEX IF NOT EXISTS idx_events_project
                    ON webhook_events(project_name);
                "#,
            )
            .map_err(|e| StoreError::storage("migration v2", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| StoreError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| StoreError::storage(operation, "connection mutex poisoned"))?;
            f(&mut *conn)
        })
        .await
        .map_err(|e| StoreError::storage(operation, e.to_string()))?
    }
}

fn project_from_row(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get(0)?,
        name: row.get(1)?,
        deploy_script: row.get(2)?,
        slack_webhook: row.get(3)?,
        secret: row.get(4)?,
    })
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<WebhookEvent> {
    let raw_created_at: String = row.get(14)?;
    let created_at = parse_created_at(&raw_created_at).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(14, rusqlite::types::Type::Text, Box::new(e))
    })?;
    Ok(WebhookEvent {
        id: row.get(0)?,
        project_name: row.get(1)?,
        repository_name: row.get(2)?,
        repository_url: row.get(3)?,
        clone_url: row.get(4)?,
        event_type: row.get(5)?,
        branch: row.get(6)?,
        commit_message: row.get(7)?,
        commit_id: row.get(8)?,
        author_name: row.get(9)?,
        author_email: row.get(10)?,
        timestamp: row.get(11)?,
        outcome: row.get(12)?,
        outcome_detail: row.get(13)?,
        created_at,
    })
}

/// `CURRENT_TIMESTAMP` is stored as `YYYY-MM-DD HH:MM:SS` in UTC.
fn parse_created_at(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| StoreError::Corruption(format!("created_at '{raw}'")))
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn fetch_project_by_id(conn: &Connection, id: i64) -> Result<Project, StoreError> {
    conn.query_row(
        &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
        params![id],
        project_from_row,
    )
    .optional()
    .map_err(|e| StoreError::storage("get project", e.to_string()))?
    .ok_or_else(|| StoreError::NotFound(id.to_string()))
}

#[async_trait]
impl ProjectStore for SqliteStore {
    async fn get(&self, name: &str) -> Result<Project, StoreError> {
        let name = name.to_string();
        self.with_conn("get project", move |conn| {
            conn.query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE name = ?1 COLLATE NOCASE"),
                params![name],
                project_from_row,
            )
            .optional()
            .map_err(|e| StoreError::storage("get project", e.to_string()))?
            .ok_or(StoreError::NotFound(name))
        })
        .await
    }

    async fn create(&self, project: NewProject) -> Result<Project, StoreError> {
        let project = prepare_new(project)?;
        self.with_conn("create project", move |conn| {
            let inserted = conn.execute(
                "INSERT INTO projects (name, deploy_script, slack_webhook, secret)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    project.name,
                    project.deploy_script,
                    project.slack_webhook,
                    project.secret
                ],
            );
            match inserted {
                Ok(_) => {
                    let id = conn.last_insert_rowid();
                    fetch_project_by_id(conn, id)
                }
                Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateName(project.name)),
                Err(e) => Err(StoreError::storage("create project", e.to_string())),
            }
        })
        .await
    }

    async fn list(&self) -> Result<Vec<Project>, StoreError> {
        self.with_conn("list projects", |conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY id"))
                .map_err(|e| StoreError::storage("list projects", e.to_string()))?;
            let rows = stmt
                .query_map([], project_from_row)
                .map_err(|e| StoreError::storage("list projects", e.to_string()))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| StoreError::storage("list projects", e.to_string()))
        })
        .await
    }

    async fn update(&self, id: i64, update: ProjectUpdate) -> Result<Project, StoreError> {
        self.with_conn("update project", move |conn| {
            let tx = conn
                .transaction()
                .map_err(|e| StoreError::storage("update project", e.to_string()))?;
            let mut project = fetch_project_by_id(&tx, id)?;
            apply_update(&mut project, update)?;

            let updated = tx.execute(
                "UPDATE projects SET name = ?1, deploy_script = ?2, slack_webhook = ?3, secret = ?4
                 WHERE id = ?5",
                params![
                    project.name,
                    project.deploy_script,
                    project.slack_webhook,
                    project.secret,
                    id
                ],
            );
            match updated {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    return Err(StoreError::DuplicateName(project.name));
                }
                Err(e) => return Err(StoreError::storage("update project", e.to_string())),
            }
            tx.commit()
                .map_err(|e| StoreError::storage("update project", e.to_string()))?;
            Ok(project)
        })
        .await
    }
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn record(&self, event: NewWebhookEvent) -> Result<WebhookEvent, StoreError> {
        self.with_conn("record event", move |conn| {
            let e = &event.event;
            conn.execute(
                "INSERT INTO webhook_events (project_name, repository_name, repository_url,
                     clone_url, event_type, branch, commit_message, commit_id, author_name,
                     author_email, timestamp, outcome, outcome_detail)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    event.project_name,
                    e.repository_name,
                    e.repository_url,
                    e.clone_url,
                    e.event_type,
                    e.branch,
                    e.commit_message,
                    e.commit_id,
                    e.author_name,
                    e.author_email,
                    e.timestamp,
                    event.outcome,
                    event.outcome_detail,
                ],
            )
            .map_err(|e| StoreError::storage("record event", e.to_string()))?;

            let id = conn.last_insert_rowid();
            let created_at: String = conn
                .query_row(
                    "SELECT created_at FROM webhook_events WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .map_err(|e| StoreError::storage("record event", e.to_string()))?;
            Ok(WebhookEvent::from_new(id, event, parse_created_at(&created_at)?))
        })
        .await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<WebhookEvent>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.with_conn("recent events", move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {EVENT_COLUMNS} FROM webhook_events ORDER BY id DESC LIMIT ?1"
                ))
                .map_err(|e| StoreError::storage("recent events", e.to_string()))?;
            let rows = stmt
                .query_map(params![limit], event_from_row)
                .map_err(|e| StoreError::storage("recent events", e.to_string()))?;

            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| StoreError::storage("recent events", e.to_string()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CanonicalEvent;

    fn new_project(name: &str, secret: Option<&str>) -> NewProject {
        NewProject {
            name: name.to_string(),
            deploy_script: "/srv/deploy.sh".into(),
            slack_webhook: "https://hooks.example.com/x".into(),
            secret: secret.map(str::to_string),
        }
    }

    fn new_event(project: &str) -> NewWebhookEvent {
        NewWebhookEvent {
            project_name: project.to_string(),
            event: CanonicalEvent {
                event_type: "push".into(),
                repository_name: "site".into(),
                repository_url: Some("https://github.com/acme/site".into()),
                clone_url: None,
                branch: "main".into(),
                commit_id: Some("abc123".into()),
                commit_message: Some("Bump".into()),
                author_name: Some("Robin".into()),
                author_email: None,
                timestamp: None,
            },
            outcome: "success".into(),
            outcome_detail: "exited with status 0 in 12ms".into(),
        }
    }

    #[tokio::test]
    async fn create_get_list() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.create(new_project("Alpha", Some("given"))).await.unwrap();
        let b = store.create(new_project("Beta", None)).await.unwrap();

        assert_eq!(a.secret.as_deref(), Some("given"));
        assert_eq!(b.secret.as_ref().map(String::len), Some(64));
        assert_eq!(store.get("alpha").await.unwrap(), a);

        let names: Vec<_> = store.list().await.unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["Alpha", "Beta"]);
    }

    #[tokio::test]
    async fn missing_project_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.get("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn duplicate_name_is_rejected_case_insensitively() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create(new_project("Alpha", None)).await.unwrap();
        let err = store.create(new_project("ALPHA", None)).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName(name) if name == "ALPHA"));
    }

    #[tokio::test]
    async fn update_renames_and_clears_secret() {
        let store = SqliteStore::open_in_memory().unwrap();
        let p = store.create(new_project("Alpha", Some("s"))).await.unwrap();

        let updated = store
            .update(
                p.id,
                ProjectUpdate {
                    name: Some("Gamma".into()),
                    secret: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Gamma");
        assert!(updated.secret.is_none());
        assert_eq!(store.get("gamma").await.unwrap(), updated);
        assert!(store.get("alpha").await.is_err());
    }

    #[tokio::test]
    async fn update_unknown_id_is_not_found() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.update(42, ProjectUpdate::default()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn events_are_recorded_and_listed_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = store.record(new_event("Alpha")).await.unwrap();
        let second = store.record(new_event("Beta")).await.unwrap();
        assert!(second.id > first.id);
        assert_eq!(first.outcome.as_deref(), Some("success"));

        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0], second);
        assert_eq!(recent[1], first);
    }

    #[tokio::test]
    async fn reopening_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("projects.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.create(new_project("Alpha", None)).await.unwrap();
            store.record(new_event("Alpha")).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
        assert_eq!(store.recent(5).await.unwrap().len(), 1);
    }
}
