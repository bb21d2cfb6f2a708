#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;

use deployhook::config::DispatchConfig;
use deployhook::error::NotifyError;
use deployhook::http_server::{router, AppState};
use deployhook::notifier::{Notification, Notifier};
use deployhook::store::{EventStore, ProjectStore, SqliteStore};
use deployhook::types::NewProject;
use deployhook::verification::sign;

const SECRET: &str = "integration-secret";

struct RecordingNotifier(mpsc::UnboundedSender<(String, Notification)>);

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, endpoint: &str, n: &Notification) -> Result<(), NotifyError> {
        let _ = self.0.send((endpoint.to_string(), n.clone()));
        Ok(())
    }
}

/// Always fails, like an endpoint that is down.
struct FailingNotifier(mpsc::UnboundedSender<()>);

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, _endpoint: &str, _n: &Notification) -> Result<(), NotifyError> {
        let _ = self.0.send(());
        Err(NotifyError::Status {
            status: 500,
            body: "internal_error".into(),
        })
    }
}

struct TestApp {
    app: Router,
    store: Arc<SqliteStore>,
    notes: mpsc::UnboundedReceiver<(String, Notification)>,
    marker: PathBuf,
    _dir: tempfile::TempDir,
}

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("deploy.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn setup() -> TestApp {
    let (tx, notes) = mpsc::unbounded_channel();
    setup_with(Arc::new(RecordingNotifier(tx)), notes).await
}

async fn setup_with(
    notifier: Arc<dyn Notifier>,
    notes: mpsc::UnboundedReceiver<(String, Notification)>,
) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("deployed");
    let script = write_script(
        dir.path(),
        &format!("echo \"$DEPLOY_BRANCH $DEPLOY_COMMIT_ID\" > {}\necho done", marker.display()),
    );

    let store = Arc::new(SqliteStore::open(dir.path().join("projects.db")).unwrap());
    store
        .create(NewProject {
            name: "site".into(),
            deploy_script: script.display().to_string(),
            slack_webhook: "https://hooks.example.com/site".into(),
            secret: Some(SECRET.into()),
        })
        .await
        .unwrap();

    let config = DispatchConfig {
        script_timeout: Duration::from_secs(10),
        ..DispatchConfig::default()
    };
    let state = AppState::new(store.clone(), notifier, config);

    TestApp {
        app: router(state),
        store,
        notes,
        marker,
        _dir: dir,
    }
}

fn push_body(branch: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "ref": format!("refs/heads/{branch}"),
        "after": "9f8e7d6c5b4a",
        "repository": {
            "name": "site",
            "html_url": "https://github.com/acme/site",
            "clone_url": "https://github.com/acme/site.git"
        },
        "head_commit": {
            "id": "9f8e7d6c5b4a",
            "message": "Update landing page",
            "timestamp": "2024-05-01T10:00:00Z",
            "author": { "name": "Robin", "email": "robin@example.com" }
        }
    }))
    .unwrap()
}

fn webhook(path: &str, body: &[u8], signature: Option<&str>) -> Request<Body> {
    let mut req = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header("x-github-event", "push")
        .header("x-github-project", "site");
    if let Some(sig) = signature {
        req = req.header("x-hub-signature-256", sig);
    }
    req.body(Body::from(body.to_vec())).unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn signed_push_runs_script_records_and_notifies() {
    let mut t = setup().await;
    let body = push_body("main");
    let sig = sign(&body, SECRET);

    let (status, json) = send(&t.app, webhook("/webhook/main", &body, Some(&sig))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "NOTIFIED");
    assert_eq!(json["outcome"]["status"], "success");
    assert!(json["outcome"]["output"].as_str().unwrap().contains("done"));

    let marker = std::fs::read_to_string(&t.marker).unwrap();
    assert_eq!(marker.trim(), "main 9f8e7d6c5b4a");

    let events = t.store.recent(10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].project_name, "site");
    assert_eq!(events[0].branch.as_deref(), Some("main"));
    assert_eq!(events[0].outcome.as_deref(), Some("success"));
    assert_eq!(events[0].author_email.as_deref(), Some("robin@example.com"));

    let (endpoint, note) = tokio::time::timeout(Duration::from_secs(5), t.notes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(endpoint, "https://hooks.example.com/site");
    assert_eq!(note.project, "site");
    assert_eq!(note.event.commit_id.as_deref(), Some("9f8e7d6c5b4a"));
}

#[tokio::test]
async fn notification_failure_does_not_fail_the_delivery() {
    let (attempt_tx, mut attempts) = mpsc::unbounded_channel();
    let (_unused, notes) = mpsc::unbounded_channel();
    let t = setup_with(Arc::new(FailingNotifier(attempt_tx)), notes).await;
    let body = push_body("main");
    let sig = sign(&body, SECRET);

    let (status, json) = send(&t.app, webhook("/webhook/main", &body, Some(&sig))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"]["status"], "success");

    tokio::time::timeout(Duration::from_secs(5), attempts.recv())
        .await
        .unwrap()
        .unwrap();
    let events = t.store.recent(10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome.as_deref(), Some("success"));
}

#[tokio::test]
async fn branch_mismatch_is_recorded_but_not_deployed() {
    let mut t = setup().await;
    let body = push_body("develop");
    let sig = sign(&body, SECRET);

    let (status, json) = send(&t.app, webhook("/webhook/main", &body, Some(&sig))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["state"], "REJECTED_FILTER");
    assert_eq!(json["outcome"]["status"], "skipped");
    assert!(!t.marker.exists());

    let events = t.store.recent(10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].branch.as_deref(), Some("develop"));
    assert_eq!(events[0].outcome.as_deref(), Some("skipped"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(t.notes.try_recv().is_err());
}

#[tokio::test]
async fn rejected_deliveries_persist_nothing() {
    let t = setup().await;
    let body = push_body("main");

    let (status, _) = send(&t.app, webhook("/webhook/main", &body, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let wrong = sign(&body, "wrong-secret");
    let (status, _) = send(&t.app, webhook("/webhook/main", &body, Some(&wrong))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let garbage = b"{not json";
    let sig = sign(garbage, SECRET);
    let (status, _) = send(&t.app, webhook("/webhook/main", garbage, Some(&sig))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(t.store.recent(10).await.unwrap().is_empty());
    assert!(!t.marker.exists());
}

#[tokio::test]
async fn project_resolution_errors() {
    let t = setup().await;
    let body = push_body("main");

    let req = Request::builder()
        .method("POST")
        .uri("/webhook/main")
        .header("x-github-event", "push")
        .body(Body::from(body.clone()))
        .unwrap();
    let (status, _) = send(&t.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let req = Request::builder()
        .method("POST")
        .uri("/webhook/main?project=unknown")
        .header("x-github-event", "push")
        .body(Body::from(body))
        .unwrap();
    let (status, json) = send(&t.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"], "unknown project: unknown");
}

#[tokio::test]
async fn test_endpoint_skips_signature_check() {
    let t = setup().await;
    let body = push_body("main");

    let (status, json) = send(&t.app, webhook("/test-webhook/main", &body, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"]["status"], "success");
    assert!(t.marker.exists());
}

#[tokio::test]
async fn add_project_statuses() {
    let t = setup().await;
    let add = |payload: Value| {
        Request::builder()
            .method("POST")
            .uri("/add-project")
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap()
    };

    let (status, json) = send(
        &t.app,
        add(json!({ "name": "blog", "deploy_script": "/srv/blog/deploy.sh", "slack_webhook": "" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["name"], "blog");
    assert_eq!(json["secret"].as_str().unwrap().len(), 64);

    let (status, _) = send(&t.app, add(json!({ "name": "BLOG", "deploy_script": "/x.sh" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&t.app, add(json!({ "name": "docs" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&t.app, add(json!({ "name": "  ", "deploy_script": "/x.sh" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(t.store.list().await.unwrap().len(), 2);
}

#[tokio::test]
async fn update_project_changes_fields() {
    let t = setup().await;
    let id = t.store.get("site").await.unwrap().id;

    let req = Request::builder()
        .method("POST")
        .uri(format!("/update-project/{id}"))
        .header("content-type", "application/json")
        .body(Body::from(json!({ "slack_webhook": "", "secret": null }).to_string()))
        .unwrap();
    let (status, json) = send(&t.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["has_secret"], false);
    assert!(json.get("secret").is_none());

    let project = t.store.get("site").await.unwrap();
    assert!(project.secret.is_none());
    assert!(project.slack_webhook.is_empty());

    let req = Request::builder()
        .method("POST")
        .uri("/update-project/9999")
        .body(Body::from("{}"))
        .unwrap();
    let (status, _) = send(&t.app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn debug_listing_redacts_secrets() {
    let t = setup().await;
    let body = push_body("main");
    let sig = sign(&body, SECRET);
    send(&t.app, webhook("/webhook/main", &body, Some(&sig))).await;
    send(&t.app, webhook("/webhook/main", &body, Some(&sig))).await;

    let req = Request::builder().uri("/debug?limit=1").body(Body::empty()).unwrap();
    let (status, json) = send(&t.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["project_count"], 1);
    assert_eq!(json["projects"][0]["has_secret"], true);
    assert_eq!(json["recent_events"].as_array().unwrap().len(), 1);
    assert!(!json.to_string().contains(SECRET));
}

#[tokio::test]
async fn index_reports_running() {
    let t = setup().await;
    let req = Request::builder().uri("/").body(Body::empty()).unwrap();
    let (status, json) = send(&t.app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "success");
}
