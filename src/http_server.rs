use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::DispatchConfig;
use crate::dispatch::{Delivery, Dispatcher, SignatureCheck};
use crate::error::{DispatchError, StoreError};
use crate::notifier::Notifier;
use crate::parser::EVENT_HEADER;
use crate::store::{EventStore, ProjectStore, Store};
use crate::types::{DispatchReport, NewProject, ProjectUpdate};
use crate::verification::SIGNATURE_HEADER;

const PROJECT_HEADER: &str = "x-github-project";
const DELIVERY_HEADER: &str = "x-github-delivery";
const DEFAULT_DEBUG_EVENTS: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<dyn Store>,
}

impl AppState {
    /// Wire a dispatcher to `store`, which serves both projects and events.
    pub fn new<S: Store + 'static>(
        store: Arc<S>,
        notifier: Arc<dyn Notifier>,
        config: DispatchConfig,
    ) -> Self {
        let dispatcher = Dispatcher::new(store.clone(), store.clone(), notifier, config);
        Self {
            dispatcher: Arc::new(dispatcher),
            store,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/webhook/{*branch}", post(handle_webhook))
        .route("/test-webhook/{*branch}", post(handle_test_webhook))
        .route("/add-project", post(add_project))
        .route("/update-project/{id}", post(update_project))
        .route("/debug", get(debug_listing))
        .with_state(state)
}

/// Bind `addr` and serve until the process is stopped.
pub async fn serve(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "webhook server listening");
    axum::serve(listener, router(state)).await
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            DispatchError::MissingProject
            | DispatchError::UnknownProject(_)
            | DispatchError::Parse(_) => StatusCode::BAD_REQUEST,
            DispatchError::MissingSignature => StatusCode::UNAUTHORIZED,
            DispatchError::InvalidSignature => StatusCode::FORBIDDEN,
            DispatchError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match self {
            DispatchError::Store(_) => "internal storage error".to_string(),
            other => other.to_string(),
        };
        error_body(status, message)
    }
}

fn store_error_response(err: StoreError) -> Response {
    let status = match &err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::DuplicateName(_) => StatusCode::CONFLICT,
        StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
        StoreError::Storage { .. } | StoreError::Corruption(_) => {
            error!(error = %err, "storage failure");
            return error_body(StatusCode::INTERNAL_SERVER_ERROR, "internal storage error");
        }
    };
    error_body(status, err.to_string())
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

async fn index() -> Json<Value> {
    Json(json!({
        "status": "success",
        "message": "Webhook handler is deployed and running successfully."
    }))
}

#[derive(Debug, Default, Deserialize)]
struct WebhookQuery {
    project: Option<String>,
}

async fn handle_webhook(
    State(state): State<AppState>,
    Path(branch): Path<String>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    run_pipeline(&state, &branch, query, &headers, &body, SignatureCheck::Enforce).await
}

async fn handle_test_webhook(
    State(state): State<AppState>,
    Path(branch): Path<String>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    run_pipeline(&state, &branch, query, &headers, &body, SignatureCheck::Skip).await
}

async fn run_pipeline(
    state: &AppState,
    branch: &str,
    query: WebhookQuery,
    headers: &HeaderMap,
    body: &[u8],
    check: SignatureCheck,
) -> Response {
    let project = header(headers, PROJECT_HEADER)
        .map(str::to_string)
        .or(query.project.filter(|p| !p.trim().is_empty()));
    let Some(project) = project else {
        return DispatchError::MissingProject.into_response();
    };
    let delivery_id = header(headers, DELIVERY_HEADER)
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let delivery = Delivery {
        id: &delivery_id,
        project: &project,
        branch,
        event_type: header(headers, EVENT_HEADER).unwrap_or("unknown"),
        signature: header(headers, SIGNATURE_HEADER),
        body,
    };

    match state.dispatcher.dispatch(delivery, check).await {
        Ok(report) => (StatusCode::OK, Json(report_body(&report))).into_response(),
        Err(e) => e.into_response(),
    }
}

fn report_body(report: &DispatchReport) -> Value {
    let message = format!(
        "Received `{}` event on branch `{}` for `{}` - {}",
        report.event_type,
        report.branch,
        report.project,
        report.outcome.detail()
    );
    json!({
        "message": message,
        "state": report.state,
        "event_id": report.event_id,
        "outcome": report.outcome,
    })
}

async fn add_project(State(state): State<AppState>, body: Bytes) -> Response {
    let new: NewProject = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, format!("invalid project: {e}")),
    };
    match state.store.create(new).await {
        Ok(project) => {
            info!(project = %project.name, id = project.id, "project created");
            (StatusCode::CREATED, Json(project)).into_response()
        }
        Err(e) => store_error_response(e),
    }
}

async fn update_project(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Bytes,
) -> Response {
    let update: ProjectUpdate = match serde_json::from_slice(&body) {
        Ok(u) => u,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, format!("invalid update: {e}")),
    };
    match state.store.update(id, update).await {
        Ok(project) => {
            info!(project = %project.name, id, "project updated");
            Json(project.redacted()).into_response()
        }
        Err(e) => store_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct DebugQuery {
    limit: Option<usize>,
}

async fn debug_listing(State(state): State<AppState>, Query(query): Query<DebugQuery>) -> Response {
    let projects = match state.store.list().await {
        Ok(p) => p,
        Err(e) => return store_error_response(e),
    };
    let events = match state
        .store
        .recent(query.limit.unwrap_or(DEFAULT_DEBUG_EVENTS))
        .await
    {
        Ok(e) => e,
        Err(e) => return store_error_response(e),
    };
    Json(json!({
        "projects": projects.iter().map(|p| p.redacted()).collect::<Vec<_>>(),
        "project_count": projects.len(),
        "recent_events": events,
    }))
    .into_response()
}
