//! The per-delivery pipeline: lookup → verify → parse → filter → execute →
//! persist → notify.
//!
//! Each delivery is handled start to finish on the request's own task.
//! Failures after verification (filter mismatch, script failure, notifier
//! errors) are recorded and reported but never turned into HTTP errors.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{DeployConcurrency, DispatchConfig};
use crate::error::{DispatchError, RunError, StoreError};
use crate::notifier::{Notification, Notifier};
use crate::parser;
use crate::runner::{self, ScriptRunner};
use crate::store::{EventStore, ProjectStore};
use crate::types::{
    CanonicalEvent, DispatchReport, DispatchState, NewWebhookEvent, Outcome, Project,
};
use crate::verification;

/// One inbound delivery as seen by the pipeline.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    pub id: &'a str,
    pub project: &'a str,
    /// Branch taken from the URL path.
    pub branch: &'a str,
    pub event_type: &'a str,
    pub signature: Option<&'a str>,
    pub body: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Enforce,
    /// Integration-testing endpoint only.
    Skip,
}

pub struct Dispatcher {
    projects: Arc<dyn ProjectStore>,
    events: Arc<dyn EventStore>,
    runner: ScriptRunner,
    notifier: Arc<dyn Notifier>,
    config: DispatchConfig,
    deploy_slots: Semaphore,
    project_locks: Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>,
}

impl Dispatcher {
    pub fn new(
        projects: Arc<dyn ProjectStore>,
        events: Arc<dyn EventStore>,
        notifier: Arc<dyn Notifier>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            projects,
            events,
            runner: ScriptRunner::new(config.script_timeout),
            notifier,
            deploy_slots: Semaphore::new(config.max_concurrent_deploys.max(1)),
            config,
            project_locks: Mutex::new(HashMap::new()),
        }
    }

    #[instrument(
        skip_all,
        fields(delivery_id = %delivery.id, project = %delivery.project, branch = %delivery.branch)
    )]
    pub async fn dispatch(
        &self,
        delivery: Delivery<'_>,
        check: SignatureCheck,
    ) -> Result<DispatchReport, DispatchError> {
        debug!(state = ?DispatchState::Received, "delivery received");
        let project = match self.projects.get(delivery.project).await {
            Ok(p) => p,
            Err(StoreError::NotFound(name)) => {
                warn!("delivery for unknown project");
                return Err(DispatchError::UnknownProject(name));
            }
            Err(e) => {
                error!(error = %e, "project lookup failed");
                return Err(e.into());
            }
        };

        self.check_signature(&project, &delivery, check)?;
        debug!(state = ?DispatchState::Verified);

        let event = parser::parse(delivery.body, delivery.event_type).map_err(|e| {
            warn!(error = %e, "rejecting unparseable payload");
            e
        })?;

        let (state, outcome) = match self.filter(&delivery, &event) {
            Some(reason) => {
                info!(event_type = %event.event_type, event_branch = %event.branch, %reason, "delivery filtered");
                (DispatchState::RejectedFilter, Outcome::Skipped { reason })
            }
            None => {
                debug!(state = ?DispatchState::Filtered);
                self.execute(&project, &event).await
            }
        };

        let stored = self
            .events
            .record(NewWebhookEvent {
                project_name: project.name.clone(),
                event: event.clone(),
                outcome: outcome.label().to_string(),
                outcome_detail: outcome.detail(),
            })
            .await
            .map_err(|e| {
                error!(error = %e, "failed to persist webhook event");
                DispatchError::from(e)
            })?;

        let notified = self.notify(&project, &event, &outcome);
        let state = match state {
            DispatchState::Executed if notified => DispatchState::Notified,
            other => other,
        };

        info!(event_id = stored.id, ?state, outcome = outcome.label(), "delivery processed");
        Ok(DispatchReport {
            state,
            event_id: stored.id,
            project: project.name,
            branch: event.branch,
            event_type: event.event_type,
            outcome,
        })
    }

    fn check_signature(
        &self,
        project: &Project,
        delivery: &Delivery<'_>,
        check: SignatureCheck,
    ) -> Result<(), DispatchError> {
        if check == SignatureCheck::Skip {
            info!("signature verification skipped on test endpoint");
            return Ok(());
        }
        let Some(secret) = project.secret.as_deref() else {
            warn!("project has no secret configured, accepting delivery without signature verification");
            return Ok(());
        };
        let Some(signature) = delivery.signature else {
            warn!(state = ?DispatchState::RejectedAuth, "rejected delivery: missing signature header");
            return Err(DispatchError::MissingSignature);
        };
        if !verification::verify(delivery.body, signature, secret) {
            warn!(state = ?DispatchState::RejectedAuth, "rejected delivery: signature mismatch");
            return Err(DispatchError::InvalidSignature);
        }
        debug!("signature verified");
        Ok(())
    }

    /// `Some(reason)` when the delivery must not trigger a deploy.
    fn filter(&self, delivery: &Delivery<'_>, event: &CanonicalEvent) -> Option<String> {
        let accepted = self
            .config
            .accepted_events
            .iter()
            .any(|e| e.eq_ignore_ascii_case(&event.event_type));
        if !accepted {
            return Some(format!("event type '{}' is not deployed", event.event_type));
        }
        if event.branch != delivery.branch {
            return Some(format!(
                "branch '{}' does not match endpoint branch '{}'",
                event.branch, delivery.branch
            ));
        }
        None
    }

    /// Filtered → Executed, or a terminal state when the deploy is refused or fails.
    async fn execute(&self, project: &Project, event: &CanonicalEvent) -> (DispatchState, Outcome) {
        let _project_guard = match self.project_guard(project.id).await {
            Ok(guard) => guard,
            Err(reason) => {
                info!(%reason, "deploy refused by concurrency policy");
                return (DispatchState::RejectedFilter, Outcome::Skipped { reason });
            }
        };
        // The semaphore is never closed, so acquire cannot fail.
        let _slot = self.deploy_slots.acquire().await.ok();

        let env = runner::deploy_env(&project.name, event);
        let result = self.runner.run(Path::new(&project.deploy_script), &env).await;
        let outcome = outcome_from_run(result);

        match &outcome {
            Outcome::Success { duration_ms, .. } => {
                info!(duration_ms, "deploy script succeeded");
                (DispatchState::Executed, outcome)
            }
            other => {
                warn!(detail = %other.detail(), "deploy script failed");
                (DispatchState::ExecutionFailed, outcome)
            }
        }
    }

    async fn project_guard(&self, project_id: i64) -> Result<Option<OwnedMutexGuard<()>>, String> {
        if self.config.deploy_concurrency == DeployConcurrency::Parallel {
            return Ok(None);
        }
        let lock = {
            let mut locks = self
                .project_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(project_id).or_default().clone()
        };
        match self.config.deploy_concurrency {
            DeployConcurrency::Reject => lock
                .try_lock_owned()
                .map(Some)
                .map_err(|_| "deploy already running for this project".to_string()),
            _ => Ok(Some(lock.lock_owned().await)),
        }
    }

    /// Fire the notification on its own task. Returns whether one was sent.
    fn notify(&self, project: &Project, event: &CanonicalEvent, outcome: &Outcome) -> bool {
        if matches!(outcome, Outcome::Skipped { .. }) && !self.config.notify_on_skip {
            return false;
        }
        let endpoint = project.slack_webhook.trim();
        if endpoint.is_empty() {
            debug!("no notification endpoint configured");
            return false;
        }

        let notifier = self.notifier.clone();
        let endpoint = endpoint.to_string();
        let notification = Notification {
            project: project.name.clone(),
            event: event.clone(),
            outcome: outcome.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&endpoint, &notification).await {
                warn!(project = %notification.project, error = %e, "failed to send notification");
            }
        });
        true
    }
}

fn outcome_from_run(result: Result<runner::ScriptOutput, RunError>) -> Outcome {
    match result {
        Ok(out) if out.success() => Outcome::Success {
            exit_code: 0,
            duration_ms: out.duration_ms,
            output: out.combined(),
        },
        Ok(out) => Outcome::Failure {
            detail: match out.exit_code {
                Some(code) => format!("exited with status {code} after {}ms", out.duration_ms),
                None => format!("terminated by signal after {}ms", out.duration_ms),
            },
            exit_code: out.exit_code,
            timed_out: false,
            output: out.combined(),
        },
        Err(RunError::Timeout {
            after,
            stdout,
            stderr,
        }) => Outcome::Failure {
            detail: format!("timed out after {}s", after.as_secs()),
            exit_code: None,
            timed_out: true,
            output: runner::combine(&stdout, &stderr),
        },
        Err(e) => Outcome::Failure {
            detail: e.to_string(),
            exit_code: None,
            timed_out: false,
            output: String::new(),
        },
    }
}
