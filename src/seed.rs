//! Bootstrap seeding of projects from `PROJECT_<NAME>_<ATTR>` variables.
//!
//! `PROJECT_BLOG_DEPLOY_SCRIPT=/srv/blog/deploy.sh` sets `deploy_script` on
//! project `blog`. The name is the segment between the first two
//! underscores, lowercased; recognised attributes are `DEPLOY_SCRIPT`,
//! `SLACK_WEBHOOK` and `SECRET`.

use std::collections::BTreeMap;

use tracing::{info, warn};

use crate::error::StoreError;
use crate::store::ProjectStore;
use crate::types::{NewProject, Project};

const PREFIX: &str = "PROJECT_";

#[derive(Default)]
struct Partial {
    deploy_script: Option<String>,
    slack_webhook: Option<String>,
    secret: Option<String>,
}

/// Collect complete project definitions. Projects without a deploy script
/// are dropped with a warning.
pub fn projects_from_vars<I, K, V>(vars: I) -> Vec<NewProject>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    let mut partials: BTreeMap<String, Partial> = BTreeMap::new();

    for (key, value) in vars {
        let Some(rest) = key.as_ref().strip_prefix(PREFIX) else {
            continue;
        };
        let Some((name, attribute)) = rest.split_once('_') else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        let entry = partials.entry(name.to_lowercase()).or_default();
        match attribute.to_ascii_lowercase().as_str() {
            "deploy_script" => entry.deploy_script = Some(value.into()),
            "slack_webhook" => entry.slack_webhook = Some(value.into()),
            "secret" => entry.secret = Some(value.into()),
            other => warn!(project = %name, attribute = %other, "ignoring unknown project attribute"),
        }
    }

    partials
        .into_iter()
        .filter_map(|(name, p)| match p.deploy_script {
            Some(deploy_script) => Some(NewProject {
                name,
                deploy_script,
                slack_webhook: p.slack_webhook.unwrap_or_default(),
                secret: p.secret,
            }),
            None => {
                warn!(project = %name, "skipping seeded project without DEPLOY_SCRIPT");
                None
            }
        })
        .collect()
}

/// Create every seeded project that is not already stored and return the
/// created rows. Existing rows win: seeding never overwrites a project
/// changed through the API.
///
/// A project seeded without `SECRET` gets a generated one, logged once here
/// so it can be copied into the repository's webhook settings.
pub async fn seed_projects(
    store: &dyn ProjectStore,
    projects: Vec<NewProject>,
) -> Result<Vec<Project>, StoreError> {
    let mut created = Vec::new();
    for project in projects {
        let generated = project.secret.as_deref().map_or(true, str::is_empty);
        match store.create(project).await {
            Ok(p) => {
                if generated {
                    warn!(
                        project = %p.name,
                        secret = p.secret.as_deref().unwrap_or_default(),
                        "seeded project without a secret, generated one for its webhook"
                    );
                } else {
                    info!(project = %p.name, "seeded project from environment");
                }
                created.push(p);
            }
            Err(StoreError::DuplicateName(name)) => {
                info!(project = %name, "seeded project already exists, keeping stored row");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(created)
}
