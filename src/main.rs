use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use deployhook::config::{Config, LogFormat, StoreBackend};
use deployhook::http_server::{self, AppState};
use deployhook::notifier::SlackNotifier;
use deployhook::seed;
use deployhook::store::{MemoryStore, SqliteStore, Store};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; the real environment still applies.
    dotenvy::dotenv().ok();

    let config = Config::from_vars(std::env::vars()).context("invalid configuration")?;

    // ---- Tracing ----
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    tracing::info!(
        bind_addr = %config.bind_addr,
        backend = ?config.store_backend,
        concurrency = ?config.dispatch.deploy_concurrency,
        "starting deployhook"
    );

    match config.store_backend {
        StoreBackend::Sqlite => {
            let store = SqliteStore::open(&config.database_path).with_context(|| format!("failed to open {}", config.database_path.display()))?;
            tracing::info!(path = %config.database_path.display(), "sqlite store ready");
            run(Arc::new(store), config).await
        }
        StoreBackend::Memory => {
            tracing::warn!("using in-memory store; projects and events are lost on restart");
            run(Arc::new(MemoryStore::new()), config).await
        }
    }
}

async fn run<S: Store + 'static>(store: Arc<S>, config: Config) -> Result<()> {
    let seeded = seed::seed_projects(&*store, seed::projects_from_vars(std::env::vars()))
        .await
        .context("failed to seed projects from environment")?;
    if !seeded.is_empty() {
        tracing::info!(count = seeded.len(), "seeded projects");
    }

    let notifier = SlackNotifier::new(config.notify_timeout, config.dispatch.notify_output_limit)
        .context("failed to build notification client")?;

    let state = AppState::new(store, Arc::new(notifier), config.dispatch);
    http_server::serve(config.bind_addr, state)
        .await
        .context("webhook server failed")
}
