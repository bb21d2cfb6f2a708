//! Process configuration read from environment variables.
//!
//! `main` loads an optional `.env` file first (dotenvy), then hands the
//! process environment to [`Config::from_vars`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

/// What to do when a deploy is requested while the same project is already deploying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployConcurrency {
    /// Run concurrently, no per-project lock.
    Parallel,
    /// Wait for the running deploy to finish.
    Queue,
    /// Skip the new delivery (recorded with outcome `skipped`).
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub store_backend: StoreBackend,
    pub database_path: PathBuf,
    pub dispatch: DispatchConfig,
    pub notify_timeout: Duration,
    pub log_format: LogFormat,
}

/// The knobs the dispatch pipeline itself reads.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub accepted_events: Vec<String>,
    pub script_timeout: Duration,
    pub deploy_concurrency: DeployConcurrency,
    pub max_concurrent_deploys: usize,
    pub notify_on_skip: bool,
    /// Maximum characters of script output carried into a notification.
    pub notify_output_limit: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            accepted_events: vec!["push".to_string()],
            script_timeout: Duration::from_secs(300),
            deploy_concurrency: DeployConcurrency::Queue,
            max_concurrent_deploys: 4,
            notify_on_skip: false,
            notify_output_limit: 1500,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            store_backend: StoreBackend::Sqlite,
            database_path: PathBuf::from("projects.db"),
            dispatch: DispatchConfig::default(),
            notify_timeout: Duration::from_secs(10),
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    /// Build a config from `(key, value)` pairs, falling back to defaults
    /// for anything unset or empty.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        let get = |key: &str| vars.get(key).map(|v| v.trim());

        let mut config = Config::default();

        if let Some(v) = get("BIND_ADDR") {
            config.bind_addr = parse("BIND_ADDR", v)?;
        }
        if let Some(v) = get("STORE_BACKEND") {
            config.store_backend = match v.to_ascii_lowercase().as_str() {
                "sqlite" => StoreBackend::Sqlite,
                "memory" => StoreBackend::Memory,
                _ => return Err(invalid("STORE_BACKEND", v, "expected sqlite or memory")),
            };
        }
        if let Some(v) = get("DATABASE_PATH") {
            config.database_path = PathBuf::from(v);
        }
        if let Some(v) = get("SCRIPT_TIMEOUT_SECS") {
            config.dispatch.script_timeout = Duration::from_secs(positive("SCRIPT_TIMEOUT_SECS", v)?);
        }
        if let Some(v) = get("NOTIFY_TIMEOUT_SECS") {
            config.notify_timeout = Duration::from_secs(positive("NOTIFY_TIMEOUT_SECS", v)?);
        }
        if let Some(v) = get("NOTIFY_OUTPUT_LIMIT") {
            config.dispatch.notify_output_limit = parse("NOTIFY_OUTPUT_LIMIT", v)?;
        }
        if let Some(v) = get("ACCEPTED_EVENTS") {
            let events: Vec<String> = v
                .split(',')
                .map(|e| e.trim().to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect();
            if events.is_empty() {
                return Err(invalid("ACCEPTED_EVENTS", v, "no event names given"));
            }
            config.dispatch.accepted_events = events;
        }
        if let Some(v) = get("DEPLOY_CONCURRENCY") {
            config.dispatch.deploy_concurrency = match v.to_ascii_lowercase().as_str() {
                "parallel" => DeployConcurrency::Parallel,
                "queue" => DeployConcurrency::Queue,
                "reject" => DeployConcurrency::Reject,
                _ => {
                    return Err(invalid(
                        "DEPLOY_CONCURRENCY",
                        v,
                        "expected parallel, queue or reject",
                    ))
                }
            };
        }
        if let Some(v) = get("MAX_CONCURRENT_DEPLOYS") {
            config.dispatch.max_concurrent_deploys =
                usize::try_from(positive("MAX_CONCURRENT_DEPLOYS", v)?)
                    .map_err(|e| invalid("MAX_CONCURRENT_DEPLOYS", v, &e.to_string()))?;
        }
        if let Some(v) = get("NOTIFY_ON_SKIP") {
            config.dispatch.notify_on_skip = parse_bool("NOTIFY_ON_SKIP", v)?;
        }
        if let Some(v) = get("LOG_FORMAT") {
            config.log_format = match v.to_ascii_lowercase().as_str() {
                "pretty" | "text" => LogFormat::Pretty,
                "json" => LogFormat::Json,
                _ => return Err(invalid("LOG_FORMAT", v, "expected pretty or json")),
            };
        }

        Ok(config)
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| invalid(key, value, &e.to_string()))
}

fn positive(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    match parse::<u64>(key, value)? {
        0 => Err(invalid(key, value, "must be greater than zero")),
        n => Ok(n),
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value, "expected a boolean")),
    }
}
