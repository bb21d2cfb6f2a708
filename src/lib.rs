//! Git webhook receiver that runs per-project deploy scripts.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod http_server;
pub mod notifier;
pub mod parser;
pub mod runner;
pub mod seed;
pub mod store;
pub mod types;
pub mod verification;
