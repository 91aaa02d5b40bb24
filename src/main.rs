//! SiteWatch - Website Availability Monitor
//!
//! Periodically probes configured HTTP endpoints, records each outcome in an
//! embedded ordered key-value store and serves the state through a JSON API
//! plus a small admin dashboard.

mod auth;
mod cache;
mod config;
mod db;
mod error;
mod probe;
mod scheduler;
mod stats;
mod syslog;
mod web;

use auth::AuthService;
use cache::Cache;
use config::ServerConfig;
use db::Store;
use probe::ProbeExecutor;
use scheduler::{MaintenanceJob, Scheduler};
use stats::StatsEngine;
use syslog::SystemLogger;
use web::Server;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Load configuration first: the log level comes from it.
    let cfg = ServerConfig::load();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("sitewatch={}", cfg.log_level).parse()?),
        )
        .init();

    tracing::info!("Starting SiteWatch on port {}...", cfg.port);
    tracing::info!("Using database at {}", cfg.db_path);

    // A store-open failure is a startup failure: exit code 1.
    let store = match Store::open(&cfg.db_path) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to open database: {}", e);
            return Err(e.into());
        }
    };
    tracing::info!("Database initialized successfully");

    let cache = Cache::new();
    cache.start_sweeper();

    let logger = SystemLogger::new(store.clone(), cache.clone());
    logger.info("服务启动", None);

    let executor = ProbeExecutor::new(store.clone(), logger.clone(), cfg.request_timeout_ms);
    let scheduler = Scheduler::new(
        store.clone(),
        cache.clone(),
        executor,
        cfg.max_concurrent_monitors,
    );
    scheduler.start().await;

    MaintenanceJob::new(store.clone(), logger.clone(), cfg.history_retention_days).start();

    let auth = AuthService::new(
        store.clone(),
        cfg.admin_password.clone(),
        cfg.session_expire_hours,
        cfg.login_lockout_minutes,
        cfg.max_login_attempts,
    );
    let stats = StatsEngine::new(store.clone(), cache.clone());

    // A bind failure is also a startup failure: exit code 1.
    let server = Server::new(cfg, store, cache, logger, auth, scheduler, stats);
    server.start().await?;

    Ok(())
}
