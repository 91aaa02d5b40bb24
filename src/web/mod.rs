//! Web server module.

mod handlers;

pub use handlers::*;

use crate::auth::AuthService;
use crate::cache::Cache;
use crate::config::ServerConfig;
use crate::db::Store;
use crate::scheduler::Scheduler;
use crate::stats::StatsEngine;
use crate::syslog::SystemLogger;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue},
    routing::{delete, get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Store,
    pub cache: Cache,
    pub logger: SystemLogger,
    pub auth: AuthService,
    pub scheduler: Scheduler,
    pub stats: StatsEngine,
    pub started_at: DateTime<Utc>,
}

/// Web server for SiteWatch.
pub struct Server {
    state: AppState,
}

impl Server {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ServerConfig,
        store: Store,
        cache: Cache,
        logger: SystemLogger,
        auth: AuthService,
        scheduler: Scheduler,
        stats: StatsEngine,
    ) -> Self {
        Self {
            state: AppState {
                config,
                store,
                cache,
                logger,
                auth,
                scheduler,
                stats,
                started_at: Utc::now(),
            },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            // Dashboard
            .route("/", get(handlers::handle_dashboard))
            .route("/dashboard", get(handlers::handle_dashboard))
            // Auth
            .route("/api/login", post(handlers::handle_login))
            .route("/api/logout", post(handlers::handle_logout))
            .route("/api/auth/check", get(handlers::handle_auth_check))
            // Monitors
            .route("/api/monitors", get(handlers::handle_get_monitors))
            .route("/api/monitors", post(handlers::handle_create_monitor))
            .route("/api/monitors/status", get(handlers::handle_monitors_status))
            .route("/api/monitors/{id}", put(handlers::handle_update_monitor))
            .route("/api/monitors/{id}", delete(handlers::handle_delete_monitor))
            .route("/api/monitors/{id}/history", get(handlers::handle_monitor_history))
            .route("/api/monitors/{id}/stats", get(handlers::handle_monitor_stats))
            // Stats
            .route("/api/stats", get(handlers::handle_stats))
            .route("/api/stats/overview", get(handlers::handle_stats_overview))
            // System
            .route("/api/system/info", get(handlers::handle_system_info))
            .route("/api/system/health", get(handlers::handle_system_health))
            .route("/api/system/cache", get(handlers::handle_system_cache))
            .route("/api/system/cache/clear", post(handlers::handle_cache_clear))
            .route("/api/system/scheduler", get(handlers::handle_system_scheduler))
            .route("/api/system/logs", get(handlers::handle_system_logs))
            .layer(cors)
            .layer(SetResponseHeaderLayer::overriding(
                header::X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                header::X_FRAME_OPTIONS,
                HeaderValue::from_static("DENY"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                header::X_XSS_PROTECTION,
                HeaderValue::from_static("1; mode=block"),
            ))
            .layer(SetResponseHeaderLayer::overriding(
                header::REFERRER_POLICY,
                HeaderValue::from_static("strict-origin-when-cross-origin"),
            ))
            .layer(CatchPanicLayer::custom(handlers::handle_panic))
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
