//! Maintenance job: periodic GC of expired and aged-out records.

use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;

use crate::db::Store;
use crate::syslog::SystemLogger;

/// Sweep cadence; the first sweep runs at startup.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);

/// System log entries are kept this many days.
const LOG_RETENTION_DAYS: i64 = 7;

/// Login attempts are kept this many hours.
const ATTEMPT_RETENTION_HOURS: i64 = 24;

/// Background job sweeping sessions, history, system logs and login attempts.
pub struct MaintenanceJob {
    store: Store,
    logger: SystemLogger,
    history_retention_days: i64,
}

impl MaintenanceJob {
    pub fn new(store: Store, logger: SystemLogger, history_retention_days: i64) -> Self {
        Self {
            store,
            logger,
            history_retention_days,
        }
    }

    /// Run once now, then hourly.
    pub fn start(self) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                self.run_sweeps().await;
            }
        });
    }

    /// The sweeps are independent: a failure in one (logged inside the store)
    /// never aborts the others.
    async fn run_sweeps(&self) {
        let now = Utc::now();
        let history_cutoff = now - ChronoDuration::days(self.history_retention_days);
        let log_cutoff = now - ChronoDuration::days(LOG_RETENTION_DAYS);
        let attempt_cutoff = now - ChronoDuration::hours(ATTEMPT_RETENTION_HOURS);

        let sessions_store = self.store.clone();
        let history_store = self.store.clone();
        let logs_store = self.store.clone();
        let attempts_store = self.store.clone();

        let (sessions, history, logs, attempts) = tokio::join!(
            tokio::task::spawn_blocking(move || sessions_store.delete_expired_sessions(now)),
            tokio::task::spawn_blocking(move || history_store.delete_history_before(history_cutoff)),
            tokio::task::spawn_blocking(move || logs_store.delete_system_logs_before(log_cutoff)),
            tokio::task::spawn_blocking(move || {
                attempts_store.delete_login_attempts_before(attempt_cutoff)
            }),
        );

        let sessions = sessions.unwrap_or(0);
        let history = history.unwrap_or(0);
        let logs = logs.unwrap_or(0);
        let attempts = attempts.unwrap_or(0);

        tracing::info!(
            "Maintenance: removed {} sessions, {} history records, {} logs, {} login attempts",
            sessions,
            history,
            logs,
            attempts
        );
        self.logger.log(
            crate::db::LogLevel::Info,
            format!(
                "维护完成: 清理 {sessions} 个过期会话, {history} 条历史记录, {logs} 条系统日志, {attempts} 条登录记录"
            ),
            None,
            Some(serde_json::json!({
                "sessions": sessions,
                "history": history,
                "system_logs": logs,
                "login_attempts": attempts,
            })),
        );
    }
}
