//! Configuration module for SiteWatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8000)
    pub port: u16,
    /// Path to the redb database file (default: "sitewatch.redb")
    pub db_path: String,
    /// Shared admin password for the dashboard login
    pub admin_password: String,
    /// Session lifetime in hours
    pub session_expire_hours: i64,
    /// Default probe interval in minutes for new monitors
    pub default_monitor_interval: u32,
    /// Lower bound for a monitor's probe interval
    pub min_monitor_interval: u32,
    /// Upper bound for a monitor's probe interval
    pub max_monitor_interval: u32,
    /// Days of probe history kept before the maintenance sweep removes it
    pub history_retention_days: i64,
    /// Maximum probes executed in parallel within a scheduler batch
    pub max_concurrent_monitors: usize,
    /// Hard per-probe timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Trailing window in which failed logins count toward the lockout
    pub login_lockout_minutes: i64,
    /// Failed logins within the window that trigger the lockout
    pub max_login_attempts: usize,
    /// Log level directive for the tracing subscriber
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            db_path: "sitewatch.redb".to_string(),
            admin_password: "admin123".to_string(),
            session_expire_hours: 24,
            default_monitor_interval: 1,
            min_monitor_interval: 1,
            max_monitor_interval: 60,
            history_retention_days: 30,
            max_concurrent_monitors: 10,
            request_timeout_ms: 30_000,
            login_lockout_minutes: 15,
            max_login_attempts: 5,
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Unset or unparseable variables fall back to their defaults.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parse_var("PORT") {
            cfg.port = port;
        }
        if let Ok(db_path) = env::var("SITEWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Ok(password) = env::var("ADMIN_PASSWORD") {
            if !password.is_empty() {
                cfg.admin_password = password;
            }
        }
        if let Some(hours) = parse_var("SESSION_EXPIRE_HOURS") {
            cfg.session_expire_hours = hours;
        }
        if let Some(interval) = parse_var("DEFAULT_MONITOR_INTERVAL") {
            cfg.default_monitor_interval = interval;
        }
        if let Some(min) = parse_var("MIN_MONITOR_INTERVAL") {
            cfg.min_monitor_interval = min;
        }
        if let Some(max) = parse_var("MAX_MONITOR_INTERVAL") {
            cfg.max_monitor_interval = max;
        }
        if let Some(days) = parse_var("HISTORY_RETENTION_DAYS") {
            cfg.history_retention_days = days;
        }
        if let Some(n) = parse_var("MAX_CONCURRENT_MONITORS") {
            cfg.max_concurrent_monitors = n;
        }
        if let Some(ms) = parse_var("REQUEST_TIMEOUT") {
            cfg.request_timeout_ms = ms;
        }
        if let Some(minutes) = parse_var("LOGIN_LOCKOUT_MINUTES") {
            cfg.login_lockout_minutes = minutes;
        }
        if let Some(n) = parse_var("MAX_LOGIN_ATTEMPTS") {
            cfg.max_login_attempts = n;
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            if !level.is_empty() {
                cfg.log_level = level;
            }
        }

        cfg
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.db_path, "sitewatch.redb");
        assert_eq!(cfg.admin_password, "admin123");
        assert_eq!(cfg.session_expire_hours, 24);
        assert_eq!(cfg.min_monitor_interval, 1);
        assert_eq!(cfg.max_monitor_interval, 60);
        assert_eq!(cfg.max_concurrent_monitors, 10);
        assert_eq!(cfg.request_timeout_ms, 30_000);
        assert_eq!(cfg.max_login_attempts, 5);
    }
}
