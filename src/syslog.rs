//! System log sink.
//!
//! Operator-facing events, appended under a chronological key so a reverse
//! range scan yields newest-first. Writes are fire-and-forget: a failed
//! append is traced and swallowed, never surfaced to the caller.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::{Cache, LOGS_TTL};
use crate::db::{DbError, LogLevel, Store, SystemLog};

/// Upper bound on entries examined by one `list` call. Filtering happens in
/// memory within this window, so the matched count is exact inside it and a
/// lower bound beyond it.
pub const MAX_SYSTEM_LOGS: usize = 1000;

/// Filters and paging for a log query.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub level: Option<LogLevel>,
    pub monitor_id: Option<String>,
    pub search: Option<String>,
    pub offset: usize,
    pub limit: usize,
}

/// One page of log entries plus the matched count within the scan window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPage {
    pub entries: Vec<SystemLog>,
    pub matched_count: usize,
}

/// Store-backed logger for operator events.
#[derive(Clone)]
pub struct SystemLogger {
    store: Store,
    cache: Cache,
}

impl SystemLogger {
    pub fn new(store: Store, cache: Cache) -> Self {
        Self { store, cache }
    }

    /// Append an entry. Never fails the caller.
    pub fn log(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        monitor: Option<(&str, &str)>,
        metadata: Option<serde_json::Value>,
    ) {
        let message = message.into();
        let entry = SystemLog {
            id: Uuid::new_v4().to_string(),
            level,
            message,
            monitor_id: monitor.map(|(id, _)| id.to_string()),
            monitor_name: monitor.map(|(_, name)| name.to_string()),
            metadata,
            timestamp: Utc::now(),
        };
        if !self.store.append_system_log(&entry) {
            tracing::warn!("SystemLogger: dropped log entry: {}", entry.message);
        }
    }

    pub fn info(&self, message: impl Into<String>, monitor: Option<(&str, &str)>) {
        self.log(LogLevel::Info, message, monitor, None);
    }

    pub fn warn(&self, message: impl Into<String>, monitor: Option<(&str, &str)>) {
        self.log(LogLevel::Warn, message, monitor, None);
    }

    pub fn error(&self, message: impl Into<String>, monitor: Option<(&str, &str)>) {
        self.log(LogLevel::Error, message, monitor, None);
    }

    /// Query entries newest-first. Scans at most [`MAX_SYSTEM_LOGS`] records,
    /// applies the filters in memory and pages the result.
    pub fn list(&self, query: &LogQuery) -> Result<LogPage, DbError> {
        let limit = if query.limit == 0 { 50 } else { query.limit.min(200) };
        let cache_key = format!(
            "system_logs_{}_{}_{}_{}_{}",
            query
                .level
                .map(|l| format!("{l:?}"))
                .unwrap_or_else(|| "all".to_string()),
            query.monitor_id.as_deref().unwrap_or("all"),
            query.search.as_deref().unwrap_or(""),
            query.offset,
            limit,
        );
        if let Some(page) = self.cache.get::<LogPage>(&cache_key) {
            return Ok(page);
        }

        let scanned = self.store.get_system_logs(MAX_SYSTEM_LOGS)?;
        let matched: Vec<SystemLog> = scanned
            .into_iter()
            .filter(|entry| {
                if let Some(level) = query.level {
                    if entry.level != level {
                        return false;
                    }
                }
                if let Some(monitor_id) = &query.monitor_id {
                    if entry.monitor_id.as_deref() != Some(monitor_id.as_str()) {
                        return false;
                    }
                }
                if let Some(needle) = &query.search {
                    if !needle.is_empty() && !entry.message.contains(needle.as_str()) {
                        return false;
                    }
                }
                true
            })
            .collect();

        let matched_count = matched.len();
        let entries = matched
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .collect();
        let page = LogPage {
            entries,
            matched_count,
        };
        self.cache.set(&cache_key, &page, LOGS_TTL);
        Ok(page)
    }
}
