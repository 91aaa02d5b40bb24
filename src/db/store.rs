//! Ordered key-value store adapter over redb.
//!
//! All entities live in per-entity tables keyed by composite strings, with
//! JSON bytes as values. Key layout:
//!
//! - `monitors`:       `{id}`
//! - `history`:        `{monitor_id}:{time_key}:{record_id}`
//! - `sessions`:       `{token}`
//! - `login_attempts`: `{ip}:{time_key}:{attempt_id}`
//! - `system_logs`:    `{time_key}:{log_id}`
//!
//! `time_key` is the record timestamp as left-zero-padded 20-digit
//! milliseconds, so a reverse range scan yields newest-first without a
//! secondary index.
//!
//! Contract: mutations surface a `bool` success and point reads a nullable
//! value — underlying errors are logged, not propagated. Explicit range scans
//! return `Result` so callers can distinguish an empty range from a failure.

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::models::*;

const MONITORS: TableDefinition<&str, &[u8]> = TableDefinition::new("monitors");
const HISTORY: TableDefinition<&str, &[u8]> = TableDefinition::new("history");
const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");
const LOGIN_ATTEMPTS: TableDefinition<&str, &[u8]> = TableDefinition::new("login_attempts");
const SYSTEM_LOGS: TableDefinition<&str, &[u8]> = TableDefinition::new("system_logs");

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Render a timestamp as a 20-digit millisecond key segment.
pub fn time_key(ts: DateTime<Utc>) -> String {
    format!("{:020}", ts.timestamp_millis().max(0))
}

/// Thread-safe store handle; cheap to clone.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    /// Open (or create) the database and ensure all tables exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let db = Database::create(path)?;
        let tx = db.begin_write()?;
        {
            tx.open_table(MONITORS)?;
            tx.open_table(HISTORY)?;
            tx.open_table(SESSIONS)?;
            tx.open_table(LOGIN_ATTEMPTS)?;
            tx.open_table(SYSTEM_LOGS)?;
        }
        tx.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Cheap liveness probe used by the health endpoint.
    pub fn ping(&self) -> bool {
        match self.db.begin_read() {
            Ok(tx) => tx.open_table(MONITORS).is_ok(),
            Err(_) => false,
        }
    }

    // --- Monitors ---

    pub fn save_monitor(&self, config: &MonitorConfig) -> bool {
        self.log_mutation("save monitor", || {
            self.put(MONITORS, &config.id, config)
        })
    }

    pub fn get_monitor(&self, id: &str) -> Option<MonitorConfig> {
        self.log_read("get monitor", || self.point_get(MONITORS, id))
    }

    /// All monitor configs in key order.
    pub fn get_monitors(&self) -> Result<Vec<MonitorConfig>, DbError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(MONITORS)?;
        let mut configs = Vec::new();
        for item in table.iter()? {
            let (_, value) = item?;
            configs.push(serde_json::from_slice(value.value())?);
        }
        Ok(configs)
    }

    /// Delete a monitor and every history record under its prefix.
    ///
    /// Best-effort compound mutation: the monitor key and the history prefix
    /// go in one write transaction, and deleting an absent id still reports
    /// success.
    pub fn delete_monitor(&self, id: &str) -> bool {
        self.log_mutation("delete monitor", || {
            let tx = self.db.begin_write()?;
            {
                let mut monitors = tx.open_table(MONITORS)?;
                monitors.remove(id)?;

                let mut history = tx.open_table(HISTORY)?;
                // ';' sorts immediately after the ':' separator
                let start = format!("{id}:");
                let end = format!("{id};");
                let keys: Vec<String> = history
                    .range::<&str>(start.as_str()..end.as_str())?
                    .filter_map(|item| item.ok())
                    .map(|(k, _)| k.value().to_string())
                    .collect();
                for key in &keys {
                    history.remove(key.as_str())?;
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    // --- History ---

    pub fn append_history(&self, record: &MonitorHistory) -> bool {
        let key = format!(
            "{}:{}:{}",
            record.monitor_id,
            time_key(record.timestamp),
            record.id
        );
        self.log_mutation("append history", || self.put(HISTORY, &key, record))
    }

    /// Newest-first history for one monitor, up to `limit` records.
    pub fn get_history(
        &self,
        monitor_id: &str,
        limit: usize,
    ) -> Result<Vec<MonitorHistory>, DbError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(HISTORY)?;
        let start = format!("{monitor_id}:");
        let end = format!("{monitor_id};");
        let mut records = Vec::new();
        for item in table
            .range::<&str>(start.as_str()..end.as_str())?
            .rev()
            .take(limit)
        {
            let (_, value) = item?;
            records.push(serde_json::from_slice(value.value())?);
        }
        Ok(records)
    }

    /// Newest-first history for one monitor, stopping at the first record
    /// older than `cutoff`.
    pub fn get_history_since(
        &self,
        monitor_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<MonitorHistory>, DbError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(HISTORY)?;
        let start = format!("{monitor_id}:");
        let end = format!("{monitor_id};");
        let mut records = Vec::new();
        for item in table.range::<&str>(start.as_str()..end.as_str())?.rev() {
            let (_, value) = item?;
            let record: MonitorHistory = serde_json::from_slice(value.value())?;
            if record.timestamp < cutoff {
                break;
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Remove history records older than `cutoff` across all monitors.
    /// Returns the number removed; failures are logged and yield 0.
    pub fn delete_history_before(&self, cutoff: DateTime<Utc>) -> u64 {
        self.sweep(HISTORY, "history", move |key, _| {
            // key = {monitor_id}:{time_key}:{record_id}; uuids carry no ':'
            key.split(':')
                .nth(1)
                .and_then(|t| t.parse::<i64>().ok())
                .is_some_and(|ms| ms < cutoff.timestamp_millis())
        })
    }

    // --- Sessions ---

    pub fn save_session(&self, session: &Session) -> bool {
        self.log_mutation("save session", || {
            self.put(SESSIONS, &session.id, session)
        })
    }

    pub fn get_session(&self, token: &str) -> Option<Session> {
        self.log_read("get session", || self.point_get(SESSIONS, token))
    }

    pub fn delete_session(&self, token: &str) -> bool {
        self.log_mutation("delete session", || {
            let tx = self.db.begin_write()?;
            {
                let mut table = tx.open_table(SESSIONS)?;
                table.remove(token)?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    /// Remove sessions whose `expires_at` has passed.
    pub fn delete_expired_sessions(&self, now: DateTime<Utc>) -> u64 {
        self.sweep(SESSIONS, "sessions", move |_, value| {
            serde_json::from_slice::<Session>(value)
                .map(|s| s.is_expired(now))
                .unwrap_or(false)
        })
    }

    // --- Login attempts ---

    pub fn record_login_attempt(&self, attempt: &LoginAttempt) -> bool {
        let key = format!(
            "{}:{}:{}",
            attempt.ip,
            time_key(attempt.timestamp),
            Uuid::new_v4()
        );
        self.log_mutation("record login attempt", || {
            self.put(LOGIN_ATTEMPTS, &key, attempt)
        })
    }

    /// Failed attempts from `ip` at or after `since`, newest-first with early
    /// stop once the scan leaves the window.
    pub fn count_login_failures(
        &self,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(LOGIN_ATTEMPTS)?;
        let start = format!("{ip}:");
        let end = format!("{ip};");
        let mut failures = 0;
        for item in table.range::<&str>(start.as_str()..end.as_str())?.rev() {
            let (_, value) = item?;
            let attempt: LoginAttempt = serde_json::from_slice(value.value())?;
            if attempt.timestamp < since {
                break;
            }
            if !attempt.success {
                failures += 1;
            }
        }
        Ok(failures)
    }

    /// Remove login attempts older than `cutoff`.
    pub fn delete_login_attempts_before(&self, cutoff: DateTime<Utc>) -> u64 {
        self.sweep(LOGIN_ATTEMPTS, "login attempts", move |_, value| {
            serde_json::from_slice::<LoginAttempt>(value)
                .map(|a| a.timestamp < cutoff)
                .unwrap_or(false)
        })
    }

    // --- System logs ---

    pub fn append_system_log(&self, entry: &SystemLog) -> bool {
        let key = format!("{}:{}", time_key(entry.timestamp), entry.id);
        self.log_mutation("append system log", || {
            self.put(SYSTEM_LOGS, &key, entry)
        })
    }

    /// Newest-first system log entries, at most `max`.
    pub fn get_system_logs(&self, max: usize) -> Result<Vec<SystemLog>, DbError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(SYSTEM_LOGS)?;
        let mut entries = Vec::new();
        for item in table.iter()?.rev().take(max) {
            let (_, value) = item?;
            entries.push(serde_json::from_slice(value.value())?);
        }
        Ok(entries)
    }

    /// Remove system logs older than `cutoff`.
    pub fn delete_system_logs_before(&self, cutoff: DateTime<Utc>) -> u64 {
        self.sweep(SYSTEM_LOGS, "system logs", move |key, _| {
            key.split(':')
                .next()
                .and_then(|t| t.parse::<i64>().ok())
                .is_some_and(|ms| ms < cutoff.timestamp_millis())
        })
    }

    // --- Internals ---

    fn put<T: serde::Serialize>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &T,
    ) -> Result<(), DbError> {
        let bytes = serde_json::to_vec(value)?;
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(table_def)?;
            table.insert(key, bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    fn point_get<T: serde::de::DeserializeOwned>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> Result<Option<T>, DbError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(table_def)?;
        match table.get(key)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Delete every entry matching `should_remove`; best-effort, logs on error.
    fn sweep<F>(
        &self,
        table_def: TableDefinition<&str, &[u8]>,
        what: &str,
        should_remove: F,
    ) -> u64
    where
        F: Fn(&str, &[u8]) -> bool,
    {
        let run = || -> Result<u64, DbError> {
            let tx = self.db.begin_write()?;
            let mut removed = 0;
            {
                let mut table = tx.open_table(table_def)?;
                let keys: Vec<String> = table
                    .iter()?
                    .filter_map(|item| item.ok())
                    .filter(|(k, v)| should_remove(k.value(), v.value()))
                    .map(|(k, _)| k.value().to_string())
                    .collect();
                for key in &keys {
                    table.remove(key.as_str())?;
                    removed += 1;
                }
            }
            tx.commit()?;
            Ok(removed)
        };
        match run() {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("Store: sweep of {} failed: {}", what, e);
                0
            }
        }
    }

    fn log_mutation<F>(&self, what: &str, f: F) -> bool
    where
        F: FnOnce() -> Result<(), DbError>,
    {
        match f() {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Store: failed to {}: {}", what, e);
                false
            }
        }
    }

    fn log_read<T, F>(&self, what: &str, f: F) -> Option<T>
    where
        F: FnOnce() -> Result<Option<T>, DbError>,
    {
        match f() {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Store: failed to {}: {}", what, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::NamedTempFile;

    fn test_store() -> (NamedTempFile, Store) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        (tmp, store)
    }

    fn sample_monitor(id: &str) -> MonitorConfig {
        let now = Utc::now();
        MonitorConfig {
            id: id.to_string(),
            name: "Test".to_string(),
            url: "https://example.test/ok".to_string(),
            method: MonitorMethod::Get,
            cookie: None,
            headers: None,
            interval_minutes: 1,
            enabled: true,
            last_check_at: None,
            status: MonitorStatus::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_history(monitor_id: &str, ts: DateTime<Utc>) -> MonitorHistory {
        MonitorHistory {
            id: Uuid::new_v4().to_string(),
            monitor_id: monitor_id.to_string(),
            timestamp: ts,
            status: HistoryStatus::Success,
            response_time_ms: Some(120),
            http_status: Some(200),
            error: None,
        }
    }

    #[test]
    fn test_monitor_crud() {
        let (_tmp, store) = test_store();

        let config = sample_monitor("m1");
        assert!(store.save_monitor(&config));

        let fetched = store.get_monitor("m1").unwrap();
        assert_eq!(fetched.name, "Test");
        assert_eq!(fetched.status, MonitorStatus::Pending);

        let mut updated = fetched;
        updated.name = "Updated".to_string();
        assert!(store.save_monitor(&updated));
        assert_eq!(store.get_monitor("m1").unwrap().name, "Updated");

        assert!(store.delete_monitor("m1"));
        assert!(store.get_monitor("m1").is_none());
        // Deleting an absent id is a no-op that reports success.
        assert!(store.delete_monitor("m1"));
    }

    #[test]
    fn test_cascade_delete_removes_history_prefix() {
        let (_tmp, store) = test_store();
        let config = sample_monitor("m1");
        store.save_monitor(&config);

        let base = Utc::now();
        for i in 0..20 {
            store.append_history(&sample_history("m1", base + Duration::seconds(i)));
        }
        // A neighboring monitor's history must survive.
        store.append_history(&sample_history("m2", base));

        assert_eq!(store.get_history("m1", 100).unwrap().len(), 20);
        assert!(store.delete_monitor("m1"));
        assert!(store.get_history("m1", 100).unwrap().is_empty());
        assert_eq!(store.get_history("m2", 100).unwrap().len(), 1);
    }

    #[test]
    fn test_history_newest_first_and_limit() {
        let (_tmp, store) = test_store();
        let base = Utc::now();
        for i in 0..5 {
            store.append_history(&sample_history("m1", base + Duration::minutes(i)));
        }

        let records = store.get_history("m1", 3).unwrap();
        assert_eq!(records.len(), 3);
        assert!(records[0].timestamp > records[1].timestamp);
        assert!(records[1].timestamp > records[2].timestamp);
        assert_eq!(records[0].timestamp, base + Duration::minutes(4));
    }

    #[test]
    fn test_history_since_stops_at_cutoff() {
        let (_tmp, store) = test_store();
        let base = Utc::now();
        for i in 0..10 {
            store.append_history(&sample_history("m1", base - Duration::hours(i)));
        }

        let cutoff = base - Duration::hours(3) - Duration::minutes(1);
        let records = store.get_history_since("m1", cutoff).unwrap();
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.timestamp >= cutoff));
    }

    #[test]
    fn test_history_retention_sweep() {
        let (_tmp, store) = test_store();
        let now = Utc::now();
        store.append_history(&sample_history("m1", now - Duration::days(40)));
        store.append_history(&sample_history("m1", now - Duration::days(1)));

        let removed = store.delete_history_before(now - Duration::days(30));
        assert_eq!(removed, 1);
        assert_eq!(store.get_history("m1", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_session_lifecycle() {
        let (_tmp, store) = test_store();
        let now = Utc::now();
        let session = Session {
            id: "tok".to_string(),
            authenticated: true,
            created_at: now,
            expires_at: now + Duration::hours(24),
            last_access_at: now,
            ip_address: "1.2.3.4".to_string(),
            user_agent: "test".to_string(),
        };
        assert!(store.save_session(&session));
        assert!(store.get_session("tok").is_some());
        assert!(store.delete_session("tok"));
        assert!(store.get_session("tok").is_none());
    }

    #[test]
    fn test_expired_session_sweep() {
        let (_tmp, store) = test_store();
        let now = Utc::now();
        let expired = Session {
            id: "old".to_string(),
            authenticated: true,
            created_at: now - Duration::hours(48),
            expires_at: now - Duration::hours(24),
            last_access_at: now - Duration::hours(24),
            ip_address: "1.2.3.4".to_string(),
            user_agent: "test".to_string(),
        };
        let live = Session {
            id: "new".to_string(),
            expires_at: now + Duration::hours(24),
            ..expired.clone()
        };
        store.save_session(&expired);
        store.save_session(&live);

        assert_eq!(store.delete_expired_sessions(now), 1);
        assert!(store.get_session("old").is_none());
        assert!(store.get_session("new").is_some());
    }

    #[test]
    fn test_login_failure_window() {
        let (_tmp, store) = test_store();
        let now = Utc::now();

        for i in 0..4 {
            store.record_login_attempt(&LoginAttempt {
                ip: "1.2.3.4".to_string(),
                timestamp: now - Duration::minutes(i),
                success: false,
            });
        }
        // Outside the window, and a success inside it: neither counts.
        store.record_login_attempt(&LoginAttempt {
            ip: "1.2.3.4".to_string(),
            timestamp: now - Duration::minutes(30),
            success: false,
        });
        store.record_login_attempt(&LoginAttempt {
            ip: "1.2.3.4".to_string(),
            timestamp: now,
            success: true,
        });
        // Another IP never counts.
        store.record_login_attempt(&LoginAttempt {
            ip: "5.6.7.8".to_string(),
            timestamp: now,
            success: false,
        });

        let since = now - Duration::minutes(15);
        assert_eq!(store.count_login_failures("1.2.3.4", since).unwrap(), 4);
        assert_eq!(store.count_login_failures("5.6.7.8", since).unwrap(), 1);
        assert_eq!(store.count_login_failures("9.9.9.9", since).unwrap(), 0);
    }

    #[test]
    fn test_system_log_order_and_sweep() {
        let (_tmp, store) = test_store();
        let now = Utc::now();
        for i in 0..5 {
            store.append_system_log(&SystemLog {
                id: Uuid::new_v4().to_string(),
                level: LogLevel::Info,
                message: format!("event {i}"),
                monitor_id: None,
                monitor_name: None,
                metadata: None,
                timestamp: now - Duration::days(i * 2),
            });
        }

        let entries = store.get_system_logs(10).unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].message, "event 0");
        assert!(entries[0].timestamp > entries[1].timestamp);

        // Entries at 0, 2, 4, 6, 8 days old; the 7-day sweep drops one.
        let removed = store.delete_system_logs_before(now - Duration::days(7));
        assert_eq!(removed, 1);
        assert_eq!(store.get_system_logs(10).unwrap().len(), 4);
    }

    #[test]
    fn test_time_key_padding_sorts() {
        let early = time_key(Utc::now());
        let late = time_key(Utc::now() + Duration::days(1));
        assert_eq!(early.len(), 20);
        assert!(early < late);
    }
}
