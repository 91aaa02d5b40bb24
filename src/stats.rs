//! Bucketed success-rate statistics over probe history.
//!
//! Buckets are aligned to the local clock: 24 hourly buckets for the `24h`
//! period, 7 daily buckets for `7d`, oldest first, with the current partial
//! bucket included.

use chrono::{DateTime, Duration as ChronoDuration, Local, LocalResult, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{Cache, STATS_TTL};
use crate::db::{DbError, HistoryStatus, MonitorHistory, Store};

/// Aggregation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsPeriod {
    Day,
    Week,
}

impl StatsPeriod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "24h" => Some(Self::Day),
            "7d" => Some(Self::Week),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "24h",
            Self::Week => "7d",
        }
    }

    fn bucket_count(&self) -> usize {
        match self {
            Self::Day => 24,
            Self::Week => 7,
        }
    }

    fn bucket_seconds(&self) -> i64 {
        match self {
            Self::Day => 3600,
            Self::Week => 86_400,
        }
    }
}

/// One aggregation bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsBucket {
    pub label: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    pub bucket_start: DateTime<Utc>,
}

/// Bucketed stats for one monitor and period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorStats {
    pub monitor_id: String,
    pub monitor_name: String,
    pub period: String,
    pub buckets: Vec<StatsBucket>,
}

/// Stats engine over the history range scans.
#[derive(Clone)]
pub struct StatsEngine {
    store: Store,
    cache: Cache,
}

impl StatsEngine {
    pub fn new(store: Store, cache: Cache) -> Self {
        Self { store, cache }
    }

    /// Aggregate one monitor's history into period buckets, cached per
    /// `(monitor_id, period)`.
    pub fn monitor_stats(
        &self,
        monitor_id: &str,
        monitor_name: &str,
        period: StatsPeriod,
    ) -> Result<MonitorStats, DbError> {
        let cache_key = format!("monitor_stats_{}_{}", monitor_id, period.as_str());
        if let Some(stats) = self.cache.get::<MonitorStats>(&cache_key) {
            return Ok(stats);
        }

        let starts = bucket_starts(period, Local::now());
        let window_start = starts[0].with_timezone(&Utc);
        let records = self.store.get_history_since(monitor_id, window_start)?;
        let buckets = aggregate(&records, &starts, period);

        let stats = MonitorStats {
            monitor_id: monitor_id.to_string(),
            monitor_name: monitor_name.to_string(),
            period: period.as_str().to_string(),
            buckets,
        };
        self.cache.set(&cache_key, &stats, STATS_TTL);
        Ok(stats)
    }
}

/// Bucket start instants for the period ending at `now`, oldest first.
fn bucket_starts(period: StatsPeriod, now: DateTime<Local>) -> Vec<DateTime<Local>> {
    let count = period.bucket_count() as i64;
    let current = match period {
        StatsPeriod::Day => truncate_to_hour(now),
        StatsPeriod::Week => truncate_to_midnight(now),
    };
    (0..count)
        .rev()
        .map(|i| current - ChronoDuration::seconds(i * period.bucket_seconds()))
        .collect()
}

fn aggregate(
    records: &[MonitorHistory],
    starts: &[DateTime<Local>],
    period: StatsPeriod,
) -> Vec<StatsBucket> {
    let window_start = starts[0];
    let bucket_seconds = period.bucket_seconds();
    let mut success = vec![0u64; starts.len()];
    let mut failure = vec![0u64; starts.len()];

    for record in records {
        let local = record.timestamp.with_timezone(&Local);
        let offset = (local - window_start).num_seconds();
        if offset < 0 {
            continue;
        }
        let index = (offset / bucket_seconds) as usize;
        if index >= starts.len() {
            continue;
        }
        match record.status {
            HistoryStatus::Success => success[index] += 1,
            HistoryStatus::Error => failure[index] += 1,
        }
    }

    starts
        .iter()
        .enumerate()
        .map(|(i, start)| StatsBucket {
            label: bucket_label(*start, period),
            success_count: success[i],
            failure_count: failure[i],
            success_rate: success_rate(success[i], failure[i]),
            bucket_start: start.with_timezone(&Utc),
        })
        .collect()
}

fn bucket_label(start: DateTime<Local>, period: StatsPeriod) -> String {
    match period {
        StatsPeriod::Day => start.format("%H:00").to_string(),
        StatsPeriod::Week => format!("{}/{}", start.format("%-m"), start.format("%-d")),
    }
}

/// Percentage of successful probes, rounded to 2 decimals; 0 without samples.
fn success_rate(success: u64, failure: u64) -> f64 {
    let total = success + failure;
    if total == 0 {
        return 0.0;
    }
    let rate = success as f64 / total as f64 * 100.0;
    (rate * 100.0).round() / 100.0
}

fn truncate_to_hour(dt: DateTime<Local>) -> DateTime<Local> {
    dt.with_minute(0)
        .and_then(|d| d.with_second(0))
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(dt)
}

fn truncate_to_midnight(dt: DateTime<Local>) -> DateTime<Local> {
    let naive = dt.date_naive().and_hms_opt(0, 0, 0).unwrap_or(dt.naive_local());
    match Local.from_local_datetime(&naive) {
        LocalResult::Single(d) => d,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => dt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(ts: DateTime<Utc>, status: HistoryStatus) -> MonitorHistory {
        MonitorHistory {
            id: Uuid::new_v4().to_string(),
            monitor_id: "m1".to_string(),
            timestamp: ts,
            status,
            response_time_ms: Some(100),
            http_status: Some(200),
            error: None,
        }
    }

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_day_buckets_align_to_hours() {
        // Stats produced at 12:34 local: 24 labels from 13:00 to 12:00.
        let now = local(2024, 3, 5, 12, 34);
        let starts = bucket_starts(StatsPeriod::Day, now);
        assert_eq!(starts.len(), 24);
        assert_eq!(bucket_label(starts[0], StatsPeriod::Day), "13:00");
        assert_eq!(bucket_label(starts[23], StatsPeriod::Day), "12:00");
        assert_eq!(starts[23], local(2024, 3, 5, 12, 0));
        assert_eq!(starts[0], local(2024, 3, 4, 13, 0));
    }

    #[test]
    fn test_week_buckets_align_to_midnight() {
        let now = local(2024, 3, 5, 12, 34);
        let starts = bucket_starts(StatsPeriod::Week, now);
        assert_eq!(starts.len(), 7);
        assert_eq!(starts[6], local(2024, 3, 5, 0, 0));
        assert_eq!(starts[0], local(2024, 2, 28, 0, 0));
        assert_eq!(bucket_label(starts[6], StatsPeriod::Week), "3/5");
        assert_eq!(bucket_label(starts[0], StatsPeriod::Week), "2/28");
    }

    #[test]
    fn test_aggregate_counts_and_rate() {
        let now = local(2024, 3, 5, 12, 34);
        let starts = bucket_starts(StatsPeriod::Day, now);

        // Two successes and one failure in the current hour, one success in
        // the previous hour, one record outside the window.
        let current_hour = starts[23].with_timezone(&Utc);
        let records = vec![
            record(current_hour + ChronoDuration::minutes(5), HistoryStatus::Success),
            record(current_hour + ChronoDuration::minutes(10), HistoryStatus::Success),
            record(current_hour + ChronoDuration::minutes(15), HistoryStatus::Error),
            record(current_hour - ChronoDuration::minutes(30), HistoryStatus::Success),
            record(current_hour - ChronoDuration::hours(30), HistoryStatus::Error),
        ];

        let buckets = aggregate(&records, &starts, StatsPeriod::Day);
        let last = &buckets[23];
        assert_eq!(last.success_count, 2);
        assert_eq!(last.failure_count, 1);
        assert_eq!(last.success_rate, 66.67);

        let previous = &buckets[22];
        assert_eq!(previous.success_count, 1);
        assert_eq!(previous.failure_count, 0);
        assert_eq!(previous.success_rate, 100.0);

        let total: u64 = buckets
            .iter()
            .map(|b| b.success_count + b.failure_count)
            .sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn test_empty_bucket_has_zero_rate() {
        assert_eq!(success_rate(0, 0), 0.0);
        assert_eq!(success_rate(1, 2), 33.33);
        assert_eq!(success_rate(3, 0), 100.0);
    }
}
