//! Persisted record types.
//!
//! Everything stored in the KV namespace is one of these structs, serialized
//! as JSON. Timestamps are `chrono::DateTime<Utc>` and revive on read through
//! serde; IDs are random v4 UUIDs rendered as 36-char strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// HTTP method a monitor probe is allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MonitorMethod {
    #[default]
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "HEAD")]
    Head,
}

impl MonitorMethod {
    /// Parse from the wire form; only GET/POST/HEAD are accepted.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "HEAD" => Some(Self::Head),
            _ => None,
        }
    }
}

/// Last known probe outcome for a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Success,
    Error,
    #[default]
    Pending,
}

/// A monitored endpoint and its probe settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub method: MonitorMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    pub interval_minutes: u32,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_check_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: MonitorStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Terminal outcome of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    Success,
    Error,
}

/// One probe outcome, appended after retries collapse into a terminal result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorHistory {
    pub id: String,
    pub monitor_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: HistoryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An authenticated admin session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub authenticated: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub ip_address: String,
    pub user_agent: String,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A single login attempt, kept for rate limiting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginAttempt {
    pub ip: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

/// Severity of a system log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    #[serde(rename = "DEBUG")]
    Debug,
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARN")]
    Warn,
    #[serde(rename = "ERROR")]
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARN" => Some(Self::Warn),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Operator-facing event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemLog {
    pub id: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse() {
        assert_eq!(MonitorMethod::parse("GET"), Some(MonitorMethod::Get));
        assert_eq!(MonitorMethod::parse("POST"), Some(MonitorMethod::Post));
        assert_eq!(MonitorMethod::parse("HEAD"), Some(MonitorMethod::Head));
        assert_eq!(MonitorMethod::parse("DELETE"), None);
        assert_eq!(MonitorMethod::parse("get"), None);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&MonitorStatus::Success).unwrap(),
            "\"success\""
        );
        assert_eq!(
            serde_json::to_string(&MonitorStatus::Pending).unwrap(),
            "\"pending\""
        );
        assert_eq!(
            serde_json::to_string(&HistoryStatus::Error).unwrap(),
            "\"error\""
        );
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!(LogLevel::parse("info"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("ERROR"), Some(LogLevel::Error));
        assert_eq!(LogLevel::parse("trace"), None);
    }

    #[test]
    fn test_history_roundtrip_revives_timestamp() {
        let record = MonitorHistory {
            id: "a".to_string(),
            monitor_id: "b".to_string(),
            timestamp: Utc::now(),
            status: HistoryStatus::Success,
            response_time_ms: Some(120),
            http_status: Some(200),
            error: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(!json.contains("\"error\""));
        let back: MonitorHistory = serde_json::from_str(&json).unwrap();
        assert_eq!(back.timestamp, record.timestamp);
        assert_eq!(back.http_status, Some(200));
    }
}
