//! HTTP probe implementation.
//!
//! Executes one probe per call and collapses retries into a single terminal
//! outcome: exactly one history record is appended per invocation.

use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{redirect, Method, StatusCode, Url};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::ProbeError;
use crate::db::{HistoryStatus, MonitorConfig, MonitorHistory, MonitorMethod, Store};
use crate::syslog::SystemLogger;

/// Network errors are retried this many times with linear backoff.
/// Timeouts are cancellation-shaped and never retried.
const MAX_RETRIES: u32 = 2;

/// One-shot probe executor shared by the scheduler.
#[derive(Clone)]
pub struct ProbeExecutor {
    client: reqwest::Client,
    store: Store,
    logger: SystemLogger,
    timeout: Duration,
}

impl ProbeExecutor {
    pub fn new(store: Store, logger: SystemLogger, timeout_ms: u64) -> Self {
        let timeout = Duration::from_millis(timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::limited(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            store,
            logger,
            timeout,
        }
    }

    /// Probe one monitor and record the terminal outcome to history.
    pub async fn execute(&self, config: &MonitorConfig) -> MonitorHistory {
        self.logger
            .info("开始检查", Some((&config.id, &config.name)));

        let outcome = self.run(config).await;
        let record = MonitorHistory {
            id: Uuid::new_v4().to_string(),
            monitor_id: config.id.clone(),
            timestamp: Utc::now(),
            status: outcome.status,
            response_time_ms: outcome.response_time_ms,
            http_status: outcome.http_status,
            error: outcome.error,
        };
        self.store.append_history(&record);

        match record.status {
            HistoryStatus::Success => {
                self.logger.log(
                    crate::db::LogLevel::Info,
                    format!(
                        "检查成功 ({} ms)",
                        record.response_time_ms.unwrap_or_default()
                    ),
                    Some((&config.id, &config.name)),
                    Some(serde_json::json!({
                        "http_status": record.http_status,
                        "response_time_ms": record.response_time_ms,
                    })),
                );
            }
            HistoryStatus::Error => {
                self.logger.error(
                    format!(
                        "检查失败: {}",
                        record.error.as_deref().unwrap_or("未知错误")
                    ),
                    Some((&config.id, &config.name)),
                );
            }
        }

        record
    }

    async fn run(&self, config: &MonitorConfig) -> Outcome {
        let url = match Url::parse(&config.url) {
            Ok(u) => u,
            Err(e) => {
                return Outcome::failure(format!("URL 无效: {e}"), None, None);
            }
        };

        let mut attempt = 0;
        loop {
            let start = Instant::now();
            let result = self.dispatch(config, &url).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;

            match result {
                Ok((status, final_url, body_len)) => {
                    return classify(&url, status, &final_url, body_len, elapsed_ms);
                }
                Err(ProbeError::Timeout) => {
                    // Cancellation-shaped: no retry.
                    return Outcome::failure(
                        format!("请求超时或被取消 (>{} ms)", self.timeout.as_millis()),
                        Some(elapsed_ms),
                        None,
                    );
                }
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        attempt += 1;
                        tracing::debug!(
                            "Probe: retry {}/{} for {} after: {}",
                            attempt,
                            MAX_RETRIES,
                            config.name,
                            e
                        );
                        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                        continue;
                    }
                    return Outcome::failure(e.to_string(), None, None);
                }
            }
        }
    }

    /// Send one request and read the body. Returns the final status, the
    /// post-redirect URL and the body length.
    async fn dispatch(
        &self,
        config: &MonitorConfig,
        url: &Url,
    ) -> Result<(StatusCode, Url, usize), ProbeError> {
        let method = match config.method {
            MonitorMethod::Get => Method::GET,
            MonitorMethod::Post => Method::POST,
            MonitorMethod::Head => Method::HEAD,
        };

        let response = self
            .client
            .request(method, url.clone())
            .headers(build_headers(config, url))
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        let final_url = response.url().clone();
        let body = response.bytes().await.map_err(map_send_error)?;

        Ok((status, final_url, body.len()))
    }
}

struct Outcome {
    status: HistoryStatus,
    response_time_ms: Option<u64>,
    http_status: Option<u16>,
    error: Option<String>,
}

impl Outcome {
    fn success(elapsed_ms: u64, http_status: u16) -> Self {
        Self {
            status: HistoryStatus::Success,
            response_time_ms: Some(elapsed_ms),
            http_status: Some(http_status),
            error: None,
        }
    }

    fn failure(error: String, elapsed_ms: Option<u64>, http_status: Option<u16>) -> Self {
        Self {
            status: HistoryStatus::Error,
            response_time_ms: elapsed_ms,
            http_status,
            error: Some(error),
        }
    }
}

fn map_send_error(e: reqwest::Error) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout
    } else {
        ProbeError::Network(e.to_string())
    }
}

fn classify(
    target_url: &Url,
    status: StatusCode,
    final_url: &Url,
    body_len: usize,
    elapsed_ms: u64,
) -> Outcome {
    if status.is_success() || status.is_redirection() {
        if check_response_success(target_url, final_url, body_len) {
            Outcome::success(elapsed_ms, status.as_u16())
        } else {
            Outcome::failure(
                "响应不符合预期".to_string(),
                Some(elapsed_ms),
                Some(status.as_u16()),
            )
        }
    } else {
        Outcome::failure(
            format!(
                "HTTP {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            ),
            Some(elapsed_ms),
            Some(status.as_u16()),
        )
    }
}

/// A 2xx/3xx response counts as up when the body is non-empty, and for
/// cloudstudio.net targets the redirect chain must also land on a
/// cloudstudio host.
fn check_response_success(target_url: &Url, final_url: &Url, body_len: usize) -> bool {
    if body_len == 0 {
        return false;
    }
    let target_host = target_url.host_str().unwrap_or_default();
    if target_host.contains("cloudstudio.net") {
        let final_host = final_url.host_str().unwrap_or_default();
        return final_host.contains("cloudstudio.net") || final_host.contains("cloudstudio.club");
    }
    true
}

/// Browser-like default header set, overridden by per-monitor headers.
fn build_headers(config: &MonitorConfig, url: &Url) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::USER_AGENT,
        HeaderValue::from_static(
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
             (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        ),
    );
    headers.insert(
        reqwest::header::ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(
        reqwest::header::ACCEPT_LANGUAGE,
        HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
    );
    headers.insert(
        reqwest::header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache"),
    );

    if let Some(extra) = &config.headers {
        for (name, value) in extra {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
    }

    if let Some(cookie) = &config.cookie {
        if !cookie.is_empty() {
            if let Ok(value) = HeaderValue::from_str(cookie) {
                headers.insert(reqwest::header::COOKIE, value);
            }
        }
    }

    if let Some(host) = url.host_str() {
        let origin = format!("{}://{}", url.scheme(), host);
        if let Ok(value) = HeaderValue::from_str(&origin) {
            headers.insert(reqwest::header::ORIGIN, value.clone());
            headers.insert(reqwest::header::REFERER, value);
        }
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::db::MonitorStatus;
    use tempfile::NamedTempFile;

    fn sample_config(url: &str) -> MonitorConfig {
        let now = Utc::now();
        MonitorConfig {
            id: "m1".to_string(),
            name: "Test".to_string(),
            url: url.to_string(),
            method: MonitorMethod::Get,
            cookie: Some("sid=abc".to_string()),
            headers: Some(
                [("X-Custom".to_string(), "yes".to_string())]
                    .into_iter()
                    .collect(),
            ),
            interval_minutes: 1,
            enabled: true,
            last_check_at: None,
            status: MonitorStatus::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_classify_http_error() {
        let url = Url::parse("https://example.test/403").unwrap();
        let outcome = classify(&url, StatusCode::FORBIDDEN, &url, 10, 80);
        assert_eq!(outcome.status, HistoryStatus::Error);
        assert_eq!(outcome.http_status, Some(403));
        assert_eq!(outcome.error.as_deref(), Some("HTTP 403: Forbidden"));
        assert_eq!(outcome.response_time_ms, Some(80));
    }

    #[test]
    fn test_classify_success_requires_body() {
        let url = Url::parse("https://example.test/ok").unwrap();
        let ok = classify(&url, StatusCode::OK, &url, 2, 120);
        assert_eq!(ok.status, HistoryStatus::Success);
        assert_eq!(ok.http_status, Some(200));
        assert!(ok.error.is_none());

        let empty = classify(&url, StatusCode::OK, &url, 0, 120);
        assert_eq!(empty.status, HistoryStatus::Error);
        assert_eq!(empty.error.as_deref(), Some("响应不符合预期"));
    }

    #[test]
    fn test_cloudstudio_affinity() {
        let target = Url::parse("https://app.cloudstudio.net/x").unwrap();
        let same = Url::parse("https://app.cloudstudio.net/x").unwrap();
        let club = Url::parse("https://edge.cloudstudio.club/x").unwrap();
        let elsewhere = Url::parse("https://login.example.com/").unwrap();

        assert!(check_response_success(&target, &same, 10));
        assert!(check_response_success(&target, &club, 10));
        assert!(!check_response_success(&target, &elsewhere, 10));

        // Non-cloudstudio targets may redirect anywhere.
        let normal = Url::parse("https://example.test/").unwrap();
        assert!(check_response_success(&normal, &elsewhere, 10));
    }

    #[test]
    fn test_build_headers_merges_and_wires_origin() {
        let config = sample_config("https://example.test/ok");
        let url = Url::parse(&config.url).unwrap();
        let headers = build_headers(&config, &url);

        assert_eq!(headers.get("x-custom").unwrap(), "yes");
        assert_eq!(headers.get(reqwest::header::COOKIE).unwrap(), "sid=abc");
        assert_eq!(
            headers.get(reqwest::header::ORIGIN).unwrap(),
            "https://example.test"
        );
        assert_eq!(
            headers.get(reqwest::header::REFERER).unwrap(),
            "https://example.test"
        );
        assert!(headers.get(reqwest::header::USER_AGENT).is_some());
    }

    #[test]
    fn test_config_headers_override_defaults() {
        let mut config = sample_config("https://example.test/ok");
        config.headers = Some(
            [("User-Agent".to_string(), "custom-agent".to_string())]
                .into_iter()
                .collect(),
        );
        let url = Url::parse(&config.url).unwrap();
        let headers = build_headers(&config, &url);
        assert_eq!(headers.get(reqwest::header::USER_AGENT).unwrap(), "custom-agent");
    }

    #[tokio::test]
    async fn test_invalid_url_yields_immediate_error() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let logger = SystemLogger::new(store.clone(), Cache::new());
        let executor = ProbeExecutor::new(store.clone(), logger, 1000);

        let config = sample_config("not a url");
        let record = executor.execute(&config).await;

        assert_eq!(record.status, HistoryStatus::Error);
        assert!(record.error.unwrap().starts_with("URL 无效"));
        assert!(record.http_status.is_none());
        // The terminal outcome must already be in history.
        assert_eq!(store.get_history("m1", 10).unwrap().len(), 1);
    }
}
