//! HTTP request handlers.
//!
//! Every `/api` response uses the uniform envelope
//! `{success, data?, error?, code?, timestamp}`. Protected endpoints run
//! `require_auth` first; state-changing endpoints additionally pass the
//! same-origin guard.

use super::AppState;
use crate::auth::{
    clear_session_cookie, extract_client_ip, extract_session_token, session_cookie, LoginError,
};
use crate::cache::{ALL_MONITOR_CONFIGS, CONFIGS_TTL, HISTORY_TTL};
use crate::db::{
    LogLevel, MonitorConfig, MonitorHistory, MonitorMethod, MonitorStatus, Session,
};
use crate::error::ApiError;
use crate::stats::{MonitorStats, StatsPeriod};
use crate::syslog::LogQuery;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use chrono::Utc;
use reqwest::Url;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

const DASHBOARD_TEMPLATE: &str = include_str!("templates/dashboard.html");

/// Hard cap on the `limit` query of the history endpoint.
const MAX_HISTORY_LIMIT: usize = 1000;

// ============================================================================
// Envelope
// ============================================================================

fn envelope(status: StatusCode, data: serde_json::Value) -> Response {
    let body = json!({
        "success": true,
        "data": data,
        "timestamp": Utc::now().to_rfc3339(),
    });
    (
        status,
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        body.to_string(),
    )
        .into_response()
}

fn ok<T: serde::Serialize>(data: T) -> Response {
    envelope(
        StatusCode::OK,
        serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
    )
}

fn created<T: serde::Serialize>(data: T) -> Response {
    envelope(
        StatusCode::CREATED,
        serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
    )
}

/// Panic fallback for the catch-panic layer: a 5001 envelope, no internals.
pub fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("panic");
    tracing::error!("Handler panicked: {}", detail);
    ApiError::internal().into_response()
}

// ============================================================================
// Guards
// ============================================================================

/// Reject when neither Origin nor Referer carries the same host as Host.
fn check_same_origin(headers: &HeaderMap) -> Result<(), ApiError> {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if host.is_empty() {
        return Err(ApiError::validation("缺少 Host 请求头"));
    }

    for name in [header::ORIGIN, header::REFERER] {
        if let Some(value) = headers.get(&name) {
            if let Some(authority) = value
                .to_str()
                .ok()
                .and_then(|v| Url::parse(v).ok())
                .and_then(|url| {
                    url.host_str().map(|h| match url.port() {
                        Some(port) => format!("{h}:{port}"),
                        None => h.to_string(),
                    })
                })
            {
                if authority == host {
                    return Ok(());
                }
            }
        }
    }
    Err(ApiError::validation("跨站请求被拒绝"))
}

fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<Session, ApiError> {
    let token = extract_session_token(headers).ok_or_else(ApiError::authorization)?;
    state
        .auth
        .check(&token)
        .ok_or_else(ApiError::authorization)
}

/// A body that never arrived is an I/O failure (2002); a body that arrived
/// but does not parse is a validation failure (1001).
fn map_body_error(rejection: JsonRejection) -> ApiError {
    match rejection {
        JsonRejection::BytesRejection(e) => {
            tracing::error!("Handlers: failed to read request body: {}", e);
            ApiError::network("读取请求体失败")
        }
        _ => ApiError::validation("请求体格式错误"),
    }
}

fn validate_url(url: &str) -> Result<Url, ApiError> {
    let parsed = Url::parse(url).map_err(|_| ApiError::validation("URL 格式无效"))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ApiError::validation("URL 格式无效"));
    }
    Ok(parsed)
}

fn validated_interval(value: u32, min: u32, max: u32) -> Result<u32, ApiError> {
    if value < min || value > max {
        return Err(ApiError::validation(format!(
            "检查间隔必须在 {min}-{max} 分钟之间"
        )));
    }
    Ok(value)
}

/// Config list with the shared 2-minute cache in front of the store.
fn load_monitors(state: &AppState) -> Result<Vec<MonitorConfig>, ApiError> {
    if let Some(list) = state.cache.get::<Vec<MonitorConfig>>(ALL_MONITOR_CONFIGS) {
        return Ok(list);
    }
    let list = state.store.get_monitors().map_err(|e| {
        tracing::error!("Handlers: failed to load monitors: {}", e);
        ApiError::database()
    })?;
    state.cache.set(ALL_MONITOR_CONFIGS, &list, CONFIGS_TTL);
    Ok(list)
}

// ============================================================================
// Auth
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub password: String,
}

pub async fn handle_login(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<axum::Json<LoginRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    check_same_origin(&headers)?;
    let axum::Json(req) = body.map_err(map_body_error)?;

    let ip = extract_client_ip(&headers);
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    match state.auth.login(&req.password, &ip, user_agent) {
        Ok(session) => {
            state.logger.info(format!("管理员登录成功 (IP: {ip})"), None);
            let cookie = session_cookie(&session.id, state.auth.max_age_secs());
            let mut response = ok(json!({ "authenticated": true }));
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().insert(header::SET_COOKIE, value);
            }
            Ok(response)
        }
        Err(LoginError::RateLimited) => {
            state
                .logger
                .warn(format!("登录被限流 (IP: {ip})"), None);
            Err(ApiError::rate_limited("登录尝试次数过多,请稍后再试"))
        }
        Err(LoginError::InvalidPassword) => {
            state
                .logger
                .warn(format!("登录失败: 密码错误 (IP: {ip})"), None);
            Err(ApiError::authentication("密码错误"))
        }
        Err(LoginError::Database) => Err(ApiError::database()),
    }
}

pub async fn handle_logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    check_same_origin(&headers)?;
    if let Some(token) = extract_session_token(&headers) {
        state.auth.logout(&token);
    }
    let mut response = ok(json!({ "authenticated": false }));
    if let Ok(value) = HeaderValue::from_str(&clear_session_cookie()) {
        response.headers_mut().insert(header::SET_COOKIE, value);
    }
    Ok(response)
}

pub async fn handle_auth_check(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    let session = extract_session_token(&headers).and_then(|token| state.auth.check(&token));
    match session {
        Some(session) => ok(json!({ "authenticated": true, "session": session })),
        None => ok(json!({ "authenticated": false })),
    }
}

// ============================================================================
// Monitors
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateMonitorRequest {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub cookie: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub interval_minutes: Option<u32>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMonitorRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub cookie: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub interval_minutes: Option<u32>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

pub async fn handle_get_monitors(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    Ok(ok(load_monitors(&state)?))
}

pub async fn handle_create_monitor(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<axum::Json<CreateMonitorRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    check_same_origin(&headers)?;
    let axum::Json(req) = body.map_err(map_body_error)?;

    let name = req.name.trim().to_string();
    let url = req.url.trim().to_string();
    if name.is_empty() || url.is_empty() {
        return Err(ApiError::validation("缺少必填字段: name 或 url"));
    }
    validate_url(&url)?;

    let method = match req.method.as_deref() {
        None | Some("") => MonitorMethod::default(),
        Some(s) => MonitorMethod::parse(s)
            .ok_or_else(|| ApiError::validation(format!("不支持的请求方法: {s}")))?,
    };
    let interval = validated_interval(
        req.interval_minutes
            .unwrap_or(state.config.default_monitor_interval),
        state.config.min_monitor_interval,
        state.config.max_monitor_interval,
    )?;

    let now = Utc::now();
    let config = MonitorConfig {
        id: uuid::Uuid::new_v4().to_string(),
        name,
        url,
        method,
        cookie: req.cookie.filter(|c| !c.is_empty()),
        headers: req.headers.filter(|h| !h.is_empty()),
        interval_minutes: interval,
        enabled: req.enabled.unwrap_or(true),
        last_check_at: None,
        status: MonitorStatus::Pending,
        last_error: None,
        created_at: now,
        updated_at: now,
    };

    if !state.store.save_monitor(&config) {
        return Err(ApiError::database());
    }
    state.cache.clear_by_prefix(ALL_MONITOR_CONFIGS);
    state
        .logger
        .info("创建监控项", Some((&config.id, &config.name)));
    Ok(created(config))
}

pub async fn handle_update_monitor(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Result<axum::Json<UpdateMonitorRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    check_same_origin(&headers)?;
    let axum::Json(req) = body.map_err(map_body_error)?;

    let mut config = state
        .store
        .get_monitor(&id)
        .ok_or_else(|| ApiError::not_found("监控项不存在"))?;

    if let Some(name) = req.name {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(ApiError::validation("缺少必填字段: name 或 url"));
        }
        config.name = name;
    }
    if let Some(url) = req.url {
        let url = url.trim().to_string();
        validate_url(&url)?;
        config.url = url;
    }
    if let Some(method) = req.method {
        config.method = MonitorMethod::parse(&method)
            .ok_or_else(|| ApiError::validation(format!("不支持的请求方法: {method}")))?;
    }
    if let Some(cookie) = req.cookie {
        config.cookie = if cookie.is_empty() { None } else { Some(cookie) };
    }
    if let Some(headers_map) = req.headers {
        config.headers = if headers_map.is_empty() {
            None
        } else {
            Some(headers_map)
        };
    }
    if let Some(interval) = req.interval_minutes {
        config.interval_minutes = validated_interval(
            interval,
            state.config.min_monitor_interval,
            state.config.max_monitor_interval,
        )?;
    }
    if let Some(enabled) = req.enabled {
        config.enabled = enabled;
    }
    config.updated_at = Utc::now();

    if !state.store.save_monitor(&config) {
        return Err(ApiError::database());
    }
    state.cache.clear_by_prefix(ALL_MONITOR_CONFIGS);
    state
        .logger
        .info("更新监控项", Some((&config.id, &config.name)));
    Ok(ok(config))
}

pub async fn handle_delete_monitor(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    check_same_origin(&headers)?;

    let config = state
        .store
        .get_monitor(&id)
        .ok_or_else(|| ApiError::not_found("监控项不存在"))?;

    if !state.store.delete_monitor(&id) {
        return Err(ApiError::database());
    }
    state.cache.clear_by_prefix(ALL_MONITOR_CONFIGS);
    // Cached pages for a deleted monitor must not outlive it.
    state.cache.clear_by_prefix(&format!("monitor_history_{id}"));
    state.cache.clear_by_prefix(&format!("monitor_stats_{id}"));
    state
        .logger
        .info("删除监控项及其历史记录", Some((&id, &config.name)));
    Ok(ok(json!({ "deleted": true })))
}

pub async fn handle_monitors_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    let monitors = load_monitors(&state)?;
    let status: Vec<serde_json::Value> = monitors
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "name": m.name,
                "enabled": m.enabled,
                "status": m.status,
                "last_check": m.last_check_at,
                "last_error": m.last_error,
            })
        })
        .collect();
    Ok(ok(status))
}

// ============================================================================
// History & stats
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn handle_monitor_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    let limit = query.limit.unwrap_or(50).clamp(1, MAX_HISTORY_LIMIT);

    let cache_key = format!("monitor_history_{id}_{limit}");
    if let Some(records) = state.cache.get::<Vec<MonitorHistory>>(&cache_key) {
        return Ok(ok(records));
    }

    let records = state.store.get_history(&id, limit).map_err(|e| {
        tracing::error!("Handlers: failed to load history for {}: {}", id, e);
        ApiError::database()
    })?;
    state.cache.set(&cache_key, &records, HISTORY_TTL);
    Ok(ok(records))
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    #[serde(default)]
    pub period: Option<String>,
}

fn parse_period(query: &StatsQuery) -> Result<StatsPeriod, ApiError> {
    match query.period.as_deref() {
        None | Some("") => Ok(StatsPeriod::Day),
        Some(s) => StatsPeriod::parse(s)
            .ok_or_else(|| ApiError::validation(format!("无效的统计周期: {s}"))),
    }
}

pub async fn handle_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StatsQuery>,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    let period = parse_period(&query)?;

    let monitors = load_monitors(&state)?;
    let mut all: Vec<MonitorStats> = Vec::with_capacity(monitors.len());
    for monitor in &monitors {
        let stats = state
            .stats
            .monitor_stats(&monitor.id, &monitor.name, period)
            .map_err(|e| {
                tracing::error!("Handlers: stats failed for {}: {}", monitor.id, e);
                ApiError::database()
            })?;
        all.push(stats);
    }
    Ok(ok(all))
}

pub async fn handle_stats_overview(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    let monitors = load_monitors(&state)?;

    let total = monitors.len();
    let enabled = monitors.iter().filter(|m| m.enabled).count();
    let success = monitors
        .iter()
        .filter(|m| m.status == MonitorStatus::Success)
        .count();
    let error = monitors
        .iter()
        .filter(|m| m.status == MonitorStatus::Error)
        .count();
    let pending = monitors
        .iter()
        .filter(|m| m.status == MonitorStatus::Pending)
        .count();

    Ok(ok(json!({
        "total": total,
        "enabled": enabled,
        "success": success,
        "error": error,
        "pending": pending,
    })))
}

pub async fn handle_monitor_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Query(query): Query<StatsQuery>,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    let period = parse_period(&query)?;

    let monitor = state
        .store
        .get_monitor(&id)
        .ok_or_else(|| ApiError::not_found("监控项不存在"))?;

    let stats = state
        .stats
        .monitor_stats(&monitor.id, &monitor.name, period)
        .map_err(|e| {
            tracing::error!("Handlers: stats failed for {}: {}", monitor.id, e);
            ApiError::database()
        })?;
    Ok(ok(stats))
}

// ============================================================================
// System
// ============================================================================

pub async fn handle_system_info(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    let monitors = load_monitors(&state)?;
    let enabled = monitors.iter().filter(|m| m.enabled).count();

    Ok(ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "totalMonitors": monitors.len(),
        "enabledMonitors": enabled,
        "uptime_ms": (Utc::now() - state.started_at).num_milliseconds(),
        "scheduler": state.scheduler.status(),
    })))
}

pub async fn handle_system_health(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    let database = state.store.ping();
    let scheduler = state.scheduler.status();
    let status = if database && scheduler.is_running {
        "ok"
    } else {
        "degraded"
    };

    Ok(ok(json!({
        "status": status,
        "services": {
            "database": database,
            "scheduler": scheduler.is_running,
            "cache": true,
        },
        "scheduler": scheduler,
    })))
}

pub async fn handle_system_cache(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    let stats = state.cache.stats();
    Ok(ok(json!({
        "cacheSize": state.cache.len(),
        "cacheKeys": state.cache.keys(),
        "hits": stats.hits,
        "misses": stats.misses,
    })))
}

pub async fn handle_cache_clear(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    check_same_origin(&headers)?;
    state.cache.clear();
    state.logger.info("缓存已手动清空", None);
    Ok(ok(json!({ "cleared": true })))
}

pub async fn handle_system_scheduler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;
    Ok(ok(state.scheduler.status()))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub monitor_id: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub offset: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn handle_system_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    require_auth(&state, &headers)?;

    let level = match query.level.as_deref() {
        None | Some("") => None,
        Some(s) => Some(
            LogLevel::parse(s).ok_or_else(|| ApiError::validation(format!("无效的日志级别: {s}")))?,
        ),
    };
    let log_query = LogQuery {
        level,
        monitor_id: query.monitor_id.filter(|m| !m.is_empty()),
        search: query.search.filter(|s| !s.is_empty()),
        offset: query.offset.unwrap_or(0),
        limit: query.limit.unwrap_or(50),
    };

    let page = state.logger.list(&log_query).map_err(|e| {
        tracing::error!("Handlers: failed to query system logs: {}", e);
        ApiError::database()
    })?;
    Ok(ok(json!({
        "logs": page.entries,
        "total": page.matched_count,
        "offset": log_query.offset,
        "limit": log_query.limit,
    })))
}

// ============================================================================
// Dashboard
// ============================================================================

pub async fn handle_dashboard() -> impl IntoResponse {
    Html(DASHBOARD_TEMPLATE)
}
