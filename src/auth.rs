//! Session and authentication layer.
//!
//! A single shared admin credential, rate-limited login attempts per client
//! IP, and opaque session tokens persisted in the store. Failed logins keep
//! counting against the lockout window even after a successful login.

use axum::http::HeaderMap;
use chrono::{Duration as ChronoDuration, Utc};
use constant_time_eq::constant_time_eq;
use uuid::Uuid;

use crate::db::{LoginAttempt, Session, Store};

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "session";

/// Why a login was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginError {
    /// Too many failed attempts from this IP within the lockout window.
    RateLimited,
    /// Wrong password.
    InvalidPassword,
    /// The session could not be persisted.
    Database,
}

/// Authentication service over the shared store.
#[derive(Clone)]
pub struct AuthService {
    store: Store,
    admin_password: String,
    session_expire_hours: i64,
    lockout_minutes: i64,
    max_attempts: usize,
}

impl AuthService {
    pub fn new(
        store: Store,
        admin_password: String,
        session_expire_hours: i64,
        lockout_minutes: i64,
        max_attempts: usize,
    ) -> Self {
        Self {
            store,
            admin_password,
            session_expire_hours,
            lockout_minutes,
            max_attempts,
        }
    }

    /// Attempt a login. Every call records an attempt, including lockout
    /// rejections, so hammering a locked account extends nothing in its
    /// favor.
    pub fn login(
        &self,
        password: &str,
        ip: &str,
        user_agent: &str,
    ) -> Result<Session, LoginError> {
        let now = Utc::now();
        let since = now - ChronoDuration::minutes(self.lockout_minutes);
        let failures = match self.store.count_login_failures(ip, since) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("Auth: failed to count login attempts: {}", e);
                0
            }
        };

        if failures >= self.max_attempts {
            self.record_attempt(ip, now, false);
            tracing::warn!("Auth: login from {} locked out ({} failures)", ip, failures);
            return Err(LoginError::RateLimited);
        }

        if !constant_time_eq(password.as_bytes(), self.admin_password.as_bytes()) {
            self.record_attempt(ip, now, false);
            return Err(LoginError::InvalidPassword);
        }

        self.record_attempt(ip, now, true);
        let session = Session {
            id: Uuid::new_v4().to_string(),
            authenticated: true,
            created_at: now,
            expires_at: now + ChronoDuration::hours(self.session_expire_hours),
            last_access_at: now,
            ip_address: ip.to_string(),
            user_agent: user_agent.to_string(),
        };
        if !self.store.save_session(&session) {
            return Err(LoginError::Database);
        }
        tracing::info!("Auth: login from {}", ip);
        Ok(session)
    }

    /// Look up a session by token. Expired sessions are deleted on sight and
    /// never returned; a live session gets its `last_access_at` touched.
    pub fn check(&self, token: &str) -> Option<Session> {
        let mut session = self.store.get_session(token)?;
        let now = Utc::now();
        if session.is_expired(now) {
            self.store.delete_session(token);
            return None;
        }
        session.last_access_at = now;
        self.store.save_session(&session);
        Some(session)
    }

    /// Delete the session; deleting an unknown token is a no-op.
    pub fn logout(&self, token: &str) {
        self.store.delete_session(token);
    }

    /// Session lifetime in seconds, for the cookie Max-Age.
    pub fn max_age_secs(&self) -> i64 {
        self.session_expire_hours * 3600
    }

    fn record_attempt(&self, ip: &str, timestamp: chrono::DateTime<Utc>, success: bool) {
        self.store.record_login_attempt(&LoginAttempt {
            ip: ip.to_string(),
            timestamp,
            success,
        });
    }
}

/// Client IP from proxy headers: first `X-Forwarded-For` entry, then
/// `X-Real-IP`, then `CF-Connecting-IP`, else "unknown".
pub fn extract_client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(first) = forwarded_str.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
    }
    for name in ["x-real-ip", "cf-connecting-ip"] {
        if let Some(value) = headers.get(name) {
            if let Ok(s) = value.to_str() {
                let s = s.trim();
                if !s.is_empty() {
                    return s.to_string();
                }
            }
        }
    }
    "unknown".to_string()
}

/// Pull the session token out of the `Cookie` header.
pub fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    for pair in cookies.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        if parts.next() == Some(SESSION_COOKIE) {
            let value = parts.next()?.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Set-Cookie value for a fresh session.
pub fn session_cookie(token: &str, max_age_secs: i64) -> String {
    format!(
        "{SESSION_COOKIE}={token}; HttpOnly; Secure; SameSite=Strict; Max-Age={max_age_secs}; Path=/"
    )
}

/// Set-Cookie value that clears the session cookie.
pub fn clear_session_cookie() -> String {
    format!("{SESSION_COOKIE}=; HttpOnly; Secure; SameSite=Strict; Max-Age=0; Path=/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use tempfile::NamedTempFile;

    fn test_auth() -> (NamedTempFile, AuthService) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let auth = AuthService::new(store, "admin123".to_string(), 24, 15, 5);
        (tmp, auth)
    }

    #[test]
    fn test_login_success_and_check() {
        let (_tmp, auth) = test_auth();
        let session = auth.login("admin123", "1.2.3.4", "test-agent").unwrap();
        assert!(session.authenticated);
        assert_eq!(session.ip_address, "1.2.3.4");
        assert_eq!(session.expires_at, session.created_at + ChronoDuration::hours(24));

        let checked = auth.check(&session.id).unwrap();
        assert_eq!(checked.id, session.id);
        assert!(checked.last_access_at >= session.last_access_at);
    }

    #[test]
    fn test_wrong_password_rejected() {
        let (_tmp, auth) = test_auth();
        assert_eq!(
            auth.login("nope", "1.2.3.4", "t"),
            Err(LoginError::InvalidPassword)
        );
    }

    #[test]
    fn test_lockout_after_max_failures() {
        let (_tmp, auth) = test_auth();
        for _ in 0..5 {
            assert_eq!(
                auth.login("wrong", "1.2.3.4", "t"),
                Err(LoginError::InvalidPassword)
            );
        }
        // The 6th attempt is locked out even with the correct password.
        assert_eq!(
            auth.login("admin123", "1.2.3.4", "t"),
            Err(LoginError::RateLimited)
        );
        // Other IPs are unaffected.
        assert!(auth.login("admin123", "5.6.7.8", "t").is_ok());
    }

    #[test]
    fn test_success_does_not_reset_failure_count() {
        let (_tmp, auth) = test_auth();
        for _ in 0..4 {
            let _ = auth.login("wrong", "1.2.3.4", "t");
        }
        assert!(auth.login("admin123", "1.2.3.4", "t").is_ok());
        // The 4 failures still count; one more reaches the threshold.
        let _ = auth.login("wrong", "1.2.3.4", "t");
        assert_eq!(
            auth.login("admin123", "1.2.3.4", "t"),
            Err(LoginError::RateLimited)
        );
    }

    #[test]
    fn test_expired_session_is_deleted_on_check() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::open(tmp.path()).unwrap();
        let auth = AuthService::new(store.clone(), "admin123".to_string(), 24, 15, 5);

        let now = Utc::now();
        let expired = Session {
            id: "tok".to_string(),
            authenticated: true,
            created_at: now - ChronoDuration::hours(48),
            expires_at: now - ChronoDuration::hours(24),
            last_access_at: now - ChronoDuration::hours(24),
            ip_address: "1.2.3.4".to_string(),
            user_agent: "t".to_string(),
        };
        store.save_session(&expired);

        assert!(auth.check("tok").is_none());
        assert!(store.get_session("tok").is_none());
    }

    #[test]
    fn test_extract_client_ip_precedence() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_client_ip(&headers), "unknown");

        headers.insert("cf-connecting-ip", HeaderValue::from_static("3.3.3.3"));
        assert_eq!(extract_client_ip(&headers), "3.3.3.3");

        headers.insert("x-real-ip", HeaderValue::from_static("2.2.2.2"));
        assert_eq!(extract_client_ip(&headers), "2.2.2.2");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("1.1.1.1, 9.9.9.9"),
        );
        assert_eq!(extract_client_ip(&headers), "1.1.1.1");
    }

    #[test]
    fn test_session_cookie_roundtrip() {
        let cookie = session_cookie("abc123", 86_400);
        assert_eq!(
            cookie,
            "session=abc123; HttpOnly; Secure; SameSite=Strict; Max-Age=86400; Path=/"
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("theme=dark; session=abc123; other=1"),
        );
        assert_eq!(extract_session_token(&headers), Some("abc123".to_string()));

        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("theme=dark"),
        );
        assert_eq!(extract_session_token(&headers), None);
    }
}
