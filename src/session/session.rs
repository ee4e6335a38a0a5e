//! Reputation-tracked crawl identity.
//!
//! A session bundles the state that makes repeated requests look like one
//! persistent client: a cookie jar keyed by origin and an optional proxy
//! binding, plus the usage and error counters that decide when the
//! identity has worn out.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SessionPoolConfig;
use crate::utils::url_origin;

/// One cookie, as the browser backend hands them over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
}

/// A rotating crawl identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub usage_count: u64,
    pub error_score: f64,
    pub max_error_score: f64,
    pub error_score_decrement: f64,
    pub max_usage_count: u64,
    /// Cookie jar keyed by URL origin
    pub cookies: HashMap<String, Vec<Cookie>>,
    /// Proxy this identity is bound to, passed through to the browser
    /// backend untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Explicitly retired by an operator or the reputation counters
    #[serde(default)]
    pub retired: bool,
}

impl Session {
    /// Fresh session with thresholds taken from the pool configuration.
    #[must_use]
    pub fn new(config: &SessionPoolConfig) -> Self {
        let now = Utc::now();
        let max_age =
            ChronoDuration::from_std(config.max_age).unwrap_or_else(|_| ChronoDuration::hours(1));
        Self {
            id: format!("session_{}", Uuid::new_v4().simple()),
            usage_count: 0,
            error_score: 0.0,
            max_error_score: config.max_error_score,
            error_score_decrement: config.error_score_decrement,
            max_usage_count: config.max_usage_count,
            cookies: HashMap::new(),
            proxy_url: None,
            created_at: now,
            expires_at: now + max_age,
            retired: false,
        }
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// A session is usable iff its error score and usage count are under
    /// their thresholds, it has not expired, and it was not retired.
    #[must_use]
    pub fn is_usable(&self) -> bool {
        !self.retired
            && self.error_score < self.max_error_score
            && self.usage_count < self.max_usage_count
            && !self.is_expired()
    }

    /// Record a successful use: usage goes up, error score decays.
    pub fn mark_good(&mut self) {
        self.usage_count += 1;
        self.error_score = (self.error_score - self.error_score_decrement).max(0.0);
    }

    /// Record a failed use: usage and error score go up.
    pub fn mark_bad(&mut self) {
        self.usage_count += 1;
        self.error_score += 1.0;
    }

    /// Take the session out of rotation regardless of its counters.
    pub fn retire(&mut self) {
        self.retired = true;
    }

    /// Store cookies under the origin of `url`.
    pub fn set_cookies(&mut self, url: &str, cookies: Vec<Cookie>) -> anyhow::Result<()> {
        let origin = url_origin(url)?;
        self.cookies.insert(origin, cookies);
        Ok(())
    }

    /// Cookies previously stored for the origin of `url`.
    pub fn cookies_for(&self, url: &str) -> anyhow::Result<&[Cookie]> {
        let origin = url_origin(url)?;
        Ok(self
            .cookies
            .get(&origin)
            .map_or(&[] as &[Cookie], Vec::as_slice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(&SessionPoolConfig::default())
    }

    #[test]
    fn fresh_session_is_usable() {
        assert!(session().is_usable());
    }

    #[test]
    fn error_score_threshold_retires() {
        let mut s = session();
        for _ in 0..3 {
            s.mark_bad();
        }
        assert!(s.error_score >= s.max_error_score);
        assert!(!s.is_usable());
    }

    #[test]
    fn mark_good_decays_error_score() {
        let mut s = session();
        s.mark_bad();
        s.mark_bad();
        assert!((s.error_score - 2.0).abs() < f64::EPSILON);
        s.mark_good();
        assert!((s.error_score - 1.0).abs() < f64::EPSILON);
        assert!(s.is_usable());
        // Never decays below zero
        s.mark_good();
        s.mark_good();
        assert_eq!(s.error_score, 0.0);
    }

    #[test]
    fn usage_budget_exhausts() {
        let mut s = session();
        s.max_usage_count = 2;
        s.mark_good();
        assert!(s.is_usable());
        s.mark_good();
        assert!(!s.is_usable());
    }

    #[test]
    fn explicit_retirement_wins() {
        let mut s = session();
        s.retire();
        assert!(!s.is_usable());
    }

    #[test]
    fn cookie_jar_is_scoped_by_origin() {
        let mut s = session();
        s.set_cookies(
            "https://a.test/login",
            vec![Cookie {
                name: "sid".into(),
                value: "1".into(),
            }],
        )
        .unwrap();

        assert_eq!(s.cookies_for("https://a.test/other/page").unwrap().len(), 1);
        assert!(s.cookies_for("https://b.test/").unwrap().is_empty());
    }
}
