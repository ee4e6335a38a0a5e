//! Work-item model for the crawl frontier.
//!
//! A [`Request`] represents one URL to process. Its identifier is derived
//! from a unique key (normalized URL + method + payload unless the caller
//! overrides it); identifier equality is what the frontier deduplicates on.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_128;

use crate::utils::constants::MAX_ERROR_MESSAGES_PER_REQUEST;
use crate::utils::normalize_url;

/// HTTP method carried by a request.
///
/// The engine never issues these itself; the method participates in the
/// unique key so that e.g. a GET and a POST to the same URL are distinct
/// frontier entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }
}

/// One unit of crawl work: a URL plus bookkeeping for retries and errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Stable identifier: hex xxh3 of the unique key
    pub id: String,
    /// Deduplication key; defaults to `method:normalized_url[:payload-hash]`
    pub unique_key: String,
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    /// Header map with deterministic iteration order (participates in
    /// serialized state, so ordering must be stable across runs)
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    /// Arbitrary caller metadata, carried through the frontier untouched
    #[serde(default)]
    pub user_data: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub error_messages: Vec<String>,
    /// When set, a failed request goes straight to the failure handler
    #[serde(default)]
    pub no_retry: bool,
    /// Final URL after redirects, set by the user handler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loaded_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handled_at: Option<DateTime<Utc>>,
}

impl Request {
    /// Build a GET request for `url` with the default unique key.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        RequestBuilder::new(url).build()
    }

    /// Start building a request with non-default method, payload or key.
    #[must_use]
    pub fn builder(url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(url)
    }

    /// Record a failure message, bounded by the per-request cap.
    ///
    /// Messages keep their order of occurrence. Once the cap is reached the
    /// newest slot is overwritten with a truncation marker rather than
    /// growing without bound.
    pub fn push_error_message(&mut self, message: impl Into<String>) {
        if self.error_messages.len() < MAX_ERROR_MESSAGES_PER_REQUEST {
            self.error_messages.push(message.into());
        } else if let Some(last) = self.error_messages.last_mut() {
            *last = format!(
                "(further errors truncated after {MAX_ERROR_MESSAGES_PER_REQUEST} messages)"
            );
        }
    }

    /// Most recent recorded error, if any.
    #[must_use]
    pub fn last_error_message(&self) -> Option<&str> {
        self.error_messages.last().map(String::as_str)
    }
}

/// Builder for [`Request`]; computes the identifier at `build()` time.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    url: String,
    method: HttpMethod,
    headers: BTreeMap<String, String>,
    payload: Option<Vec<u8>>,
    user_data: serde_json::Map<String, serde_json::Value>,
    unique_key: Option<String>,
    no_retry: bool,
}

impl RequestBuilder {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Get,
            headers: BTreeMap::new(),
            payload: None,
            user_data: serde_json::Map::new(),
            unique_key: None,
            no_retry: false,
        }
    }

    #[must_use]
    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn user_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.user_data.insert(key.into(), value);
        self
    }

    /// Override the deduplication key entirely.
    ///
    /// Callers use this to force two URLs to collapse into one frontier
    /// entry, or to keep otherwise-identical URLs distinct.
    #[must_use]
    pub fn unique_key(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn no_retry(mut self, no_retry: bool) -> Self {
        self.no_retry = no_retry;
        self
    }

    pub fn build(self) -> Result<Request> {
        let unique_key = match self.unique_key {
            Some(key) => key,
            None => compute_unique_key(&self.url, self.method, self.payload.as_deref())?,
        };
        let id = request_id(&unique_key);

        Ok(Request {
            id,
            unique_key,
            url: self.url,
            method: self.method,
            headers: self.headers,
            payload: self.payload,
            user_data: self.user_data,
            retry_count: 0,
            error_messages: Vec::new(),
            no_retry: self.no_retry,
            loaded_url: None,
            handled_at: None,
        })
    }
}

/// Default unique key: `METHOD:normalized_url`, with a payload hash suffix
/// for methods that carry a body.
pub fn compute_unique_key(url: &str, method: HttpMethod, payload: Option<&[u8]>) -> Result<String> {
    let normalized = normalize_url(url)?;
    match payload {
        Some(body) if !body.is_empty() => {
            let digest = xxh3_128(body);
            Ok(format!(
                "{}:{}:{}",
                method.as_str(),
                normalized,
                hex::encode(digest.to_be_bytes())
            ))
        }
        _ => Ok(format!("{}:{}", method.as_str(), normalized)),
    }
}

/// Stable identifier for a unique key: hex-encoded 128-bit xxh3.
#[must_use]
pub fn request_id(unique_key: &str) -> String {
    hex::encode(xxh3_128(unique_key.as_bytes()).to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_url_same_id() {
        let a = Request::new("https://example.com/path?b=2&a=1").unwrap();
        let b = Request::new("https://EXAMPLE.com/path?a=1&b=2#frag").unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn method_distinguishes_requests() {
        let get = Request::new("https://example.com/api").unwrap();
        let post = Request::builder("https://example.com/api")
            .method(HttpMethod::Post)
            .build()
            .unwrap();
        assert_ne!(get.id, post.id);
    }

    #[test]
    fn payload_distinguishes_requests() {
        let a = Request::builder("https://example.com/api")
            .method(HttpMethod::Post)
            .payload(b"x=1".to_vec())
            .build()
            .unwrap();
        let b = Request::builder("https://example.com/api")
            .method(HttpMethod::Post)
            .payload(b"x=2".to_vec())
            .build()
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn caller_key_overrides_url() {
        let a = Request::builder("https://example.com/a")
            .unique_key("shared")
            .build()
            .unwrap();
        let b = Request::builder("https://example.com/b")
            .unique_key("shared")
            .build()
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn error_messages_are_capped() {
        let mut req = Request::new("https://example.com").unwrap();
        for i in 0..20 {
            req.push_error_message(format!("boom {i}"));
        }
        assert_eq!(req.error_messages.len(), MAX_ERROR_MESSAGES_PER_REQUEST);
        assert!(req.last_error_message().unwrap().contains("truncated"));
        assert_eq!(req.error_messages[0], "boom 0");
    }

    #[test]
    fn request_round_trips_through_json() {
        let req = Request::builder("https://example.com/x")
            .header("accept", "text/html")
            .user_data("depth", serde_json::json!(2))
            .build()
            .unwrap();
        let json = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, req.id);
        assert_eq!(back.headers, req.headers);
        assert_eq!(back.user_data, req.user_data);
    }
}
