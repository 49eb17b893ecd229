//! Stored HTTP responses.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::Result;

/// An HTTP response as held by a cache partition.
///
/// Cloning is cheap: the body is reference counted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    /// URL the response was fetched from.
    pub url: String,
    /// HTTP status code.
    pub status: u16,
    /// Response headers in the order received.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Bytes,
    /// When the response was written to a partition, if it has been.
    pub stored_at: Option<DateTime<Utc>>,
}

impl CachedResponse {
    /// Creates a response with no headers.
    #[must_use]
    pub fn new(url: impl Into<String>, status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            url: url.into(),
            status,
            headers: Vec::new(),
            body: body.into(),
            stored_at: None,
        }
    }

    /// Creates a `200 OK` JSON response holding `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be serialized.
    pub fn json<T: Serialize>(url: impl Into<String>, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(url, 200, body).with_header("content-type", "application/json"))
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns true for a 2xx status.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Returns true if the response may be stored in a partition: an ok
    /// status that is not `206 Partial Content`.
    #[must_use]
    pub const fn is_cacheable(&self) -> bool {
        self.is_ok() && self.status != 206
    }

    /// Returns the first header with the given name, compared case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Parses the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON for `T`.
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Returns the body length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Returns true if the body is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Splits off everything but the body, for storing alongside it.
    #[must_use]
    pub fn metadata(&self) -> ResponseMetadata {
        ResponseMetadata {
            url: self.url.clone(),
            status: self.status,
            headers: self.headers.clone(),
            stored_at: self.stored_at,
        }
    }

    /// Reassembles a response from stored metadata and body.
    #[must_use]
    pub fn from_parts(metadata: ResponseMetadata, body: Bytes) -> Self {
        Self {
            url: metadata.url,
            status: metadata.status,
            headers: metadata.headers,
            body,
            stored_at: metadata.stored_at,
        }
    }
}

/// Everything about a stored response except its body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// URL the response was fetched from.
    pub url: String,
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// When the response was written.
    #[serde(default)]
    pub stored_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn ok_is_2xx() {
        assert!(CachedResponse::new("u", 200, "").is_ok());
        assert!(CachedResponse::new("u", 204, "").is_ok());
        assert!(!CachedResponse::new("u", 304, "").is_ok());
        assert!(!CachedResponse::new("u", 404, "").is_ok());
        assert!(!CachedResponse::new("u", 503, "").is_ok());
    }

    #[test]
    fn partial_content_is_not_cacheable() {
        assert!(CachedResponse::new("u", 200, "").is_cacheable());
        assert!(CachedResponse::new("u", 204, "").is_cacheable());
        assert!(!CachedResponse::new("u", 206, "0123").is_cacheable());
        assert!(!CachedResponse::new("u", 404, "").is_cacheable());
    }

    #[test]
    fn header_lookup_ignores_case() {
        let r = CachedResponse::new("u", 200, "").with_header("Content-Type", "text/html");
        assert_eq!(r.header("content-type"), Some("text/html"));
        assert_eq!(r.header("etag"), None);
    }

    #[test]
    fn json_body_parses_back() {
        let mut map = BTreeMap::new();
        map.insert("index.html".to_string(), "a8".to_string());
        let r = CachedResponse::json("manifest", &map).unwrap();
        assert_eq!(r.header("content-type"), Some("application/json"));
        let parsed: BTreeMap<String, String> = r.parse_json().unwrap();
        assert_eq!(parsed, map);
    }

    #[test]
    fn metadata_and_body_reassemble() {
        let r = CachedResponse::new("https://a/x.js", 200, "body").with_header("etag", "\"1\"");
        let again = CachedResponse::from_parts(r.metadata(), r.body.clone());
        assert_eq!(again, r);
    }
}
