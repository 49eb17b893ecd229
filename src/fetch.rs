//! Network fetching.

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{CACHE_CONTROL, HeaderMap, HeaderName, HeaderValue, PRAGMA};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::response::CachedResponse;

/// Headers that describe a single hop and are never forwarded or stored.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// Bypass HTTP caches on the way and force revalidation.
    pub reload: bool,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
    /// Request body, empty for GET.
    pub body: Bytes,
}

impl FetchRequest {
    /// Creates a GET request.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            reload: false,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Creates a GET request that bypasses intermediate HTTP caches.
    #[must_use]
    pub fn reload(url: impl Into<String>) -> Self {
        Self {
            reload: true,
            ..Self::get(url)
        }
    }

    /// Sets the method.
    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns true for GET requests, the only ones the cache intercepts.
    #[must_use]
    pub fn is_get(&self) -> bool {
        self.method == Method::GET
    }
}

/// Abstraction over the network for testability.
///
/// A transport failure is an `Err`; an HTTP error status is an `Ok` response
/// whose [`CachedResponse::is_ok`] is false.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Performs the request.
    async fn fetch(&self, request: &FetchRequest) -> Result<CachedResponse>;
}

#[async_trait]
impl<F: Fetcher + ?Sized> Fetcher for std::sync::Arc<F> {
    async fn fetch(&self, request: &FetchRequest) -> Result<CachedResponse> {
        (**self).fetch(request).await
    }
}

/// Default fetcher backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Builds a client with the configured user agent and timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .pool_max_idle_per_host(config.concurrent_fetches);
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Wraps an existing client.
    #[must_use]
    pub const fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn request_headers(request: &FetchRequest) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            if is_hop_by_hop(name) {
                continue;
            }
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::InvalidUrl(format!("header {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::InvalidUrl(format!("header value for {name}: {e}")))?;
            headers.append(name, value);
        }
        if request.reload {
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
        }
        Ok(headers)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<CachedResponse> {
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| Error::InvalidUrl(format!("{}: {e}", request.url)))?;
        log::debug!("{} {url}", request.method);

        let response = self
            .client
            .request(request.method.clone(), url)
            .headers(Self::request_headers(request)?)
            .body(request.body.clone())
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        Ok(CachedResponse {
            url: request.url.clone(),
            status,
            headers,
            body,
            stored_at: None,
        })
    }
}
