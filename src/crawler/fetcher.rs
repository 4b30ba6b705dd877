//! HTTP fetcher implementation
//!
//! [`Fetcher`] is the transport seam of the worker pipeline. [`HttpFetcher`] implements
//! it with reqwest; tests plug in their own implementations.

use crate::config::UserAgentConfig;
use crate::crawler::retry::ErrorKind;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{redirect::Policy, Client};
use std::fmt;
use std::time::Duration;
use url::Url;

/// A response with its body fully read
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl FetchResponse {
    /// The Content-Type header, if present and readable
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The raw Location header, if present and readable
    pub fn location(&self) -> Option<&str> {
        self.headers
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.trim().is_empty())
    }

    /// A 3xx that names where to go next
    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status) && self.location().is_some()
    }

    /// True for `text/html` and `application/xhtml+xml`; a missing header counts as HTML
    pub fn is_html(&self) -> bool {
        match self.content_type() {
            None => true,
            Some(value) => {
                let value = value.to_ascii_lowercase();
                value.contains("text/html") || value.contains("application/xhtml+xml")
            }
        }
    }
}

/// A request that produced no usable response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    pub kind: ErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for FetchError {}

/// HTTP transport used by workers
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// GETs `url`, giving up after `timeout` and rejecting bodies over `max_bytes`
    ///
    /// Non-2xx responses are returned as `Ok`; classifying them is up to the caller.
    /// Redirects are not followed: a 3xx comes back as-is so its target can be scheduled
    /// like any other URL.
    async fn fetch(
        &self,
        url: &Url,
        timeout: Duration,
        max_bytes: usize,
    ) -> Result<FetchResponse, FetchError>;
}

/// Builds an HTTP client with proper configuration
///
/// # Example
///
/// ```
/// use driftnet::config::UserAgentConfig;
/// use driftnet::crawler::build_http_client;
///
/// let config = UserAgentConfig {
///     crawler_name: "Driftnet".to_string(),
///     crawler_version: "1.0".to_string(),
///     contact_url: "https://example.com/about".to_string(),
///     contact_email: "admin@example.com".to_string(),
/// };
///
/// let client = build_http_client(&config).unwrap();
/// ```
pub fn build_http_client(config: &UserAgentConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.header_value())
        .connect_timeout(Duration::from_secs(10))
        .redirect(Policy::none())
        .gzip(true)
        .brotli(true)
        .build()
}

/// [`Fetcher`] over a shared reqwest client
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn from_config(config: &UserAgentConfig) -> Result<Self, reqwest::Error> {
        Ok(Self::new(build_http_client(config)?))
    }
}

/// Classifies a reqwest error
fn classify_error(error: &reqwest::Error) -> ErrorKind {
    if error.is_timeout() {
        ErrorKind::Timeout
    } else if error.is_builder() {
        ErrorKind::Malformed
    } else if error.is_connect() || error.is_request() || error.is_body() {
        ErrorKind::Connect
    } else if error.is_decode() {
        ErrorKind::Malformed
    } else {
        ErrorKind::Connect
    }
}

fn oversize(max_bytes: usize) -> FetchError {
    FetchError::new(
        ErrorKind::Oversize,
        format!("body exceeds {} bytes", max_bytes),
    )
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &Url,
        timeout: Duration,
        max_bytes: usize,
    ) -> Result<FetchResponse, FetchError> {
        let mut response = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| FetchError::new(classify_error(&e), e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();

        let declared_len = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared_len.is_some_and(|len| len > max_bytes) {
            return Err(oversize(max_bytes));
        }

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::new(classify_error(&e), e.to_string()))?
        {
            if body.len() + chunk.len() > max_bytes {
                return Err(oversize(max_bytes));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchResponse {
            status,
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }
}
