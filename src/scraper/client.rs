//! Blocking HTTP transport. One GET per call; pacing, caching and retries live in
//! [Session](super::Session) and the pipeline's retry policy.

use super::error::ScraperError;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Url;
use std::time::Duration;

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; fictionpack/0.1; +https://github.com/fictionpack)";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_REDIRECTS: usize = 10;

/// A successful response, fully read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Final URL after redirects.
    pub url: Url,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Response {
    /// Charset declared in the Content-Type header, if any.
    pub fn charset(&self) -> Option<&str> {
        let ct = self.content_type.as_deref()?;
        ct.split(';')
            .filter_map(|p| p.trim().strip_prefix("charset="))
            .map(|c| c.trim_matches('"'))
            .next()
    }
}

/// Network seam. Implementations perform exactly one request per call and map failures onto
/// [ScraperError] (timeouts, connection errors and 5xx/429 must come back as transient).
pub trait Transport: Send + Sync {
    fn get(&self, url: &Url, headers: &[(String, String)]) -> Result<Response, ScraperError>;
}

/// Map a non-success status to the error taxonomy.
pub(crate) fn status_error(status: u16, url: &str) -> ScraperError {
    match status {
        404 | 410 => ScraperError::NotFound {
            url: url.to_string(),
        },
        401 | 403 => ScraperError::AccessBlocked {
            url: url.to_string(),
        },
        _ => ScraperError::HttpStatus {
            status,
            url: url.to_string(),
        },
    }
}

/// Blocking reqwest client with a browser-like User-Agent, cookie jar, timeout and redirect cap.
#[derive(Debug, Clone)]
pub struct PoliteClient {
    inner: reqwest::blocking::Client,
}

impl PoliteClient {
    pub fn builder() -> PoliteClientBuilder {
        PoliteClientBuilder::default()
    }
}

impl Transport for PoliteClient {
    fn get(&self, url: &Url, headers: &[(String, String)]) -> Result<Response, ScraperError> {
        let mut extra = HeaderMap::new();
        for (name, value) in headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) else {
                tracing::warn!(header = %name, "skipping invalid request header");
                continue;
            };
            extra.insert(name, value);
        }
        tracing::debug!(url = %url, "GET");
        let response = self
            .inner
            .get(url.clone())
            .headers(extra)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    ScraperError::Timeout {
                        url: url.to_string(),
                    }
                } else {
                    ScraperError::Connection {
                        url: url.to_string(),
                        reason: e.to_string(),
                    }
                }
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status.as_u16(), url.as_str()));
        }
        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response.bytes().map_err(|e| {
            if e.is_timeout() {
                ScraperError::Timeout {
                    url: url.to_string(),
                }
            } else {
                ScraperError::Body {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;
        Ok(Response {
            url: final_url,
            content_type,
            body: body.to_vec(),
        })
    }
}

/// Builder for PoliteClient with optional User-Agent and timeout.
#[derive(Debug)]
pub struct PoliteClientBuilder {
    user_agent: Option<String>,
    timeout_secs: u64,
}

impl Default for PoliteClientBuilder {
    fn default() -> Self {
        Self {
            user_agent: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl PoliteClientBuilder {
    /// Set a custom User-Agent. If not set, a browser-like default is used.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Per-request timeout in seconds. Default 30. A timeout is transient and gets retried.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn build(self) -> Result<PoliteClient, reqwest::Error> {
        let user_agent = self
            .user_agent
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let inner = reqwest::blocking::Client::builder()
            .cookie_store(true)
            .user_agent(user_agent)
            .timeout(Duration::from_secs(self.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(PoliteClient { inner })
    }
}
