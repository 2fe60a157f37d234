//! Shared error type for transports and site adapters.

use thiserror::Error;

/// Error from a single request or from interpreting a fetched page.
///
/// Every variant is chapter-scoped when raised by `fetch_chapter`; the pipeline turns it into a
/// recorded gap. Raised from `fetch_metadata` it is fatal for the whole story.
#[derive(Debug, Error)]
pub enum ScraperError {
    #[error("Invalid URL: {input}: {reason}")]
    InvalidUrl { input: String, reason: String },

    /// Expected structural anchors are absent; the adapter needs maintenance.
    #[error("Page layout not recognized at {url}: {detail}")]
    MarkupChanged { url: String, detail: String },

    #[error("Not found (removed or never existed): {url}")]
    NotFound { url: String },

    #[error("Chapter is locked (premium) and cannot be fetched: {url}")]
    Locked { url: String },

    #[error("Request timed out: {url}")]
    Timeout { url: String },

    #[error("Network error: could not reach {url}: {reason}")]
    Connection { url: String, reason: String },

    #[error("HTTP {status} when fetching: {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Failed to read response body from {url}: {reason}")]
    Body { url: String, reason: String },

    #[error("Access blocked or restricted at {url}. A cookie may be required; see the `cookie` key under [sites.<id>] in the config.")]
    AccessBlocked { url: String },
}

impl ScraperError {
    /// Transient faults are retried by the pipeline's retry policy; everything else is final.
    pub fn is_transient(&self) -> bool {
        match self {
            ScraperError::Timeout { .. } | ScraperError::Connection { .. } => true,
            ScraperError::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// HTTP 429 gets a longer backoff schedule.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ScraperError::HttpStatus { status: 429, .. })
    }

    pub(crate) fn markup(url: &str, detail: impl Into<String>) -> Self {
        ScraperError::MarkupChanged {
            url: url.to_string(),
            detail: detail.into(),
        }
    }
}
