//! Site adapters and everything they touch: the adapter contract, the registry that picks one
//! per URL, the HTTP transport, and the per-story session.

mod client;
mod error;
mod registry;
mod session;

pub mod royalroad;
pub mod scribblehub;

pub use client::{PoliteClient, PoliteClientBuilder, Response, Transport};
#[cfg(test)]
pub(crate) use client::status_error;
pub use error::ScraperError;
pub use registry::{AdapterRegistry, RegistryError};
pub use session::{Pacer, Session};

use crate::model::{ChapterRef, StoryMetadata};
use chrono::{DateTime, Utc};
use reqwest::Url;
use scraper::Selector;
use std::time::Duration;

/// Default minimum delay between requests to one site.
pub const DEFAULT_REQUEST_INTERVAL: Duration = Duration::from_secs(2);

/// Metadata plus the ordered chapter list, as reported by an adapter.
#[derive(Debug, Clone)]
pub struct StoryIndex {
    pub metadata: StoryMetadata,
    pub chapters: Vec<ChapterRef>,
}

/// Raw chapter page content handed to the normalizer.
#[derive(Debug, Clone)]
pub struct RawChapter {
    pub markup: Vec<u8>,
    /// Declared encoding label (e.g. `utf-8`, `windows-1252`).
    pub encoding: String,
    /// Base for resolving relative image sources.
    pub base_url: Url,
    /// Chapter title found on the page, used when the listing had none.
    pub title: Option<String>,
    /// CSS classes the site hides from readers; elements carrying them are dropped.
    pub hidden_classes: Vec<String>,
}

/// URL matching rule: host (exact or any subdomain) plus path prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrlPattern {
    pub host: &'static str,
    pub path_prefix: &'static str,
}

impl UrlPattern {
    pub fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        host_matches(host, self.host) && url.path().starts_with(self.path_prefix)
    }

    /// True if some URL could match both patterns.
    pub fn overlaps(&self, other: &UrlPattern) -> bool {
        let hosts = host_matches(self.host, other.host) || host_matches(other.host, self.host);
        let paths = self.path_prefix.starts_with(other.path_prefix)
            || other.path_prefix.starts_with(self.path_prefix);
        hosts && paths
    }
}

fn host_matches(host: &str, pattern: &str) -> bool {
    let host = host.to_ascii_lowercase();
    host == pattern
        || host
            .strip_suffix(pattern)
            .map(|rest| rest.ends_with('.'))
            .unwrap_or(false)
}

/// Capability set every supported site implements.
///
/// Implementations are stateless: everything they need for one story comes in through the
/// [Session] and the arguments, so the pipeline can call them from several worker threads.
/// Chapter pages should be fetched with [Session::get_uncached]; the pipeline caches the
/// normalized chapter instead of the raw page.
pub trait SiteAdapter: Send + Sync {
    /// Short lowercase id, used for `--site`, config sections and cache keys.
    fn id(&self) -> &'static str;

    fn name(&self) -> &'static str;

    fn patterns(&self) -> &'static [UrlPattern];

    fn min_request_interval(&self) -> Duration {
        DEFAULT_REQUEST_INTERVAL
    }

    /// Whether chapters may be fetched from several threads at once.
    fn concurrent_safe(&self) -> bool {
        false
    }

    fn fetch_metadata(&self, session: &Session<'_>, url: &Url) -> Result<StoryIndex, ScraperError>;

    fn fetch_chapter(
        &self,
        session: &Session<'_>,
        chapter: &ChapterRef,
    ) -> Result<RawChapter, ScraperError>;
}

/// Parse a CSS selector or return an error (avoids panics from Selector::parse).
pub(crate) fn parse_selector(sel: &str) -> Result<Selector, ScraperError> {
    Selector::parse(sel).map_err(|e| ScraperError::MarkupChanged {
        url: String::new(),
        detail: format!("invalid selector {:?}: {}", sel, e),
    })
}

/// Strip known site suffix from the end of a page title (e.g. " - Royal Road", " | Scribble Hub")
/// so that titles containing " - " or " | " in the actual title are preserved.
pub fn strip_title_site_suffix(s: &str, suffixes: &[&str]) -> String {
    let mut t = s.trim();
    for suffix in suffixes {
        if t.ends_with(suffix) {
            t = t[..t.len() - suffix.len()].trim();
            break;
        }
    }
    t.to_string()
}

pub(crate) fn strip_html_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for c in s.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.replace("\n\n\n", "\n\n").trim().to_string()
}

const LD_JSON_OPEN: &str = "<script type=\"application/ld+json\">";
const LD_JSON_CLOSE: &str = "</script>";

/// First JSON-LD object with `@type: Book` in the page, if any.
pub(crate) fn json_ld_book(html: &str) -> Option<serde_json::Value> {
    let mut search_start = 0;
    while let Some(script) = html[search_start..].find(LD_JSON_OPEN) {
        let start = search_start + script + LD_JSON_OPEN.len();
        let end = html[start..]
            .find(LD_JSON_CLOSE)
            .map(|i| start + i)
            .unwrap_or(html.len());
        search_start = end;
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(html[start..end].trim()) {
            if v.get("@type").and_then(|t| t.as_str()) == Some("Book") {
                return Some(v);
            }
        }
    }
    None
}

/// Non-empty string field of a JSON object.
pub(crate) fn json_str(v: &serde_json::Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(|s| s.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// RFC 3339 timestamp, or a bare `YYYY-MM-DD` date taken as midnight UTC.
pub(crate) fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Response body decoded with the charset from Content-Type, UTF-8 otherwise.
pub(crate) fn decode_body(response: &Response) -> String {
    crate::normalize::decode_markup(&response.body, response.charset().unwrap_or("utf-8")).0
}

pub(crate) fn parse_url(input: &str) -> Result<Url, ScraperError> {
    Url::parse(input).map_err(|e| ScraperError::InvalidUrl {
        input: input.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_title_site_suffix_removes_trailing_suffix_only() {
        assert_eq!(
            strip_title_site_suffix(
                "Chapter 1 - The Beginning | Scribble Hub",
                &[" | Scribble Hub", " - Scribble Hub"]
            ),
            "Chapter 1 - The Beginning"
        );
        assert_eq!(
            strip_title_site_suffix(
                "1. Good Morning - Brother - Book _ Royal Road",
                &[" _ Royal Road", " - Royal Road", " | Royal Road"]
            ),
            "1. Good Morning - Brother - Book"
        );
    }

    #[test]
    fn pattern_matches_subdomains_and_prefix() {
        let p = UrlPattern {
            host: "royalroad.com",
            path_prefix: "/fiction/",
        };
        assert!(p.matches(&Url::parse("https://www.royalroad.com/fiction/1/x").unwrap()));
        assert!(p.matches(&Url::parse("https://royalroad.com/fiction/1").unwrap()));
        assert!(!p.matches(&Url::parse("https://notroyalroad.com/fiction/1").unwrap()));
        assert!(!p.matches(&Url::parse("https://www.royalroad.com/forums/1").unwrap()));
    }

    #[test]
    fn pattern_overlap_detection() {
        let a = UrlPattern {
            host: "example.com",
            path_prefix: "/series/",
        };
        let b = UrlPattern {
            host: "www.example.com",
            path_prefix: "/",
        };
        let c = UrlPattern {
            host: "example.com",
            path_prefix: "/read/",
        };
        let d = UrlPattern {
            host: "other.com",
            path_prefix: "/series/",
        };
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert!(!a.overlaps(&d));
    }

    #[test]
    fn json_ld_book_skips_other_types() {
        let html = r#"<script type="application/ld+json">{"@type":"WebSite","name":"x"}</script>
<script type="application/ld+json">{"@type":"Book","name":"Found"}</script>"#;
        let book = json_ld_book(html).unwrap();
        assert_eq!(json_str(&book, "name").as_deref(), Some("Found"));
        assert!(json_ld_book("<html></html>").is_none());
    }

    #[test]
    fn parse_timestamp_accepts_rfc3339_and_dates() {
        let ts = parse_timestamp("2020-05-01T10:00:00Z").unwrap();
        assert_eq!(ts.to_rfc3339(), "2020-05-01T10:00:00+00:00");
        let d = parse_timestamp("2021-02-03").unwrap();
        assert_eq!(d.to_rfc3339(), "2021-02-03T00:00:00+00:00");
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn strip_html_tags_keeps_text() {
        assert_eq!(strip_html_tags("<p>A <b>bold</b> move</p>"), "A bold move");
    }
}
