//! Test doubles: an in-memory transport with scripted responses and a minimal site adapter.

use crate::model::{ChapterRef, StoryMetadata};
use crate::scraper::{
    status_error, RawChapter, Response, ScraperError, Session, SiteAdapter, StoryIndex,
    Transport, UrlPattern,
};
use reqwest::Url;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Route {
    Page {
        body: Vec<u8>,
        content_type: String,
    },
    Status(u16),
    Timeout,
    /// Fails with the given status `failures` times, then serves the page.
    Flaky {
        failures: u32,
        status: u16,
        body: Vec<u8>,
    },
}

/// Scripted transport. Unknown URLs answer 404. Fragments are ignored when matching.
#[derive(Debug, Default)]
pub(crate) struct StubTransport {
    routes: HashMap<String, Route>,
    hits: Mutex<HashMap<String, u32>>,
}

fn route_key(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut u) => {
            u.set_fragment(None);
            u.to_string()
        }
        Err(_) => url.to_string(),
    }
}

impl StubTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn page(mut self, url: &str, html: &str) -> Self {
        self.routes.insert(
            route_key(url),
            Route::Page {
                body: html.as_bytes().to_vec(),
                content_type: "text/html; charset=utf-8".to_string(),
            },
        );
        self
    }

    pub(crate) fn image(mut self, url: &str, bytes: &[u8], content_type: &str) -> Self {
        self.routes.insert(
            route_key(url),
            Route::Page {
                body: bytes.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        self
    }

    pub(crate) fn status(mut self, url: &str, status: u16) -> Self {
        self.routes.insert(route_key(url), Route::Status(status));
        self
    }

    pub(crate) fn timeout(mut self, url: &str) -> Self {
        self.routes.insert(route_key(url), Route::Timeout);
        self
    }

    /// 503 for the first `failures` requests, then `html`.
    pub(crate) fn flaky(self, url: &str, failures: u32, html: &str) -> Self {
        self.flaky_with_status(url, failures, 503, html)
    }

    pub(crate) fn flaky_with_status(
        mut self,
        url: &str,
        failures: u32,
        status: u16,
        html: &str,
    ) -> Self {
        self.routes.insert(
            route_key(url),
            Route::Flaky {
                failures,
                status,
                body: html.as_bytes().to_vec(),
            },
        );
        self
    }

    /// Number of requests seen for `url`.
    pub(crate) fn hits(&self, url: &str) -> u32 {
        let hits = match self.hits.lock() {
            Ok(h) => h,
            Err(p) => p.into_inner(),
        };
        hits.get(&route_key(url)).copied().unwrap_or(0)
    }

    /// Total requests seen.
    pub(crate) fn total_hits(&self) -> u32 {
        let hits = match self.hits.lock() {
            Ok(h) => h,
            Err(p) => p.into_inner(),
        };
        hits.values().sum()
    }
}

impl Transport for StubTransport {
    fn get(&self, url: &Url, _headers: &[(String, String)]) -> Result<Response, ScraperError> {
        let key = route_key(url.as_str());
        let count = {
            let mut hits = match self.hits.lock() {
                Ok(h) => h,
                Err(p) => p.into_inner(),
            };
            let entry = hits.entry(key.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        let ok = |body: &[u8], content_type: &str| Response {
            url: url.clone(),
            content_type: Some(content_type.to_string()),
            body: body.to_vec(),
        };
        match self.routes.get(&key) {
            Some(Route::Page { body, content_type }) => Ok(ok(body, content_type)),
            Some(Route::Status(status)) => Err(status_error(*status, url.as_str())),
            Some(Route::Timeout) => Err(ScraperError::Timeout {
                url: url.to_string(),
            }),
            Some(Route::Flaky {
                failures,
                status,
                body,
            }) => {
                if count <= *failures {
                    Err(status_error(*status, url.as_str()))
                } else {
                    Ok(ok(body, "text/html; charset=utf-8"))
                }
            }
            None => Err(ScraperError::NotFound {
                url: url.to_string(),
            }),
        }
    }
}

static STUB_PATTERNS: [UrlPattern; 1] = [UrlPattern {
    host: "stories.test",
    path_prefix: "/story/",
}];

pub(crate) const STORY_URL: &str = "https://stories.test/story/1";

pub(crate) fn chapter_url(n: u32) -> String {
    format!("https://stories.test/story/1/chapter/{}", n)
}

/// Adapter for `stories.test`. Metadata comes from the story page's `<h1>`; the chapter list is
/// fixed at `chapters` entries. Chapter pages are served verbatim as markup.
#[derive(Debug, Clone)]
pub(crate) struct StubAdapter {
    pub(crate) chapters: u32,
    pub(crate) concurrent: bool,
    pub(crate) cover_url: Option<String>,
}

impl StubAdapter {
    pub(crate) fn new(chapters: u32) -> Self {
        StubAdapter {
            chapters,
            concurrent: false,
            cover_url: None,
        }
    }
}

impl SiteAdapter for StubAdapter {
    fn id(&self) -> &'static str {
        "stub"
    }

    fn name(&self) -> &'static str {
        "Stub"
    }

    fn patterns(&self) -> &'static [UrlPattern] {
        &STUB_PATTERNS
    }

    fn min_request_interval(&self) -> Duration {
        Duration::ZERO
    }

    fn concurrent_safe(&self) -> bool {
        self.concurrent
    }

    fn fetch_metadata(&self, session: &Session<'_>, url: &Url) -> Result<StoryIndex, ScraperError> {
        let page = String::from_utf8_lossy(&session.get(url)?.body).into_owned();
        let title = page
            .split("<h1>")
            .nth(1)
            .and_then(|rest| rest.split("</h1>").next())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ScraperError::markup(url.as_str(), "missing <h1>"))?;
        let chapters = (1..=self.chapters)
            .map(|n| ChapterRef {
                ordinal: n,
                title: format!("Chapter {}", n),
                locator: chapter_url(n),
                published: None,
                locked: false,
            })
            .collect();
        Ok(StoryIndex {
            metadata: StoryMetadata {
                title: title.to_string(),
                author: "Stub Author".to_string(),
                source_url: url.to_string(),
                summary: String::new(),
                tags: BTreeSet::new(),
                published: None,
                updated: None,
                cover_url: self.cover_url.clone(),
            },
            chapters,
        })
    }

    fn fetch_chapter(
        &self,
        session: &Session<'_>,
        chapter: &ChapterRef,
    ) -> Result<RawChapter, ScraperError> {
        let url = Url::parse(&chapter.locator).map_err(|e| ScraperError::InvalidUrl {
            input: chapter.locator.clone(),
            reason: e.to_string(),
        })?;
        let response = session.get_uncached(&url)?;
        Ok(RawChapter {
            markup: response.body,
            encoding: "utf-8".to_string(),
            base_url: response.url,
            title: None,
            hidden_classes: Vec::new(),
        })
    }
}

/// Transport serving the stub story page and `chapters` chapter pages.
pub(crate) fn stub_site(chapters: u32) -> StubTransport {
    let mut transport = StubTransport::new().page(STORY_URL, "<h1>Stub Story</h1>");
    for n in 1..=chapters {
        transport = transport.page(
            &chapter_url(n),
            &format!("<p>Text of chapter {}.</p>", n),
        );
    }
    transport
}
