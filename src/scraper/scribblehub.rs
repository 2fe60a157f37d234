//! Scribble Hub adapter. The series page carries metadata and the first page of the table of
//! contents; further TOC pages are walked with [ListingPages]. Chapter body: `#chp_raw` only.

use super::{
    decode_body, json_ld_book, json_str, parse_selector, parse_timestamp, parse_url,
    strip_html_tags, strip_title_site_suffix, RawChapter, ScraperError, Session, SiteAdapter,
    StoryIndex, UrlPattern,
};
use crate::model::{ChapterRef, StoryMetadata};
use reqwest::Url;
use scraper::{ElementRef, Html};
use std::collections::{BTreeSet, HashSet};

const SCRIBBLEHUB_BASE: &str = "https://www.scribblehub.com";
const TITLE_SUFFIXES: &[&str] = &[" | Scribble Hub", " - Scribble Hub"];

/// Hard cap on TOC pages walked for one series (15 chapters per page).
pub const MAX_LISTING_PAGES: usize = 500;

static PATTERNS: [UrlPattern; 1] = [UrlPattern {
    host: "scribblehub.com",
    path_prefix: "/series/",
}];

/// Scribble Hub site adapter.
#[derive(Debug, Default, Clone, Copy)]
pub struct ScribbleHub;

/// Series page URL without query or fragment. Requires `/series/{numeric id}/`.
fn series_url(url: &Url) -> Result<Url, ScraperError> {
    let id = url
        .path()
        .strip_prefix("/series/")
        .and_then(|rest| rest.split('/').next())
        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()));
    if id.is_none() {
        return Err(ScraperError::InvalidUrl {
            input: url.to_string(),
            reason: "expected a series URL containing /series/{id}/{slug}/".to_string(),
        });
    }
    let mut canonical = url.clone();
    canonical.set_query(None);
    canonical.set_fragment(None);
    Ok(canonical)
}

fn element_text(e: ElementRef<'_>) -> String {
    e.text().collect::<String>().trim().to_string()
}

/// Extract metadata from series page HTML: JSON-LD Book first, then DOM fallback per field.
fn parse_metadata(html: &str, source_url: &Url) -> Result<StoryMetadata, ScraperError> {
    let ld = json_ld_book(html);
    let doc = Html::parse_document(html);
    let first_text = |sel: &str| -> Result<Option<String>, ScraperError> {
        let sel = parse_selector(sel)?;
        Ok(doc
            .select(&sel)
            .next()
            .map(element_text)
            .filter(|s| !s.is_empty()))
    };
    let first_attr = |sel: &str, attr: &str| -> Result<Option<String>, ScraperError> {
        let sel = parse_selector(sel)?;
        Ok(doc
            .select(&sel)
            .next()
            .and_then(|e| e.value().attr(attr))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()))
    };

    let title = match ld.as_ref().and_then(|v| json_str(v, "name")) {
        Some(t) => Some(t),
        None => first_text("div.fic_title")?.or(first_attr("meta[property=\"og:title\"]", "content")?
            .map(|t| strip_title_site_suffix(&t, TITLE_SUFFIXES))),
    };
    let title = title.ok_or_else(|| {
        ScraperError::markup(source_url.as_str(), "missing story title (div.fic_title / JSON-LD name)")
    })?;

    let author = match ld
        .as_ref()
        .and_then(|v| v.get("author"))
        .and_then(|a| json_str(a, "name"))
    {
        Some(a) => a,
        None => first_text("span.auth_name_fic")?
            .or(first_text("div.sb_content.author div[property=\"author\"] a")?)
            .unwrap_or_default(),
    };

    let summary = match ld
        .as_ref()
        .and_then(|v| json_str(v, "description"))
        .map(|d| strip_html_tags(&d))
    {
        Some(s) => s,
        None => first_text(".wi_fic_desc")?.unwrap_or_default(),
    };

    let cover_url = match ld.as_ref().and_then(|v| json_str(v, "image")) {
        Some(c) => Some(c),
        None => first_attr("meta[property=\"og:image\"]", "content")?
            .or(first_attr(".fic_image img", "src")?),
    }
    .and_then(|c| source_url.join(&c).ok())
    .map(|u| u.to_string());

    let genre_sel = parse_selector("a.fic_genre, a.stag")?;
    let tags: BTreeSet<String> = doc
        .select(&genre_sel)
        .map(element_text)
        .filter(|t| !t.is_empty())
        .collect();

    Ok(StoryMetadata {
        title,
        author,
        source_url: source_url.to_string(),
        summary,
        tags,
        published: ld
            .as_ref()
            .and_then(|v| json_str(v, "datePublished"))
            .and_then(|d| parse_timestamp(&d)),
        updated: ld
            .as_ref()
            .and_then(|v| json_str(v, "dateModified"))
            .and_then(|d| parse_timestamp(&d)),
        cover_url,
    })
}

/// One TOC row: site order attribute, absolute chapter URL, title.
#[derive(Debug, Clone, PartialEq)]
struct TocEntry {
    order: u32,
    url: String,
    title: String,
}

/// Parse one page's TOC: ol.toc_ol > li.toc_w (order attr), a.toc_a (href, text).
fn parse_toc_page(html: &str, page_url: &str) -> Result<Vec<TocEntry>, ScraperError> {
    let base = parse_url(SCRIBBLEHUB_BASE)?;
    let doc = Html::parse_document(html);
    let ol_sel = parse_selector("ol.toc_ol")?;
    let li_sel = parse_selector("li.toc_w")?;
    let a_sel = parse_selector("a.toc_a")?;

    let ol = doc
        .select(&ol_sel)
        .next()
        .ok_or_else(|| ScraperError::markup(page_url, "ol.toc_ol not found"))?;

    let mut entries = Vec::new();
    for li in ol.select(&li_sel) {
        let order = li
            .value()
            .attr("order")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0);
        let Some(a) = li.select(&a_sel).next() else {
            continue;
        };
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        let url = base
            .join(href)
            .map_err(|e| ScraperError::markup(page_url, format!("bad chapter url: {}", e)))?;
        let title = element_text(a);
        if title.is_empty() {
            continue;
        }
        entries.push(TocEntry {
            order,
            url: url.to_string(),
            title,
        });
    }
    Ok(entries)
}

/// Parse toc=N from a URL or query string. Returns 1 if missing.
fn toc_page_number(url: &str) -> u32 {
    let query = url.split('?').nth(1).unwrap_or("");
    for param in query.split('&') {
        if let Some(rest) = param.trim().strip_prefix("toc=") {
            let n = rest.split(['#', '&']).next().unwrap_or("").trim();
            if let Ok(num) = n.parse::<u32>() {
                return num;
            }
        }
    }
    1
}

/// Next TOC page from `#pagination-mesh-toc a.page-link.next`, or any pagination link to
/// `toc=(current+1)` (the `.next` class is sometimes missing on the "»" link). `None` is the
/// end marker.
fn next_toc_page_url(html: &str, series_base: &Url, current_page_url: &str) -> Option<Url> {
    let doc = Html::parse_document(html);
    let current_page = toc_page_number(current_page_url);

    let next_sel = parse_selector("#pagination-mesh-toc a.page-link.next").ok()?;
    if let Some(next_a) = doc.select(&next_sel).next() {
        if let Some(href) = next_a.value().attr("href") {
            if !href.is_empty() && href != "#" {
                if let Ok(u) = series_base.join(href) {
                    return Some(u);
                }
            }
        }
    }

    let wanted = current_page + 1;
    let fallback_sel = parse_selector("#pagination-mesh-toc a[href*=\"toc=\"]").ok()?;
    doc.select(&fallback_sel)
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| !href.is_empty() && *href != "#")
        .find(|href| toc_page_number(href) == wanted)
        .and_then(|href| series_base.join(href).ok())
}

/// Sort TOC entries by order and deduplicate by URL (first occurrence kept).
fn merge_toc_entries(mut all_entries: Vec<TocEntry>) -> Vec<TocEntry> {
    all_entries.sort_by_key(|e| e.order);
    let mut seen = HashSet::new();
    all_entries.retain(|e| seen.insert(e.url.clone()));
    all_entries
}

/// Lazy walk over TOC pages. The first page is the already-fetched series page; each further
/// page is fetched through the session only when the iterator is advanced. Stops at the end
/// marker, after [MAX_LISTING_PAGES], or after the first error.
pub struct ListingPages<'s, 'a> {
    session: &'s Session<'a>,
    series_base: Url,
    pending: Option<(Url, String)>,
    next: Option<Url>,
    visited: HashSet<String>,
    pages: usize,
    failed: bool,
}

impl<'s, 'a> ListingPages<'s, 'a> {
    pub fn new(session: &'s Session<'a>, series_base: Url, first_html: String) -> Self {
        ListingPages {
            session,
            pending: Some((series_base.clone(), first_html)),
            series_base,
            next: None,
            visited: HashSet::new(),
            pages: 0,
            failed: false,
        }
    }

    fn load(&mut self) -> Option<Result<(Url, String), ScraperError>> {
        if let Some(page) = self.pending.take() {
            return Some(Ok(page));
        }
        let url = self.next.take()?;
        Some(self.session.get(&url).map(|r| (url, decode_body(&r))))
    }
}

impl Iterator for ListingPages<'_, '_> {
    /// (page URL, page HTML)
    type Item = Result<(Url, String), ScraperError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.pages >= MAX_LISTING_PAGES {
            if self.next.is_some() {
                tracing::warn!(
                    series = %self.series_base,
                    "table of contents exceeds {} pages; stopping",
                    MAX_LISTING_PAGES
                );
                self.next = None;
            }
            return None;
        }
        match self.load()? {
            Ok((url, html)) => {
                self.pages += 1;
                self.visited.insert(url.to_string());
                self.next = next_toc_page_url(&html, &self.series_base, url.as_str())
                    .filter(|n| !self.visited.contains(n.as_str()));
                Some(Ok((url, html)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

fn collect_toc(pages: ListingPages<'_, '_>) -> Result<Vec<ChapterRef>, ScraperError> {
    let mut all = Vec::new();
    for page in pages {
        let (url, html) = page?;
        all.extend(parse_toc_page(&html, url.as_str())?);
    }
    let mut refs: Vec<ChapterRef> = merge_toc_entries(all)
        .into_iter()
        .map(|e| ChapterRef {
            ordinal: 0,
            title: e.title,
            locator: e.url,
            published: None,
            locked: false,
        })
        .collect();
    ChapterRef::renumber(&mut refs);
    Ok(refs)
}

struct ChapterPage {
    title: Option<String>,
    markup: String,
}

/// Title from div.chapter-title or `<title>`; body is the `#chp_raw` container.
fn parse_chapter_page(html: &str, url: &str) -> Result<ChapterPage, ScraperError> {
    let doc = Html::parse_document(html);

    let chapter_title_sel = parse_selector("div.chapter-title")?;
    let title_sel = parse_selector("title")?;
    let title = doc
        .select(&chapter_title_sel)
        .next()
        .map(element_text)
        .filter(|s| !s.is_empty())
        .or_else(|| {
            doc.select(&title_sel)
                .next()
                .map(element_text)
                .map(|t| strip_title_site_suffix(&t, TITLE_SUFFIXES))
                .filter(|s| !s.is_empty())
        });

    let chp_raw_sel = parse_selector("#chp_raw")?;
    let body = doc
        .select(&chp_raw_sel)
        .next()
        .ok_or_else(|| ScraperError::markup(url, "missing #chp_raw"))?;

    Ok(ChapterPage {
        title,
        markup: body.html(),
    })
}

impl SiteAdapter for ScribbleHub {
    fn id(&self) -> &'static str {
        "scribblehub"
    }

    fn name(&self) -> &'static str {
        "Scribble Hub"
    }

    fn patterns(&self) -> &'static [UrlPattern] {
        &PATTERNS
    }

    fn fetch_metadata(&self, session: &Session<'_>, url: &Url) -> Result<StoryIndex, ScraperError> {
        let series = series_url(url)?;
        let response = session.get(&series)?;
        let html = decode_body(&response);
        let metadata = parse_metadata(&html, &series)?;
        let chapters = collect_toc(ListingPages::new(session, series, html))?;
        if chapters.is_empty() {
            return Err(ScraperError::markup(
                &metadata.source_url,
                "table of contents is empty",
            ));
        }
        Ok(StoryIndex { metadata, chapters })
    }

    fn fetch_chapter(
        &self,
        session: &Session<'_>,
        chapter: &ChapterRef,
    ) -> Result<RawChapter, ScraperError> {
        let url = parse_url(&chapter.locator)?;
        let response = session.get_uncached(&url)?;
        let html = decode_body(&response);
        let page = parse_chapter_page(&html, &chapter.locator)?;
        Ok(RawChapter {
            markup: page.markup.into_bytes(),
            encoding: "utf-8".to_string(),
            base_url: response.url,
            title: page.title,
            hidden_classes: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::testing::StubTransport;
    use std::time::Duration;

    const SERIES: &str = "https://www.scribblehub.com/series/123/slug/";

    fn toc_html(entries: &[(u32, u32)], next: Option<u32>) -> String {
        let items: String = entries
            .iter()
            .map(|(order, id)| {
                format!(
                    r#"<li class="toc_w" order="{order}"><a class="toc_a" href="/read/123-slug/chapter/{id}/">Chapter {order}</a></li>"#
                )
            })
            .collect();
        let pagination = match next {
            Some(n) => format!(
                r#"<ul id="pagination-mesh-toc"><li><a class="page-link next" href="?toc={n}#content1">»</a></li></ul>"#
            ),
            None => r#"<ul id="pagination-mesh-toc"></ul>"#.to_string(),
        };
        format!(
            r#"<html><body><div class="fic_title">Series</div><ol class="toc_ol">{items}</ol>{pagination}</body></html>"#
        )
    }

    #[test]
    fn inline_parse_metadata_json_ld() -> Result<(), ScraperError> {
        let html = r#"<html><head></head><body>
<script type="application/ld+json">
{"@type":"Book","name":"SH Inline Book","author":{"name":"SH Author"},"description":"Desc","image":"https://example.com/cover.jpg"}
</script>
<a class="fic_genre">Fantasy</a><a class="stag">Magic</a>
</body></html>"#;
        let m = parse_metadata(html, &Url::parse(SERIES).unwrap())?;
        assert_eq!(m.title, "SH Inline Book");
        assert_eq!(m.author, "SH Author");
        assert_eq!(m.summary, "Desc");
        assert_eq!(m.cover_url.as_deref(), Some("https://example.com/cover.jpg"));
        assert_eq!(
            m.tags.iter().cloned().collect::<Vec<_>>(),
            vec!["Fantasy".to_string(), "Magic".to_string()]
        );
        Ok(())
    }

    #[test]
    fn inline_parse_metadata_dom_fallback() -> Result<(), ScraperError> {
        let html = r#"<html><head><meta property="og:image" content="/img/c.png"/></head><body>
<div class="fic_title">The Trouble with Horns</div>
<span class="auth_name_fic">Tempokai</span>
<div class="wi_fic_desc"><p>A demon.</p></div>
</body></html>"#;
        let m = parse_metadata(html, &Url::parse(SERIES).unwrap())?;
        assert_eq!(m.title, "The Trouble with Horns");
        assert_eq!(m.author, "Tempokai");
        assert_eq!(m.summary, "A demon.");
        assert_eq!(
            m.cover_url.as_deref(),
            Some("https://www.scribblehub.com/img/c.png")
        );
        Ok(())
    }

    #[test]
    fn series_url_requires_numeric_id() {
        assert!(series_url(&Url::parse("https://www.scribblehub.com/series/123/slug/?toc=3#x").unwrap())
            .map(|u| u.as_str() == SERIES)
            .unwrap_or(false));
        assert!(matches!(
            series_url(&Url::parse("https://www.scribblehub.com/series/abc/").unwrap()),
            Err(ScraperError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn inline_parse_toc_page() -> Result<(), ScraperError> {
        let html = r#"<html><body>
<ol class="toc_ol">
<li class="toc_w" order="1"><a class="toc_a" href="/read/123/series-slug/chapter/1/">Chapter 1: Start</a></li>
</ol>
</body></html>"#;
        let entries = parse_toc_page(html, SERIES)?;
        assert_eq!(entries.len(), 1);
        assert!(entries[0].url.contains("scribblehub.com"));
        assert_eq!(entries[0].title, "Chapter 1: Start");
        Ok(())
    }

    #[test]
    fn missing_toc_is_markup_changed() {
        assert!(matches!(
            parse_toc_page("<html></html>", SERIES),
            Err(ScraperError::MarkupChanged { .. })
        ));
    }

    #[test]
    fn inline_parse_chapter_page() -> Result<(), ScraperError> {
        let html = r#"<!DOCTYPE html><html><head><title>Book - Chapter 1: Intro | Scribble Hub</title></head><body>
<div class="chapter-title">Chapter 1: Intro</div>
<div id="chp_raw" class="chp_raw">
<p>First line of the chapter.</p>
<p>Second line.</p>
</div>
</body></html>"#;
        let page = parse_chapter_page(html, "https://www.scribblehub.com/read/123/slug/chapter/1/")?;
        assert_eq!(page.title.as_deref(), Some("Chapter 1: Intro"));
        assert!(page.markup.contains("First line of the chapter"));
        assert!(page.markup.contains("Second line"));
        Ok(())
    }

    #[test]
    fn inline_parse_chapter_page_title_fallback_with_dash_and_pipe() -> Result<(), ScraperError> {
        let html = r#"<!DOCTYPE html><html><head><title>Book - Chapter 1 | Part 2 | Scribble Hub</title></head><body>
<div id="chp_raw" class="chp_raw"><p>Content.</p></div></body></html>"#;
        let page = parse_chapter_page(html, "https://www.scribblehub.com/read/123/slug/chapter/1/")?;
        assert_eq!(page.title.as_deref(), Some("Book - Chapter 1 | Part 2"));
        Ok(())
    }

    #[test]
    fn merge_toc_entries_sorts_and_dedupes_by_url() {
        let e = |order: u32, url: &str, title: &str| TocEntry {
            order,
            url: url.to_string(),
            title: title.to_string(),
        };
        let merged = merge_toc_entries(vec![
            e(2, "https://example.com/ch2", "Ch2"),
            e(1, "https://example.com/ch1", "Ch1"),
            e(2, "https://example.com/ch2", "Ch2 again"),
            e(3, "https://example.com/ch3", "Ch3"),
        ]);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].title, "Ch1");
        assert_eq!(merged[1].title, "Ch2");
        assert_eq!(merged[2].order, 3);
    }

    #[test]
    fn next_toc_page_url_fallback_finds_toc2_without_next_class() {
        let series_base =
            Url::parse("https://www.scribblehub.com/series/55539/trouble-with-horns/").unwrap();
        let html = r#"<ul id="pagination-mesh-toc"><li class="active"><a class="current" href="?toc=1#content1">1</a></li><li><a href="?toc=2#content1" class="page-link">2</a></li><li><a href="?toc=3#content1" class="page-link">»</a></li></ul>"#;
        let url = next_toc_page_url(html, &series_base, series_base.as_str());
        assert!(url.map(|u| u.as_str().contains("toc=2")).unwrap_or(false));
    }

    #[test]
    fn next_toc_page_url_returns_none_at_end_marker() {
        let series_base = Url::parse(SERIES).unwrap();
        assert!(next_toc_page_url(r#"<div id="pagination-mesh-toc"></div>"#, &series_base, SERIES).is_none());
        let html_hash =
            r##"<div id="pagination-mesh-toc"><a class="page-link next" href="#">Next</a></div>"##;
        assert!(next_toc_page_url(html_hash, &series_base, SERIES).is_none());
    }

    #[test]
    fn listing_pages_walks_lazily_until_end_marker() -> Result<(), ScraperError> {
        let page2 = "https://www.scribblehub.com/series/123/slug/?toc=2#content1";
        let page3 = "https://www.scribblehub.com/series/123/slug/?toc=3#content1";
        let transport = StubTransport::new()
            .page(page2, &toc_html(&[(3, 3), (4, 4)], Some(3)))
            .page(page3, &toc_html(&[(5, 5)], None));
        let cache = MemoryCache::new();
        let session = Session::new(&transport, &cache, Duration::ZERO, Duration::from_secs(60));
        let first = toc_html(&[(2, 2), (1, 1)], Some(2));

        let mut pages = ListingPages::new(&session, Url::parse(SERIES).unwrap(), first.clone());
        assert!(pages.next().is_some());
        assert_eq!(transport.hits(page2), 0);

        let refs = collect_toc(ListingPages::new(&session, Url::parse(SERIES).unwrap(), first))?;
        assert_eq!(refs.len(), 5);
        assert_eq!(refs[0].title, "Chapter 1");
        assert_eq!(refs[4].ordinal, 5);
        assert_eq!(transport.hits(page3), 1);
        Ok(())
    }

    #[test]
    fn listing_pages_stops_on_repeated_page() -> Result<(), ScraperError> {
        // A page whose next link points back at itself must not loop.
        let page2 = "https://www.scribblehub.com/series/123/slug/?toc=2";
        let transport = StubTransport::new().page(page2, &toc_html(&[(2, 2)], Some(2)));
        let cache = MemoryCache::new();
        let session = Session::new(&transport, &cache, Duration::ZERO, Duration::from_secs(60));
        let first = toc_html(&[(1, 1)], Some(2));
        let count = ListingPages::new(&session, Url::parse(SERIES).unwrap(), first).count();
        assert_eq!(count, 2);
        Ok(())
    }

    #[test]
    fn listing_page_failure_propagates() {
        let page2 = "https://www.scribblehub.com/series/123/slug/?toc=2#content1";
        let transport = StubTransport::new().status(page2, 404);
        let cache = MemoryCache::new();
        let session = Session::new(&transport, &cache, Duration::ZERO, Duration::from_secs(60));
        let first = toc_html(&[(1, 1)], Some(2));
        assert!(matches!(
            collect_toc(ListingPages::new(&session, Url::parse(SERIES).unwrap(), first)),
            Err(ScraperError::NotFound { .. })
        ));
    }
}
