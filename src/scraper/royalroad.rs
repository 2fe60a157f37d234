//! Royal Road adapter. The fiction page carries metadata and the full chapter list
//! (`window.chapters`); each chapter page carries the content plus optional author notes.
//!
//! Cloudflare: cookie jar and browser-like User-Agent are used; captcha is not handled.

use super::{
    json_ld_book, json_str, parse_selector, parse_timestamp, parse_url, strip_html_tags,
    strip_title_site_suffix, RawChapter, ScraperError, Session, SiteAdapter, StoryIndex,
    UrlPattern,
};
use crate::model::{ChapterRef, StoryMetadata};
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::OnceLock;

const ROYALROAD_BASE: &str = "https://www.royalroad.com";
const TITLE_SUFFIXES: &[&str] = &[" _ Royal Road", " - Royal Road", " | Royal Road"];

static PATTERNS: [UrlPattern; 1] = [UrlPattern {
    host: "royalroad.com",
    path_prefix: "/fiction/",
}];

/// Royal Road site adapter.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoyalRoad;

/// Shape of one entry in window.chapters (relative url, order 0-based, isUnlocked).
#[derive(Debug, Deserialize)]
struct WindowChapter {
    title: String,
    url: String,
    #[serde(default)]
    order: u32,
    #[serde(rename = "isUnlocked", default = "default_true")]
    is_unlocked: bool,
    #[serde(default)]
    date: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Canonical fiction page URL (`/fiction/{id}`) for any URL under a fiction, including
/// chapter URLs.
fn fiction_url(url: &Url) -> Result<Url, ScraperError> {
    let mut segments = url.path_segments().into_iter().flatten();
    let id = match (segments.next(), segments.next()) {
        (Some("fiction"), Some(id)) if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) => {
            id
        }
        _ => {
            return Err(ScraperError::InvalidUrl {
                input: url.to_string(),
                reason: "expected a fiction URL, e.g. https://www.royalroad.com/fiction/21220/mother-of-learning".to_string(),
            })
        }
    };
    parse_url(&format!("{}/fiction/{}", ROYALROAD_BASE, id))
}

fn element_text(e: ElementRef<'_>) -> String {
    e.text().collect::<String>().trim().to_string()
}

/// Metadata from the fiction page: JSON-LD Book first, DOM fallbacks per field. Only a missing
/// title is fatal; everything else defaults to empty.
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
        None => first_text("h1.font-white")?.or(first_text("h1")?),
    };
    let title = title.ok_or_else(|| {
        ScraperError::markup(source_url.as_str(), "missing story title (h1 / JSON-LD name)")
    })?;

    let author = match ld
        .as_ref()
        .and_then(|v| v.get("author"))
        .and_then(|a| json_str(a, "name"))
    {
        Some(a) => a,
        None => first_attr("meta[property=\"books:author\"]", "content")?
            .or(first_text("h4 a.font-white")?)
            .unwrap_or_default(),
    };

    let summary = match ld
        .as_ref()
        .and_then(|v| json_str(v, "description"))
        .map(|d| strip_html_tags(&d))
    {
        Some(s) => s,
        None => first_text(".description")?.unwrap_or_default(),
    };

    let cover_url = match ld.as_ref().and_then(|v| json_str(v, "image")) {
        Some(c) => Some(c),
        None => first_attr("meta[property=\"og:image\"]", "content")?
            .or(first_attr("img.thumbnail", "src")?),
    }
    .and_then(|c| source_url.join(&c).ok())
    .map(|u| u.to_string());

    let tag_sel = parse_selector("span.tags a.fiction-tag")?;
    let tags: BTreeSet<String> = doc
        .select(&tag_sel)
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

/// Chapter list from `window.chapters`, falling back to the `#chapters` table.
fn parse_toc(html: &str, page_url: &str) -> Result<Vec<ChapterRef>, ScraperError> {
    let base = parse_url(ROYALROAD_BASE)?;
    let mut refs = match parse_window_chapters(html, &base) {
        Some(refs) => refs?,
        None => parse_chapter_table(html, &base)?,
    };
    if refs.is_empty() {
        return Err(ScraperError::markup(
            page_url,
            "chapter list not found (window.chapters / #chapters table)",
        ));
    }
    ChapterRef::renumber(&mut refs);
    Ok(refs)
}

/// `None` when the page has no `window.chapters` assignment at all.
fn parse_window_chapters(html: &str, base: &Url) -> Option<Result<Vec<ChapterRef>, ScraperError>> {
    let needle = "window.chapters = ";
    let start = html.find(needle)? + needle.len();
    let array = extract_json_array_with_strings(&html[start..])?;
    let parsed: Result<Vec<WindowChapter>, _> = serde_json::from_str(array);
    Some(match parsed {
        Ok(mut chapters) => {
            chapters.sort_by_key(|c| c.order);
            chapters
                .into_iter()
                .map(|ch| -> Result<ChapterRef, ScraperError> {
                    let url = base.join(&ch.url).map_err(|e| {
                        ScraperError::markup(base.as_str(), format!("bad chapter url: {}", e))
                    })?;
                    Ok(ChapterRef {
                        ordinal: ch.order + 1,
                        title: ch.title.trim().to_string(),
                        locator: url.to_string(),
                        published: ch.date.as_deref().and_then(parse_timestamp),
                        locked: !ch.is_unlocked,
                    })
                })
                .collect()
        }
        Err(e) => Err(ScraperError::markup(
            base.as_str(),
            format!("window.chapters is not valid JSON: {}", e),
        )),
    })
}

fn parse_chapter_table(html: &str, base: &Url) -> Result<Vec<ChapterRef>, ScraperError> {
    let doc = Html::parse_document(html);
    let row_sel = parse_selector("#chapters tbody tr[data-url]")?;
    let link_sel = parse_selector("a[href]")?;
    let time_sel = parse_selector("time[unixtime]")?;
    let mut refs = Vec::new();
    for row in doc.select(&row_sel) {
        let Some(href) = row.value().attr("data-url") else {
            continue;
        };
        let Ok(url) = base.join(href) else {
            continue;
        };
        let title = row
            .select(&link_sel)
            .next()
            .map(element_text)
            .unwrap_or_default();
        let published = row
            .select(&time_sel)
            .next()
            .and_then(|t| t.value().attr("unixtime"))
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0));
        refs.push(ChapterRef {
            ordinal: refs.len() as u32 + 1,
            title,
            locator: url.to_string(),
            published,
            locked: false,
        });
    }
    Ok(refs)
}

/// Find the matching closing bracket for the first '[' in s, skipping content inside JSON strings.
fn extract_json_array_with_strings(s: &str) -> Option<&str> {
    let start = s.find('[')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for (byte_offset, c) in s[start..].char_indices() {
        if in_string {
            if escape {
                escape = false;
                continue;
            }
            if c == '\\' {
                escape = true;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + byte_offset + 1]);
                }
            }
            '"' => in_string = true,
            _ => {}
        }
    }
    None
}

fn hidden_class_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\.([A-Za-z_][\w-]*)\s*\{[^}]*display:\s*none[^}]*\}").ok())
        .as_ref()
}

/// Classes hidden by inline `<style>` blocks. Royal Road injects "stolen content" notices into
/// chapter text and hides them with such rules.
fn hidden_classes(doc: &Html) -> Result<Vec<String>, ScraperError> {
    let style_sel = parse_selector("style")?;
    let mut classes: Vec<String> = Vec::new();
    let Some(re) = hidden_class_regex() else {
        return Ok(classes);
    };
    for style in doc.select(&style_sel) {
        let css = style.text().collect::<String>();
        for cap in re.captures_iter(&css) {
            let class = cap[1].to_string();
            if !classes.contains(&class) {
                classes.push(class);
            }
        }
    }
    Ok(classes)
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Serialize `el` with every spoiler box shown inline: a `[SPOILER - title]` header in bold
/// followed by the box's `.spoiler-inner` content without its `display: none` style. The toggle
/// input and the title bar are dropped. A box without `.spoiler-inner` is left untouched.
fn with_spoilers_shown(el: ElementRef<'_>, outer: bool) -> Result<String, ScraperError> {
    let spoiler_sel = parse_selector(".spoiler")?;
    let title_sel = parse_selector("div.smalltext")?;
    let inner_sel = parse_selector(".spoilerContent .spoiler-inner")?;
    let mut html = if outer { el.html() } else { el.inner_html() };
    for spoiler in el.select(&spoiler_sel) {
        if spoiler.id() == el.id() {
            continue;
        }
        // Nested boxes are handled when their enclosing box's content is serialized.
        let enclosed = spoiler
            .ancestors()
            .take_while(|a| a.id() != el.id())
            .filter_map(ElementRef::wrap)
            .any(|a| a.value().classes().any(|c| c == "spoiler"));
        if enclosed {
            continue;
        }
        let Some(inner) = spoiler.select(&inner_sel).next() else {
            continue;
        };
        let title = spoiler
            .select(&title_sel)
            .next()
            .map(element_text)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| " ".to_string());
        let shown = format!(
            "<p><strong class=\"spoiler-header\">[SPOILER - {}]</strong></p><div class=\"spoiler-inner\">{}</div>",
            escape_text(&title),
            with_spoilers_shown(inner, false)?
        );
        html = html.replacen(&spoiler.html(), &shown, 1);
    }
    Ok(html)
}

/// Parsed chapter page: title, content markup with author notes placed around it, hidden classes.
struct ChapterPage {
    title: Option<String>,
    markup: String,
    hidden_classes: Vec<String>,
}

fn parse_chapter_page(html: &str, url: &str) -> Result<ChapterPage, ScraperError> {
    let doc = Html::parse_document(html);

    let h1_sel = parse_selector("h1.font-white.break-word, h1")?;
    let og_title_sel = parse_selector("meta[property=\"og:title\"]")?;
    let title = doc
        .select(&h1_sel)
        .next()
        .map(element_text)
        .filter(|s| !s.is_empty())
        .or_else(|| {
            doc.select(&og_title_sel)
                .next()
                .and_then(|e| e.value().attr("content"))
                .map(|s| strip_title_site_suffix(s, TITLE_SUFFIXES))
                .filter(|s| !s.is_empty())
        });

    let content_sel = parse_selector("div.chapter-content")?;
    let content = doc
        .select(&content_sel)
        .next()
        .ok_or_else(|| ScraperError::markup(url, "missing div.chapter-content"))?;

    // Author notes go before or after the content, in document order.
    let note_sel = parse_selector("div.author-note-portlet")?;
    let notes: Vec<ElementRef<'_>> = doc.select(&note_sel).collect();
    let mut before = Vec::new();
    let mut after = Vec::new();
    if !notes.is_empty() {
        let mut seen_content = false;
        for node in doc.root_element().descendants() {
            if node.id() == content.id() {
                seen_content = true;
            } else if let Some(note) = notes.iter().find(|n| n.id() == node.id()) {
                let note = with_spoilers_shown(*note, true)?;
                if seen_content {
                    after.push(note);
                } else {
                    before.push(note);
                }
            }
        }
    }

    let mut parts = before;
    parts.push(with_spoilers_shown(content, true)?);
    parts.extend(after);

    Ok(ChapterPage {
        title,
        markup: parts.join("<hr/>"),
        hidden_classes: hidden_classes(&doc)?,
    })
}

impl SiteAdapter for RoyalRoad {
    fn id(&self) -> &'static str {
        "royalroad"
    }

    fn name(&self) -> &'static str {
        "Royal Road"
    }

    fn patterns(&self) -> &'static [UrlPattern] {
        &PATTERNS
    }

    fn fetch_metadata(&self, session: &Session<'_>, url: &Url) -> Result<StoryIndex, ScraperError> {
        let fiction = fiction_url(url)?;
        let response = session.get(&fiction)?;
        let html = super::decode_body(&response);
        let mut metadata = parse_metadata(&html, &fiction)?;
        let chapters = parse_toc(&html, fiction.as_str())?;
        if metadata.published.is_none() {
            metadata.published = chapters.iter().filter_map(|c| c.published).min();
        }
        if metadata.updated.is_none() {
            metadata.updated = chapters.iter().filter_map(|c| c.published).max();
        }
        Ok(StoryIndex { metadata, chapters })
    }

    fn fetch_chapter(
        &self,
        session: &Session<'_>,
        chapter: &ChapterRef,
    ) -> Result<RawChapter, ScraperError> {
        if chapter.locked {
            return Err(ScraperError::Locked {
                url: chapter.locator.clone(),
            });
        }
        let url = parse_url(&chapter.locator)?;
        let response = session.get_uncached(&url)?;
        let html = super::decode_body(&response);
        let page = parse_chapter_page(&html, &chapter.locator)?;
        Ok(RawChapter {
            markup: page.markup.into_bytes(),
            encoding: "utf-8".to_string(),
            base_url: response.url,
            title: page.title,
            hidden_classes: page.hidden_classes,
        })
    }
}
