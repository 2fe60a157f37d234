//! EPUB 3 assembler. Consumes a fetched [Story] and writes mimetype, container, OPF, nav/NCX,
//! stylesheet, optional cover and contents pages, chapters and images.
//!
//! The whole package is planned in memory and checked before the first byte is written: every
//! image reference must resolve to a packaged asset, and the manifest is derived from the same
//! file list that goes into the archive.

use crate::model::{Block, ChapterGap, Inline, InlineStyle, Story, StoryEntry};
use chrono::Utc;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fmt;
use std::io::{Seek, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const CONTAINER_XML: &[u8] = b"<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<container version=\"1.0\" xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\">\n  <rootfiles>\n    <rootfile full-path=\"OEBPS/content.opf\" media-type=\"application/oebps-package+xml\"/>\n  </rootfiles>\n</container>";

const MIMETYPE: &[u8] = b"application/epub+zip";
const OEBPS_PREFIX: &str = "OEBPS/";
const XHTML: &str = "application/xhtml+xml";

const STYLE_CSS: &str = "body { font-family: serif; line-height: 1.4; margin: 0 5%; }
h1 { font-size: 1.4em; margin: 1.5em 0 1em; text-align: center; }
p { margin: 0 0 0.8em; text-indent: 0; }
hr { border: none; border-top: 1px solid #888; margin: 1.5em 20%; }
div.image { text-align: center; margin: 1em 0; }
div.image img { max-width: 100%; height: auto; }
p.missing { font-style: italic; text-align: center; }
div.cover { text-align: center; margin-top: 3em; }
";

/// What to do with chapters the pipeline could not fetch. No default: callers must choose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingChapterPolicy {
    /// Leave the chapter out; the gap is still listed in the report.
    Skip,
    /// Render a short page stating the chapter is missing and why.
    Placeholder,
}

impl fmt::Display for MissingChapterPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MissingChapterPolicy::Skip => "skip",
            MissingChapterPolicy::Placeholder => "placeholder",
        })
    }
}

impl FromStr for MissingChapterPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(MissingChapterPolicy::Skip),
            "placeholder" => Ok(MissingChapterPolicy::Placeholder),
            other => Err(format!(
                "unknown missing-chapter policy '{}' (expected skip or placeholder)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembleOptions {
    pub missing_chapters: MissingChapterPolicy,
    /// Visible table-of-contents page after the cover.
    pub toc_page: bool,
    /// BCP 47 tag for `dc:language`.
    pub language: String,
}

impl AssembleOptions {
    pub fn new(missing_chapters: MissingChapterPolicy) -> Self {
        AssembleOptions {
            missing_chapters,
            toc_page: true,
            language: "en".to_string(),
        }
    }
}

/// Summary of a written package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssemblyReport {
    /// Every chapter the story was missing, whether skipped or rendered as a placeholder.
    pub gaps: Vec<ChapterGap>,
    pub chapters_written: usize,
    pub placeholders_written: usize,
    pub images_written: usize,
}

/// Errors from the assembler.
///
/// Maps to CLI exit code 3.
#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("Cannot write EPUB: story title is empty.")]
    EmptyTitle,

    #[error("Cannot write EPUB: story has no chapters to render.")]
    NoChapters,

    #[error("Cannot write EPUB: chapter {chapter} references image {id} which the story does not contain.")]
    DanglingImage { chapter: u32, id: String },

    #[error("Cannot write EPUB: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create EPUB file: {path}: {source}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write EPUB archive: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl From<std::io::Error> for AssemblyError {
    fn from(e: std::io::Error) -> Self {
        AssemblyError::Zip(zip::result::ZipError::Io(e))
    }
}

/// One file under `OEBPS/`, manifested exactly once.
#[derive(Debug)]
struct Item {
    id: String,
    href: String,
    media_type: String,
    properties: Option<&'static str>,
    data: Vec<u8>,
}

/// Entry in the reading order.
struct Page<'s> {
    href: String,
    title: &'s str,
}

/// Everything that goes into the archive apart from mimetype, container and the OPF.
struct Package {
    items: Vec<Item>,
    spine: Vec<String>,
    report: AssemblyReport,
}

/// Write `story` to a file at `path`. The archive is built in a temporary file next to `path`
/// and moved into place only when complete.
pub fn write_epub(
    story: &Story,
    path: &Path,
    opts: &AssembleOptions,
) -> Result<AssemblyReport, AssemblyError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| AssemblyError::CreateFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    let report = assemble(story, tmp.as_file(), opts)?;
    tmp.persist(path).map_err(|e| AssemblyError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(report)
}

/// Assemble `story` into `writer` as an EPUB 3 archive.
pub fn assemble<W: Write + Seek>(
    story: &Story,
    writer: W,
    opts: &AssembleOptions,
) -> Result<AssemblyReport, AssemblyError> {
    validate_story(story)?;
    let package = plan(story, opts)?;
    let opf = write_opf(story, &package, opts);

    let mut zip = ZipWriter::new(writer);
    let options_stored = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored)
        .unix_permissions(0o644);
    let options_deflate = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(0o644);

    // Mimetype first, uncompressed (required by OCF)
    zip.start_file("mimetype", options_stored)?;
    zip.write_all(MIMETYPE)?;

    zip.start_file("META-INF/container.xml", options_deflate)?;
    zip.write_all(CONTAINER_XML)?;

    zip.start_file(format!("{}content.opf", OEBPS_PREFIX), options_deflate)?;
    zip.write_all(opf.as_bytes())?;

    for item in &package.items {
        zip.start_file(format!("{}{}", OEBPS_PREFIX, item.href), options_deflate)?;
        zip.write_all(&item.data)?;
    }

    zip.finish()?;
    tracing::info!(
        chapters = package.report.chapters_written,
        placeholders = package.report.placeholders_written,
        images = package.report.images_written,
        "EPUB assembled"
    );
    Ok(package.report)
}

fn validate_story(story: &Story) -> Result<(), AssemblyError> {
    if story.metadata().title.trim().is_empty() {
        return Err(AssemblyError::EmptyTitle);
    }
    if story.chapters().next().is_none() {
        return Err(AssemblyError::NoChapters);
    }
    for chapter in story.chapters() {
        let referenced = chapter.images.iter().chain(chapter.blocks.iter().filter_map(|b| {
            match b {
                Block::Image { id, .. } => Some(id),
                _ => None,
            }
        }));
        for id in referenced {
            if story.image(id).is_none() {
                return Err(AssemblyError::DanglingImage {
                    chapter: chapter.ordinal,
                    id: id.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn chapter_href(ordinal: u32) -> String {
    format!("chapter-{:04}.xhtml", ordinal)
}

fn plan(story: &Story, opts: &AssembleOptions) -> Result<Package, AssemblyError> {
    let mut items = Vec::new();
    let mut spine = Vec::new();
    let mut pages = Vec::new();
    let mut report = AssemblyReport::default();
    let mut used_images = BTreeSet::new();

    for entry in story.entries() {
        let ordinal = entry.ordinal();
        let body = match entry {
            StoryEntry::Chapter(chapter) => {
                used_images.extend(chapter.images.iter().cloned());
                used_images.extend(chapter.blocks.iter().filter_map(|b| match b {
                    Block::Image { id, .. } => Some(id.clone()),
                    _ => None,
                }));
                report.chapters_written += 1;
                render_blocks(story, &chapter.blocks, chapter.ordinal)?
            }
            StoryEntry::Missing(gap) => {
                report.gaps.push(gap.clone());
                match opts.missing_chapters {
                    MissingChapterPolicy::Skip => {
                        tracing::warn!(ordinal, title = %gap.title, "missing chapter left out");
                        continue;
                    }
                    MissingChapterPolicy::Placeholder => {
                        report.placeholders_written += 1;
                        format!(
                            "  <p class=\"missing\">This chapter could not be retrieved ({}).</p>\n",
                            xml_escape(&gap.reason.to_string())
                        )
                    }
                }
            }
        };
        let id = format!("chapter-{:04}", ordinal);
        let href = chapter_href(ordinal);
        items.push(Item {
            id: id.clone(),
            href: href.clone(),
            media_type: XHTML.to_string(),
            properties: None,
            data: xhtml_page(
                entry.title(),
                &format!("  <h1>{}</h1>\n{}", xml_escape(entry.title()), body),
                opts,
            )
            .into_bytes(),
        });
        spine.push(id);
        pages.push(Page {
            href,
            title: entry.title(),
        });
    }

    let mut front = Vec::new();
    let mut front_spine = Vec::new();
    let cover = story.cover().and_then(|id| story.image(id));
    if let Some(asset) = cover {
        used_images.insert(asset.id.clone());
        let body = format!(
            "  <div class=\"cover\">\n    <img src=\"{}\" alt=\"Cover\"/>\n  </div>\n",
            xml_escape(&asset.href())
        );
        front.push(cover_item(xhtml_page("Cover", &body, opts)));
        front_spine.push("cover".to_string());
    } else if story.metadata().cover_url.is_some() {
        // Cover could not be downloaded: title-only cover page.
        let m = story.metadata();
        let body = format!(
            "  <div class=\"cover\">\n    <h1>{}</h1>\n    <p>{}</p>\n  </div>\n",
            xml_escape(&m.title),
            xml_escape(&m.author)
        );
        front.push(cover_item(xhtml_page("Cover", &body, opts)));
        front_spine.push("cover".to_string());
    }
    if opts.toc_page {
        front.push(Item {
            id: "toc-page".to_string(),
            href: "toc.xhtml".to_string(),
            media_type: XHTML.to_string(),
            properties: None,
            data: toc_page(&pages, opts).into_bytes(),
        });
        front_spine.push("toc-page".to_string());
    }

    let mut all = vec![
        Item {
            id: "nav".to_string(),
            href: "nav.xhtml".to_string(),
            media_type: XHTML.to_string(),
            properties: Some("nav"),
            data: nav_xhtml(&pages, opts).into_bytes(),
        },
        Item {
            id: "ncx".to_string(),
            href: "toc.ncx".to_string(),
            media_type: "application/x-dtbncx+xml".to_string(),
            properties: None,
            data: ncx(story, &pages).into_bytes(),
        },
        Item {
            id: "css".to_string(),
            href: "style.css".to_string(),
            media_type: "text/css".to_string(),
            properties: None,
            data: STYLE_CSS.as_bytes().to_vec(),
        },
    ];
    all.append(&mut front);
    all.append(&mut items);

    // Only images some page actually shows are packaged.
    for id in &used_images {
        let Some(asset) = story.image(id) else {
            continue;
        };
        let is_cover = story.cover() == Some(id);
        all.push(Item {
            id: asset.id.to_string(),
            href: asset.href(),
            media_type: asset.media_type.clone(),
            properties: is_cover.then_some("cover-image"),
            data: asset.data.clone(),
        });
        report.images_written += 1;
    }

    front_spine.append(&mut spine);
    Ok(Package {
        items: all,
        spine: front_spine,
        report,
    })
}

fn cover_item(page: String) -> Item {
    Item {
        id: "cover".to_string(),
        href: "cover.xhtml".to_string(),
        media_type: XHTML.to_string(),
        properties: None,
        data: page.into_bytes(),
    }
}

fn render_blocks(story: &Story, blocks: &[Block], ordinal: u32) -> Result<String, AssemblyError> {
    let mut out = String::new();
    for block in blocks {
        match block {
            Block::Paragraph(inlines) => {
                out.push_str("  <p>");
                render_inlines(&mut out, inlines);
                out.push_str("</p>\n");
            }
            Block::Heading { level, text } => {
                let level = (*level).clamp(2, 6);
                out.push_str(&format!("  <h{0}>{1}</h{0}>\n", level, xml_escape(text)));
            }
            Block::Image { id, alt } => {
                let asset = story.image(id).ok_or_else(|| AssemblyError::DanglingImage {
                    chapter: ordinal,
                    id: id.to_string(),
                })?;
                out.push_str(&format!(
                    "  <div class=\"image\"><img src=\"{}\" alt=\"{}\"/></div>\n",
                    xml_escape(&asset.href()),
                    xml_escape(alt)
                ));
            }
            Block::Rule => out.push_str("  <hr/>\n"),
        }
    }
    Ok(out)
}

fn render_inlines(out: &mut String, inlines: &[Inline]) {
    for inline in inlines {
        match inline {
            Inline::Text { text, style } => {
                let text = xml_escape(text);
                match style {
                    InlineStyle::Plain => out.push_str(&text),
                    InlineStyle::Emphasis => out.push_str(&format!("<em>{}</em>", text)),
                    InlineStyle::Strong => out.push_str(&format!("<strong>{}</strong>", text)),
                }
            }
            Inline::Break => out.push_str("<br/>"),
        }
    }
}

fn xhtml_page(title: &str, body: &str, opts: &AssembleOptions) -> String {
    let lang = xml_escape(&opts.language);
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE html>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops" xml:lang="{lang}" lang="{lang}">
<head>
  <meta charset="UTF-8"/>
  <title>{title}</title>
  <link rel="stylesheet" type="text/css" href="style.css"/>
</head>
<body>
{body}</body>
</html>
"#,
        lang = lang,
        title = xml_escape(title),
        body = body
    )
}

fn nav_xhtml(pages: &[Page<'_>], opts: &AssembleOptions) -> String {
    let mut nav_links = String::new();
    for page in pages {
        nav_links.push_str(&format!(
            "      <li><a href=\"{}\">{}</a></li>\n",
            page.href,
            xml_escape(page.title)
        ));
    }
    let body = format!(
        "  <nav epub:type=\"toc\" id=\"toc\">\n    <h1>Contents</h1>\n    <ol>\n{}    </ol>\n  </nav>\n",
        nav_links
    );
    xhtml_page("Table of Contents", &body, opts)
}

/// Visible table-of-contents page (toc.xhtml), placed after the cover.
fn toc_page(pages: &[Page<'_>], opts: &AssembleOptions) -> String {
    let mut items = String::new();
    for page in pages {
        items.push_str(&format!(
            "    <li><a href=\"{}\">{}</a></li>\n",
            page.href,
            xml_escape(page.title)
        ));
    }
    xhtml_page(
        "Table of Contents",
        &format!("  <h1>Table of Contents</h1>\n  <ol>\n{}  </ol>\n", items),
        opts,
    )
}

fn identifier(story: &Story) -> String {
    story.metadata().source_url.clone()
}

fn ncx(story: &Story, pages: &[Page<'_>]) -> String {
    let mut nav_points = String::new();
    for (i, page) in pages.iter().enumerate() {
        nav_points.push_str(&format!(
            r#"    <navPoint id="navpoint-{n}" playOrder="{n}">
      <navLabel><text>{label}</text></navLabel>
      <content src="{href}"/>
    </navPoint>
"#,
            n = i + 1,
            label = xml_escape(page.title),
            href = page.href
        ));
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head>
    <meta name="dtb:uid" content="{}"/>
  </head>
  <docTitle>
    <text>{}</text>
  </docTitle>
  <navMap>
{}  </navMap>
</ncx>
"#,
        xml_escape(&identifier(story)),
        xml_escape(&story.metadata().title),
        nav_points
    )
}

/// Package document. The manifest lists every planned item; the OPF itself is not an item.
fn write_opf(story: &Story, package: &Package, opts: &AssembleOptions) -> String {
    let m = story.metadata();
    let mut meta = String::new();
    meta.push_str(&format!(
        "    <dc:identifier id=\"book-id\">{}</dc:identifier>\n",
        xml_escape(&identifier(story))
    ));
    meta.push_str(&format!("    <dc:title>{}</dc:title>\n", xml_escape(&m.title)));
    if !m.author.trim().is_empty() {
        meta.push_str(&format!("    <dc:creator>{}</dc:creator>\n", xml_escape(&m.author)));
    }
    meta.push_str(&format!(
        "    <dc:language>{}</dc:language>\n",
        xml_escape(&opts.language)
    ));
    if !m.summary.trim().is_empty() {
        meta.push_str(&format!(
            "    <dc:description>{}</dc:description>\n",
            xml_escape(&m.summary)
        ));
    }
    for tag in &m.tags {
        meta.push_str(&format!("    <dc:subject>{}</dc:subject>\n", xml_escape(tag)));
    }
    if let Some(published) = m.published {
        meta.push_str(&format!(
            "    <dc:date>{}</dc:date>\n",
            published.format("%Y-%m-%d")
        ));
    }
    meta.push_str(&format!("    <dc:source>{}</dc:source>\n", xml_escape(&m.source_url)));
    let modified = m.updated.or(m.published).unwrap_or_else(Utc::now);
    meta.push_str(&format!(
        "    <meta property=\"dcterms:modified\">{}</meta>\n",
        modified.format("%Y-%m-%dT%H:%M:%SZ")
    ));
    if let Some(cover) = story.cover() {
        if package.items.iter().any(|i| i.id == cover.as_str()) {
            meta.push_str(&format!("    <meta name=\"cover\" content=\"{}\"/>\n", cover));
        }
    }

    let mut manifest = String::new();
    for item in &package.items {
        let properties = item
            .properties
            .map(|p| format!(" properties=\"{}\"", p))
            .unwrap_or_default();
        manifest.push_str(&format!(
            "    <item id=\"{}\" href=\"{}\" media-type=\"{}\"{}/>\n",
            xml_escape(&item.id),
            xml_escape(&item.href),
            xml_escape(&item.media_type),
            properties
        ));
    }

    let mut spine = String::new();
    for idref in &package.spine {
        spine.push_str(&format!("    <itemref idref=\"{}\"/>\n", idref));
    }
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" unique-identifier="book-id" version="3.0" xml:lang="{lang}">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
{meta}  </metadata>
  <manifest>
{manifest}  </manifest>
  <spine toc="ncx">
{spine}  </spine>
</package>
"#,
        lang = xml_escape(&opts.language),
        meta = meta,
        manifest = manifest,
        spine = spine
    )
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
