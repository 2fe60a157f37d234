//! Content normalizer: raw chapter markup in, canonical [Block]s out.
//!
//! Never fails. Anything it cannot interpret is reported as a warning on the chapter and the
//! best-effort result is returned.

use crate::model::{Block, ImageId, ImageRef, Inline, InlineStyle};
use crate::scraper::RawChapter;
use ego_tree::NodeRef;
use encoding_rs::Encoding;
use reqwest::Url;
use scraper::node::Element;
use scraper::{Html, Node};

/// Elements that never carry story content.
const CHROME: &[&str] = &[
    "script", "style", "nav", "header", "footer", "aside", "form", "iframe", "noscript",
    "button", "input", "select", "textarea", "svg", "object", "embed", "head", "title", "meta",
    "link", "template",
];

/// Elements that end the current paragraph before and after their content.
const BLOCK_CONTAINERS: &[&str] = &[
    "p", "div", "section", "article", "main", "blockquote", "li", "ul", "ol", "dl", "dt", "dd",
    "table", "thead", "tbody", "tfoot", "tr", "td", "th", "pre", "figure", "figcaption",
    "center", "details", "summary", "address",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedChapter {
    pub blocks: Vec<Block>,
    /// Images referenced by `blocks`, unique, in order of first use.
    pub images: Vec<ImageRef>,
    pub warnings: Vec<String>,
}

/// Decode `bytes` using the encoding named by `label`. Unknown labels fall back to UTF-8 and
/// malformed sequences are replaced; both add a warning.
pub fn decode_markup(bytes: &[u8], label: &str) -> (String, Vec<String>) {
    let mut warnings = Vec::new();
    let encoding = match Encoding::for_label(label.trim().as_bytes()) {
        Some(e) => e,
        None => {
            warnings.push(format!("unknown encoding '{}', decoded as UTF-8", label));
            encoding_rs::UTF_8
        }
    };
    let (text, used, had_errors) = encoding.decode(bytes);
    if had_errors {
        warnings.push(format!(
            "malformed {} byte sequences replaced",
            used.name()
        ));
    }
    (text.into_owned(), warnings)
}

pub fn normalize(raw: &RawChapter) -> NormalizedChapter {
    let (text, mut warnings) = decode_markup(&raw.markup, &raw.encoding);
    let fragment = Html::parse_fragment(&text);

    let mut walker = Walker {
        base: &raw.base_url,
        hidden: &raw.hidden_classes,
        blocks: Vec::new(),
        current: Vec::new(),
        images: Vec::new(),
        warnings: Vec::new(),
        saw_block: false,
        in_heading: false,
        heading_images: Vec::new(),
    };
    walker.walk_children(fragment.tree.root(), InlineStyle::Plain);
    walker.flush();
    warnings.append(&mut walker.warnings);

    let mut blocks = walker.blocks;
    if !walker.saw_block {
        let plain = plain_text(&blocks);
        blocks = if plain.is_empty() {
            Vec::new()
        } else {
            warnings.push("no block structure found; content kept as one paragraph".to_string());
            vec![Block::text(plain)]
        };
    }
    if !blocks.iter().any(has_text) && walker.images.is_empty() {
        warnings.push("chapter has no text".to_string());
    }

    NormalizedChapter {
        blocks,
        images: walker.images,
        warnings,
    }
}

fn has_text(block: &Block) -> bool {
    match block {
        Block::Paragraph(inlines) => inlines.iter().any(|i| match i {
            Inline::Text { text, .. } => !text.trim().is_empty(),
            Inline::Break => false,
        }),
        Block::Heading { text, .. } => !text.trim().is_empty(),
        Block::Image { .. } | Block::Rule => false,
    }
}

fn plain_text(blocks: &[Block]) -> String {
    let mut out = String::new();
    for block in blocks {
        if let Block::Paragraph(inlines) = block {
            for inline in inlines {
                match inline {
                    Inline::Text { text, .. } => push_collapsed(&mut out, text),
                    Inline::Break => push_collapsed(&mut out, " "),
                }
            }
            push_collapsed(&mut out, " ");
        }
    }
    out.trim().to_string()
}

/// Append `text` with whitespace runs collapsed to one space, also across the boundary.
fn push_collapsed(out: &mut String, text: &str) {
    let mut prev_space = out.is_empty() || out.ends_with(' ');
    for c in text.chars() {
        if c.is_whitespace() {
            if !prev_space {
                out.push(' ');
                prev_space = true;
            }
        } else {
            out.push(c);
            prev_space = false;
        }
    }
}

/// Strong wins over Emphasis, Emphasis over Plain.
fn combine(outer: InlineStyle, inner: InlineStyle) -> InlineStyle {
    match (outer, inner) {
        (InlineStyle::Strong, _) | (_, InlineStyle::Strong) => InlineStyle::Strong,
        (InlineStyle::Emphasis, _) | (_, InlineStyle::Emphasis) => InlineStyle::Emphasis,
        _ => InlineStyle::Plain,
    }
}

struct Walker<'a> {
    base: &'a Url,
    hidden: &'a [String],
    blocks: Vec<Block>,
    current: Vec<Inline>,
    images: Vec<ImageRef>,
    warnings: Vec<String>,
    saw_block: bool,
    /// Images met inside a heading are held here and emitted after it.
    in_heading: bool,
    heading_images: Vec<Block>,
}

impl Walker<'_> {
    fn walk_children(&mut self, node: NodeRef<'_, Node>, style: InlineStyle) {
        for child in node.children() {
            self.walk(child, style);
        }
    }

    fn walk(&mut self, node: NodeRef<'_, Node>, style: InlineStyle) {
        match node.value() {
            Node::Text(t) => self.push_text(t, style),
            Node::Element(e) => self.element(node, e, style),
            Node::Document | Node::Fragment => self.walk_children(node, style),
            _ => {}
        }
    }

    fn is_hidden(&self, e: &Element) -> bool {
        if e.classes().any(|c| self.hidden.iter().any(|h| h == c)) {
            return true;
        }
        e.attr("style")
            .map(|s| {
                let s: String = s.chars().filter(|c| !c.is_whitespace()).collect();
                s.to_ascii_lowercase().contains("display:none")
            })
            .unwrap_or(false)
    }

    fn element(&mut self, node: NodeRef<'_, Node>, e: &Element, style: InlineStyle) {
        let name = e.name();
        if CHROME.contains(&name) || self.is_hidden(e) {
            return;
        }
        match name {
            "br" => self.current.push(Inline::Break),
            "hr" => {
                self.flush();
                self.blocks.push(Block::Rule);
                self.saw_block = true;
            }
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                self.flush();
                self.saw_block = true;
                let level = name.as_bytes()[1] - b'0';
                let outer = std::mem::take(&mut self.current);
                let nested = std::mem::replace(&mut self.in_heading, true);
                self.walk_children(node, InlineStyle::Plain);
                self.in_heading = nested;
                let inner = std::mem::replace(&mut self.current, outer);
                let mut text = String::new();
                for inline in &inner {
                    match inline {
                        Inline::Text { text: t, .. } => push_collapsed(&mut text, t),
                        Inline::Break => push_collapsed(&mut text, " "),
                    }
                }
                let text = text.trim().to_string();
                if !text.is_empty() {
                    self.blocks.push(Block::Heading { level, text });
                }
                if !nested {
                    self.blocks.append(&mut self.heading_images);
                }
            }
            "img" => self.image(e),
            "strong" | "b" => self.walk_children(node, combine(style, InlineStyle::Strong)),
            "em" | "i" | "cite" | "dfn" => {
                self.walk_children(node, combine(style, InlineStyle::Emphasis))
            }
            _ if BLOCK_CONTAINERS.contains(&name) => {
                self.flush();
                self.saw_block = true;
                self.walk_children(node, style);
                self.flush();
            }
            _ => self.walk_children(node, style),
        }
    }

    fn image(&mut self, e: &Element) {
        let Some(src) = e
            .attr("src")
            .or_else(|| e.attr("data-src"))
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            self.warnings.push("image without a source dropped".to_string());
            return;
        };
        if src.starts_with("data:") {
            self.warnings.push("inline data: image dropped".to_string());
            return;
        }
        let origin = match self.base.join(src) {
            Ok(u) => u,
            Err(err) => {
                self.warnings
                    .push(format!("image with unusable source '{}' dropped: {}", src, err));
                return;
            }
        };
        let id = ImageId::from_origin(origin.as_str());
        if !self.images.iter().any(|i| i.id == id) {
            self.images.push(ImageRef {
                id: id.clone(),
                origin_url: origin.to_string(),
            });
        }
        self.saw_block = true;
        let alt = e.attr("alt").map(|a| a.trim().to_string()).unwrap_or_default();
        if self.in_heading {
            self.heading_images.push(Block::Image { id, alt });
            return;
        }
        self.flush();
        self.blocks.push(Block::Image { id, alt });
    }

    fn push_text(&mut self, text: &str, style: InlineStyle) {
        let prev_space = match self.current.last() {
            None | Some(Inline::Break) => true,
            Some(Inline::Text { text, .. }) => text.ends_with(' '),
        };
        let mut collapsed = if prev_space {
            String::new()
        } else {
            // Sentinel so push_collapsed keeps a single leading space.
            String::from("x")
        };
        push_collapsed(&mut collapsed, text);
        if !prev_space {
            collapsed.remove(0);
        }
        if collapsed.is_empty() {
            return;
        }
        if let Some(Inline::Text { text: last, style: last_style }) = self.current.last_mut() {
            if *last_style == style {
                last.push_str(&collapsed);
                return;
            }
        }
        self.current.push(Inline::Text {
            text: collapsed,
            style,
        });
    }

    /// Close the current paragraph: trim whitespace at its edges and around line breaks, drop
    /// it entirely when nothing visible remains.
    fn flush(&mut self) {
        let mut inlines = std::mem::take(&mut self.current);
        while matches!(inlines.first(), Some(Inline::Break)) {
            inlines.remove(0);
        }
        while matches!(inlines.last(), Some(Inline::Break)) {
            inlines.pop();
        }
        let len = inlines.len();
        for i in 0..len {
            let after_edge = i == 0 || matches!(inlines[i - 1], Inline::Break);
            let before_edge = i + 1 == len || matches!(inlines[i + 1], Inline::Break);
            if let Inline::Text { text, .. } = &mut inlines[i] {
                if after_edge {
                    *text = text.trim_start().to_string();
                }
                if before_edge {
                    *text = text.trim_end().to_string();
                }
            }
        }
        inlines.retain(|i| !matches!(i, Inline::Text { text, .. } if text.is_empty()));
        let visible = inlines
            .iter()
            .any(|i| matches!(i, Inline::Text { text, .. } if !text.is_empty()));
        if visible {
            self.blocks.push(Block::Paragraph(inlines));
        }
    }
}
