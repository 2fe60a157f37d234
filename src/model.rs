//! Canonical data model for a fetched story.
//!
//! Adapters produce [StoryMetadata] and [ChapterRef]s, the normalizer produces [Block]s,
//! the pipeline owns the resulting [Story], and the EPUB assembler consumes it read-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Story-level metadata. Built once by an adapter and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct StoryMetadata {
    pub title: String,
    pub author: String,
    pub source_url: String,
    /// Plain-text summary; empty when the site has none.
    pub summary: String,
    pub tags: BTreeSet<String>,
    pub published: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub cover_url: Option<String>,
}

impl StoryMetadata {
    /// Title and source URL must be non-empty.
    pub fn validate(&self) -> Result<(), String> {
        if self.title.trim().is_empty() {
            return Err("story title is empty".to_string());
        }
        if self.source_url.trim().is_empty() {
            return Err("story source URL is empty".to_string());
        }
        Ok(())
    }
}

/// Pointer to one chapter before its content is fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterRef {
    /// 1-based position in reading order.
    pub ordinal: u32,
    pub title: String,
    /// Site-specific locator (absolute chapter URL for both supported sites).
    pub locator: String,
    pub published: Option<DateTime<Utc>>,
    /// Premium/locked chapter; adapters refuse to fetch these.
    pub locked: bool,
}

impl ChapterRef {
    /// Reassign dense 1-based ordinals in current order.
    pub fn renumber(refs: &mut [ChapterRef]) {
        for (i, r) in refs.iter_mut().enumerate() {
            r.ordinal = i as u32 + 1;
        }
    }
}

/// Stable identifier of an image inside one story, derived from its origin URL.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ImageId(String);

impl ImageId {
    pub fn from_origin(origin_url: &str) -> Self {
        let digest = Sha256::digest(origin_url.as_bytes());
        let hex = hex::encode(digest);
        ImageId(format!("img-{}", &hex[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InlineStyle {
    Plain,
    Emphasis,
    Strong,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Inline {
    Text { text: String, style: InlineStyle },
    Break,
}

/// One node of the canonical content tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Block {
    Paragraph(Vec<Inline>),
    Heading { level: u8, text: String },
    Image { id: ImageId, alt: String },
    Rule,
}

impl Block {
    /// Plain-text paragraph.
    pub fn text(s: impl Into<String>) -> Self {
        Block::Paragraph(vec![Inline::Text {
            text: s.into(),
            style: InlineStyle::Plain,
        }])
    }
}

/// Image discovered during normalization, not yet downloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub id: ImageId,
    pub origin_url: String,
}

/// A chapter after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub ordinal: u32,
    pub title: String,
    pub blocks: Vec<Block>,
    /// Image ids used by `blocks`, in order of first use.
    pub images: Vec<ImageId>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ImageAsset {
    pub id: ImageId,
    pub origin_url: String,
    pub data: Vec<u8>,
    pub media_type: String,
}

impl ImageAsset {
    /// File extension matching the media type.
    pub fn extension(&self) -> &'static str {
        match self.media_type.as_str() {
            "image/jpeg" => "jpg",
            "image/gif" => "gif",
            "image/webp" => "webp",
            "image/svg+xml" => "svg",
            _ => "png",
        }
    }

    /// Archive path relative to the content directory.
    pub fn href(&self) -> String {
        format!("images/{}.{}", self.id, self.extension())
    }
}

/// Why a chapter is missing from the story.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapReason {
    NotFound,
    MarkupChanged,
    Locked,
    Network,
    Cancelled,
}

impl fmt::Display for GapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GapReason::NotFound => "not found",
            GapReason::MarkupChanged => "page layout changed",
            GapReason::Locked => "locked",
            GapReason::Network => "network error",
            GapReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Recorded per-chapter failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterGap {
    pub ordinal: u32,
    pub title: String,
    pub reason: GapReason,
    pub message: String,
}

#[derive(Debug, Clone)]
pub enum StoryEntry {
    Chapter(Chapter),
    Missing(ChapterGap),
}

impl StoryEntry {
    pub fn ordinal(&self) -> u32 {
        match self {
            StoryEntry::Chapter(c) => c.ordinal,
            StoryEntry::Missing(g) => g.ordinal,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            StoryEntry::Chapter(c) => &c.title,
            StoryEntry::Missing(g) => &g.title,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoryStatus {
    Complete,
    MissingChapters(usize),
}

/// Tri-state result surface, together with the `Err` channel for fatal failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Complete,
    CompletedWithWarnings {
        missing: Vec<u32>,
        warnings: usize,
    },
}

/// A fetched story. Owns its chapters and images.
#[derive(Debug, Clone)]
pub struct Story {
    metadata: StoryMetadata,
    entries: Vec<StoryEntry>,
    images: BTreeMap<ImageId, ImageAsset>,
    cover: Option<ImageId>,
    warnings: Vec<String>,
}

impl Story {
    /// Entries must already be in ordinal order, one per chapter ref.
    pub fn new(metadata: StoryMetadata, entries: Vec<StoryEntry>) -> Self {
        Story {
            metadata,
            entries,
            images: BTreeMap::new(),
            cover: None,
            warnings: Vec::new(),
        }
    }

    pub fn metadata(&self) -> &StoryMetadata {
        &self.metadata
    }

    pub fn entries(&self) -> &[StoryEntry] {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [StoryEntry] {
        &mut self.entries
    }

    pub fn chapters(&self) -> impl Iterator<Item = &Chapter> {
        self.entries.iter().filter_map(|e| match e {
            StoryEntry::Chapter(c) => Some(c),
            StoryEntry::Missing(_) => None,
        })
    }

    pub fn gaps(&self) -> impl Iterator<Item = &ChapterGap> {
        self.entries.iter().filter_map(|e| match e {
            StoryEntry::Missing(g) => Some(g),
            StoryEntry::Chapter(_) => None,
        })
    }

    pub fn images(&self) -> &BTreeMap<ImageId, ImageAsset> {
        &self.images
    }

    pub fn image(&self, id: &ImageId) -> Option<&ImageAsset> {
        self.images.get(id)
    }

    /// Insert an asset unless one with the same id (same origin URL) is already owned.
    pub fn add_image(&mut self, asset: ImageAsset) {
        self.images.entry(asset.id.clone()).or_insert(asset);
    }

    pub fn cover(&self) -> Option<&ImageId> {
        self.cover.as_ref()
    }

    pub fn set_cover(&mut self, id: ImageId) {
        self.cover = Some(id);
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn status(&self) -> StoryStatus {
        match self.gaps().count() {
            0 => StoryStatus::Complete,
            n => StoryStatus::MissingChapters(n),
        }
    }

    /// Count of all warnings: story-level, per-chapter, and one per gap.
    pub fn warning_count(&self) -> usize {
        let chapter_warnings: usize = self.chapters().map(|c| c.warnings.len()).sum();
        self.warnings.len() + chapter_warnings + self.gaps().count()
    }

    pub fn outcome(&self) -> Outcome {
        let warnings = self.warning_count();
        if warnings == 0 {
            Outcome::Complete
        } else {
            Outcome::CompletedWithWarnings {
                missing: self.gaps().map(|g| g.ordinal).collect(),
                warnings,
            }
        }
    }
}
