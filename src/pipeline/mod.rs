//! Fetch pipeline: drives one site adapter through a [Session] to produce a [Story].
//!
//! Metadata failures are fatal. Everything chapter-scoped is recorded as a [ChapterGap] and the
//! run continues, so the returned story always has one entry per chapter reference.

mod retry;

pub use retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS};

use crate::cache::{timestamp_bucket, CacheKey, ContentCache};
use crate::model::{
    Block, Chapter, ChapterGap, ChapterRef, GapReason, ImageAsset, ImageId, ImageRef, Story,
    StoryEntry,
};
use crate::normalize::normalize;
use crate::scraper::{
    AdapterRegistry, RegistryError, Response, ScraperError, Session, SiteAdapter, StoryIndex,
    Transport,
};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Default lifetime of cached pages and chapters.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    NotSupported(#[from] RegistryError),

    #[error("Could not fetch story index from {url}: {source}")]
    MetadataFetch {
        url: String,
        #[source]
        source: ScraperError,
    },

    #[error("Chapter range {from}-{to} selects nothing (story has {total} chapters)")]
    EmptyRange { from: u32, to: u32, total: usize },
}

/// Cooperative cancellation flag, checked between chapters.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-site settings from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SiteOverrides {
    /// Replaces the adapter's minimum request interval.
    pub request_interval: Option<Duration>,
    /// Opaque credential sent as the `Cookie` header.
    pub cookie: Option<String>,
}

pub struct FetchOptions<'a> {
    pub include_images: bool,
    /// 1-based inclusive range of chapters to keep; ordinals are renumbered afterwards.
    pub chapter_range: Option<(u32, u32)>,
    /// Worker threads for chapter fetches. Only used when the adapter is concurrent-safe.
    pub workers: usize,
    pub cache_ttl: Duration,
    pub retry: RetryPolicy,
    /// Adapter id to use instead of resolving by URL.
    pub site_override: Option<String>,
    /// Keyed by adapter id.
    pub sites: HashMap<String, SiteOverrides>,
    /// Called with (done, total) after each chapter.
    pub progress: Option<&'a (dyn Fn(u32, u32) + Sync)>,
    pub cancel: Option<CancelToken>,
}

impl Default for FetchOptions<'_> {
    fn default() -> Self {
        FetchOptions {
            include_images: true,
            chapter_range: None,
            workers: 1,
            cache_ttl: DEFAULT_CACHE_TTL,
            retry: RetryPolicy::default(),
            site_override: None,
            sites: HashMap::new(),
            progress: None,
            cancel: None,
        }
    }
}

impl FetchOptions<'_> {
    fn cancelled(&self) -> bool {
        self.cancel.as_ref().map(|c| c.is_cancelled()).unwrap_or(false)
    }
}

/// Normalized chapter as stored in the chapter cache.
#[derive(Debug, Serialize, Deserialize)]
struct CachedChapter {
    chapter: Chapter,
    images: Vec<ImageRef>,
}

pub struct FetchPipeline<'a> {
    registry: &'a AdapterRegistry,
    transport: &'a dyn Transport,
    cache: &'a dyn ContentCache,
}

impl<'a> FetchPipeline<'a> {
    pub fn new(
        registry: &'a AdapterRegistry,
        transport: &'a dyn Transport,
        cache: &'a dyn ContentCache,
    ) -> Self {
        FetchPipeline {
            registry,
            transport,
            cache,
        }
    }

    /// Adapter for `url`, or the explicitly requested one.
    pub fn adapter_for(
        &self,
        url: &str,
        opts: &FetchOptions<'_>,
    ) -> Result<&'a dyn SiteAdapter, PipelineError> {
        let adapter = match &opts.site_override {
            Some(id) => self.registry.by_id(id)?,
            None => self.registry.resolve(url)?,
        };
        Ok(adapter)
    }

    fn session(&self, adapter: &dyn SiteAdapter, opts: &FetchOptions<'_>) -> Session<'a> {
        let site = opts.sites.get(adapter.id());
        let interval = site
            .and_then(|s| s.request_interval)
            .unwrap_or_else(|| adapter.min_request_interval());
        let session = Session::new(self.transport, self.cache, interval, opts.cache_ttl);
        match site.and_then(|s| s.cookie.as_deref()) {
            Some(cookie) => session.with_header("Cookie", cookie),
            None => session,
        }
    }

    /// Metadata and the (range-filtered) chapter list only. Used for dry runs.
    pub fn fetch_index(&self, url: &str, opts: &FetchOptions<'_>) -> Result<StoryIndex, PipelineError> {
        let adapter = self.adapter_for(url, opts)?;
        let session = self.session(adapter, opts);
        self.index(adapter, &session, url, opts)
    }

    fn index(
        &self,
        adapter: &dyn SiteAdapter,
        session: &Session<'_>,
        url: &str,
        opts: &FetchOptions<'_>,
    ) -> Result<StoryIndex, PipelineError> {
        let metadata_error = |source| PipelineError::MetadataFetch {
            url: url.to_string(),
            source,
        };
        let parsed = Url::parse(url.trim()).map_err(|e| {
            metadata_error(ScraperError::InvalidUrl {
                input: url.to_string(),
                reason: e.to_string(),
            })
        })?;
        tracing::info!(site = adapter.name(), url = %parsed, "fetching story index");
        let mut index = opts
            .retry
            .run(url, || adapter.fetch_metadata(session, &parsed))
            .map_err(metadata_error)?;
        index
            .metadata
            .validate()
            .map_err(|detail| metadata_error(ScraperError::markup(url, detail)))?;
        if index.chapters.is_empty() {
            return Err(metadata_error(ScraperError::markup(
                url,
                "story lists no chapters",
            )));
        }
        if let Some((from, to)) = opts.chapter_range {
            let total = index.chapters.len();
            index.chapters.retain(|c| c.ordinal >= from && c.ordinal <= to);
            if index.chapters.is_empty() {
                return Err(PipelineError::EmptyRange { from, to, total });
            }
        }
        ChapterRef::renumber(&mut index.chapters);
        Ok(index)
    }

    /// Fetch the whole story: index, chapters (in parallel when the adapter allows it), images.
    pub fn fetch_story(&self, url: &str, opts: &FetchOptions<'_>) -> Result<Story, PipelineError> {
        let adapter = self.adapter_for(url, opts)?;
        let session = self.session(adapter, opts);
        let StoryIndex { metadata, chapters } = self.index(adapter, &session, url, opts)?;

        let workers = if adapter.concurrent_safe() {
            opts.workers.clamp(1, chapters.len().max(1))
        } else {
            1
        };
        tracing::info!(
            title = %metadata.title,
            chapters = chapters.len(),
            workers,
            "fetching chapters"
        );

        let total = chapters.len() as u32;
        let done = AtomicU32::new(0);
        let mut slots: Vec<Option<(StoryEntry, Vec<ImageRef>)>> = vec![None; chapters.len()];
        let fetch = |slot: &mut Option<(StoryEntry, Vec<ImageRef>)>, chapter: &ChapterRef| {
            *slot = Some(self.fetch_chapter(adapter, &session, chapter, opts));
            let n = done.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(progress) = opts.progress {
                progress(n, total);
            }
        };

        if workers <= 1 {
            for (slot, chapter) in slots.iter_mut().zip(&chapters) {
                fetch(slot, chapter);
            }
        } else {
            // Each worker owns a contiguous run of slots; no slot is shared.
            let chunk = chapters.len().div_ceil(workers);
            std::thread::scope(|scope| {
                for (slot_chunk, ref_chunk) in slots.chunks_mut(chunk).zip(chapters.chunks(chunk)) {
                    let fetch = &fetch;
                    scope.spawn(move || {
                        for (slot, chapter) in slot_chunk.iter_mut().zip(ref_chunk) {
                            fetch(slot, chapter);
                        }
                    });
                }
            });
        }

        let mut image_refs: BTreeMap<ImageId, String> = BTreeMap::new();
        let entries: Vec<StoryEntry> = slots
            .into_iter()
            .zip(&chapters)
            .map(|(slot, chapter)| match slot {
                Some((entry, images)) => {
                    for image in images {
                        image_refs.entry(image.id).or_insert(image.origin_url);
                    }
                    entry
                }
                None => StoryEntry::Missing(gap(chapter, GapReason::Cancelled, "not fetched")),
            })
            .collect();

        let cover_url = metadata.cover_url.clone();
        let mut story = Story::new(metadata, entries);
        if opts.include_images {
            self.resolve_images(&mut story, &session, &image_refs, opts);
            if let Some(cover) = cover_url {
                self.resolve_cover(&mut story, &session, &cover, opts);
            }
        } else {
            strip_images(&mut story);
        }

        tracing::info!(
            chapters = story.chapters().count(),
            missing = story.gaps().count(),
            images = story.images().len(),
            "story fetched"
        );
        Ok(story)
    }

    fn fetch_chapter(
        &self,
        adapter: &dyn SiteAdapter,
        session: &Session<'_>,
        chapter: &ChapterRef,
        opts: &FetchOptions<'_>,
    ) -> (StoryEntry, Vec<ImageRef>) {
        if opts.cancelled() {
            return (
                StoryEntry::Missing(gap(chapter, GapReason::Cancelled, "cancelled")),
                Vec::new(),
            );
        }

        let bucket = timestamp_bucket(chrono::Utc::now().timestamp(), opts.cache_ttl);
        let key = CacheKey::chapter(adapter.id(), &chapter.locator, bucket);
        match self.cache.get(&key) {
            Ok(Some(bytes)) => match serde_json::from_slice::<CachedChapter>(&bytes) {
                Ok(mut cached) => {
                    tracing::debug!(ordinal = chapter.ordinal, "chapter cache hit");
                    cached.chapter.ordinal = chapter.ordinal;
                    return (StoryEntry::Chapter(cached.chapter), cached.images);
                }
                Err(e) => tracing::warn!(key = key.as_str(), error = %e, "ignoring corrupt cached chapter"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "chapter cache lookup failed"),
        }

        let raw = match opts
            .retry
            .run(&chapter.locator, || adapter.fetch_chapter(session, chapter))
        {
            Ok(raw) => raw,
            Err(e) => {
                let reason = gap_reason(&e);
                tracing::warn!(
                    ordinal = chapter.ordinal,
                    title = %chapter.title,
                    %reason,
                    error = %e,
                    "chapter skipped"
                );
                return (
                    StoryEntry::Missing(gap(chapter, reason, &e.to_string())),
                    Vec::new(),
                );
            }
        };

        let normalized = normalize(&raw);
        let title = if chapter.title.trim().is_empty() {
            raw.title
                .clone()
                .unwrap_or_else(|| format!("Chapter {}", chapter.ordinal))
        } else {
            chapter.title.clone()
        };
        for warning in &normalized.warnings {
            tracing::debug!(ordinal = chapter.ordinal, "{}", warning);
        }
        let cached = CachedChapter {
            chapter: Chapter {
                ordinal: chapter.ordinal,
                title,
                blocks: normalized.blocks,
                images: normalized.images.iter().map(|i| i.id.clone()).collect(),
                warnings: normalized.warnings,
            },
            images: normalized.images,
        };
        match serde_json::to_vec(&cached) {
            Ok(bytes) => {
                if let Err(e) = self.cache.put(&key, &bytes, opts.cache_ttl) {
                    tracing::warn!(error = %e, "chapter cache store failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "chapter not cached"),
        }
        (StoryEntry::Chapter(cached.chapter), cached.images)
    }

    fn fetch_image(
        &self,
        session: &Session<'_>,
        origin: &str,
        opts: &FetchOptions<'_>,
    ) -> Result<(Vec<u8>, String), String> {
        let url = Url::parse(origin).map_err(|e| e.to_string())?;
        let response = opts
            .retry
            .run(origin, || session.get(&url))
            .map_err(|e| e.to_string())?;
        let media_type = image_media_type(&response)
            .ok_or_else(|| "response is not a supported image".to_string())?;
        Ok((response.body, media_type))
    }

    /// Download every referenced image once. Failed images are rewritten to alt text (or dropped)
    /// so no chapter keeps a reference to an asset the story does not own.
    fn resolve_images(
        &self,
        story: &mut Story,
        session: &Session<'_>,
        refs: &BTreeMap<ImageId, String>,
        opts: &FetchOptions<'_>,
    ) {
        let mut failed = BTreeSet::new();
        for (id, origin) in refs {
            if opts.cancelled() {
                failed.insert(id.clone());
                continue;
            }
            match self.fetch_image(session, origin, opts) {
                Ok((data, media_type)) => story.add_image(ImageAsset {
                    id: id.clone(),
                    origin_url: origin.clone(),
                    data,
                    media_type,
                }),
                Err(reason) => {
                    tracing::warn!(url = %origin, %reason, "image skipped");
                    story.add_warning(format!("image {} skipped: {}", origin, reason));
                    failed.insert(id.clone());
                }
            }
        }
        if failed.is_empty() {
            return;
        }
        for entry in story.entries_mut() {
            if let StoryEntry::Chapter(chapter) = entry {
                chapter.images.retain(|id| !failed.contains(id));
                chapter.blocks = std::mem::take(&mut chapter.blocks)
                    .into_iter()
                    .filter_map(|block| match block {
                        Block::Image { id, alt } if failed.contains(&id) => {
                            (!alt.is_empty()).then(|| Block::text(format!("[Image: {}]", alt)))
                        }
                        other => Some(other),
                    })
                    .collect();
            }
        }
    }

    fn resolve_cover(
        &self,
        story: &mut Story,
        session: &Session<'_>,
        cover_url: &str,
        opts: &FetchOptions<'_>,
    ) {
        let id = ImageId::from_origin(cover_url);
        if story.image(&id).is_some() {
            story.set_cover(id);
            return;
        }
        match self.fetch_image(session, cover_url, opts) {
            Ok((data, media_type)) => {
                story.add_image(ImageAsset {
                    id: id.clone(),
                    origin_url: cover_url.to_string(),
                    data,
                    media_type,
                });
                story.set_cover(id);
            }
            Err(reason) => {
                tracing::warn!(url = %cover_url, %reason, "cover skipped");
                story.add_warning(format!("cover {} skipped: {}", cover_url, reason));
            }
        }
    }
}

fn strip_images(story: &mut Story) {
    for entry in story.entries_mut() {
        if let StoryEntry::Chapter(chapter) = entry {
            chapter.images.clear();
            chapter.blocks.retain(|b| !matches!(b, Block::Image { .. }));
        }
    }
}

fn gap(chapter: &ChapterRef, reason: GapReason, message: &str) -> ChapterGap {
    ChapterGap {
        ordinal: chapter.ordinal,
        title: chapter.title.clone(),
        reason,
        message: message.to_string(),
    }
}

fn gap_reason(err: &ScraperError) -> GapReason {
    match err {
        ScraperError::NotFound { .. } => GapReason::NotFound,
        ScraperError::MarkupChanged { .. } | ScraperError::InvalidUrl { .. } => {
            GapReason::MarkupChanged
        }
        ScraperError::Locked { .. } => GapReason::Locked,
        _ => GapReason::Network,
    }
}

const SUPPORTED_IMAGE_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/svg+xml",
];

/// Media type from Content-Type, or sniffed from magic bytes when the header is missing or
/// generic. `None` for anything an EPUB reader is not required to display.
fn image_media_type(response: &Response) -> Option<String> {
    let declared = response
        .content_type
        .as_deref()
        .and_then(|ct| ct.split(';').next())
        .map(|ct| ct.trim().to_ascii_lowercase());
    if let Some(ct) = declared.as_deref() {
        if SUPPORTED_IMAGE_TYPES.contains(&ct) {
            return Some(ct.to_string());
        }
        if ct == "image/jpg" {
            return Some("image/jpeg".to_string());
        }
    }
    let b = &response.body;
    let sniffed = if b.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if b.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if b.starts_with(b"GIF87a") || b.starts_with(b"GIF89a") {
        "image/gif"
    } else if b.len() > 12 && &b[..4] == b"RIFF" && &b[8..12] == b"WEBP" {
        "image/webp"
    } else {
        return None;
    };
    Some(sniffed.to_string())
}
