//! fictionpack: fetch serialized web fiction (Royal Road, Scribble Hub) and package it as EPUB.

pub mod cache;
pub mod cli;
pub mod config;
pub mod epub;
pub mod logging;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod scraper;

#[cfg(test)]
mod testing;

// Re-exports for CLI and consumers.
pub use cache::{ContentCache, DiskCache, MemoryCache, NoCache};
pub use epub::{assemble, write_epub, AssembleOptions, AssemblyError, AssemblyReport, MissingChapterPolicy};
pub use model::{Outcome, Story, StoryMetadata, StoryStatus};
pub use pipeline::{CancelToken, FetchOptions, FetchPipeline, PipelineError, RetryPolicy};
pub use scraper::{AdapterRegistry, PoliteClient, ScraperError, SiteAdapter, Transport};
