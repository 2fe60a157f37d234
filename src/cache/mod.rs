//! Content cache: a byte store keyed by normalized request or by chapter identity, with TTL.
//!
//! The cache is an explicitly passed handle. Open it before the run, pass `&dyn ContentCache`
//! down to the pipeline, and call [ContentCache::close] when the run is over.

mod disk;
mod memory;

pub use disk::DiskCache;
pub use memory::MemoryCache;

use reqwest::Url;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt cache entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Key into the content cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for an HTTP request: normalized URL plus request signature (method and any
    /// request-affecting header values).
    pub fn request(url: &Url, signature: &str) -> Self {
        CacheKey(format!("req:{}:{}", signature, normalize_url(url)))
    }

    /// Key for a normalized chapter: adapter, locator, and fetch timestamp bucket.
    pub fn chapter(adapter_id: &str, locator: &str, bucket: u64) -> Self {
        CacheKey(format!("chapter:{}:{}:{}", adapter_id, bucket, locator))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Time bucket for chapter keys: entries written in the same TTL window share a key.
pub fn timestamp_bucket(unix_secs: i64, ttl: Duration) -> u64 {
    let width = ttl.as_secs().max(1);
    (unix_secs.max(0) as u64) / width
}

/// Lowercased scheme/host (done by the URL parser), no fragment, query pairs sorted.
pub fn normalize_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        pairs.sort();
        url.query_pairs_mut().clear().extend_pairs(pairs);
    }
    url.to_string()
}

/// Byte-level cache with TTL semantics. Implementations must tolerate concurrent `get`/`put`
/// from several worker threads without corrupting entries.
pub trait ContentCache: Send + Sync {
    /// Cached bytes, or `None` on a miss or an expired entry.
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError>;

    fn put(&self, key: &CacheKey, bytes: &[u8], ttl: Duration) -> Result<(), CacheError>;

    /// Teardown at the end of a run.
    fn close(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

/// Cache that never stores anything (`--no-cache`).
#[derive(Debug, Default)]
pub struct NoCache;

impl ContentCache for NoCache {
    fn get(&self, _key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(None)
    }

    fn put(&self, _key: &CacheKey, _bytes: &[u8], _ttl: Duration) -> Result<(), CacheError> {
        Ok(())
    }
}
