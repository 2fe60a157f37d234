//! Per-story request session: cache lookup first, then a paced network call.
//!
//! Adapters only ever see a `Session`; they never hold a transport or cache themselves.

use super::client::{Response, Transport};
use super::error::ScraperError;
use crate::cache::{CacheKey, ContentCache};
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Enforces a minimum delay between consecutive requests, shared across worker threads.
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Pacer {
            interval,
            last: Mutex::new(None),
        }
    }

    /// Block until `interval` has passed since the previous call returned.
    pub fn wait(&self) {
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                std::thread::sleep(self.interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}

pub struct Session<'a> {
    transport: &'a dyn Transport,
    cache: &'a dyn ContentCache,
    pacer: Pacer,
    ttl: Duration,
    headers: Vec<(String, String)>,
}

impl<'a> Session<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        cache: &'a dyn ContentCache,
        interval: Duration,
        ttl: Duration,
    ) -> Self {
        Session {
            transport,
            cache,
            pacer: Pacer::new(interval),
            ttl,
            headers: Vec::new(),
        }
    }

    /// Extra request header sent with every request (credential injection, e.g. `Cookie`).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Request signature for cache keys; requests sent with different headers never share
    /// an entry.
    fn signature(&self) -> String {
        if self.headers.is_empty() {
            return "GET".to_string();
        }
        let mut hasher = Sha256::new();
        for (name, value) in &self.headers {
            hasher.update(name.to_ascii_lowercase().as_bytes());
            hasher.update(b"\0");
            hasher.update(value.as_bytes());
            hasher.update(b"\0");
        }
        format!("GET+{}", &hex::encode(hasher.finalize())[..12])
    }

    /// Cached GET: a hit skips the network entirely, a miss goes out paced and the response is
    /// stored for `ttl`. Cache failures are logged and treated as misses.
    pub fn get(&self, url: &Url) -> Result<Response, ScraperError> {
        let key = CacheKey::request(url, &self.signature());
        match self.cache.get(&key) {
            Ok(Some(bytes)) => match decode_response(&bytes) {
                Some(response) => {
                    tracing::debug!(url = %url, "cache hit");
                    return Ok(response);
                }
                None => tracing::warn!(url = %url, "ignoring malformed cached response"),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(url = %url, error = %e, "cache lookup failed"),
        }
        let response = self.get_uncached(url)?;
        if let Err(e) = self.cache.put(&key, &encode_response(&response), self.ttl) {
            tracing::warn!(url = %url, error = %e, "cache store failed");
        }
        Ok(response)
    }

    /// Paced GET without touching the cache.
    pub fn get_uncached(&self, url: &Url) -> Result<Response, ScraperError> {
        self.pacer.wait();
        self.transport.get(url, &self.headers)
    }
}

/// `{final_url}\n{content_type}\n{body}`.
fn encode_response(response: &Response) -> Vec<u8> {
    let mut out = Vec::with_capacity(response.body.len() + 128);
    out.extend_from_slice(response.url.as_str().as_bytes());
    out.push(b'\n');
    out.extend_from_slice(response.content_type.as_deref().unwrap_or("").as_bytes());
    out.push(b'\n');
    out.extend_from_slice(&response.body);
    out
}

fn decode_response(bytes: &[u8]) -> Option<Response> {
    let first = bytes.iter().position(|b| *b == b'\n')?;
    let rest = &bytes[first + 1..];
    let second = rest.iter().position(|b| *b == b'\n')?;
    let url = Url::parse(std::str::from_utf8(&bytes[..first]).ok()?).ok()?;
    let content_type = std::str::from_utf8(&rest[..second]).ok()?;
    Some(Response {
        url,
        content_type: (!content_type.is_empty()).then(|| content_type.to_string()),
        body: rest[second + 1..].to_vec(),
    })
}
