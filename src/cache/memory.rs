use super::{CacheError, CacheKey, ContentCache};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Process-local cache. Entries live until their TTL passes or the cache is dropped.
#[derive(Debug, Default)]
pub struct MemoryCache {
    /// Payload and expiry; `None` when the TTL runs past what `Instant` can hold.
    entries: Mutex<HashMap<String, (Vec<u8>, Option<Instant>)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ContentCache for MemoryCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::Corrupt {
            key: key.as_str().to_string(),
            reason: "cache lock poisoned".to_string(),
        })?;
        match entries.get(key.as_str()) {
            Some((bytes, expires)) if expires.map_or(true, |t| t > Instant::now()) => {
                Ok(Some(bytes.clone()))
            }
            Some(_) => {
                entries.remove(key.as_str());
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn put(&self, key: &CacheKey, bytes: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().map_err(|_| CacheError::Corrupt {
            key: key.as_str().to_string(),
            reason: "cache lock poisoned".to_string(),
        })?;
        entries.insert(
            key.as_str().to_string(),
            (bytes.to_vec(), Instant::now().checked_add(ttl)),
        );
        Ok(())
    }
}
