use super::{CacheError, CacheKey, ContentCache};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

const HEADER_PREFIX: &str = "fictionpack-cache v1 ";

/// Directory-backed cache. One file per key, named by the SHA-256 of the key and sharded by
/// its first two hex digits. Each file starts with a header line carrying the expiry time.
///
/// Writes go to a temporary file in the same directory and are renamed into place, so a
/// concurrent reader sees either the old entry or the new one, never a torn write.
#[derive(Debug)]
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    /// Create the cache directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| CacheError::Io {
            path: root.clone(),
            source: e,
        })?;
        Ok(DiskCache { root })
    }

    /// Default location: `$XDG_CACHE_HOME/fictionpack` (or the platform equivalent).
    pub fn default_dir() -> Option<PathBuf> {
        dirs::cache_dir().map(|d| d.join("fictionpack"))
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let hash = hex::encode(Sha256::digest(key.as_str().as_bytes()));
        self.root.join(&hash[..2]).join(&hash)
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize, CacheError> {
        let now = Utc::now().timestamp();
        let mut removed = 0;
        let shards = std::fs::read_dir(&self.root).map_err(|e| CacheError::Io {
            path: self.root.clone(),
            source: e,
        })?;
        for shard in shards.flatten() {
            let shard_path = shard.path();
            if !shard_path.is_dir() {
                continue;
            }
            let Ok(files) = std::fs::read_dir(&shard_path) else {
                continue;
            };
            for file in files.flatten() {
                let path = file.path();
                let expired = match std::fs::read(&path) {
                    Ok(bytes) => match split_entry(&bytes) {
                        Some((expires, _)) => expires <= now,
                        None => true,
                    },
                    Err(_) => false,
                };
                if expired && std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Split an entry file into (expiry unix seconds, payload).
fn split_entry(bytes: &[u8]) -> Option<(i64, &[u8])> {
    let newline = bytes.iter().position(|b| *b == b'\n')?;
    let header = std::str::from_utf8(&bytes[..newline]).ok()?;
    let expires = header.strip_prefix(HEADER_PREFIX)?.trim().parse().ok()?;
    Some((expires, &bytes[newline + 1..]))
}

impl ContentCache for DiskCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.entry_path(key);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::Io { path, source: e }),
        };
        let (expires, payload) = split_entry(&bytes).ok_or_else(|| CacheError::Corrupt {
            key: key.as_str().to_string(),
            reason: "missing or malformed header".to_string(),
        })?;
        if expires <= Utc::now().timestamp() {
            return Ok(None);
        }
        Ok(Some(payload.to_vec()))
    }

    fn put(&self, key: &CacheKey, bytes: &[u8], ttl: Duration) -> Result<(), CacheError> {
        let path = self.entry_path(key);
        let dir = path.parent().unwrap_or(&self.root).to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| CacheError::Io {
            path: dir.clone(),
            source: e,
        })?;
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires = Utc::now().timestamp().saturating_add(ttl_secs);
        let io_err = |e: std::io::Error| CacheError::Io {
            path: path.clone(),
            source: e,
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
        writeln!(tmp, "{}{}", HEADER_PREFIX, expires).map_err(io_err)?;
        tmp.write_all(bytes).map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    fn close(&self) -> Result<(), CacheError> {
        let removed = self.purge_expired()?;
        if removed > 0 {
            tracing::debug!(removed, root = %self.root.display(), "purged expired cache entries");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_entry_on_disk() -> Result<(), CacheError> {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path().join("cache"))?;
        let key = CacheKey::chapter("sh", "https://example.com/read/1", 3);
        assert!(cache.get(&key)?.is_none());
        cache.put(&key, b"<p>body</p>\nsecond line", Duration::from_secs(600))?;
        assert_eq!(
            cache.get(&key)?.as_deref(),
            Some(&b"<p>body</p>\nsecond line"[..])
        );
        Ok(())
    }

    #[test]
    fn entries_survive_reopen() -> Result<(), CacheError> {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::chapter("sh", "loc", 0);
        {
            let cache = DiskCache::open(dir.path())?;
            cache.put(&key, b"persisted", Duration::from_secs(600))?;
        }
        let cache = DiskCache::open(dir.path())?;
        assert_eq!(cache.get(&key)?.as_deref(), Some(&b"persisted"[..]));
        Ok(())
    }

    #[test]
    fn expired_entries_miss_and_are_purged_on_close() -> Result<(), CacheError> {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path())?;
        let stale = CacheKey::chapter("sh", "stale", 0);
        let fresh = CacheKey::chapter("sh", "fresh", 0);
        cache.put(&stale, b"old", Duration::ZERO)?;
        cache.put(&fresh, b"new", Duration::from_secs(600))?;
        assert!(cache.get(&stale)?.is_none());
        assert_eq!(cache.purge_expired()?, 1);
        assert!(cache.get(&fresh)?.is_some());
        cache.close()?;
        Ok(())
    }

    #[test]
    fn huge_ttl_saturates_instead_of_wrapping() -> Result<(), CacheError> {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path())?;
        let key = CacheKey::chapter("sh", "forever", 0);
        cache.put(&key, b"kept", Duration::MAX)?;
        assert_eq!(cache.get(&key)?.as_deref(), Some(&b"kept"[..]));
        assert_eq!(cache.purge_expired()?, 0);
        Ok(())
    }

    #[test]
    fn corrupt_entry_is_reported() -> Result<(), CacheError> {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(dir.path())?;
        let key = CacheKey::chapter("sh", "bad", 0);
        let path = cache.entry_path(&key);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"garbage without header").unwrap();
        assert!(matches!(cache.get(&key), Err(CacheError::Corrupt { .. })));
        Ok(())
    }
}
