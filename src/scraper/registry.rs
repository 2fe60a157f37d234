//! Adapter registry: maps an input URL to exactly one site adapter.

use super::royalroad::RoyalRoad;
use super::scribblehub::ScribbleHub;
use super::SiteAdapter;
use reqwest::Url;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Invalid URL: {input}: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("Unsupported site: {host}. Supported: {supported}.")]
    NotSupported { host: String, supported: String },

    #[error("Unknown site id '{id}'. Supported: {supported}.")]
    UnknownSite { id: String, supported: String },

    /// Two adapters could claim the same URL; detected when the registry is built.
    #[error("Adapters '{first}' and '{second}' both match {host}{path_prefix}")]
    Conflict {
        first: &'static str,
        second: &'static str,
        host: &'static str,
        path_prefix: &'static str,
    },
}

pub struct AdapterRegistry {
    adapters: Vec<Box<dyn SiteAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.ids())
            .finish()
    }
}

impl AdapterRegistry {
    /// Compose a registry. Fails if two adapters share an id or have overlapping patterns, so
    /// resolution can never be ambiguous.
    pub fn new(adapters: Vec<Box<dyn SiteAdapter>>) -> Result<Self, RegistryError> {
        for (i, a) in adapters.iter().enumerate() {
            for b in &adapters[i + 1..] {
                if a.id() == b.id() {
                    let p = a.patterns().first().copied().unwrap_or(super::UrlPattern {
                        host: "",
                        path_prefix: "",
                    });
                    return Err(RegistryError::Conflict {
                        first: a.id(),
                        second: b.id(),
                        host: p.host,
                        path_prefix: p.path_prefix,
                    });
                }
                for pa in a.patterns() {
                    if let Some(pb) = b.patterns().iter().find(|pb| pa.overlaps(pb)) {
                        let narrower = if pa.path_prefix.len() >= pb.path_prefix.len() {
                            pa
                        } else {
                            pb
                        };
                        return Err(RegistryError::Conflict {
                            first: a.id(),
                            second: b.id(),
                            host: narrower.host,
                            path_prefix: narrower.path_prefix,
                        });
                    }
                }
            }
        }
        Ok(AdapterRegistry { adapters })
    }

    /// Royal Road and Scribble Hub.
    pub fn with_default_sites() -> Result<Self, RegistryError> {
        Self::new(vec![Box::new(RoyalRoad), Box::new(ScribbleHub)])
    }

    pub fn ids(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|a| a.id()).collect()
    }

    fn supported(&self) -> String {
        self.ids().join(", ")
    }

    /// Pure lookup by URL.
    pub fn resolve(&self, url: &str) -> Result<&dyn SiteAdapter, RegistryError> {
        let parsed = Url::parse(url.trim()).map_err(|e| RegistryError::InvalidUrl {
            input: url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RegistryError::InvalidUrl {
                input: url.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
        let host = parsed.host_str().ok_or_else(|| RegistryError::InvalidUrl {
            input: url.to_string(),
            reason: "URL has no host".to_string(),
        })?;
        self.adapters
            .iter()
            .find(|a| a.patterns().iter().any(|p| p.matches(&parsed)))
            .map(|a| a.as_ref())
            .ok_or_else(|| RegistryError::NotSupported {
                host: format!("{}{}", host, parsed.path()),
                supported: self.supported(),
            })
    }

    /// Explicit override (`--site`).
    pub fn by_id(&self, id: &str) -> Result<&dyn SiteAdapter, RegistryError> {
        let wanted = id.trim().to_ascii_lowercase();
        self.adapters
            .iter()
            .find(|a| a.id() == wanted)
            .map(|a| a.as_ref())
            .ok_or_else(|| RegistryError::UnknownSite {
                id: id.to_string(),
                supported: self.supported(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ChapterRef;
    use crate::scraper::{RawChapter, ScraperError, Session, StoryIndex, UrlPattern};

    struct Fake {
        id: &'static str,
        patterns: &'static [UrlPattern],
    }

    impl SiteAdapter for Fake {
        fn id(&self) -> &'static str {
            self.id
        }
        fn name(&self) -> &'static str {
            self.id
        }
        fn patterns(&self) -> &'static [UrlPattern] {
            self.patterns
        }
        fn fetch_metadata(&self, _: &Session<'_>, url: &Url) -> Result<StoryIndex, ScraperError> {
            Err(ScraperError::NotFound {
                url: url.to_string(),
            })
        }
        fn fetch_chapter(&self, _: &Session<'_>, c: &ChapterRef) -> Result<RawChapter, ScraperError> {
            Err(ScraperError::NotFound {
                url: c.locator.clone(),
            })
        }
    }

    #[test]
    fn resolves_default_sites() -> Result<(), RegistryError> {
        let registry = AdapterRegistry::with_default_sites()?;
        assert_eq!(
            registry
                .resolve("https://www.royalroad.com/fiction/21220/mother-of-learning")?
                .id(),
            "royalroad"
        );
        assert_eq!(
            registry
                .resolve("https://www.scribblehub.com/series/123/slug/")?
                .id(),
            "scribblehub"
        );
        assert_eq!(registry.by_id("royalroad")?.name(), "Royal Road");
        Ok(())
    }

    #[test]
    fn unsupported_host_is_not_supported_error() {
        let registry = AdapterRegistry::with_default_sites().unwrap();
        match registry.resolve("https://example.com/foo") {
            Err(RegistryError::NotSupported { host, supported }) => {
                assert_eq!(host, "example.com/foo");
                assert!(supported.contains("royalroad"));
            }
            other => panic!("expected NotSupported, got {:?}", other.map(|a| a.id())),
        }
    }

    #[test]
    fn invalid_url_and_scheme_rejected() {
        let registry = AdapterRegistry::with_default_sites().unwrap();
        assert!(matches!(
            registry.resolve("not-a-url"),
            Err(RegistryError::InvalidUrl { .. })
        ));
        assert!(matches!(
            registry.resolve("ftp://www.royalroad.com/fiction/1"),
            Err(RegistryError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn overlapping_adapters_rejected_at_composition() {
        static WIDE: [UrlPattern; 1] = [UrlPattern {
            host: "example.com",
            path_prefix: "/",
        }];
        static NARROW: [UrlPattern; 1] = [UrlPattern {
            host: "www.example.com",
            path_prefix: "/series/",
        }];
        let result = AdapterRegistry::new(vec![
            Box::new(Fake {
                id: "wide",
                patterns: &WIDE,
            }),
            Box::new(Fake {
                id: "narrow",
                patterns: &NARROW,
            }),
        ]);
        match result {
            Err(RegistryError::Conflict {
                first,
                second,
                path_prefix,
                ..
            }) => {
                assert_eq!((first, second), ("wide", "narrow"));
                assert_eq!(path_prefix, "/series/");
            }
            other => panic!("expected Conflict, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_ids_rejected() {
        static A: [UrlPattern; 1] = [UrlPattern {
            host: "a.com",
            path_prefix: "/",
        }];
        static B: [UrlPattern; 1] = [UrlPattern {
            host: "b.com",
            path_prefix: "/",
        }];
        let result = AdapterRegistry::new(vec![
            Box::new(Fake { id: "x", patterns: &A }),
            Box::new(Fake { id: "x", patterns: &B }),
        ]);
        assert!(matches!(result, Err(RegistryError::Conflict { .. })));
    }

    #[test]
    fn by_id_is_case_insensitive() -> Result<(), RegistryError> {
        let registry = AdapterRegistry::with_default_sites()?;
        assert_eq!(registry.by_id("RoyalRoad")?.id(), "royalroad");
        assert!(matches!(
            registry.by_id("ao3"),
            Err(RegistryError::UnknownSite { .. })
        ));
        Ok(())
    }
}
