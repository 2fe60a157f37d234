//! Optional config file loading. Search order: ./fictionpack.toml, then
//! $XDG_CONFIG_HOME/fictionpack/config.toml (or ~/.config/fictionpack/config.toml).

use crate::epub::MissingChapterPolicy;
use crate::pipeline::SiteOverrides;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file contents. All fields optional; only present keys override defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case", default, deny_unknown_fields)]
pub struct Config {
    /// Default output directory when -o is not set. Paths are relative to CWD.
    pub output_dir: Option<PathBuf>,
    /// HTTP User-Agent header.
    pub user_agent: Option<String>,
    /// Delay in seconds between requests, for every site without its own setting.
    pub request_delay_secs: Option<u64>,
    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Attempts per request for transient failures (default 3).
    pub retry_count: Option<u32>,
    /// Delay in seconds before each retry (e.g. [1, 2, 4]).
    pub retry_backoff_secs: Option<Vec<u64>>,
    /// Visible table-of-contents page after the cover (default: true).
    pub toc_page: Option<bool>,
    /// Download and embed images (default: true).
    pub include_images: Option<bool>,
    /// `skip` or `placeholder` (default: placeholder).
    pub on_missing_chapter: Option<MissingChapterPolicy>,
    /// Chapter fetch workers for sites that allow parallel fetching.
    pub workers: Option<usize>,
    pub cache_dir: Option<PathBuf>,
    pub cache_ttl_secs: Option<u64>,
    /// Per-site settings keyed by adapter id (`royalroad`, `scribblehub`).
    pub sites: HashMap<String, SiteConfig>,
}

/// `[sites.<id>]` table.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "snake_case", default, deny_unknown_fields)]
pub struct SiteConfig {
    pub request_delay_secs: Option<u64>,
    /// Sent verbatim as the Cookie header.
    pub cookie: Option<String>,
}

impl Config {
    /// Per-site pipeline overrides. A global `request_delay_secs` (or `global_delay`, which the
    /// CLI passes from `--delay`) applies to every registered site without its own value.
    pub fn site_overrides(
        &self,
        site_ids: &[&str],
        global_delay: Option<u64>,
    ) -> HashMap<String, SiteOverrides> {
        let mut out = HashMap::new();
        for id in site_ids {
            let site = self.sites.get(*id);
            let delay = global_delay
                .or_else(|| site.and_then(|s| s.request_delay_secs))
                .or(self.request_delay_secs);
            let overrides = SiteOverrides {
                request_interval: delay.map(Duration::from_secs),
                cookie: site.and_then(|s| s.cookie.clone()),
            };
            if overrides != SiteOverrides::default() {
                out.insert(id.to_string(), overrides);
            }
        }
        out
    }
}

/// Candidate config paths, in search order.
pub fn config_paths() -> Result<Vec<PathBuf>, String> {
    let cwd = std::env::current_dir()
        .map_err(|e| format!("Cannot determine current directory: {}", e))?;
    let mut paths = vec![cwd.join("fictionpack.toml")];
    if let Some(d) = dirs::config_dir() {
        paths.push(d.join("fictionpack").join("config.toml"));
    }
    Ok(paths)
}

/// Load the first config file that exists. Missing file returns Ok(None). Invalid TOML or I/O
/// error reading a present file returns Err.
pub fn load_config() -> Result<Option<Config>, String> {
    load_first(&config_paths()?)
}

fn load_first(paths: &[PathBuf]) -> Result<Option<Config>, String> {
    for path in paths {
        if path.exists() {
            return load_file(path).map(Some);
        }
    }
    Ok(None)
}

pub fn load_file(path: &Path) -> Result<Config, String> {
    let s = std::fs::read_to_string(path)
        .map_err(|e| format!("Cannot read config {}: {}", path.display(), e))?;
    let config: Config =
        toml::from_str(&s).map_err(|e| format!("Invalid config {}: {}", path.display(), e))?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config() {
        let c: Config = toml::from_str("").unwrap();
        assert!(c.output_dir.is_none());
        assert!(c.on_missing_chapter.is_none());
        assert!(c.sites.is_empty());
    }

    #[test]
    fn parse_full_config() {
        let s = r#"
            output_dir = "out"
            user_agent = "Custom/1.0"
            request_delay_secs = 3
            timeout_secs = 60
            retry_count = 5
            retry_backoff_secs = [1, 2, 4, 8]
            toc_page = false
            include_images = false
            on_missing_chapter = "skip"
            workers = 4
            cache_dir = "/tmp/fp-cache"
            cache_ttl_secs = 600

            [sites.royalroad]
            request_delay_secs = 5
            cookie = ".AspNetCore.Identity.Application=abc"
        "#;
        let c: Config = toml::from_str(s).unwrap();
        assert_eq!(c.output_dir.as_deref(), Some(Path::new("out")));
        assert_eq!(c.user_agent.as_deref(), Some("Custom/1.0"));
        assert_eq!(c.retry_backoff_secs.as_deref(), Some([1, 2, 4, 8].as_slice()));
        assert_eq!(c.toc_page, Some(false));
        assert_eq!(c.include_images, Some(false));
        assert_eq!(c.on_missing_chapter, Some(MissingChapterPolicy::Skip));
        assert_eq!(c.workers, Some(4));
        assert_eq!(c.cache_ttl_secs, Some(600));
        let rr = &c.sites["royalroad"];
        assert_eq!(rr.request_delay_secs, Some(5));
        assert!(rr.cookie.as_deref().unwrap().starts_with(".AspNetCore"));
    }

    #[test]
    fn invalid_values_error() {
        assert!(toml::from_str::<Config>("output_dir = [").is_err());
        assert!(toml::from_str::<Config>("on_missing_chapter = \"fail\"").is_err());
        assert!(toml::from_str::<Config>("empty_chapters = \"skip\"").is_err());
    }

    #[test]
    fn site_overrides_prefer_site_table_over_global_delay() {
        let c: Config = toml::from_str(
            r#"
            request_delay_secs = 3
            [sites.royalroad]
            request_delay_secs = 5
            cookie = "k=v"
        "#,
        )
        .unwrap();
        let o = c.site_overrides(&["royalroad", "scribblehub"], None);
        assert_eq!(o["royalroad"].request_interval, Some(Duration::from_secs(5)));
        assert_eq!(o["royalroad"].cookie.as_deref(), Some("k=v"));
        assert_eq!(o["scribblehub"].request_interval, Some(Duration::from_secs(3)));
        assert!(o["scribblehub"].cookie.is_none());
    }

    #[test]
    fn cli_delay_wins_and_empty_config_adds_nothing() {
        let c: Config = toml::from_str("[sites.royalroad]\nrequest_delay_secs = 5").unwrap();
        let o = c.site_overrides(&["royalroad"], Some(1));
        assert_eq!(o["royalroad"].request_interval, Some(Duration::from_secs(1)));
        assert!(Config::default().site_overrides(&["royalroad"], None).is_empty());
    }

    #[test]
    fn load_first_uses_first_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let present = dir.path().join("config.toml");
        std::fs::write(&present, "workers = 2").unwrap();
        let c = load_first(&[missing.clone(), present]).unwrap().unwrap();
        assert_eq!(c.workers, Some(2));
        assert!(load_first(&[missing]).unwrap().is_none());
    }
}
