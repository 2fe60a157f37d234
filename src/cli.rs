//! CLI parsing and orchestration: fetch a story, assemble the EPUB, map failures to exit codes.

use crate::cache::{ContentCache, DiskCache, NoCache};
use crate::config::{self, Config};
use crate::epub::{write_epub, AssembleOptions, AssemblyError, MissingChapterPolicy};
use crate::model::Outcome;
use crate::pipeline::{FetchOptions, FetchPipeline, PipelineError, RetryPolicy, DEFAULT_CACHE_TTL};
use crate::scraper::{AdapterRegistry, PoliteClient, RegistryError};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_WORKERS: usize = 1;

#[derive(Debug, Error)]
pub enum CliRunError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Registry(#[from] RegistryError),

    #[error("{0}")]
    Pipeline(#[from] PipelineError),

    #[error("{0}")]
    Assembly(#[from] AssemblyError),

    #[error("{0}")]
    Validation(String),
}

impl CliRunError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliRunError::InvalidInput(_) | CliRunError::Registry(_) => 1,
            CliRunError::Pipeline(PipelineError::NotSupported(_))
            | CliRunError::Pipeline(PipelineError::EmptyRange { .. }) => 1,
            CliRunError::Pipeline(PipelineError::MetadataFetch { .. }) => 2,
            CliRunError::Assembly(_) | CliRunError::Validation(_) => 3,
        }
    }
}

/// Process exit code for a finished run: 0 complete, 4 completed with warnings.
pub fn outcome_exit_code(outcome: &Outcome) -> i32 {
    match outcome {
        Outcome::Complete => 0,
        Outcome::CompletedWithWarnings { .. } => 4,
    }
}

/// Run epubcheck on the given EPUB path. Requires epubcheck on PATH.
fn validate_epub(path: &Path) -> Result<(), CliRunError> {
    let output = std::process::Command::new("epubcheck")
        .arg(path)
        .output()
        .map_err(|e| {
            CliRunError::Validation(format!(
                "Could not run epubcheck: {}. Is epubcheck installed and on PATH?",
                e
            ))
        })?;
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let msg = if stderr.is_empty() { stdout } else { stderr };
        Err(CliRunError::Validation(format!(
            "epubcheck reported errors:\n{}",
            msg.trim()
        )))
    }
}

#[derive(Parser, Debug)]
#[command(name = "fictionpack")]
#[command(about = "Package a Royal Road or Scribble Hub story as an EPUB")]
#[command(
    after_help = "Config file (./fictionpack.toml or ~/.config/fictionpack/config.toml) keys: output_dir, user_agent, request_delay_secs, timeout_secs, retry_count, retry_backoff_secs, toc_page, include_images, on_missing_chapter, workers, cache_dir, cache_ttl_secs, and [sites.<id>] tables with request_delay_secs and cookie. CLI flags override config.\n\nExit codes: 0 complete, 4 written with warnings or missing chapters, 1 invalid input or unsupported site, 2 story index could not be fetched, 3 EPUB could not be written or failed validation."
)]
pub struct Args {
    /// Story URL (Royal Road fiction page or Scribble Hub series page).
    pub url: String,

    /// Output path. Default: {output_dir}/{sanitized-title}.epub
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Use this site adapter instead of detecting it from the URL (royalroad, scribblehub).
    #[arg(long)]
    pub site: Option<String>,

    /// Fetch only chapters in this range (1-based inclusive), e.g. 1-10.
    #[arg(long, value_parser = parse_chapter_range)]
    pub chapters: Option<(u32, u32)>,

    /// Chapters that could not be fetched: skip, or placeholder (default).
    #[arg(long)]
    pub on_missing_chapter: Option<MissingChapterPolicy>,

    /// Do not download images; image references are dropped.
    #[arg(long)]
    pub no_images: bool,

    /// Parallel chapter fetches for sites that allow it (default 1).
    #[arg(long)]
    pub workers: Option<usize>,

    /// Cache directory (default: platform cache dir).
    #[arg(long, conflicts_with = "no_cache")]
    pub cache_dir: Option<PathBuf>,

    /// Do not read or write the cache.
    #[arg(long)]
    pub no_cache: bool,

    /// HTTP User-Agent (overrides config).
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Delay between requests in seconds (overrides config and the site default).
    #[arg(long)]
    pub delay: Option<u64>,

    /// Request timeout in seconds (overrides config; default 30).
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Fetch the story index only; print chapter count and output path without writing.
    #[arg(long)]
    pub dry_run: bool,

    /// Run epubcheck on the written file (epubcheck must be on PATH).
    #[arg(long)]
    pub validate: bool,

    /// Suppress progress output (warnings and errors only).
    #[arg(short, long)]
    pub quiet: bool,

    /// Debug logging and the full error chain.
    #[arg(long)]
    pub verbose: bool,
}

fn parse_chapter_range(s: &str) -> Result<(u32, u32), String> {
    let s = s.trim();
    let (from_str, to_str) = s.split_once('-').ok_or_else(|| {
        format!(
            "Invalid --chapters: expected 'from-to' (e.g. 1-10), got '{}'",
            s
        )
    })?;
    let from_str = from_str.trim();
    let to_str = to_str.trim();
    let from: u32 = from_str.parse().map_err(|_| {
        format!(
            "Invalid --chapters: '{}' is not a valid start chapter number",
            from_str
        )
    })?;
    let to: u32 = to_str.parse().map_err(|_| {
        format!(
            "Invalid --chapters: '{}' is not a valid end chapter number",
            to_str
        )
    })?;
    if from == 0 {
        return Err("Invalid --chapters: chapters are numbered from 1".to_string());
    }
    if from > to {
        return Err(format!(
            "Invalid --chapters: start ({}) must be <= end ({})",
            from, to
        ));
    }
    Ok((from, to))
}

/// Sanitize story title to a safe filename: lowercase, replace spaces/special with `-`.
fn sanitize_title(title: &str) -> String {
    let mut s = title
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>();
    while s.contains("--") {
        s = s.replace("--", "-");
    }
    s = s.trim_matches('-').to_string();
    if s.is_empty() {
        s = "story".to_string();
    }
    s
}

fn output_path(args: &Args, config: &Config, title: &str) -> PathBuf {
    match &args.output {
        Some(p) => p.clone(),
        None => config
            .output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(format!("{}.epub", sanitize_title(title))),
    }
}

fn validate_output_path(path: &Path) -> Result<(), CliRunError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            return Err(CliRunError::InvalidInput(format!(
                "Cannot write output: {}: parent directory does not exist.",
                path.display()
            )));
        }
    }
    Ok(())
}

/// Config values, else the default schedule.
fn retry_policy(config: &Config) -> RetryPolicy {
    match (config.retry_count, &config.retry_backoff_secs) {
        (None, None) => RetryPolicy::default(),
        (count, backoff) => RetryPolicy::new(
            count.unwrap_or(crate::pipeline::DEFAULT_MAX_ATTEMPTS),
            backoff.as_deref().unwrap_or(&[1, 2, 4]),
        ),
    }
}

fn open_cache(args: &Args, config: &Config) -> Box<dyn ContentCache> {
    if args.no_cache {
        return Box::new(NoCache);
    }
    let dir = args
        .cache_dir
        .clone()
        .or_else(|| config.cache_dir.clone())
        .or_else(DiskCache::default_dir);
    let Some(dir) = dir else {
        tracing::warn!("no cache directory available; caching disabled");
        return Box::new(NoCache);
    };
    match DiskCache::open(&dir) {
        Ok(cache) => {
            tracing::debug!(dir = %dir.display(), "using disk cache");
            Box::new(cache)
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot open cache; caching disabled");
            Box::new(NoCache)
        }
    }
}

/// Entry point for the CLI. Returns the outcome of a written (or dry) run; fatal failures carry
/// their exit code.
pub fn run(args: &Args) -> Result<Outcome, CliRunError> {
    let config = config::load_config()
        .map_err(CliRunError::InvalidInput)?
        .unwrap_or_default();

    let registry = AdapterRegistry::with_default_sites()?;
    let url = args.url.trim();
    if let Some(id) = &args.site {
        registry.by_id(id)?;
    } else {
        registry.resolve(url)?;
    }

    let timeout_secs = args
        .timeout
        .or(config.timeout_secs)
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    let mut builder = PoliteClient::builder().timeout_secs(timeout_secs);
    if let Some(ua) = args.user_agent.clone().or_else(|| config.user_agent.clone()) {
        builder = builder.user_agent(ua);
    }
    let client = builder
        .build()
        .map_err(|e| CliRunError::InvalidInput(format!("Failed to create HTTP client: {}", e)))?;

    let cache = open_cache(args, &config);
    let result = fetch_and_write(args, &config, &registry, &client, cache.as_ref());
    if let Err(e) = cache.close() {
        tracing::warn!(error = %e, "cache teardown failed");
    }
    result
}

fn fetch_and_write(
    args: &Args,
    config: &Config,
    registry: &AdapterRegistry,
    client: &PoliteClient,
    cache: &dyn ContentCache,
) -> Result<Outcome, CliRunError> {
    let bar = if args.quiet {
        indicatif::ProgressBar::hidden()
    } else {
        indicatif::ProgressBar::new(0)
    };
    bar.set_style(
        indicatif::ProgressStyle::default_bar()
            .template("{spinner} {msg} [{bar:40}] {pos}/{len} ({elapsed})")
            .map_err(|e| CliRunError::InvalidInput(format!("Bad progress template: {}", e)))?
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
            .progress_chars("█▉▊▋▌▍▎▏ "),
    );
    let progress = |n: u32, total: u32| {
        if bar.length() != Some(total as u64) {
            bar.set_length(total as u64);
            bar.enable_steady_tick(Duration::from_millis(80));
        }
        bar.set_position(n as u64);
        bar.set_message(format!("Fetching chapter {}/{}", n, total));
    };

    let opts = FetchOptions {
        include_images: !args.no_images && config.include_images.unwrap_or(true),
        chapter_range: args.chapters,
        workers: args.workers.or(config.workers).unwrap_or(DEFAULT_WORKERS).max(1),
        cache_ttl: config
            .cache_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CACHE_TTL),
        retry: retry_policy(config),
        site_override: args.site.clone(),
        sites: config.site_overrides(&registry.ids(), args.delay),
        progress: Some(&progress),
        cancel: None,
    };
    let pipeline = FetchPipeline::new(registry, client, cache);
    let url = args.url.trim();

    if args.dry_run {
        let site = pipeline.adapter_for(url, &opts)?.name();
        let index = pipeline.fetch_index(url, &opts)?;
        let path = output_path(args, config, &index.metadata.title);
        eprintln!("Site: {}", site);
        eprintln!("Title: {}", index.metadata.title);
        eprintln!("Chapters: {}", index.chapters.len());
        eprintln!("Output: {}", path.display());
        return Ok(Outcome::Complete);
    }

    let story = pipeline.fetch_story(url, &opts);
    bar.finish_and_clear();
    let story = story?;

    let path = output_path(args, config, &story.metadata().title);
    validate_output_path(&path)?;
    let assemble = AssembleOptions {
        missing_chapters: args
            .on_missing_chapter
            .or(config.on_missing_chapter)
            .unwrap_or(MissingChapterPolicy::Placeholder),
        toc_page: config.toc_page.unwrap_or(true),
        ..AssembleOptions::new(MissingChapterPolicy::Placeholder)
    };
    let report = write_epub(&story, &path, &assemble)?;
    if args.validate {
        validate_epub(&path)?;
    }

    let outcome = story.outcome();
    if !args.quiet {
        eprintln!("Wrote {}", path.display());
        for gap in &report.gaps {
            eprintln!(
                "  missing chapter {} ({}): {}",
                gap.ordinal, gap.title, gap.reason
            );
        }
        if let Outcome::CompletedWithWarnings { warnings, .. } = &outcome {
            eprintln!("Completed with {} warning(s).", warnings);
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scraper::ScraperError;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["fictionpack", "https://www.royalroad.com/fiction/1"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn sanitize_title_cases() {
        assert_eq!(sanitize_title(""), "story");
        assert_eq!(sanitize_title("My  Story!"), "my-story");
        assert_eq!(sanitize_title("  --  a  --  b  --  "), "a-b");
        assert_eq!(sanitize_title("Mother of Learning"), "mother-of-learning");
    }

    #[test]
    fn parse_chapter_range_valid() {
        assert_eq!(parse_chapter_range("1-10").unwrap(), (1, 10));
        assert_eq!(parse_chapter_range("5-5").unwrap(), (5, 5));
        assert_eq!(parse_chapter_range("  3 - 7  ").unwrap(), (3, 7));
    }

    #[test]
    fn parse_chapter_range_rejects_bad_input() {
        assert!(parse_chapter_range("1").is_err());
        assert!(parse_chapter_range("a-b").is_err());
        assert!(parse_chapter_range("10-1").is_err());
        assert!(parse_chapter_range("0-3").is_err());
    }

    #[test]
    fn flags_parse() {
        let a = args(&[
            "--on-missing-chapter",
            "skip",
            "--no-images",
            "--workers",
            "4",
            "--chapters",
            "2-5",
            "--no-cache",
        ]);
        assert_eq!(a.on_missing_chapter, Some(MissingChapterPolicy::Skip));
        assert!(a.no_images);
        assert_eq!(a.workers, Some(4));
        assert_eq!(a.chapters, Some((2, 5)));
        assert!(a.no_cache);
        assert!(Args::try_parse_from([
            "fictionpack",
            "u",
            "--no-cache",
            "--cache-dir",
            "/tmp/x"
        ])
        .is_err());
        assert!(Args::try_parse_from(["fictionpack", "u", "--on-missing-chapter", "fail"]).is_err());
    }

    #[test]
    fn output_path_uses_config_dir_and_title() {
        let config: Config = toml::from_str("output_dir = \"out\"").unwrap();
        assert_eq!(
            output_path(&args(&[]), &config, "My Book"),
            PathBuf::from("out/my-book.epub")
        );
        assert_eq!(
            output_path(&args(&["-o", "x.epub"]), &config, "My Book"),
            PathBuf::from("x.epub")
        );
    }

    #[test]
    fn validate_output_path_parent_missing() {
        assert!(validate_output_path(&std::env::temp_dir().join("fp.epub")).is_ok());
        let result = validate_output_path(Path::new("/nonexistent_dir_fictionpack_xyz/out.epub"));
        match result {
            Err(CliRunError::InvalidInput(msg)) => {
                assert!(msg.contains("parent directory does not exist"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn retry_policy_from_config() {
        assert_eq!(retry_policy(&Config::default()), RetryPolicy::default());
        let c: Config = toml::from_str("retry_count = 5\nretry_backoff_secs = [0]").unwrap();
        assert_eq!(retry_policy(&c).max_attempts(), 5);
    }

    #[test]
    fn no_cache_flag_selects_no_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        let a = args(&["--no-cache"]);
        let cache = open_cache(&a, &config);
        assert!(cache.get(&crate::cache::CacheKey::chapter("x", "y", 0)).unwrap().is_none());
        let a = args(&["--cache-dir", dir.path().to_str().unwrap()]);
        let cache = open_cache(&a, &config);
        let key = crate::cache::CacheKey::chapter("x", "y", 0);
        cache.put(&key, b"v", Duration::from_secs(60)).unwrap();
        assert_eq!(cache.get(&key).unwrap().as_deref(), Some(&b"v"[..]));
    }

    #[test]
    fn exit_codes() {
        assert_eq!(CliRunError::InvalidInput("x".into()).exit_code(), 1);
        assert_eq!(
            CliRunError::Registry(RegistryError::NotSupported {
                host: "x".into(),
                supported: "y".into()
            })
            .exit_code(),
            1
        );
        assert_eq!(
            CliRunError::Pipeline(PipelineError::EmptyRange {
                from: 5,
                to: 6,
                total: 2
            })
            .exit_code(),
            1
        );
        assert_eq!(
            CliRunError::Pipeline(PipelineError::MetadataFetch {
                url: "u".into(),
                source: ScraperError::NotFound { url: "u".into() }
            })
            .exit_code(),
            2
        );
        assert_eq!(CliRunError::Assembly(AssemblyError::EmptyTitle).exit_code(), 3);
        assert_eq!(CliRunError::Validation("bad".into()).exit_code(), 3);
        assert_eq!(outcome_exit_code(&Outcome::Complete), 0);
        assert_eq!(
            outcome_exit_code(&Outcome::CompletedWithWarnings {
                missing: vec![3],
                warnings: 1
            }),
            4
        );
    }

    #[test]
    fn unsupported_url_fails_before_network() {
        let a = Args::try_parse_from(["fictionpack", "https://example.com/story/1", "--no-cache"])
            .unwrap();
        let err = run(&a).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }
}
