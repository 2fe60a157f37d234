//! Diagnostic output on stderr via `tracing-subscriber`.

use tracing_subscriber::EnvFilter;

/// Default filter directive for the crate's own events.
fn default_directive(verbose: bool, quiet: bool) -> &'static str {
    if verbose {
        "fictionpack=debug"
    } else if quiet {
        "fictionpack=warn"
    } else {
        "fictionpack=info"
    }
}

/// Install the global subscriber. A set `RUST_LOG` replaces the level chosen by the flags.
pub fn init(verbose: bool, quiet: bool) -> anyhow::Result<()> {
    let filter = if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        EnvFilter::try_from_default_env()?
    } else {
        EnvFilter::new(default_directive(verbose, quiet))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {}", e))?;
    Ok(())
}
