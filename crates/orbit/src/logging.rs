//! Diagnostic tracing to stderr.
//!
//! Command results go to stdout; everything here is for operators and is
//! filtered through `RUST_LOG` (default `warn`).

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Directive applied when `--verbose` is given without `RUST_LOG`.
pub const VERBOSE_DIRECTIVE: &str = "warn,orbit=debug,orbit_core=debug,orbit_git=debug";

pub fn filter_for(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new(VERBOSE_DIRECTIVE)
        } else {
            EnvFilter::new("warn")
        }
    })
}

/// Install the global subscriber. Call once, from the binary.
pub fn init(verbose: bool) {
    tracing_subscriber::registry()
        .with(filter_for(verbose))
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
