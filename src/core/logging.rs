//! Stderr diagnostics for the binary. Library code only emits `tracing`
//! events; installing the subscriber is the caller's choice.

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "GITGOV_LOG";

pub fn default_directive(verbose: bool, quiet: bool) -> &'static str {
    if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "warn"
    }
}

/// Install the fmt subscriber. `GITGOV_LOG` wins over the flags. Safe to call
/// twice; the second call is a no-op.
pub fn init(verbose: bool, quiet: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose, quiet)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
