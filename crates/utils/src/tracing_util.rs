//! Helpers related to tracing, used by main entrypoints

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize tracing with the default configuration.
///
/// The filter is read from `RUST_LOG` when set; otherwise `warn` is used,
/// or `debug` when `verbose` is true. Output goes to stderr and, when
/// available, to the systemd journal.
pub fn initialize_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let fmt = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(false)
        .with_writer(std::io::stderr);
    // The journal is absent in most containers and in the initramfs.
    let journald = tracing_journald::layer().ok();
    // Ignore the error if a subscriber was already installed (e.g. tests).
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt)
        .with(journald)
        .try_init();
}
