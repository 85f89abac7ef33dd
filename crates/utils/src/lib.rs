//! The inevitable catchall "utils" crate. Generally only add
//! things here that only depend on the standard library and
//! "core" crates.
//!
mod chroot;
pub use chroot::*;
mod command;
pub use command::*;
mod path;
pub use path::*;
mod tracing_util;
pub use tracing_util::*;

/// The name of our binary
pub const NAME: &str = "snapos";

/// Intended for use in `main`, calls an inner function and
/// handles errors by printing them.
///
/// The closure returns the process exit code to use on failure along
/// with the error, so that callers can map error kinds to stable codes.
pub fn run_main<F>(f: F)
where
    F: FnOnce() -> Result<(), (i32, anyhow::Error)>,
{
    use std::io::Write as _;

    use owo_colors::OwoColorize;

    if let Err((code, e)) = f() {
        let mut stderr = anstream::stderr();
        // Don't panic if writing fails.
        let _ = writeln!(stderr, "{}{:#}", "error: ".red(), e);
        std::process::exit(code);
    }
}
