//! Tracing setup for the `quarry` binary.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber that writes to stderr.
///
/// Stdout is reserved for command output and, in child mode, for IPC frames,
/// so logs never go there. `RUST_LOG` overrides the level chosen by `verbose`.
pub fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // A subscriber may already be installed (tests); keep it.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
