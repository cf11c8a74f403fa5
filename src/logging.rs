//! Tracing bootstrap for binaries and tests embedding the client.

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber.
///
/// Honors `RUST_LOG` when set; otherwise `debug` for the crate when
/// `verbose` (the `verbose_logging` config option), `info` when not.
/// Safe to call more than once; later calls are no-ops.
pub fn init(verbose: bool) {
    let default_directive = if verbose {
        "info,tripledb=debug"
    } else {
        "info"
    };

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
